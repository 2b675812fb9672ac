//! Batch execution metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use super::registry::CloseReason;

/// Counters for batches, operations and cached channels.
pub struct BatchMetrics {
    // Batch metrics
    batches_started: AtomicU64,
    batches_rejected: AtomicU64,

    // Operation metrics
    operations_started: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    operations_timed_out: AtomicU64,
    operations_skipped: AtomicU64,
    active_operations: AtomicU64,
    peak_active_operations: AtomicU64,

    // Channel metrics
    channels_opened: AtomicU64,
    channels_reused: AtomicU64,
    connection_errors: AtomicU64,
    closed_explicit: AtomicU64,
    closed_idle: AtomicU64,
    closed_fault: AtomicU64,
    closed_shutdown: AtomicU64,

    // Per-tool latency tracking
    tool_latencies: DashMap<String, LatencyStats>,
}

impl BatchMetrics {
    pub fn new() -> Self {
        Self {
            batches_started: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
            operations_started: AtomicU64::new(0),
            operations_succeeded: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operations_timed_out: AtomicU64::new(0),
            operations_skipped: AtomicU64::new(0),
            active_operations: AtomicU64::new(0),
            peak_active_operations: AtomicU64::new(0),
            channels_opened: AtomicU64::new(0),
            channels_reused: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            closed_explicit: AtomicU64::new(0),
            closed_idle: AtomicU64::new(0),
            closed_fault: AtomicU64::new(0),
            closed_shutdown: AtomicU64::new(0),
            tool_latencies: DashMap::new(),
        }
    }

    pub fn record_batch_started(&self) {
        self.batches_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch that failed before any operation was dispatched.
    pub fn record_batch_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched operation; pair with [`Self::record_operation_end`].
    pub fn record_operation_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
        let active = self.active_operations.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_active_operations.fetch_max(active, Ordering::Relaxed);
    }

    pub fn record_operation_end(&self) {
        self.active_operations.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_operation_result(
        &self,
        tool: &str,
        success: bool,
        timed_out: bool,
        duration_ms: u64,
    ) {
        if success {
            self.operations_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.operations_failed.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
        }

        self.tool_latencies
            .entry(tool.to_string())
            .or_insert_with(LatencyStats::new)
            .record(duration_ms);
    }

    pub fn record_operations_skipped(&self, count: usize) {
        self.operations_skipped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_reused(&self) {
        self.channels_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_closed(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::Explicit => &self.closed_explicit,
            CloseReason::Idle => &self.closed_idle,
            CloseReason::Fault => &self.closed_fault,
            CloseReason::Shutdown => &self.closed_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_started: self.batches_started.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            operations_started: self.operations_started.load(Ordering::Relaxed),
            operations_succeeded: self.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            operations_timed_out: self.operations_timed_out.load(Ordering::Relaxed),
            operations_skipped: self.operations_skipped.load(Ordering::Relaxed),
            active_operations: self.active_operations.load(Ordering::Relaxed),
            peak_active_operations: self.peak_active_operations.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_reused: self.channels_reused.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            channels_closed: ClosedChannels {
                explicit: self.closed_explicit.load(Ordering::Relaxed),
                idle: self.closed_idle.load(Ordering::Relaxed),
                fault: self.closed_fault.load(Ordering::Relaxed),
                shutdown: self.closed_shutdown.load(Ordering::Relaxed),
            },
        }
    }

    pub fn tool_latency(&self, tool: &str) -> Option<LatencySnapshot> {
        self.tool_latencies.get(tool).map(|stats| stats.snapshot())
    }

    pub fn all_tool_latencies(&self) -> Vec<(String, LatencySnapshot)> {
        self.tool_latencies
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

struct LatencyStats {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyStats {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);

        LatencySnapshot {
            count,
            avg_ms: if count > 0 { total / count } else { 0 },
            min_ms: if min == u64::MAX { 0 } else { min },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub batches_started: u64,
    pub batches_rejected: u64,
    pub operations_started: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub operations_timed_out: u64,
    pub operations_skipped: u64,
    pub active_operations: u64,
    pub peak_active_operations: u64,
    pub channels_opened: u64,
    pub channels_reused: u64,
    pub connection_errors: u64,
    pub channels_closed: ClosedChannels,
}

impl MetricsSnapshot {
    /// Percentage of settled operations that succeeded.
    pub fn success_rate(&self) -> f64 {
        let settled = self.operations_succeeded + self.operations_failed;
        if settled == 0 {
            100.0
        } else {
            (self.operations_succeeded as f64 / settled as f64) * 100.0
        }
    }
}

/// Channel closures broken down by [`CloseReason`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClosedChannels {
    pub explicit: u64,
    pub idle: u64,
    pub fault: u64,
    pub shutdown: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}
