//! Bounded-concurrency batch scheduler.
//!
//! Pending operations sit in a FIFO; at most `maxConcurrent` run at once on
//! the calling task. Results are collected in completion order.

use std::{collections::VecDeque, sync::Arc};

use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{debug, info};

use super::{
    config::{BatchOptions, Operation, TargetServer},
    metrics::BatchMetrics,
    registry::{Channel, ConnectionRegistry},
    runner::{OperationResult, OperationRunner},
};
use crate::error::McpResult;

/// Results of a scheduled batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// One entry per started operation, in completion order.
    pub results: Vec<OperationResult>,
    /// Tools never dispatched because `stopOnError` tripped, in queue order.
    pub skipped: Vec<String>,
}

/// Holds a channel for the duration of a batch.
///
/// Without `keepAlive` the leased generation is closed on release (a newer
/// channel cached under the same key is left alone); otherwise the lease is
/// returned and the channel stays cached. Dropping an unreleased lease
/// schedules the same release on the runtime.
struct ChannelLease {
    registry: ConnectionRegistry,
    channel: Option<Channel>,
    keep_alive: bool,
}

impl ChannelLease {
    fn new(registry: ConnectionRegistry, channel: Channel, keep_alive: bool) -> Self {
        Self {
            registry,
            channel: Some(channel),
            keep_alive,
        }
    }

    async fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            finish(&self.registry, channel, self.keep_alive).await;
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if self.keep_alive {
            self.registry.release(&channel);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                handle.spawn(async move {
                    registry.close_channel(&channel).await;
                });
            }
            Err(_) => {
                // No runtime left; the idle monitor died with it.
                self.registry.release(&channel);
            }
        }
    }
}

async fn finish(registry: &ConnectionRegistry, channel: Channel, keep_alive: bool) {
    if keep_alive {
        registry.release(&channel);
        debug!("Keeping channel '{}' cached", channel.key());
    } else if !registry.close_channel(&channel).await {
        debug!("Channel '{}' was already evicted", channel.key());
    }
}

/// Drives a batch's operations through the [`OperationRunner`].
#[derive(Clone)]
pub struct BatchScheduler {
    registry: ConnectionRegistry,
    runner: OperationRunner,
    metrics: Arc<BatchMetrics>,
}

impl BatchScheduler {
    pub fn new(registry: ConnectionRegistry, metrics: Arc<BatchMetrics>) -> Self {
        Self {
            registry,
            runner: OperationRunner::new(Arc::clone(&metrics)),
            metrics,
        }
    }

    /// Acquire the target's channel, drain `operations`, then release it.
    ///
    /// Fails only if the channel cannot be acquired; per-operation failures
    /// are recorded in the outcome.
    pub async fn execute(
        &self,
        target: &TargetServer,
        operations: Vec<Operation>,
        options: &BatchOptions,
    ) -> McpResult<BatchOutcome> {
        let channel = self.registry.get_or_create(target).await?;
        let lease = ChannelLease::new(self.registry.clone(), channel.clone(), options.keep_alive);

        let outcome = self.drain(&channel, operations, options).await;
        lease.release().await;
        Ok(outcome)
    }

    /// Run `operations` over `channel` with at most `maxConcurrent` in flight.
    pub async fn drain(
        &self,
        channel: &Channel,
        operations: Vec<Operation>,
        options: &BatchOptions,
    ) -> BatchOutcome {
        let limit = options.max_concurrent.max(1);
        let timeout = options.timeout();

        let mut pending: VecDeque<Operation> = operations.into();
        let mut running = FuturesUnordered::new();
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(pending.len()),
            skipped: Vec::new(),
        };

        loop {
            while running.len() < limit {
                let Some(operation) = pending.pop_front() else {
                    break;
                };
                debug!("Dispatching '{}' on '{}'", operation.tool, channel.key());
                running.push(self.runner.run(channel, operation, timeout));
            }

            let Some(result) = running.next().await else {
                break;
            };

            if !result.success && options.stop_on_error && !pending.is_empty() {
                info!(
                    "'{}' failed with stopOnError; skipping {} queued, awaiting {} in flight",
                    result.tool,
                    pending.len(),
                    running.len()
                );
                self.metrics.record_operations_skipped(pending.len());
                outcome
                    .skipped
                    .extend(pending.drain(..).map(|operation| operation.tool));
            }
            outcome.results.push(result);
        }

        outcome
    }
}
