//! The `batch_execute` capability.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    core::{
        client::Connector,
        config::{BatchOptions, Operation, RegistryConfig, TargetServer},
        metrics::{BatchMetrics, MetricsSnapshot},
        registry::ConnectionRegistry,
        runner::OperationResult,
        scheduler::BatchScheduler,
    },
    error::{McpError, McpResult},
};

/// A `batch_execute` call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub target_server: TargetServer,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub options: BatchOptions,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    /// Name of the target server.
    pub target_server: String,
    pub summary: BatchSummary,
    /// Started operations in completion order.
    pub operations: Vec<OperationResult>,
    /// Operations never dispatched because `stopOnError` tripped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub success_count: usize,
    pub fail_count: usize,
    /// Wall time from request receipt, including channel acquisition.
    pub total_duration_ms: u64,
}

/// Owns the connection registry and runs batches against it.
pub struct BatchExecutor {
    registry: ConnectionRegistry,
    scheduler: BatchScheduler,
    metrics: Arc<BatchMetrics>,
}

impl BatchExecutor {
    /// Executor backed by the `rmcp` connector.
    pub fn new(config: RegistryConfig) -> Self {
        let metrics = Arc::new(BatchMetrics::new());
        let registry = ConnectionRegistry::new(config, Arc::clone(&metrics));
        Self::from_parts(registry, metrics)
    }

    pub fn with_connector(config: RegistryConfig, connector: Arc<dyn Connector>) -> Self {
        let metrics = Arc::new(BatchMetrics::new());
        let registry = ConnectionRegistry::with_connector(config, connector, Arc::clone(&metrics));
        Self::from_parts(registry, metrics)
    }

    fn from_parts(registry: ConnectionRegistry, metrics: Arc<BatchMetrics>) -> Self {
        Self {
            scheduler: BatchScheduler::new(registry.clone(), Arc::clone(&metrics)),
            registry,
            metrics,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run every operation of `request` against its target server.
    ///
    /// Returns `Err` only for failures before dispatch (invalid options,
    /// transport configuration, connection). Per-operation failures are
    /// reported in the response.
    pub async fn batch_execute(&self, request: BatchRequest) -> McpResult<BatchResponse> {
        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        let span = info_span!(
            "batch",
            batch_id = %batch_id,
            target = %request.target_server.name
        );

        async move {
            self.metrics.record_batch_started();
            let result = self.run(request, started).await;
            if let Err(e) = &result {
                self.metrics.record_batch_rejected();
                warn!("Batch rejected before dispatch: {}", e);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: BatchRequest, started: Instant) -> McpResult<BatchResponse> {
        let BatchRequest {
            target_server,
            operations,
            options,
        } = request;

        options.validate()?;
        if let Some(index) = operations.iter().position(|op| op.tool.trim().is_empty()) {
            return Err(McpError::InvalidArguments(format!(
                "operation {} has an empty tool name",
                index
            )));
        }

        info!(
            "Starting {} operation(s): maxConcurrent={} timeoutMs={} stopOnError={} keepAlive={}",
            operations.len(),
            options.max_concurrent,
            options.timeout_ms,
            options.stop_on_error,
            options.keep_alive
        );

        let outcome = if operations.is_empty() {
            Default::default()
        } else {
            self.scheduler
                .execute(&target_server, operations, &options)
                .await?
        };

        let success_count = outcome.results.iter().filter(|r| r.success).count();
        let summary = BatchSummary {
            success_count,
            fail_count: outcome.results.len() - success_count,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Batch finished: {} succeeded, {} failed, {} skipped in {}ms",
            summary.success_count,
            summary.fail_count,
            outcome.skipped.len(),
            summary.total_duration_ms
        );

        Ok(BatchResponse {
            target_server: target_server.name,
            summary,
            operations: outcome.results,
            skipped: outcome.skipped,
        })
    }

    /// Close every cached channel.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: BatchRequest = serde_json::from_value(json!({
            "targetServer": {
                "name": "fs",
                "serverType": {"type": "filesystem", "config": {"rootDirectory": "/tmp"}},
                "transport": {"type": "websocket", "url": "localhost:9000"}
            },
            "operations": [{"tool": "list_dir", "arguments": {"path": "."}}]
        }))
        .unwrap();

        assert_eq!(request.options, BatchOptions::default());
        assert_eq!(request.operations[0].tool, "list_dir");
        assert_eq!(request.target_server.max_idle_time_ms, None);
    }

    #[test]
    fn test_response_omits_empty_skipped() {
        let response = BatchResponse {
            target_server: "fs".into(),
            summary: BatchSummary {
                success_count: 0,
                fail_count: 0,
                total_duration_ms: 0,
            },
            operations: Vec::new(),
            skipped: Vec::new(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("skipped").is_none());
        assert_eq!(
            value["summary"],
            json!({"successCount": 0, "failCount": 0, "totalDurationMs": 0})
        );
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_connecting() {
        let executor = BatchExecutor::new(RegistryConfig::default());
        let request: BatchRequest = serde_json::from_value(json!({
            "targetServer": {
                "name": "fs",
                "serverType": {"type": "generic", "config": {}},
                "transport": {"type": "stdio", "command": "fs-server", "args": ["--stdio"]}
            },
            "operations": [{"tool": "read"}],
            "options": {"maxConcurrent": 0}
        }))
        .unwrap();

        let err = executor.batch_execute(request).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments(_)));
        assert!(executor.registry().is_empty());
        assert_eq!(executor.metrics().batches_rejected, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_opens_no_channel() {
        let executor = BatchExecutor::new(RegistryConfig::default());
        let request: BatchRequest = serde_json::from_value(json!({
            "targetServer": {
                "name": "fs",
                "serverType": {"type": "generic", "config": {}},
                "transport": {"type": "stdio", "command": "fs-server", "args": ["--stdio"]}
            }
        }))
        .unwrap();

        let response = executor.batch_execute(request).await.unwrap();
        assert!(response.operations.is_empty());
        assert_eq!(response.summary.success_count, 0);
        assert!(executor.registry().is_empty());
    }
}
