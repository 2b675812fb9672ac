//! Batch execution of remote tool calls over pooled MCP channels.
//!
//! ## Modules
//!
//! - [`core`]: transport construction, connection registry, operation
//!   runner and batch scheduler
//! - [`executor`]: the `batch_execute` capability built on top of them

pub mod core;
pub mod error;
pub mod executor;

pub use core::{
    BatchMetrics, BatchOptions, BatchOutcome, BatchScheduler, Channel, CloseReason, Connection,
    ConnectionRegistry, Connector, McpTransport, MetricsSnapshot, Operation, OperationResult,
    OperationRunner, PoolKey, RegistryConfig, RmcpConnector, ServerType, TargetServer, ToolClient,
    TransportBuilder, TransportHandle,
};
pub use error::{ErrorKind, McpError, McpResult};
pub use executor::{BatchExecutor, BatchRequest, BatchResponse, BatchSummary};
