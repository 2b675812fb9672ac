//! Core batch infrastructure.

pub mod client;
pub mod config;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod transport;

pub use client::{Connection, Connector, JsonObject, RmcpConnector, ToolClient};
pub use config::{
    BatchOptions, DatabaseConfig, FilesystemConfig, McpTransport, Operation, RegistryConfig,
    ServerType, TargetServer, WebsocketOptions,
};
pub use metrics::{BatchMetrics, LatencySnapshot, MetricsSnapshot};
pub use registry::{Channel, CloseReason, ConnectionRegistry, EntryInfo, PoolKey, PoolStats};
pub use runner::{OperationResult, OperationRunner};
pub use scheduler::{BatchOutcome, BatchScheduler};
pub use transport::{TransportBuilder, TransportHandle};
