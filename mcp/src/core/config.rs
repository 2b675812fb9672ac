//! Target, transport, batch and registry configuration types.
//!
//! Mirrors the `batch_execute` wire shape: target servers carry a tagged
//! server kind and a tagged transport; batch options and registry settings
//! default every field.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{McpError, McpResult};

/// Downstream tool server a batch is addressed to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetServer {
    pub name: String,
    pub server_type: ServerType,
    pub transport: McpTransport,

    /// Idle bound for this identity's cached channel.
    /// Falls back to `RegistryConfig::default_idle_timeout_secs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_time_ms: Option<u64>,
}

impl TargetServer {
    /// Idle bound for this target, falling back to the registry default.
    pub fn idle_timeout(&self, registry: &RegistryConfig) -> Duration {
        self.max_idle_time_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| registry.default_idle_timeout())
    }
}

/// Kind of downstream server. The core never interprets the config beyond
/// carrying it into the identity key.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum ServerType {
    Filesystem(FilesystemConfig),
    Database(DatabaseConfig),
    Generic(Map<String, Value>),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_mode: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<u32>,
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    /// Spawn a local process and speak MCP over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment for the child. Values are hashed into the
        /// identity key, never stored in it.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to a WebSocket endpoint. A bare `host:port` defaults to `ws://`.
    Websocket {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<WebsocketOptions>,
    },
}

impl McpTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            McpTransport::Stdio { .. } => "stdio",
            McpTransport::Websocket { .. } => "websocket",
        }
    }
}

impl fmt::Debug for McpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpTransport::Stdio { command, args, env } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .finish(),
            McpTransport::Websocket { url, options } => f
                .debug_struct("Websocket")
                .field("url", url)
                .field("options", options)
                .finish(),
        }
    }
}

#[derive(Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketOptions {
    /// Headers sent with the upgrade request (e.g. Authorization).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl fmt::Debug for WebsocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketOptions")
            .field("headers", &format!("{} headers", self.headers.len()))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

/// One remote tool invocation within a batch.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl Operation {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

/// Execution options for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default)]
    pub keep_alive: bool,
}

impl BatchOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.max_concurrent == 0 {
            return Err(McpError::InvalidArguments(
                "maxConcurrent must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(McpError::InvalidArguments(
                "timeoutMs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_ms: default_timeout_ms(),
            stop_on_error: false,
            keep_alive: false,
        }
    }
}

/// Connection registry settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// How often each cached channel checks whether it has gone idle (seconds)
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Idle bound for targets that do not set `maxIdleTimeMs` (seconds)
    #[serde(default = "default_idle_timeout")]
    pub default_idle_timeout_secs: u64,

    /// Probe interval for transport faults (milliseconds)
    #[serde(default = "default_fault_poll_interval")]
    pub fault_poll_interval_ms: u64,

    /// Bound on each graceful-close step (milliseconds)
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Extra self-reference patterns, appended to the built-in identifiers
    #[serde(default)]
    pub self_reference_patterns: Vec<String>,

    /// Commands treated as direct interpreter invocations
    #[serde(default = "default_interpreters")]
    pub interpreters: Vec<String>,
}

impl RegistryConfig {
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn default_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.default_idle_timeout_secs)
    }

    pub fn fault_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fault_poll_interval_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Sweep interval for a channel with the given idle bound.
    ///
    /// Stays finer than the idle bound: bounds shorter than the configured
    /// interval are checked at half their length (never below 10ms).
    pub fn sweep_interval_for(&self, idle_timeout: Duration) -> Duration {
        let configured = self.idle_check_interval();
        if idle_timeout > configured {
            configured.max(MIN_SWEEP_INTERVAL)
        } else {
            (idle_timeout / 2).max(MIN_SWEEP_INTERVAL)
        }
    }

    /// Load configuration from a YAML (or JSON) file
    pub async fn from_file(path: &str) -> McpResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_yaml::from_str(&content)
            .map_err(|e| McpError::ConfigurationInvalid(format!("{}: {}", path, e)))
    }

    /// Apply `MCP_BATCH_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = env_u64("MCP_BATCH_IDLE_CHECK_INTERVAL_SECS") {
            self.idle_check_interval_secs = secs;
        }
        if let Some(secs) = env_u64("MCP_BATCH_IDLE_TIMEOUT_SECS") {
            self.default_idle_timeout_secs = secs;
        }
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_check_interval_secs: default_idle_check_interval(),
            default_idle_timeout_secs: default_idle_timeout(),
            fault_poll_interval_ms: default_fault_poll_interval(),
            close_timeout_ms: default_close_timeout(),
            self_reference_patterns: Vec::new(),
            interpreters: default_interpreters(),
        }
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// Default value functions
fn default_max_concurrent() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_idle_check_interval() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_fault_poll_interval() -> u64 {
    250
}

fn default_close_timeout() -> u64 {
    5_000
}

fn default_interpreters() -> Vec<String> {
    ["node", "nodejs", "python", "python3", "deno", "bun"]
        .into_iter()
        .map(String::from)
        .collect()
}
