//! Scripted in-memory connector and client for driving `BatchExecutor`.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use mcp_batch::{
    core::JsonObject, BatchExecutor, BatchOptions, BatchRequest, Connection, Connector, McpError,
    McpResult, McpTransport, Operation, RegistryConfig, ServerType, TargetServer, ToolClient,
    TransportHandle,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// How a scripted tool responds.
#[derive(Clone, Debug)]
pub enum Behavior {
    Reply {
        after: Duration,
        payload: Value,
    },
    Fail {
        after: Duration,
        error: String,
    },
    /// Never settles.
    Hang,
}

impl Behavior {
    pub fn text(after_ms: u64, text: &str) -> Self {
        Behavior::Reply {
            after: Duration::from_millis(after_ms),
            payload: json!({"content": [{"type": "text", "text": text}]}),
        }
    }

    pub fn payload(after_ms: u64, payload: Value) -> Self {
        Behavior::Reply {
            after: Duration::from_millis(after_ms),
            payload,
        }
    }

    pub fn fail(after_ms: u64, error: &str) -> Self {
        Behavior::Fail {
            after: Duration::from_millis(after_ms),
            error: error.to_string(),
        }
    }
}

pub type Script = Arc<Mutex<HashMap<String, Behavior>>>;

pub struct ScriptedClient {
    script: Script,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
    closes: AtomicUsize,
    faulted: AtomicBool,
    fault: Notify,
}

impl ScriptedClient {
    fn new(script: Script) -> Self {
        Self {
            script,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            faulted: AtomicBool::new(false),
            fault: Notify::new(),
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simulate a broken pipe.
    pub fn trip_fault(&self) {
        self.faulted.store(true, Ordering::SeqCst);
        self.fault.notify_waiters();
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolClient for ScriptedClient {
    async fn call_tool(
        &self,
        tool: &str,
        _arguments: JsonObject,
        _timeout: Option<Duration>,
    ) -> McpResult<Value> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        self.started.lock().push(tool.to_string());

        let behavior = self
            .script
            .lock()
            .get(tool)
            .cloned()
            .unwrap_or_else(|| Behavior::text(0, tool));

        match behavior {
            Behavior::Reply { after, payload } => {
                tokio::time::sleep(after).await;
                Ok(payload)
            }
            Behavior::Fail { after, error } => {
                tokio::time::sleep(after).await;
                Err(McpError::RemoteTransportError(error))
            }
            Behavior::Hang => std::future::pending().await,
        }
    }

    async fn closed(&self) {
        loop {
            let notified = self.fault.notified();
            if self.faulted.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn close(&self) -> McpResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`ScriptedClient`]s sharing one script.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Script,
    clients: Mutex<Vec<Arc<ScriptedClient>>>,
    refuse: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, tool: &str, behavior: Behavior) {
        self.script.lock().insert(tool.to_string(), behavior);
    }

    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn client(&self, index: usize) -> Arc<ScriptedClient> {
        Arc::clone(&self.clients.lock()[index])
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        server_name: &str,
        _transport: TransportHandle,
    ) -> McpResult<Connection> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionFailed(format!(
                "{} refused the handshake",
                server_name
            )));
        }
        let client = Arc::new(ScriptedClient::new(Arc::clone(&self.script)));
        self.clients.lock().push(Arc::clone(&client));
        Ok(Connection {
            client,
            process_id: None,
        })
    }
}

pub fn executor(connector: &Arc<ScriptedConnector>) -> BatchExecutor {
    init_test_logging();
    BatchExecutor::with_connector(RegistryConfig::default(), connector.clone())
}

pub fn socket_target(name: &str, url: &str) -> TargetServer {
    TargetServer {
        name: name.to_string(),
        server_type: ServerType::Generic(Default::default()),
        transport: McpTransport::Websocket {
            url: url.to_string(),
            options: None,
        },
        max_idle_time_ms: None,
    }
}

/// The websocket server most tests target.
pub fn fs_server() -> TargetServer {
    socket_target("fs", "localhost:9000")
}

pub fn ops(tools: &[&str]) -> Vec<Operation> {
    tools
        .iter()
        .map(|tool| Operation::new(*tool, JsonObject::new()))
        .collect()
}

pub fn request(target: TargetServer, tools: &[&str], options: BatchOptions) -> BatchRequest {
    BatchRequest {
        target_server: target,
        operations: ops(tools),
        options,
    }
}

pub fn options(max_concurrent: usize, timeout_ms: u64) -> BatchOptions {
    BatchOptions {
        max_concurrent,
        timeout_ms,
        ..Default::default()
    }
}
