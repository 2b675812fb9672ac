//! Remote call seam and the rmcp-backed connector.
//!
//! The registry only ever sees [`ToolClient`] and [`Connector`]; everything
//! MCP-specific (handshake, request encoding, cancellation notifications)
//! lives behind them.

use std::{borrow::Cow, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use rmcp::{
    model::{
        CallToolRequest, CallToolRequestParam, ClientJsonRpcMessage, ClientRequest,
        ServerJsonRpcMessage, ServerResult,
    },
    service::{PeerRequestOptions, RunningService},
    transport::TokioChildProcess,
    RoleClient, ServiceError, ServiceExt,
};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::{config::RegistryConfig, transport::TransportHandle};
use crate::error::{McpError, McpResult};

pub type JsonObject = Map<String, Value>;

type McpClient = RunningService<RoleClient, ()>;

/// A live, handshaken channel to one downstream tool server.
///
/// Implementations must tolerate concurrent `call_tool` invocations.
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Invoke `tool` with `arguments` and return the raw result payload.
    ///
    /// `timeout` is a hint for clients that can cancel a request on the wire;
    /// callers enforce their own deadline regardless.
    async fn call_tool(
        &self,
        tool: &str,
        arguments: JsonObject,
        timeout: Option<Duration>,
    ) -> McpResult<Value>;

    /// Resolves once the underlying transport has faulted or closed.
    async fn closed(&self);

    /// Gracefully shut down the client and its transport.
    async fn close(&self) -> McpResult<()>;
}

/// Result of a successful handshake.
pub struct Connection {
    pub client: Arc<dyn ToolClient>,
    /// PID of the spawned server, for local-process transports.
    pub process_id: Option<u32>,
}

/// Opens a [`TransportHandle`] and performs the initial handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server_name: &str, transport: TransportHandle)
        -> McpResult<Connection>;
}

/// Production connector speaking MCP via `rmcp`.
pub struct RmcpConnector {
    fault_poll_interval: Duration,
    close_timeout: Duration,
}

impl RmcpConnector {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            fault_poll_interval: config.fault_poll_interval(),
            close_timeout: config.close_timeout(),
        }
    }

    async fn connect_child_process(
        &self,
        server_name: &str,
        program: String,
        command: tokio::process::Command,
    ) -> McpResult<Connection> {
        let transport = TokioChildProcess::new(command).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                McpError::CommandNotFound(program.clone())
            } else {
                McpError::ConnectionFailed(format!("spawn '{}': {}", program, e))
            }
        })?;
        let process_id = transport.id();

        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::ConnectionFailed(format!("initialize stdio client: {}", e)))?;

        info!(
            "Connected to stdio server '{}' ({}, pid {:?})",
            server_name, program, process_id
        );
        Ok(Connection {
            client: Arc::new(self.wrap(client)),
            process_id,
        })
    }

    async fn connect_websocket(
        &self,
        server_name: &str,
        url: url::Url,
        request: tungstenite::handshake::client::Request,
        connect_timeout: Option<Duration>,
    ) -> McpResult<Connection> {
        let connect = tokio_tungstenite::connect_async(request);
        let connected = match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                McpError::ConnectionFailed(format!(
                    "websocket connect to {} timed out after {:?}",
                    url, limit
                ))
            })?,
            None => connect.await,
        };
        let (stream, _response) = connected
            .map_err(|e| McpError::ConnectionFailed(format!("websocket connect {}: {}", url, e)))?;

        let (sink, stream) = stream.split();
        let sink = Box::pin(sink.with(|message: ClientJsonRpcMessage| {
            future::ready(
                serde_json::to_string(&message)
                    .map(Message::text)
                    .map_err(|e| {
                        tungstenite::Error::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e,
                        ))
                    }),
            )
        }));
        let stream = stream
            .take_while(|frame| future::ready(!matches!(frame, Err(_) | Ok(Message::Close(_)))))
            .filter_map(|frame| future::ready(decode_frame(frame)))
            .boxed();

        let client = ().serve((sink, stream)).await.map_err(|e| {
            McpError::ConnectionFailed(format!("initialize websocket client: {}", e))
        })?;

        info!("Connected to websocket server '{}' at {}", server_name, url);
        Ok(Connection {
            client: Arc::new(self.wrap(client)),
            process_id: None,
        })
    }

    fn wrap(&self, service: McpClient) -> RmcpToolClient {
        RmcpToolClient {
            service,
            fault_poll_interval: self.fault_poll_interval,
            close_timeout: self.close_timeout,
        }
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        server_name: &str,
        transport: TransportHandle,
    ) -> McpResult<Connection> {
        debug!("Connecting to '{}' via {:?}", server_name, transport);
        match transport {
            TransportHandle::ChildProcess { program, command } => {
                self.connect_child_process(server_name, program, command)
                    .await
            }
            TransportHandle::WebSocket {
                url,
                request,
                connect_timeout,
            } => {
                self.connect_websocket(server_name, url, request, connect_timeout)
                    .await
            }
        }
    }
}

fn decode_frame(frame: Result<Message, tungstenite::Error>) -> Option<ServerJsonRpcMessage> {
    let decoded = match frame.ok()? {
        Message::Text(text) => serde_json::from_str(text.as_str()),
        Message::Binary(bytes) => serde_json::from_slice(&bytes),
        _ => return None,
    };
    match decoded {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Dropping undecodable websocket frame: {}", e);
            None
        }
    }
}

/// [`ToolClient`] over an rmcp client session.
pub struct RmcpToolClient {
    service: McpClient,
    fault_poll_interval: Duration,
    close_timeout: Duration,
}

#[async_trait]
impl ToolClient for RmcpToolClient {
    async fn call_tool(
        &self,
        tool: &str,
        arguments: JsonObject,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        let request = ClientRequest::CallToolRequest(CallToolRequest::new(CallToolRequestParam {
            name: Cow::Owned(tool.to_string()),
            arguments: Some(arguments),
        }));
        let options = PeerRequestOptions {
            timeout,
            meta: None,
        };

        let handle = self
            .service
            .send_cancellable_request(request, options)
            .await
            .map_err(|e| McpError::RemoteTransportError(format!("send '{}': {}", tool, e)))?;

        match handle.await_response().await {
            Ok(ServerResult::CallToolResult(result)) => serde_json::to_value(result)
                .map_err(|e| McpError::RemoteTransportError(format!("decode result: {}", e))),
            Ok(_) => Err(McpError::RemoteTransportError(
                "unexpected response type".to_string(),
            )),
            Err(ServiceError::Timeout { timeout }) => Err(McpError::RemoteTimeout {
                tool: tool.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(ServiceError::McpError(e)) => {
                Err(McpError::RemoteApplicationError(e.message.to_string()))
            }
            Err(e) => Err(McpError::RemoteTransportError(e.to_string())),
        }
    }

    async fn closed(&self) {
        while !self.service.is_transport_closed() {
            tokio::time::sleep(self.fault_poll_interval).await;
        }
    }

    async fn close(&self) -> McpResult<()> {
        self.service.cancellation_token().cancel();
        tokio::time::timeout(self.close_timeout, self.closed())
            .await
            .map_err(|_| {
                McpError::RemoteTransportError(format!(
                    "transport still open {:?} after cancel",
                    self.close_timeout
                ))
            })
    }
}
