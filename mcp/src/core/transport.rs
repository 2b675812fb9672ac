//! Transport validation and construction.
//!
//! `TransportBuilder` turns a transport descriptor into an unopened
//! [`TransportHandle`]. Nothing is spawned or dialed here; the connector
//! performs the handshake.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use rmcp::transport::ConfigureCommandExt;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::client::Request,
    http::{HeaderName, HeaderValue},
};
use tracing::debug;
use url::Url;

use super::config::{McpTransport, RegistryConfig, WebsocketOptions};
use crate::error::{McpError, McpResult};

/// Identifiers of this package and its binaries. A spawn target matching any
/// of them would start another aggregator instance.
pub const SELF_REFERENCE_PATTERNS: &[&str] = &["mcp-batch", "mcp_batch"];

const DEFAULT_SOCKET_SCHEME: &str = "ws";

/// Validated, not yet opened transport.
pub enum TransportHandle {
    ChildProcess {
        program: String,
        command: tokio::process::Command,
    },
    WebSocket {
        url: Url,
        request: Request,
        connect_timeout: Option<Duration>,
    },
}

impl TransportHandle {
    /// Human-readable endpoint for logs.
    pub fn endpoint(&self) -> String {
        match self {
            TransportHandle::ChildProcess { program, .. } => program.clone(),
            TransportHandle::WebSocket { url, .. } => url.to_string(),
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportHandle::ChildProcess { program, .. } => f
                .debug_struct("ChildProcess")
                .field("program", program)
                .finish(),
            TransportHandle::WebSocket {
                url,
                connect_timeout,
                ..
            } => f
                .debug_struct("WebSocket")
                .field("url", &url.as_str())
                .field("connect_timeout", connect_timeout)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportBuilder {
    self_patterns: Vec<String>,
    interpreters: Vec<String>,
    self_exe: Option<PathBuf>,
}

impl TransportBuilder {
    pub fn new(config: &RegistryConfig) -> Self {
        let self_patterns = SELF_REFERENCE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(config.self_reference_patterns.iter().cloned())
            .map(|p| p.to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        let interpreters = config
            .interpreters
            .iter()
            .map(|i| i.to_lowercase())
            .collect();

        Self {
            self_patterns,
            interpreters,
            self_exe: std::env::current_exe()
                .ok()
                .and_then(|p| p.canonicalize().ok()),
        }
    }

    pub fn build(&self, transport: &McpTransport) -> McpResult<TransportHandle> {
        match transport {
            McpTransport::Stdio { command, args, env } => {
                self.validate_local(command, args)?;
                let command_line = tokio::process::Command::new(command).configure(|cmd| {
                    cmd.args(args)
                        .envs(env.iter())
                        .stderr(std::process::Stdio::inherit())
                        .kill_on_drop(true);
                });
                Ok(TransportHandle::ChildProcess {
                    program: command.clone(),
                    command: command_line,
                })
            }
            McpTransport::Websocket { url, options } => {
                let url = normalize_socket_url(url)?;
                let request = build_upgrade_request(&url, options.as_ref())?;
                Ok(TransportHandle::WebSocket {
                    url,
                    request,
                    connect_timeout: options
                        .as_ref()
                        .and_then(|o| o.connect_timeout_ms)
                        .map(Duration::from_millis),
                })
            }
        }
    }

    /// Validate a local-process descriptor without spawning anything.
    pub fn validate_local(&self, command: &str, args: &[String]) -> McpResult<()> {
        let command = command.trim();
        if command.is_empty() {
            return Err(McpError::ConfigurationInvalid(
                "stdio transport requires a command".to_string(),
            ));
        }
        if args.is_empty() {
            return Err(McpError::ConfigurationInvalid(format!(
                "stdio transport for '{}' requires at least one argument",
                command
            )));
        }

        self.check_self_reference(command, args)?;

        if self.is_interpreter(command) {
            check_script_exists(command, &args[0])?;
        }
        Ok(())
    }

    /// Reject commands that would spawn this aggregator again.
    ///
    /// Heuristic only: compares the resolved executable against our own and
    /// falls back to case-insensitive substring matching on the full command
    /// line. Can both over- and under-match.
    pub fn check_self_reference(&self, command: &str, args: &[String]) -> McpResult<()> {
        if let (Some(own), Some(resolved)) = (&self.self_exe, resolve_command(command)) {
            if &resolved == own {
                return Err(McpError::ConfigurationInvalid(format!(
                    "command '{}' resolves to this process ({})",
                    command,
                    own.display()
                )));
            }
        }

        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
            .replace('\\', "/")
            .to_lowercase();

        if let Some(pattern) = self
            .self_patterns
            .iter()
            .find(|p| command_line.contains(p.as_str()))
        {
            return Err(McpError::ConfigurationInvalid(format!(
                "refusing to spawn '{}': matches self-reference pattern '{}'",
                command, pattern
            )));
        }
        Ok(())
    }

    fn is_interpreter(&self, command: &str) -> bool {
        Path::new(command)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| self.interpreters.iter().any(|i| i == &stem.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Parse a socket URL, defaulting a bare `host:port` to `ws://`.
pub fn normalize_socket_url(raw: &str) -> McpResult<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(McpError::ConfigurationInvalid(
            "websocket transport requires a url".to_string(),
        ));
    }

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{}://{}", DEFAULT_SOCKET_SCHEME, raw)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| McpError::ConfigurationInvalid(format!("invalid URL '{}': {}", raw, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(McpError::ConfigurationInvalid(format!(
                "unsupported socket scheme '{}' in '{}'",
                other, raw
            )))
        }
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(McpError::ConfigurationInvalid(format!(
            "URL '{}' has no host",
            raw
        )));
    }
    Ok(url)
}

fn build_upgrade_request(url: &Url, options: Option<&WebsocketOptions>) -> McpResult<Request> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| McpError::ConfigurationInvalid(format!("invalid URL '{}': {}", url, e)))?;

    if let Some(options) = options {
        for (key, value) in &options.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                McpError::ConfigurationInvalid(format!("header name '{}': {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpError::ConfigurationInvalid(format!("header value for '{}': {}", key, e))
            })?;
            request.headers_mut().insert(name, value);
        }
    }
    Ok(request)
}

fn check_script_exists(interpreter: &str, first_arg: &str) -> McpResult<()> {
    // Flags like `-m module` or `-e code` name no file.
    if first_arg.starts_with('-') {
        return Ok(());
    }

    let path = Path::new(first_arg);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    if !absolute.exists() {
        return Err(McpError::ValidationFailed(format!(
            "script '{}' for interpreter '{}' does not exist",
            absolute.display(),
            interpreter
        )));
    }
    debug!(
        "Validated script {} for {}",
        absolute.display(),
        interpreter
    );
    Ok(())
}

/// Resolve a command to a canonical executable path via `PATH`.
fn resolve_command(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.canonicalize().ok();
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| candidate.canonicalize().ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn builder() -> TransportBuilder {
        TransportBuilder::new(&RegistryConfig::default())
    }

    fn stdio(command: &str, args: &[&str]) -> McpTransport {
        McpTransport::Stdio {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_stdio_requires_command_and_args() {
        let err = builder().build(&stdio("", &["x"])).unwrap_err();
        assert!(matches!(err, McpError::ConfigurationInvalid(_)));

        let err = builder().build(&stdio("fs-server", &[])).unwrap_err();
        assert!(matches!(err, McpError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_stdio_builds_without_spawning() {
        let handle = builder()
            .build(&stdio("definitely-not-installed-server", &["--stdio"]))
            .unwrap();
        assert!(matches!(handle, TransportHandle::ChildProcess { .. }));
        assert_eq!(handle.endpoint(), "definitely-not-installed-server");
    }

    #[test]
    fn test_self_reference_rejected_before_file_check() {
        let err = builder()
            .build(&stdio("node", &["/opt/MCP-Batch/build/index.js"]))
            .unwrap_err();
        assert!(
            matches!(err, McpError::ConfigurationInvalid(ref m) if m.contains("self-reference")),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_self_reference_matches_windows_separators() {
        let err = builder()
            .check_self_reference("node", &["C:\\tools\\mcp_batch\\index.js".to_string()])
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_extra_self_reference_patterns() {
        let config = RegistryConfig {
            self_reference_patterns: vec!["My-Wrapper".to_string()],
            ..Default::default()
        };
        let builder = TransportBuilder::new(&config);
        let err = builder
            .check_self_reference("my-wrapper", &["--stdio".to_string()])
            .unwrap_err();
        assert!(matches!(err, McpError::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_interpreter_missing_script_fails_validation() {
        let err = builder()
            .build(&stdio("node", &["/nonexistent/dir/server.js"]))
            .unwrap_err();
        assert!(matches!(err, McpError::ValidationFailed(_)));

        let err = builder()
            .build(&stdio("/usr/bin/python3", &["/nonexistent/server.py"]))
            .unwrap_err();
        assert!(matches!(err, McpError::ValidationFailed(_)));
    }

    #[test]
    fn test_interpreter_existing_script_passes() {
        let script = tempfile::NamedTempFile::new().unwrap();
        let path = script.path().to_str().unwrap().to_string();
        let handle = builder().build(&stdio("node", &[&path])).unwrap();
        assert!(matches!(handle, TransportHandle::ChildProcess { .. }));
    }

    #[test]
    fn test_interpreter_flag_argument_skips_file_check() {
        let result = builder().build(&stdio("python3", &["-m", "my_server"]));
        assert!(result.is_ok());
    }

    #[test]
    fn test_non_interpreter_args_not_file_checked() {
        assert!(builder()
            .build(&stdio("fs-server", &["/does/not/exist"]))
            .is_ok());
    }

    #[test]
    fn test_socket_url_defaults_scheme() {
        let url = normalize_socket_url("localhost:9000").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(9000));

        let url = normalize_socket_url("wss://tools.example.com/mcp").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_socket_url_rejects_bad_input() {
        for raw in ["", "http://example.com", "ws://", "ws://exa mple.com"] {
            let err = normalize_socket_url(raw).unwrap_err();
            assert!(
                matches!(err, McpError::ConfigurationInvalid(_)),
                "expected ConfigurationInvalid for {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_websocket_headers_applied() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        let transport = McpTransport::Websocket {
            url: "127.0.0.1:7000".to_string(),
            options: Some(WebsocketOptions {
                headers,
                connect_timeout_ms: Some(250),
            }),
        };

        match builder().build(&transport).unwrap() {
            TransportHandle::WebSocket {
                url,
                request,
                connect_timeout,
            } => {
                assert_eq!(url.as_str(), "ws://127.0.0.1:7000/");
                assert_eq!(
                    request.headers().get("authorization").unwrap(),
                    "Bearer abc"
                );
                assert_eq!(connect_timeout, Some(Duration::from_millis(250)));
            }
            other => panic!("Expected WebSocket handle, got {:?}", other),
        }
    }

    #[test]
    fn test_websocket_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("Bad Header".to_string(), "x".to_string());
        let transport = McpTransport::Websocket {
            url: "ws://localhost:7000".to_string(),
            options: Some(WebsocketOptions {
                headers,
                connect_timeout_ms: None,
            }),
        };
        assert!(matches!(
            builder().build(&transport),
            Err(McpError::ConfigurationInvalid(_))
        ));
    }
}
