//! mcp-batch: run `batch_execute` requests against pooled MCP servers.
//!
//!   mcp-batch --request batch.json          # one request from a file
//!   mcp-batch < batches.ndjson              # one request per stdin line
//!   mcp-batch --config registry.yaml        # registry settings
//!
//! Responses go to stdout, one JSON document per request; logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mcp_batch::{BatchExecutor, BatchRequest, ErrorKind, McpError, RegistryConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

#[derive(Parser, Debug)]
#[command(name = "mcp-batch")]
#[command(about = "Execute batches of MCP tool calls over pooled connections")]
struct Cli {
    /// Registry configuration file (YAML or JSON)
    #[arg(long, env = "MCP_BATCH_CONFIG", value_name = "PATH")]
    config: Option<String>,

    /// Batch request file; newline-delimited requests are read from stdin otherwise
    #[arg(long, value_name = "PATH")]
    request: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "MCP_BATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level: LevelFilter = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let layer = if cli.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")
}

fn error_document(kind: ErrorKind, message: &str) -> Value {
    json!({"error": message, "errorKind": kind})
}

/// Execute one request, rendering rejections as error documents.
async fn respond(executor: &BatchExecutor, raw: &str) -> Value {
    let request: BatchRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(e) => {
            let err = McpError::InvalidArguments(format!("malformed batch request: {}", e));
            return error_document(err.kind(), &err.to_string());
        }
    };

    match executor.batch_execute(request).await {
        Ok(response) => serde_json::to_value(response)
            .unwrap_or_else(|e| error_document(ErrorKind::Io, &e.to_string())),
        Err(e) => error_document(e.kind(), &e.to_string()),
    }
}

async fn emit(document: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(document)?;
    line.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

async fn serve(executor: &BatchExecutor, request_file: Option<PathBuf>) -> Result<()> {
    if let Some(path) = request_file {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        return emit(&respond(executor, &raw).await).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        emit(&respond(executor, &line).await).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = match &cli.config {
        Some(path) => RegistryConfig::from_file(path)
            .await
            .with_context(|| format!("failed to load config {}", path))?,
        None => RegistryConfig::default(),
    }
    .with_env_overrides();

    let executor = BatchExecutor::new(config);
    info!("mcp-batch ready");

    let outcome = tokio::select! {
        result = serve(&executor, cli.request) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; abandoning in-flight batches");
            Ok(())
        }
    };

    executor.shutdown().await;
    info!("Shutdown complete");
    outcome
}
