//! Single remote call: dispatch, timeout race, outcome classification.

use std::{sync::Arc, time::Duration};

use scopeguard::defer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{config::Operation, metrics::BatchMetrics, registry::Channel};
use crate::error::{ErrorKind, McpError};

const IN_BAND_FALLBACK_MESSAGE: &str = "Tool reported an error without a message";

/// Outcome of one operation, as returned in a batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

impl OperationResult {
    fn succeeded(tool: String, payload: Value, duration_ms: u64) -> Self {
        Self {
            tool,
            success: true,
            result: Some(payload),
            error: None,
            error_kind: None,
            duration_ms,
        }
    }

    fn failed(tool: String, error: &McpError, duration_ms: u64) -> Self {
        Self {
            tool,
            success: false,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            duration_ms,
        }
    }
}

/// Runs operations against a channel.
///
/// The timeout is raced locally for every client. It is also handed to the
/// client so clients that can cancel on the wire do so; a late settlement of
/// an abandoned call is discarded.
#[derive(Clone)]
pub struct OperationRunner {
    metrics: Arc<BatchMetrics>,
}

impl OperationRunner {
    pub fn new(metrics: Arc<BatchMetrics>) -> Self {
        Self { metrics }
    }

    pub async fn run(
        &self,
        channel: &Channel,
        operation: Operation,
        timeout: Duration,
    ) -> OperationResult {
        let Operation { tool, arguments } = operation;
        let started = Instant::now();

        self.metrics.record_operation_start();
        defer! {
            self.metrics.record_operation_end();
        }

        let call = channel.client().call_tool(&tool, arguments, Some(timeout));
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(payload)) => match in_band_error(&payload) {
                Some(message) => Err(McpError::RemoteApplicationError(message)),
                None => Ok(payload),
            },
            Ok(Err(e)) => Err(classify_call_error(e)),
            Err(_) => Err(McpError::RemoteTimeout {
                tool: tool.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(payload) => {
                self.metrics.record_operation_result(&tool, true, false, duration_ms);
                OperationResult::succeeded(tool, payload, duration_ms)
            }
            Err(e) => {
                let timed_out = matches!(e, McpError::RemoteTimeout { .. });
                if timed_out {
                    warn!(
                        "Tool '{}' on '{}' timed out after {:?}",
                        tool,
                        channel.key(),
                        timeout
                    );
                } else {
                    debug!("Tool '{}' on '{}' failed: {}", tool, channel.key(), e);
                }
                self.metrics.record_operation_result(&tool, false, timed_out, duration_ms);
                OperationResult::failed(tool, &e, duration_ms)
            }
        }
    }
}

/// Errors raised by a call are per-operation; anything that is not already a
/// remote error is a channel fault.
fn classify_call_error(error: McpError) -> McpError {
    match error {
        McpError::RemoteTimeout { .. }
        | McpError::RemoteApplicationError(_)
        | McpError::RemoteTransportError(_) => error,
        other => McpError::RemoteTransportError(other.to_string()),
    }
}

/// Extract the message of an in-band failure (`isError: true`), if any.
///
/// Prefers an `error` field, then `message`, then the joined text content
/// entries.
pub fn in_band_error(payload: &Value) -> Option<String> {
    let object = payload.as_object()?;
    let flagged = object.get("isError").and_then(Value::as_bool);
    if !flagged.unwrap_or(false) {
        return None;
    }

    let field = |name: &str| match object.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(Value::String(_)) => None,
        Some(other) => Some(other.to_string()),
    };

    let message = field("error").or_else(|| field("message")).or_else(|| {
        let texts: Vec<&str> = object
            .get("content")?
            .as_array()?
            .iter()
            .filter(|entry| entry.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|entry| entry.get("text").and_then(Value::as_str))
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    });

    Some(message.unwrap_or_else(|| IN_BAND_FALLBACK_MESSAGE.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_in_band_error_precedence() {
        let payload = json!({"isError": true, "error": "disk full", "message": "ignored"});
        assert_eq!(in_band_error(&payload).as_deref(), Some("disk full"));

        let payload = json!({"isError": true, "message": "quota exceeded"});
        assert_eq!(in_band_error(&payload).as_deref(), Some("quota exceeded"));

        let payload = json!({
            "isError": true,
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "second"}
            ]
        });
        assert_eq!(in_band_error(&payload).as_deref(), Some("first\nsecond"));

        let payload = json!({"isError": true, "content": []});
        assert_eq!(
            in_band_error(&payload).as_deref(),
            Some(IN_BAND_FALLBACK_MESSAGE)
        );
    }

    #[test]
    fn test_structured_error_field_is_stringified() {
        let payload = json!({"isError": true, "error": {"code": 28}});
        assert_eq!(in_band_error(&payload).as_deref(), Some(r#"{"code":28}"#));
    }

    #[test]
    fn test_untagged_payload_is_success() {
        assert!(in_band_error(&json!({"content": [{"type": "text", "text": "ok"}]})).is_none());
        assert!(in_band_error(&json!({"isError": false, "error": "stale"})).is_none());
        assert!(in_band_error(&json!("plain string")).is_none());
        assert!(in_band_error(&json!({"isError": "yes"})).is_none());
    }

    #[test]
    fn test_classify_call_error() {
        let fatal = classify_call_error(McpError::ConnectionFailed("pipe".into()));
        assert_eq!(fatal.kind(), ErrorKind::RemoteTransportError);

        let kept = classify_call_error(McpError::RemoteApplicationError("nope".into()));
        assert_eq!(kept.to_string(), "nope");
    }

    #[test]
    fn test_operation_result_wire_shape() {
        let err = McpError::RemoteTimeout {
            tool: "slow".into(),
            timeout_ms: 50,
        };
        let value = serde_json::to_value(OperationResult::failed("slow".into(), &err, 51)).unwrap();
        assert_eq!(
            value,
            json!({
                "tool": "slow",
                "success": false,
                "error": "Tool 'slow' timed out after 50ms",
                "errorKind": "remoteTimeout",
                "durationMs": 51
            })
        );

        let ok = OperationResult::succeeded("fast".into(), json!({"content": []}), 3);
        let value = serde_json::to_value(ok).unwrap();
        assert_eq!(value["result"], json!({"content": []}));
        assert!(value.get("error").is_none());
    }
}
