//! Worker wire protocol
//!
//! Workers speak line-delimited JSON over stdin/stdout. Requests carry an
//! `action` tag (`execute`, `ping`) or a `type` tag for batches; replies
//! carry a `type` tag and are correlated by `requestId`. Anything on the
//! channel that does not parse as one of these shapes is noise (worker
//! banners, stray prints) and is dropped without surfacing an error.
//!
//! Wire field names stay camelCase for compatibility with existing
//! workers; serde renames map them onto Rust naming.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A command addressed to a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerCommand {
    #[serde(rename_all = "camelCase")]
    Execute {
        skill: String,
        params: Value,
        /// Whole seconds; workers enforce this on their side.
        timeout: u64,
        request_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Ping { request_id: String },
}

/// A batch command addressed to a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchCommand {
    #[serde(rename_all = "camelCase")]
    Batch {
        request_id: String,
        requests: Vec<BatchCallSpec>,
    },
    /// A `Batch` whose serialized form crossed the compression threshold:
    /// `data` is base64 of the zstd-compressed JSON array of call specs.
    #[serde(rename_all = "camelCase")]
    BatchCompressed {
        request_id: String,
        data: String,
        compression: String,
    },
}

/// One coalesced call inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCallSpec {
    pub id: String,
    pub skill: String,
    pub params: Value,
    /// Whole seconds.
    pub timeout: u64,
}

/// One result inside a batch response, positionally matched to its spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCallResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A message emitted by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Emitted once, unsolicited, when the worker is ready for requests.
    Ready,
    #[serde(rename_all = "camelCase")]
    Result {
        request_id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        execution_time: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Error { request_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    Pong { request_id: String },
    #[serde(rename_all = "camelCase")]
    BatchResponse {
        request_id: String,
        results: Vec<BatchCallResult>,
    },
}

impl WorkerReply {
    /// The `requestId` this reply correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerReply::Ready => None,
            WorkerReply::Result { request_id, .. }
            | WorkerReply::Error { request_id, .. }
            | WorkerReply::Pong { request_id }
            | WorkerReply::BatchResponse { request_id, .. } => Some(request_id),
        }
    }
}

/// Parse one line from a worker. Returns `None` for blank lines, non-JSON
/// noise, and JSON that is not a known reply shape.
pub fn parse_reply(line: &str) -> Option<WorkerReply> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Serialize a message as one protocol line (newline-terminated).
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_wire_shape() {
        let cmd = WorkerCommand::Execute {
            skill: "echo".into(),
            params: json!({"n": 1}),
            timeout: 30,
            request_id: "req-7".into(),
        };
        let line = encode_line(&cmd).unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["action"], "execute");
        assert_eq!(value["skill"], "echo");
        assert_eq!(value["timeout"], 30);
        assert_eq!(value["requestId"], "req-7");
    }

    #[test]
    fn test_ping_wire_shape() {
        let line = encode_line(&WorkerCommand::Ping {
            request_id: "health-1".into(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["action"], "ping");
        assert_eq!(value["requestId"], "health-1");
    }

    #[test]
    fn test_batch_wire_shape() {
        let cmd = BatchCommand::Batch {
            request_id: "batch-1".into(),
            requests: vec![BatchCallSpec {
                id: "req-1".into(),
                skill: "echo".into(),
                params: json!({}),
                timeout: 10,
            }],
        };
        let value: Value = serde_json::from_str(encode_line(&cmd).unwrap().trim()).unwrap();
        assert_eq!(value["type"], "batch");
        assert_eq!(value["requests"][0]["id"], "req-1");
    }

    #[test]
    fn test_parse_ready() {
        let reply = parse_reply(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(reply, WorkerReply::Ready));
        assert_eq!(reply.request_id(), None);
    }

    #[test]
    fn test_parse_result_with_correlation() {
        let reply =
            parse_reply(r#"{"type":"result","requestId":"req-3","result":{"ok":true}}"#).unwrap();
        assert_eq!(reply.request_id(), Some("req-3"));
        match reply {
            WorkerReply::Result { result, .. } => assert_eq!(result["ok"], true),
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_noise_is_dropped() {
        assert!(parse_reply("").is_none());
        assert!(parse_reply("   ").is_none());
        assert!(parse_reply("worker starting up...").is_none());
        assert!(parse_reply(r#"{"type":"surprise","requestId":"x"}"#).is_none());
        assert!(parse_reply(r#"{"unrelated":"json"}"#).is_none());
    }

    #[test]
    fn test_batch_response_roundtrip() {
        let reply = WorkerReply::BatchResponse {
            request_id: "batch-9".into(),
            results: vec![BatchCallResult {
                id: "req-1".into(),
                success: false,
                result: None,
                error: Some("boom".into()),
            }],
        };
        let line = encode_line(&reply).unwrap();
        let parsed = parse_reply(&line).unwrap();
        match parsed {
            WorkerReply::BatchResponse { results, .. } => {
                assert_eq!(results.len(), 1);
                assert!(!results[0].success);
                assert_eq!(results[0].error.as_deref(), Some("boom"));
            }
            other => panic!("expected batch response, got {:?}", other),
        }
    }
}
