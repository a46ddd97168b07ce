//! JSON-RPC message types for the agent wire protocol.
//!
//! The agent process speaks JSON-RPC 2.0 over a framed TCP connection:
//!
//! - **Requests**: client → agent (`session.create`, `session.send`)
//! - **Responses**: agent → client, correlated by request id
//! - **Notifications**: agent → client (`session.event` carrying one
//!   [`AgentEvent`](sage_domain::AgentEvent) per notification)

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Request method names understood by the agent.
pub mod methods {
    /// Open a new conversation session; result carries `sessionId`.
    pub const SESSION_CREATE: &str = "session.create";
    /// Submit a prompt into an existing session.
    pub const SESSION_SEND: &str = "session.send";
    /// Notification wrapping a single agent event.
    pub const SESSION_EVENT: &str = "session.event";
}

/// Process-wide request id counter.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// An outgoing JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Builds a request with a fresh auto-assigned id.
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: next_id(),
            method: method.into(),
            params,
        }
    }
}

/// An incoming JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// An incoming JSON-RPC notification (no id, no reply expected).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

/// Parameters for `session.create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Result of `session.create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResult {
    pub session_id: String,
}

/// Parameters for `session.send`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub session_id: String,
    pub prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_with_envelope_fields() {
        let request = JsonRpcRequest::new(
            methods::SESSION_SEND,
            Some(serde_json::json!({"sessionId": "s-1", "prompt": "hi"})),
        );

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "session.send");
        assert!(json["id"].as_u64().is_some());
        assert_eq!(json["params"]["prompt"], "hi");
    }

    #[test]
    fn test_request_without_params_omits_the_field() {
        let request = JsonRpcRequest::new("agent.ping", None);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = JsonRpcRequest::new("agent.ping", None);
        let b = JsonRpcRequest::new("agent.ping", None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_create_session_params_use_camel_case() {
        let params = CreateSessionParams {
            model: Some("sage-large".to_string()),
            system_prompt: Some("answer briefly".to_string()),
        };

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["model"], "sage-large");
        assert_eq!(json["systemPrompt"], "answer briefly");
    }

    #[test]
    fn test_create_session_params_omit_unset_fields() {
        let params = CreateSessionParams {
            model: None,
            system_prompt: None,
        };

        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("model").is_none());
        assert!(json.get("systemPrompt").is_none());
    }

    #[test]
    fn test_send_params_use_camel_case() {
        let params = SendParams {
            session_id: "sess-9".to_string(),
            prompt: "what are hooks?".to_string(),
        };

        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["sessionId"], "sess-9");
        assert_eq!(json["prompt"], "what are hooks?");
    }

    #[test]
    fn test_response_with_error_deserializes() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"result":null,"error":{"code":-32000,"message":"no such session","data":null}}"#;
        let response: JsonRpcResponse = serde_json::from_str(raw).unwrap();

        assert_eq!(response.id, Some(7));
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "no such session");
    }

    #[test]
    fn test_create_session_result_reads_camel_case() {
        let result: CreateSessionResult =
            serde_json::from_value(serde_json::json!({"sessionId": "sess-42"})).unwrap();
        assert_eq!(result.session_id, "sess-42");
    }

    #[test]
    fn test_notification_deserializes() {
        let raw = r#"{"jsonrpc":"2.0","method":"session.event","params":{"sessionId":"s"}}"#;
        let notification: JsonRpcNotification = serde_json::from_str(raw).unwrap();
        assert_eq!(notification.method, methods::SESSION_EVENT);
        assert!(notification.params.is_some());
    }
}
