//! Framing and message decoding for the agent connection.
//!
//! Messages travel as `Content-Length`-framed JSON, LSP style:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"result":{"sessionId":"s"}}
//! ```
//!
//! [`read_frame`] and [`write_frame`] handle the framing; [`decode_frame`]
//! splits incoming payloads into responses and notifications. The agent
//! never sends us requests, so anything carrying both an id and a method
//! is dropped with a log line.

use crate::agent::protocol::{JsonRpcNotification, JsonRpcResponse};
use sage_domain::AgentEvent;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

const CONTENT_LENGTH: &str = "Content-Length:";

/// A decoded incoming message.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Reads one framed payload. `Ok(None)` means the peer closed the
/// connection between frames.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut content_length: Option<usize> = None;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            // Stray blank line between frames
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix(CONTENT_LENGTH) {
            let length = rest.trim().parse::<usize>().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad Content-Length header: {trimmed}"),
                )
            })?;
            content_length = Some(length);
        }
        // Other headers are ignored
    }

    // The loop only breaks once the header was parsed
    let length = content_length.unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes one framed payload and flushes.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("{CONTENT_LENGTH} {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await
}

/// Classifies and parses one payload.
///
/// Returns `None` for payloads we do not route: unparseable JSON, incoming
/// requests, and messages that are neither response nor notification.
pub(crate) fn decode_frame(body: &[u8]) -> Option<Incoming> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!("agent sent unparseable frame: {e}");
            return None;
        }
    };

    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some();

    match (has_id, has_method) {
        (true, false) => match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => Some(Incoming::Response(response)),
            Err(e) => {
                warn!("agent sent malformed response: {e}");
                None
            }
        },
        (false, true) => match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(notification) => Some(Incoming::Notification(notification)),
            Err(e) => {
                warn!("agent sent malformed notification: {e}");
                None
            }
        },
        (true, true) => {
            warn!(
                "agent sent an incoming request ({}); requests are not served",
                value.get("method").and_then(serde_json::Value::as_str).unwrap_or("?")
            );
            None
        }
        (false, false) => {
            warn!("agent sent a frame that is neither response nor notification");
            None
        }
    }
}

/// Extracts the domain event from `session.event` params.
///
/// Params look like `{"sessionId": "...", "event": {"type": "...", ...}}`.
/// Some agents only put the session id on the envelope; it is copied into
/// the event's properties so downstream session filtering keeps working.
pub(crate) fn event_from_params(params: &Value) -> Option<AgentEvent> {
    let raw = params.get("event")?;
    let mut event: AgentEvent = serde_json::from_value(raw.clone()).ok()?;

    if event.session_id().is_none()
        && let Some(session_id) = params.get("sessionId").and_then(Value::as_str)
    {
        event
            .properties
            .insert("sessionId".to_string(), Value::String(session_id.to_string()));
    }

    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn framed(payload: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{payload}", payload.len()).into_bytes()
    }

    #[tokio::test]
    async fn test_read_frame_returns_one_body() {
        let data = framed(r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
        let mut reader = data.as_slice();

        let body = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(body, br#"{"jsonrpc":"2.0","id":1,"result":null}"#);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_handles_back_to_back_frames() {
        let mut data = framed(r#"{"a":1}"#);
        data.extend_from_slice(&framed(r#"{"b":2}"#));
        let mut reader = data.as_slice();

        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), br#"{"a":1}"#);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), br#"{"b":2}"#);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_bad_length() {
        let data = b"Content-Length: elephant\r\n\r\n{}".to_vec();
        let mut reader = data.as_slice();

        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_frame_round_trips_through_read_frame() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, r#"{"hello":"world"}"#).await.unwrap();

        let mut reader = buffer.as_slice();
        let body = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(body, br#"{"hello":"world"}"#);
    }

    #[test]
    fn test_decode_frame_classifies_responses() {
        let body = br#"{"jsonrpc":"2.0","id":3,"result":{"sessionId":"s"}}"#;
        match decode_frame(body) {
            Some(Incoming::Response(response)) => assert_eq!(response.id, Some(3)),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_classifies_notifications() {
        let body = br#"{"jsonrpc":"2.0","method":"session.event","params":{}}"#;
        match decode_frame(body) {
            Some(Incoming::Notification(notification)) => {
                assert_eq!(notification.method, "session.event");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_drops_incoming_requests_and_junk() {
        assert!(decode_frame(br#"{"jsonrpc":"2.0","id":1,"method":"tool.call"}"#).is_none());
        assert!(decode_frame(br#"{"jsonrpc":"2.0"}"#).is_none());
        assert!(decode_frame(b"not json at all").is_none());
    }

    #[test]
    fn test_event_from_params_parses_the_event() {
        let params = json!({
            "sessionId": "sess-1",
            "event": {"type": "assistant.message.delta", "sessionId": "sess-1", "content": "hi"}
        });

        let event = event_from_params(&params).unwrap();
        assert_eq!(event.event_type, "assistant.message.delta");
        assert_eq!(event.session_id(), Some("sess-1"));
        assert_eq!(event.content(), Some("hi"));
    }

    #[test]
    fn test_event_from_params_injects_envelope_session_id() {
        let params = json!({
            "sessionId": "sess-2",
            "event": {"type": "session.idle"}
        });

        let event = event_from_params(&params).unwrap();
        assert_eq!(event.session_id(), Some("sess-2"));
        assert!(event.is_terminal());
    }

    #[test]
    fn test_event_from_params_rejects_missing_event() {
        assert!(event_from_params(&json!({"sessionId": "s"})).is_none());
        assert!(event_from_params(&json!({"event": 42})).is_none());
    }
}
