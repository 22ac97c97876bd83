//! Newline-delimited JSON-RPC 2.0 plumbing shared by the ACP stdio provider
//! and the embedded in-memory bus: correlated calls, inbound notifications,
//! and server-initiated requests from the agent back to the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_hub_error::HubError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agents::{DeltaSink, PermissionRequest, StopReason, TurnContext};

pub const JSONRPC_VERSION: &str = "2.0";
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

const SESSION_CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

/// One JSON-RPC message in any of its four wire shapes. `id` stays a raw
/// `Value` so string and number ids correlate without re-typing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcMessage {
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }
}

pub fn message_id_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_else(|_| "null".to_string())
}

/// Renders an id the way a human would address it: bare text for strings,
/// raw JSON otherwise.
pub fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// One JSON-RPC connection over a byte stream. Responses resolve the pending
/// table; notifications and agent-initiated requests flow to the inbound
/// channel returned by [`RpcConn::connect`].
pub struct RpcConn {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl RpcConn {
    pub fn connect<R, W>(reader: R, writer: W) -> (Arc<Self>, mpsc::UnboundedReceiver<RpcMessage>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            closed: CancellationToken::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(conn.clone(), reader, inbound_tx));
        (conn, inbound_rx)
    }

    /// Sends a request and waits for its correlated response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, HubError> {
        let id = Value::from(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let key = message_id_key(&id);

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), sender);

        let message = RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        };
        if let Err(err) = self.write_message(&message).await {
            self.pending.lock().await.remove(&key);
            return Err(err);
        }

        let response = tokio::select! {
            received = receiver => match received {
                Ok(message) => message,
                Err(_) => {
                    return Err(HubError::upstream_unavailable(format!(
                        "acp: connection closed while waiting for {method} response"
                    )))
                }
            },
            _ = self.closed.cancelled() => {
                self.pending.lock().await.remove(&key);
                return Err(HubError::upstream_unavailable(format!(
                    "acp: connection closed while waiting for {method} response"
                )));
            }
        };

        if let Some(error) = response.error {
            return Err(HubError::upstream_unavailable(format!(
                "acp: rpc {method} error ({}): {}",
                error.code, error.message
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Sends a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), HubError> {
        self.write_message(&RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        })
        .await
    }

    pub async fn reply_result(&self, id: Value, result: Value) -> Result<(), HubError> {
        self.write_message(&RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            result: Some(result),
            ..Default::default()
        })
        .await
    }

    pub async fn reply_error(&self, id: Value, code: i64, message: &str) -> Result<(), HubError> {
        self.write_message(&RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            error: Some(RpcError {
                code,
                message: message.to_string(),
            }),
            ..Default::default()
        })
        .await
    }

    pub async fn reply_method_not_found(&self, id: Value) -> Result<(), HubError> {
        self.reply_error(id, CODE_METHOD_NOT_FOUND, "method not found").await
    }

    /// Closes the write side and unblocks every pending caller.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.pending.lock().await.clear();
    }

    async fn write_message(&self, message: &RpcMessage) -> Result<(), HubError> {
        let encoded = serde_json::to_vec(message)
            .map_err(|err| HubError::internal(format!("acp: encode rpc message: {err}")))?;

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&encoded)
            .await
            .map_err(|err| HubError::upstream_unavailable(format!("acp: write rpc message: {err}")))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|err| HubError::upstream_unavailable(format!("acp: write rpc delimiter: {err}")))?;
        writer
            .flush()
            .await
            .map_err(|err| HubError::upstream_unavailable(format!("acp: flush rpc message: {err}")))?;
        Ok(())
    }

    async fn dispatch_response(&self, message: RpcMessage) {
        let Some(id) = &message.id else { return };
        let key = message_id_key(id);
        let sender = self.pending.lock().await.remove(&key);
        if let Some(sender) = sender {
            let _ = sender.send(message);
        }
    }
}

async fn read_loop<R>(
    conn: Arc<RpcConn>,
    reader: R,
    inbound: mpsc::UnboundedSender<RpcMessage>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: RpcMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "dropping unparseable acp line");
                continue;
            }
        };

        if message.is_response() {
            conn.dispatch_response(message).await;
            continue;
        }

        if let Err(unconsumed) = inbound.send(message) {
            // Nobody is consuming the session; requests still get an answer.
            if let Some(id) = unconsumed.0.id {
                let _ = conn.reply_method_not_found(id).await;
            }
        }
    }

    conn.closed.cancel();
    conn.pending.lock().await.clear();
}

pub fn parse_session_id(result: &Value) -> Option<String> {
    let session_id = result.get("sessionId")?.as_str()?.trim();
    if session_id.is_empty() {
        None
    } else {
        Some(session_id.to_string())
    }
}

pub fn parse_stop_reason(result: &Value) -> String {
    result
        .get("stopReason")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Extracts a delta string from a `session/update` payload. Providers emit
/// either a flat `{delta}` or the nested `agent_message_chunk` shape.
pub fn extract_delta(params: &Value) -> Option<String> {
    if let Some(delta) = params.get("delta").and_then(Value::as_str) {
        return Some(delta.to_string());
    }

    let update = params.get("update")?;
    if update.get("sessionUpdate").and_then(Value::as_str) != Some("agent_message_chunk") {
        return None;
    }
    let text = update.get("content")?.get("text")?.as_str()?;
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn string_field(params: &Map<String, Value>, key: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Best-effort `session/cancel`, bounded so teardown never hangs on an
/// unresponsive agent.
pub async fn send_session_cancel(conn: &RpcConn, session_id: &str) {
    let _ = tokio::time::timeout(
        SESSION_CANCEL_TIMEOUT,
        conn.call("session/cancel", json!({ "sessionId": session_id })),
    )
    .await;
}

/// Runs one `session/prompt` while servicing inbound traffic: deltas to the
/// sink, permission requests to the turn's handler, everything else answered
/// with method-not-found. Cancellation sends a best-effort `session/cancel`
/// and normalizes to `Cancelled`.
pub async fn drive_prompt(
    conn: &Arc<RpcConn>,
    inbound: &mut mpsc::UnboundedReceiver<RpcMessage>,
    session_id: &str,
    prompt_params: Value,
    turn: &TurnContext,
    sink: &dyn DeltaSink,
) -> Result<StopReason, HubError> {
    let prompt_call = conn.call("session/prompt", prompt_params);
    tokio::pin!(prompt_call);

    loop {
        // Biased: inbound traffic drains ahead of the prompt response so a
        // trailing delta is never lost to the completion race.
        tokio::select! {
            biased;
            _ = turn.cancelled() => {
                send_session_cancel(conn, session_id).await;
                return Ok(StopReason::Cancelled);
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    if turn.is_cancelled() {
                        return Ok(StopReason::Cancelled);
                    }
                    return Err(HubError::upstream_unavailable(
                        "acp: agent connection closed mid-prompt",
                    ));
                };
                handle_inbound(conn, turn, sink, message).await?;
            }
            result = &mut prompt_call => {
                return match result {
                    Ok(value) => {
                        if turn.is_cancelled() || parse_stop_reason(&value) == "cancelled" {
                            Ok(StopReason::Cancelled)
                        } else {
                            Ok(StopReason::EndTurn)
                        }
                    }
                    Err(err) => {
                        if turn.is_cancelled() {
                            send_session_cancel(conn, session_id).await;
                            Ok(StopReason::Cancelled)
                        } else {
                            Err(err)
                        }
                    }
                };
            }
        }
    }
}

async fn handle_inbound(
    conn: &Arc<RpcConn>,
    turn: &TurnContext,
    sink: &dyn DeltaSink,
    message: RpcMessage,
) -> Result<(), HubError> {
    let Some(method) = message.method.clone() else {
        return Ok(());
    };

    match (method.as_str(), message.id) {
        ("session/update", None) => {
            if let Some(params) = &message.params {
                if let Some(delta) = extract_delta(params) {
                    sink.delta(&delta).await?;
                }
            }
            Ok(())
        }
        ("session/request_permission", Some(id)) => {
            let raw_params = message
                .params
                .as_ref()
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let request = PermissionRequest {
                request_id: id_to_string(&id),
                approval: string_field(&raw_params, "approval"),
                command: string_field(&raw_params, "command"),
                raw_params,
            };
            let response = turn.request_permission(request).await;
            conn.reply_result(id, json!({ "outcome": response.outcome.as_str() }))
                .await
        }
        (_, Some(id)) => conn.reply_method_not_found(id).await,
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_keys_distinguish_string_and_number() {
        assert_ne!(
            message_id_key(&Value::from(1)),
            message_id_key(&Value::from("1"))
        );
        assert_eq!(id_to_string(&Value::from("req-7")), "req-7");
        assert_eq!(id_to_string(&Value::from(7)), "7");
    }

    #[test]
    fn delta_extraction_supports_both_shapes() {
        assert_eq!(
            extract_delta(&json!({"delta": "abc"})),
            Some("abc".to_string())
        );
        assert_eq!(extract_delta(&json!({"delta": ""})), Some(String::new()));
        assert_eq!(
            extract_delta(&json!({
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": "xyz"}
                }
            })),
            Some("xyz".to_string())
        );
        assert_eq!(extract_delta(&json!({"update": {"sessionUpdate": "other"}})), None);
    }

    #[tokio::test]
    async fn call_correlates_response_over_duplex() {
        let (hub_io, peer_io) = tokio::io::duplex(4096);
        let (hub_read, hub_write) = tokio::io::split(hub_io);
        let (conn, _inbound) = RpcConn::connect(hub_read, hub_write);

        let (peer_read, peer_write) = tokio::io::split(peer_io);
        tokio::spawn(async move {
            let mut lines = BufReader::new(peer_read).lines();
            let mut writer = peer_write;
            while let Ok(Some(line)) = lines.next_line().await {
                let message: RpcMessage = serde_json::from_str(&line).expect("parse request");
                let reply = RpcMessage {
                    jsonrpc: Some(JSONRPC_VERSION.to_string()),
                    id: message.id,
                    result: Some(json!({"echo": message.method})),
                    ..Default::default()
                };
                let mut encoded = serde_json::to_vec(&reply).expect("encode reply");
                encoded.push(b'\n');
                writer.write_all(&encoded).await.expect("write reply");
            }
        });

        let result = conn.call("initialize", json!({})).await.expect("call");
        assert_eq!(result["echo"], "initialize");
    }

    #[tokio::test]
    async fn connection_close_unblocks_pending_calls() {
        let (hub_io, peer_io) = tokio::io::duplex(4096);
        let (hub_read, hub_write) = tokio::io::split(hub_io);
        let (conn, _inbound) = RpcConn::connect(hub_read, hub_write);

        drop(peer_io);
        let result = conn.call("session/prompt", json!({})).await;
        assert!(result.is_err());
    }
}
