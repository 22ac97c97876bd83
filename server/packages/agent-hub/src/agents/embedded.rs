//! Embedded agent provider: links an in-process agent runtime but still
//! drives the full ACP session lifecycle over an in-memory byte bus, through
//! the same JSON-RPC connection the stdio provider uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_hub_error::HubError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::acp::{
    drive_prompt, message_id_key, parse_session_id, RpcConn, RpcError, RpcMessage,
    CODE_METHOD_NOT_FOUND, JSONRPC_VERSION,
};

use super::{DeltaSink, StopReason, Streamer, TurnContext};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(8);
const PEER_CHUNK_DELAY: Duration = Duration::from_millis(10);
const TURN_START_RACE: &str = "turn/start failed";
const BUS_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct EmbeddedConfig {
    pub cwd: String,
    pub name: String,
    pub start_timeout: Duration,
    /// Injects the runtime startup race into the first created runtime so the
    /// retry guard can be exercised deterministically.
    pub fail_first_prompt: bool,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            cwd: String::new(),
            name: "embedded".to_string(),
            start_timeout: DEFAULT_START_TIMEOUT,
            fail_first_prompt: false,
        }
    }
}

struct EmbeddedSession {
    conn: Arc<RpcConn>,
    inbound: mpsc::UnboundedReceiver<RpcMessage>,
    peer_task: JoinHandle<()>,
    session_id: String,
}

impl EmbeddedSession {
    async fn shutdown(self) {
        self.conn.close().await;
        self.peer_task.abort();
    }
}

/// Provider with a cached runtime and session reused across turns. A first
/// `session/prompt` failing with the recognizable startup race tears the
/// runtime down and recreates it once before giving up.
pub struct EmbeddedAgent {
    config: EmbeddedConfig,
    session: Mutex<Option<EmbeddedSession>>,
    closed: AtomicBool,
    runtimes_created: AtomicU64,
}

impl EmbeddedAgent {
    pub fn new(config: EmbeddedConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
            runtimes_created: AtomicU64::new(0),
        }
    }

    async fn start_session(&self) -> Result<EmbeddedSession, HubError> {
        let created_before = self.runtimes_created.fetch_add(1, Ordering::SeqCst);
        let poison = self.config.fail_first_prompt && created_before == 0;

        let (hub_io, peer_io) = tokio::io::duplex(BUS_BUFFER_BYTES);
        let (hub_read, hub_write) = tokio::io::split(hub_io);
        let (conn, inbound) = RpcConn::connect(hub_read, hub_write);
        let peer_task = tokio::spawn(run_peer(
            peer_io,
            PeerConfig {
                poison_first_prompt: poison,
            },
        ));

        timeout(
            self.config.start_timeout,
            conn.call("initialize", json!({ "client": { "name": "agent-hub" } })),
        )
        .await
        .map_err(|_| HubError::timeout("embedded: initialize timed out"))??;

        let new_session = timeout(
            self.config.start_timeout,
            conn.call("session/new", json!({ "cwd": self.config.cwd })),
        )
        .await
        .map_err(|_| HubError::timeout("embedded: session/new timed out"))??;
        let session_id = parse_session_id(&new_session).ok_or_else(|| {
            HubError::upstream_unavailable("embedded: session/new returned empty sessionId")
        })?;

        Ok(EmbeddedSession {
            conn,
            inbound,
            peer_task,
            session_id,
        })
    }
}

#[async_trait]
impl Streamer for EmbeddedAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn stream(
        &self,
        turn: &TurnContext,
        input: &str,
        sink: &dyn DeltaSink,
    ) -> Result<StopReason, HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::upstream_unavailable("embedded: provider is closed"));
        }

        let mut guard = self.session.lock().await;
        for attempt in 0..2 {
            if guard.is_none() {
                match self.start_session().await {
                    Ok(session) => *guard = Some(session),
                    Err(_) if turn.is_cancelled() => return Ok(StopReason::Cancelled),
                    Err(err) => return Err(err),
                }
            }
            let Some(session) = guard.as_mut() else {
                continue;
            };

            // Stale updates from an earlier cancelled turn must not leak into
            // this turn's delta stream.
            while session.inbound.try_recv().is_ok() {}

            let prompt_params =
                json!({ "sessionId": session.session_id, "input": input });
            let result = drive_prompt(
                &session.conn,
                &mut session.inbound,
                &session.session_id,
                prompt_params,
                turn,
                sink,
            )
            .await;

            match result {
                Ok(stop) => return Ok(stop),
                Err(err) if attempt == 0 && is_turn_start_race(&err) => {
                    tracing::warn!(agent = %self.config.name, "turn-start race, recreating embedded runtime");
                    if let Some(stale) = guard.take() {
                        stale.shutdown().await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(HubError::internal("embedded: retry loop exited unexpectedly"))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
        }
    }
}

fn is_turn_start_race(err: &HubError) -> bool {
    err.to_string().contains(TURN_START_RACE)
}

// ---------------------------------------------------------------------------
// In-process runtime peer. Speaks the same wire contract an external agent
// would: streams word chunks, raises permission requests, honors
// session/cancel and reports cancelled stop reasons.

struct PeerConfig {
    poison_first_prompt: bool,
}

struct PeerState {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    poison_prompt: AtomicBool,
    session_seq: AtomicU64,
    permission_seq: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>,
    prompt_cancel: Mutex<Option<CancellationToken>>,
}

enum PromptOutcome {
    Completed,
    Cancelled,
}

async fn run_peer(io: DuplexStream, config: PeerConfig) {
    let (reader, writer) = tokio::io::split(io);
    let peer = Arc::new(PeerState {
        writer: Mutex::new(Box::new(writer)),
        poison_prompt: AtomicBool::new(config.poison_first_prompt),
        session_seq: AtomicU64::new(0),
        permission_seq: AtomicU64::new(0),
        pending: Mutex::new(HashMap::new()),
        prompt_cancel: Mutex::new(None),
    });

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<RpcMessage>(line) else {
            continue;
        };

        if message.is_response() {
            if let Some(id) = &message.id {
                let sender = peer.pending.lock().await.remove(&message_id_key(id));
                if let Some(sender) = sender {
                    let _ = sender.send(message);
                }
            }
            continue;
        }

        let Some(method) = message.method.clone() else {
            continue;
        };
        match method.as_str() {
            "initialize" => {
                if let Some(id) = message.id {
                    peer.reply_result(id, json!({ "protocolVersion": "1" })).await;
                }
            }
            "session/new" => {
                if let Some(id) = message.id {
                    let seq = peer.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
                    peer.reply_result(id, json!({ "sessionId": format!("emb_sess_{seq}") }))
                        .await;
                }
            }
            "session/prompt" => {
                let peer = peer.clone();
                tokio::spawn(async move {
                    peer.handle_prompt(message).await;
                });
            }
            "session/cancel" => {
                if let Some(cancel) = peer.prompt_cancel.lock().await.as_ref() {
                    cancel.cancel();
                }
                if let Some(id) = message.id {
                    peer.reply_result(id, json!({})).await;
                }
            }
            _ => {
                if let Some(id) = message.id {
                    peer.reply_error(id, CODE_METHOD_NOT_FOUND, "method not found")
                        .await;
                }
            }
        }
    }
}

impl PeerState {
    async fn handle_prompt(&self, message: RpcMessage) {
        let Some(id) = message.id.clone() else {
            return;
        };
        if self.poison_prompt.swap(false, Ordering::SeqCst) {
            self.reply_error(id, -32000, TURN_START_RACE).await;
            return;
        }

        let params = message.params.unwrap_or(Value::Null);
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let input = params
            .get("input")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();

        let cancel = CancellationToken::new();
        *self.prompt_cancel.lock().await = Some(cancel.clone());
        let outcome = self.stream_response(&session_id, &input, &cancel).await;
        *self.prompt_cancel.lock().await = None;

        let stop_reason = match outcome {
            PromptOutcome::Completed => "end_turn",
            PromptOutcome::Cancelled => "cancelled",
        };
        self.reply_result(id, json!({ "stopReason": stop_reason })).await;
    }

    async fn stream_response(
        &self,
        session_id: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> PromptOutcome {
        let text = if input.is_empty() {
            "OK".to_string()
        } else {
            input.to_string()
        };

        for chunk in word_chunks(&text) {
            if cancel.is_cancelled() {
                return PromptOutcome::Cancelled;
            }
            self.notify_update(session_id, &chunk).await;
            tokio::select! {
                _ = cancel.cancelled() => return PromptOutcome::Cancelled,
                _ = tokio::time::sleep(PEER_CHUNK_DELAY) => {}
            }
        }

        if text.to_ascii_lowercase().contains("permission") {
            let seq = self.permission_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let request_id = Value::from(format!("emb_perm_{seq}"));
            let (sender, receiver) = oneshot::channel();
            self.pending
                .lock()
                .await
                .insert(message_id_key(&request_id), sender);
            self.write(&RpcMessage {
                jsonrpc: Some(JSONRPC_VERSION.to_string()),
                id: Some(request_id),
                method: Some("session/request_permission".to_string()),
                params: Some(json!({
                    "sessionId": session_id,
                    "approval": "command",
                    "command": "echo test",
                })),
                ..Default::default()
            })
            .await;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                response = receiver => response.ok().and_then(|message| {
                    message
                        .result
                        .as_ref()
                        .and_then(|result| result.get("outcome"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
            };

            if outcome.as_deref() == Some("approved") {
                self.notify_update(session_id, " permission granted").await;
                return PromptOutcome::Completed;
            }
            return PromptOutcome::Cancelled;
        }

        PromptOutcome::Completed
    }

    async fn notify_update(&self, session_id: &str, text: &str) {
        self.write(&RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            method: Some("session/update".to_string()),
            params: Some(json!({
                "sessionId": session_id,
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": { "type": "text", "text": text },
                },
            })),
            ..Default::default()
        })
        .await;
    }

    async fn reply_result(&self, id: Value, result: Value) {
        self.write(&RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            result: Some(result),
            ..Default::default()
        })
        .await;
    }

    async fn reply_error(&self, id: Value, code: i64, message: &str) {
        self.write(&RpcMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(id),
            error: Some(RpcError {
                code,
                message: message.to_string(),
            }),
            ..Default::default()
        })
        .await;
    }

    async fn write(&self, message: &RpcMessage) {
        let Ok(mut encoded) = serde_json::to_vec(message) else {
            return;
        };
        encoded.push(b'\n');
        let mut writer = self.writer.lock().await;
        let _ = writer.write_all(&encoded).await;
        let _ = writer.flush().await;
    }
}

fn word_chunks(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![text.to_string()];
    }

    let last = words.len() - 1;
    words
        .into_iter()
        .enumerate()
        .map(|(index, word)| {
            if index == last {
                word.to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}
