use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use agent_hub_error::HubError;
use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::acp::{drive_prompt, parse_session_id, RpcConn, RpcMessage};

use super::{DeltaSink, StopReason, Streamer, TurnContext};

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(8);

const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Configuration for one external ACP agent binary.
#[derive(Debug, Clone)]
pub struct AcpStdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub name: String,
    pub start_timeout: Duration,
}

impl AcpStdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            dir: None,
            env: Vec::new(),
            name: "acp-stdio".to_string(),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }
}

/// ACP provider over a child process's stdio. One process is spawned per
/// streamed turn and torn down when the turn ends.
pub struct AcpStdioAgent {
    config: AcpStdioConfig,
}

impl AcpStdioAgent {
    pub fn new(config: AcpStdioConfig) -> Result<Self, HubError> {
        if config.command.trim().is_empty() {
            return Err(HubError::invalid_argument("acp: command is required"));
        }
        Ok(Self { config })
    }

    async fn run_session(
        &self,
        conn: &Arc<RpcConn>,
        inbound: &mut mpsc::UnboundedReceiver<RpcMessage>,
        turn: &TurnContext,
        input: &str,
        sink: &dyn DeltaSink,
    ) -> Result<StopReason, HubError> {
        // Startup cancellation short-circuits here; cancellation during the
        // prompt is handled inside the driver so session/cancel is sent.
        let session_id = tokio::select! {
            biased;
            _ = turn.cancelled() => return Ok(StopReason::Cancelled),
            result = self.start_session(conn) => result?,
        };

        drive_prompt(
            conn,
            inbound,
            &session_id,
            json!({ "sessionId": session_id, "input": input }),
            turn,
            sink,
        )
        .await
    }

    async fn start_session(&self, conn: &Arc<RpcConn>) -> Result<String, HubError> {
        timeout(
            self.config.start_timeout,
            conn.call("initialize", json!({ "client": { "name": "agent-hub" } })),
        )
        .await
        .map_err(|_| HubError::timeout("acp: initialize timed out"))??;

        let session_params = match &self.config.dir {
            Some(dir) => json!({ "cwd": dir.to_string_lossy() }),
            None => json!({}),
        };
        let new_session = timeout(
            self.config.start_timeout,
            conn.call("session/new", session_params),
        )
        .await
        .map_err(|_| HubError::timeout("acp: session/new timed out"))??;
        parse_session_id(&new_session)
            .ok_or_else(|| HubError::upstream_unavailable("acp: session/new returned empty sessionId"))
    }
}

#[async_trait]
impl Streamer for AcpStdioAgent {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn stream(
        &self,
        turn: &TurnContext,
        input: &str,
        sink: &dyn DeltaSink,
    ) -> Result<StopReason, HubError> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            HubError::upstream_unavailable(format!(
                "acp: start agent process {}: {err}",
                self.config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::upstream_unavailable("acp: capture agent process stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::upstream_unavailable("acp: capture agent process stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HubError::upstream_unavailable("acp: capture agent process stderr"))?;

        let agent_name = self.config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(agent = %agent_name, "agent process stderr: {line}");
            }
        });

        let (conn, mut inbound) = RpcConn::connect(stdout, stdin);

        let outcome = self.run_session(&conn, &mut inbound, turn, input, sink).await;

        conn.close().await;
        terminate_process(&mut child).await;

        outcome
    }
}

/// Closing stdin signals the agent to exit; after the grace window the
/// process is killed.
async fn terminate_process(child: &mut Child) {
    if timeout(PROCESS_EXIT_GRACE, child.wait()).await.is_ok() {
        return;
    }
    let _ = child.start_kill();
    let _ = timeout(PROCESS_EXIT_GRACE, child.wait()).await;
}
