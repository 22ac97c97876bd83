//! Binary entry: flag parsing, logging, bootstrap and graceful shutdown.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_hub_error::HubError;
use agent_hub_storage::{StorageError, Store, Thread};
use clap::Parser;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agents::acp_stdio::{AcpStdioAgent, AcpStdioConfig};
use crate::agents::embedded::{EmbeddedAgent, EmbeddedConfig};
use crate::agents::Streamer;
use crate::cache::AgentFactory;
use crate::router::{build_router, AgentInfo, AppState, AuthConfig, HubConfig};

#[derive(Parser, Debug)]
#[command(name = "agent-hub", about = "Local-first agent hub server", version)]
pub struct Cli {
    /// Server listen address.
    #[arg(long, default_value = "127.0.0.1:8686")]
    pub listen: String,

    /// Allow listening on public interfaces.
    #[arg(long)]
    pub allow_public: bool,

    /// Optional bearer token required for /v1/* endpoints.
    #[arg(long)]
    pub auth_token: Option<String>,

    /// SQLite database path. Defaults to ~/.agent-hub/agent-hub.db.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Number of recent user+assistant turns injected into each prompt.
    #[arg(long, default_value_t = 10)]
    pub context_recent_turns: usize,

    /// Maximum character budget for the injected context prompt.
    #[arg(long, default_value_t = 20_000)]
    pub context_max_chars: usize,

    /// Maximum summary characters produced by the compact endpoint.
    #[arg(long, default_value_t = 4_000)]
    pub compact_max_chars: usize,

    /// Idle seconds before a cached thread agent provider is closed.
    #[arg(long, default_value_t = 300)]
    pub agent_idle_ttl_secs: u64,

    /// Seconds a pending permission waits for a decision before failing
    /// closed.
    #[arg(long, default_value_t = 15)]
    pub permission_timeout_secs: u64,

    /// Graceful shutdown window for active turns.
    #[arg(long, default_value_t = 8)]
    pub shutdown_grace_secs: u64,

    /// External ACP agent command used by the "acp" agent id.
    #[arg(long)]
    pub acp_command: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid flag: {0}")]
    InvalidFlag(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();
    validate_flags(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cli))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn validate_flags(cli: &Cli) -> Result<(), CliError> {
    if cli.context_recent_turns == 0 {
        return Err(CliError::InvalidFlag(
            "--context-recent-turns must be positive".to_string(),
        ));
    }
    if cli.context_max_chars == 0 {
        return Err(CliError::InvalidFlag(
            "--context-max-chars must be positive".to_string(),
        ));
    }
    if cli.compact_max_chars == 0 {
        return Err(CliError::InvalidFlag(
            "--compact-max-chars must be positive".to_string(),
        ));
    }
    if cli.agent_idle_ttl_secs == 0 {
        return Err(CliError::InvalidFlag(
            "--agent-idle-ttl-secs must be positive".to_string(),
        ));
    }
    if cli.permission_timeout_secs == 0 {
        return Err(CliError::InvalidFlag(
            "--permission-timeout-secs must be positive".to_string(),
        ));
    }
    if cli.shutdown_grace_secs == 0 {
        return Err(CliError::InvalidFlag(
            "--shutdown-grace-secs must be positive".to_string(),
        ));
    }
    Ok(())
}

async fn serve(cli: Cli) -> Result<(), CliError> {
    let listen = validate_listen_addr(&cli.listen, cli.allow_public)?;

    let db_path = match cli.db_path.clone() {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Store::open(&db_path).await?;

    let acp_command = cli.acp_command.clone();
    let acp_available = acp_command
        .as_deref()
        .map(|command| which::which(command).is_ok())
        .unwrap_or(false);
    if !acp_available {
        tracing::warn!("external ACP agent unavailable; set --acp-command to enable it");
    }
    let agents = vec![
        AgentInfo {
            id: "embedded".to_string(),
            name: "Embedded".to_string(),
            status: "available".to_string(),
        },
        AgentInfo {
            id: "acp".to_string(),
            name: "ACP Agent".to_string(),
            status: if acp_available {
                "available".to_string()
            } else {
                "unavailable".to_string()
            },
        },
    ];

    let auth = match cli.auth_token.clone() {
        Some(token) if !token.trim().is_empty() => AuthConfig::with_token(token),
        _ => AuthConfig::disabled(),
    };
    let config = HubConfig {
        agents: agents.clone(),
        allowed_agents: vec!["embedded".to_string(), "acp".to_string()],
        allowed_roots: vec![PathBuf::from("/")],
        context_recent_turns: cli.context_recent_turns,
        context_max_chars: cli.context_max_chars,
        compact_max_chars: cli.compact_max_chars,
        permission_timeout: Duration::from_secs(cli.permission_timeout_secs),
        agent_idle_ttl: Duration::from_secs(cli.agent_idle_ttl_secs),
    };

    let state = AppState::new(auth, store, default_agent_factory(acp_command), config);
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    print_startup_summary(&listen, &db_path, &agents);
    tracing::info!(addr = %listen, db = %db_path.display(), "server listening");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                signal_token.cancel();
            })
            .await
    });

    let grace = Duration::from_secs(cli.shutdown_grace_secs);
    tokio::select! {
        result = &mut server_task => {
            state.shutdown(grace).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(CliError::Server(err.to_string())),
                Err(err) => return Err(CliError::Server(err.to_string())),
            }
        }
        _ = shutdown.cancelled() => {
            tracing::info!(
                active_turns = state.controller().active_count(),
                "shutdown started"
            );
            state.shutdown(grace).await;
            if tokio::time::timeout(Duration::from_secs(2), &mut server_task)
                .await
                .is_err()
            {
                server_task.abort();
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Wires thread metadata to a concrete provider. The embedded runtime is
/// always linkable; the external "acp" agent takes its command from
/// agentOptions or the server-wide flag.
pub fn default_agent_factory(acp_command: Option<String>) -> AgentFactory {
    Arc::new(move |thread: Thread| {
        let acp_command = acp_command.clone();
        async move {
            match thread.agent_id.as_str() {
                "embedded" => {
                    let agent = EmbeddedAgent::new(EmbeddedConfig {
                        cwd: thread.cwd.clone(),
                        ..Default::default()
                    });
                    Ok(Arc::new(agent) as Arc<dyn Streamer>)
                }
                "acp" => {
                    let command = agent_option_string(&thread, "command")
                        .or(acp_command)
                        .ok_or_else(|| {
                            HubError::upstream_unavailable("no ACP agent command configured")
                        })?;
                    let mut config = AcpStdioConfig::new(command);
                    config.args = agent_option_string_list(&thread, "args");
                    config.dir = Some(PathBuf::from(&thread.cwd));
                    let agent = AcpStdioAgent::new(config)?;
                    Ok(Arc::new(agent) as Arc<dyn Streamer>)
                }
                other => Err(HubError::upstream_unavailable(format!(
                    "unsupported thread agent {other:?}"
                ))),
            }
        }
        .boxed()
    })
}

fn agent_options(thread: &Thread) -> Option<Value> {
    serde_json::from_str(&thread.agent_options_json).ok()
}

fn agent_option_string(thread: &Thread, key: &str) -> Option<String> {
    let options = agent_options(thread)?;
    let value = options.get(key)?.as_str()?.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn agent_option_string_list(thread: &Thread, key: &str) -> Vec<String> {
    agent_options(thread)
        .and_then(|options| options.get(key).cloned())
        .and_then(|value| match value {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

fn validate_listen_addr(listen: &str, allow_public: bool) -> Result<String, CliError> {
    let (host, port_text) = listen
        .rsplit_once(':')
        .ok_or_else(|| CliError::InvalidFlag(format!("invalid --listen value {listen:?}")))?;
    let port: u16 = port_text
        .parse()
        .map_err(|_| CliError::InvalidFlag(format!("invalid port in --listen value {listen:?}")))?;
    if port == 0 {
        return Err(CliError::InvalidFlag(format!(
            "invalid port in --listen value {listen:?}"
        )));
    }

    if allow_public {
        return Ok(listen.to_string());
    }

    if host.is_empty() || host == "0.0.0.0" || host == "::" || host == "[::]" {
        return Err(CliError::InvalidFlag(format!(
            "public listen address {listen:?} requires --allow-public"
        )));
    }
    if host == "localhost" {
        return Ok(listen.to_string());
    }

    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    match bare_host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(listen.to_string()),
        _ => Err(CliError::InvalidFlag(format!(
            "non-loopback listen address {listen:?} requires --allow-public"
        ))),
    }
}

fn default_db_path() -> Result<PathBuf, CliError> {
    let home = dirs::home_dir()
        .ok_or_else(|| CliError::InvalidFlag("could not resolve user home dir".to_string()))?;
    Ok(home.join(".agent-hub").join("agent-hub.db"))
}

fn print_startup_summary(listen: &str, db_path: &Path, agents: &[AgentInfo]) {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
    let summary = if agents.is_empty() {
        "none".to_string()
    } else {
        agents
            .iter()
            .map(|agent| format!("{} ({})", agent.name, agent.status))
            .collect::<Vec<_>>()
            .join(", ")
    };
    eprintln!(
        "Agent Hub Server started\n  Time:   {timestamp}\n  HTTP:   http://{listen}\n  DB:     {}\n  Agents: {summary}\n  Help:   agent-hub --help",
        db_path.display()
    );
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
