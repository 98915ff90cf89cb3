#![forbid(unsafe_code)]

//! `agent-relay` — session core server binary.
//!
//! Bootstraps configuration, opens the event log, resumes any sessions left
//! `active` from a prior run, and serves the client-facing WebSocket API
//! until a shutdown signal triggers the suspend-and-close sequence.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::acp::spawner::SpawnConfig;
use agent_relay::audit::{AuditLogger, JsonlAuditWriter};
use agent_relay::config::GlobalConfig;
use agent_relay::eventlog::EventLog;
use agent_relay::markdown::{HtmlRenderer, PulldownRenderer};
use agent_relay::session::Session;
use agent_relay::subscriber::{ws_handler, AppState};
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Session core server for ACP agent subprocesses", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Override the WebSocket server bind address.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config).map_err(|err| {
        AppError::Config(format!(
            "cannot load config file '{}': {err} — copy config.toml next to the binary or pass --config <path>",
            args.config.display()
        ))
    })?;
    if let Some(bind) = args.bind {
        config.http_bind_addr = bind;
    }
    info!(workspace_root = %config.workspace_root().display(), "configuration loaded");

    let event_log = EventLog::connect(&config.resolved_db_path()).await?;
    info!(db_path = %config.resolved_db_path().display(), "event log connected");

    let renderer: Arc<dyn HtmlRenderer> = Arc::new(PulldownRenderer);
    let audit_dir = config.workspace_root().join(".agent-relay").join("logs");
    let audit: Option<Arc<dyn AuditLogger>> = match JsonlAuditWriter::new(audit_dir) {
        Ok(writer) => Some(Arc::new(writer)),
        Err(err) => {
            warn!(%err, "audit logging disabled, failed to open log directory");
            None
        }
    };

    let spawn_config = SpawnConfig {
        host_cli: config.host_cli.clone(),
        host_cli_args: config.host_cli_args.clone(),
        workspace_root: config.workspace_root().to_path_buf(),
        startup_timeout: std::time::Duration::from_secs(config.startup_timeout_seconds),
    };

    let sessions: HashMap<String, Arc<Session>> = HashMap::new();
    let state = AppState { sessions: Arc::new(Mutex::new(sessions)) };

    let active = event_log.list_active().await?;
    info!(count = active.len(), "resuming sessions left active from a prior run");
    for metadata in active {
        let session_id = metadata.session_id.clone();
        match Session::resume(metadata, event_log.clone(), spawn_config.clone(), &config, Arc::clone(&renderer), audit.clone())
            .await
        {
            Ok(session) => {
                state.sessions.lock().await.insert(session_id, session);
            }
            Err(err) => {
                error!(session_id, %err, "failed to resume session, leaving it suspended");
            }
        }
    }

    let app = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/ws/{session_id}", get(ws_handler))
        .with_state(RouterState { app: state.clone(), event_log, spawn_config, config: Arc::new(config.clone()), renderer, audit });

    let bind: SocketAddr = config
        .http_bind_addr
        .parse()
        .map_err(|err| AppError::Config(format!("invalid http_bind_addr '{}': {err}", config.http_bind_addr)))?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    info!(%bind, "serving WebSocket API");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received, suspending live sessions");
            for session in shutdown_state.sessions.lock().await.values() {
                if let Err(err) = session.close("server_shutdown").await {
                    error!(session_id = session.session_id(), %err, "error suspending session on shutdown");
                }
            }
        })
        .await
        .map_err(|err| AppError::Config(format!("server error: {err}")))?;

    info!("agent-relay shut down");
    Ok(())
}

#[derive(Clone)]
struct RouterState {
    app: AppState,
    event_log: EventLog,
    spawn_config: SpawnConfig,
    config: Arc<GlobalConfig>,
    renderer: Arc<dyn HtmlRenderer>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl axum::extract::FromRef<RouterState> for AppState {
    fn from_ref(state: &RouterState) -> Self {
        state.app.clone()
    }
}

#[derive(Serialize)]
struct CreatedSession {
    session_id: String,
}

async fn create_session(
    axum::extract::State(state): axum::extract::State<RouterState>,
) -> std::result::Result<Json<CreatedSession>, axum::http::StatusCode> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = Session::spawn_new(
        session_id.clone(),
        state.event_log.clone(),
        state.spawn_config.clone(),
        &state.config,
        Arc::clone(&state.renderer),
        state.audit.clone(),
    )
    .await
    .map_err(|err| {
        error!(%err, "failed to spawn new session");
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })?;

    state.app.sessions.lock().await.insert(session_id.clone(), session);
    Ok(Json(CreatedSession { session_id }))
}

async fn list_sessions(axum::extract::State(state): axum::extract::State<RouterState>) -> Json<Vec<String>> {
    Json(state.app.sessions.lock().await.keys().cloned().collect())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Pretty => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
