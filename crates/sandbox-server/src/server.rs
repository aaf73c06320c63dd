//! Axum router and shared state

use axum::{
    routing::{delete, get, post},
    Router,
};
use sandbox_agent::{AgentOrchestrator, ChatCompletionsClient};
use sandbox_core::{Result, SandboxConfig};
use sandbox_remote::{
    CommandHistory, DirectorySubmissionStore, RemoteSession, SessionRegistry, SshConnection,
    SshTarget, SubmissionStore,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{handlers, sse};

/// Shared application state
pub struct AppState {
    pub session: Arc<RemoteSession>,
    pub registry: Arc<SessionRegistry>,
    pub agent: Arc<AgentOrchestrator>,
    pub submissions: Arc<dyn SubmissionStore>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        session: Arc<RemoteSession>,
        registry: Arc<SessionRegistry>,
        agent: Arc<AgentOrchestrator>,
        submissions: Arc<dyn SubmissionStore>,
    ) -> Self {
        Self {
            session,
            registry,
            agent,
            submissions,
        }
    }

    /// Wire the sandbox from configuration. Fails fast on missing
    /// credentials; the SSH connection itself opens on first use.
    pub fn from_config(config: &SandboxConfig, sandbox_dir: &Path) -> Result<Self> {
        config.validate()?;

        let transport = Arc::new(SshConnection::new(SshTarget::from_config(&config.remote)?));
        let history = Arc::new(CommandHistory::new(config.history.capacity));
        let session = Arc::new(RemoteSession::from_config(transport, &config.remote, history));
        let registry = Arc::new(SessionRegistry::new(
            session.clone(),
            config.remote.default_session.clone(),
            config.remote.capture_lines,
        ));

        let model = Arc::new(ChatCompletionsClient::from_config(&config.model)?);
        let mut agent =
            AgentOrchestrator::from_config(session.clone(), registry.clone(), model, &config.agent);
        if config.agent.activity_log {
            agent = agent.with_activity_logging(sandbox_dir.to_path_buf());
        }

        info!("Sandbox configured for {}", session.describe());

        Ok(Self::new(
            session,
            registry,
            Arc::new(agent),
            Arc::new(DirectorySubmissionStore::new(config.submissions.root.clone())),
        ))
    }
}

/// All API routes
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/commands", post(handlers::run_command))
        .route("/api/commands/history", get(handlers::history))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/:name/commands", post(handlers::run_in_session))
        .route("/api/sessions/:name/output", get(handlers::session_output))
        .route("/api/sessions/:name", delete(handlers::end_session))
        .route("/api/submissions/load", post(handlers::load))
        .route("/api/tasks", post(handlers::run_task))
        .route("/api/tasks/stream", post(sse::task_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `addr` until Ctrl+C
pub async fn serve(state: SharedState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
