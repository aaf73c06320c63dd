//! Request handlers
//!
//! Each request gets its own cancellation token, cancelled when the handler
//! future is dropped (client went away).

use axum::{
    extract::{Path, State},
    response::Json,
};
use sandbox_agent::TaskOutcome;
use sandbox_core::{markup, BackgroundSession, CommandHistoryEntry, CommandOutput};
use sandbox_remote::{load_submission, SubmissionKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::server::SharedState;

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub task: String,
}

/// Output of a foreground command, with display markup for the terminal view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub html: String,
}

impl CommandResponse {
    fn new(command: String, output: CommandOutput) -> Self {
        Self {
            command,
            html: render(&output),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }
    }
}

/// Current output of a background session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutput {
    pub session: String,
    pub stdout: String,
    pub stderr: String,
    pub html: String,
}

impl SessionOutput {
    fn new(session: String, output: CommandOutput) -> Self {
        Self {
            session,
            html: render(&output),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    /// Sessions alive on the host
    pub sessions: Vec<String>,
    /// Last known state of sessions this server has touched
    pub tracked: Vec<BackgroundSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub session: String,
    pub ended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    pub submission: String,
    pub source: PathBuf,
    pub working_root: String,
}

fn render(output: &CommandOutput) -> String {
    let mut html = markup::to_display_markup(&output.stdout);
    if !output.stderr.is_empty() {
        html.push_str(&markup::to_display_markup(&output.stderr));
    }
    html
}

fn required(value: String, field: &str) -> Result<String, ApiError> {
    if value.trim().is_empty() {
        Err(ApiError::bad_request(format!("`{}` must not be empty", field)))
    } else {
        Ok(value)
    }
}

/// GET /api/health
pub async fn health(State(app): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "sandbox-server",
        "remote": app.session.describe(),
        "connected": app.session.is_connected(),
    }))
}

/// POST /api/commands
pub async fn run_command(
    State(app): State<SharedState>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let command = required(request.command, "command")?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let output = app.session.run(&command, &cancel).await?;
    Ok(Json(CommandResponse::new(command, output)))
}

/// GET /api/commands/history
pub async fn history(State(app): State<SharedState>) -> Json<Vec<CommandHistoryEntry>> {
    Json(app.session.history().snapshot())
}

/// GET /api/sessions
pub async fn list_sessions(State(app): State<SharedState>) -> Result<Json<SessionsResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let sessions = app.registry.list(&cancel).await?;
    Ok(Json(SessionsResponse {
        sessions,
        tracked: app.registry.tracked(),
    }))
}

/// POST /api/sessions/:name/commands
pub async fn run_in_session(
    State(app): State<SharedState>,
    Path(name): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<SessionOutput>, ApiError> {
    let command = required(request.command, "command")?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let output = app.registry.run_in_background(&name, &command, &cancel).await?;
    Ok(Json(SessionOutput::new(name, output)))
}

/// GET /api/sessions/:name/output
pub async fn session_output(
    State(app): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<SessionOutput>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let output = app.registry.read_output(&name, &cancel).await?;
    Ok(Json(SessionOutput::new(name, output)))
}

/// DELETE /api/sessions/:name
pub async fn end_session(
    State(app): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let ended = app.registry.end(&name, &cancel).await?;
    Ok(Json(EndSessionResponse {
        session: name,
        ended,
    }))
}

/// POST /api/submissions/load
pub async fn load(
    State(app): State<SharedState>,
    Json(key): Json<SubmissionKey>,
) -> Result<Json<LoadResponse>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let source = load_submission(&app.session, app.submissions.as_ref(), &key, &cancel).await?;
    Ok(Json(LoadResponse {
        submission: key.to_string(),
        source,
        working_root: app.session.working_directory().to_string(),
    }))
}

/// POST /api/tasks
pub async fn run_task(
    State(app): State<SharedState>,
    Json(request): Json<TaskRequest>,
) -> Result<Json<TaskOutcome>, ApiError> {
    let task = required(request.task, "task")?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let outcome = app.agent.run(&task, &cancel).await?;
    Ok(Json(outcome))
}
