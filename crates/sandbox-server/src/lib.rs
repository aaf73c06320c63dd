//! # sandbox-server
//!
//! HTTP surface polled by the grading UI: run commands, drive background
//! sessions, load submissions and run agent tasks (optionally streamed as
//! server-sent events).

mod error;
mod handlers;
mod server;
mod sse;

pub use error::ApiError;
pub use handlers::{
    CommandRequest, CommandResponse, EndSessionResponse, LoadResponse, SessionOutput,
    SessionsResponse, TaskRequest,
};
pub use server::{router, serve, AppState, SharedState};

use sandbox_core::SandboxConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Build the sandbox from configuration and serve it until Ctrl+C
pub async fn run(config: &SandboxConfig, sandbox_dir: &Path) -> anyhow::Result<()> {
    let state = AppState::from_config(config, sandbox_dir)?;
    let addr = format!("0.0.0.0:{}", config.server.port);

    info!("Starting sandbox server on {}", addr);
    println!("Sandbox server running at http://localhost:{}", config.server.port);
    println!("Press Ctrl+C to stop");

    serve(Arc::new(state), &addr).await
}
