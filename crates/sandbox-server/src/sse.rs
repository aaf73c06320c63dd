//! Server-Sent Events endpoint for streamed agent tasks

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use sandbox_agent::AgentEvent;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::handlers::TaskRequest;
use crate::server::SharedState;

/// POST /api/tasks/stream
///
/// Emits a `turn` event per conversation turn, `compacted` when older turns
/// were condensed, then one `result` event with the outcome (or `error`).
/// Dropping the connection cancels the task.
pub async fn task_stream(
    State(app): State<SharedState>,
    Json(request): Json<TaskRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.task.trim().is_empty() {
        return Err(ApiError::bad_request("`task` must not be empty"));
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);

    let agent = app.agent.clone();
    let token = cancel.clone();
    let task = request.task;
    let handle = tokio::spawn(async move { agent.run_streaming(&task, &token, tx).await });

    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;

        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Turn(turn) => {
                    if let Ok(data) = serde_json::to_string(&turn) {
                        yield Ok(Event::default().event("turn").data(data));
                    }
                }
                AgentEvent::Compacted { replaced } => {
                    let data = json!({ "replaced": replaced }).to_string();
                    yield Ok(Event::default().event("compacted").data(data));
                }
                AgentEvent::Finished(outcome) => {
                    if let Ok(data) = serde_json::to_string(&outcome) {
                        yield Ok(Event::default().event("result").data(data));
                    }
                }
            }
        }

        match handle.await {
            Ok(Ok(_)) => debug!("Streamed task finished"),
            Ok(Err(e)) => {
                warn!("Streamed task failed: {}", e);
                let data = json!({ "error": e.to_string() }).to_string();
                yield Ok(Event::default().event("error").data(data));
            }
            Err(e) => {
                warn!("Streamed task panicked: {}", e);
                let data = json!({ "error": "task aborted" }).to_string();
                yield Ok(Event::default().event("error").data(data));
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
