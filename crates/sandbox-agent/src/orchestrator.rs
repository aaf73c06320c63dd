//! Agent orchestrator - drives one task through the tool-calling loop
//!
//! Control flow lives in [`crate::state_machine`]; this module performs the
//! actions it asks for. Two turn lists are kept:
//!
//! - the full conversation, returned to the caller and never shortened
//! - the model-facing context, compacted by the [`ContextBudgetManager`]
//!   before every model call
//!
//! New turns are appended to both.

use sandbox_core::{AgentConfig, Result, SandboxError, ToolCall, Turn};
use sandbox_remote::{RemoteSession, SessionRegistry};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity_logger::ActivityLogger;
use crate::budget::ContextBudgetManager;
use crate::prompt::{system_prompt, FORCED_SUMMARY_PROMPT, INCOMPLETE_MARKER};
use crate::state_machine::{transition, Action, Event, State};
use crate::tools::{ExternalTool, ToolBox, ToolSource};
use crate::types::{ModelBackend, ModelReply, ModelRequest, RequestPurpose, Usage};

const DEFAULT_MAX_ITERATIONS: usize = 30;
const DEFAULT_KEEP_RECENT: usize = 20;
const NOTE_PREVIEW_CHARS: usize = 1_000;

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The model stopped calling tools on its own
    Completed,
    /// Iteration cap or model failure; the summary is best effort
    Incomplete,
}

/// Result returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Final answer. Prefixed with [`INCOMPLETE_MARKER`] unless completed.
    pub summary: String,
    /// Every turn of the task, uncompacted
    pub conversation: Vec<Turn>,
    /// Completed tool cycles
    pub iterations: usize,
    pub usage: Usage,
}

impl TaskOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Progress notifications for streaming callers
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A turn was appended to the conversation
    Turn(Turn),
    /// Older turns were condensed in the model-facing context
    Compacted { replaced: usize },
    Finished(TaskOutcome),
}

/// Both turn lists of a running task, plus the optional event stream
struct Transcript<'a> {
    conversation: Vec<Turn>,
    context: Vec<Turn>,
    events: Option<&'a mpsc::Sender<AgentEvent>>,
    call_ids: HashSet<String>,
}

impl<'a> Transcript<'a> {
    fn new(events: Option<&'a mpsc::Sender<AgentEvent>>) -> Self {
        Self {
            conversation: Vec::new(),
            context: Vec::new(),
            events,
            call_ids: HashSet::new(),
        }
    }

    async fn push(&mut self, turn: Turn) {
        self.conversation.push(turn.clone());
        self.context.push(turn.clone());
        self.emit(AgentEvent::Turn(turn)).await;
    }

    async fn emit(&self, event: AgentEvent) {
        if let Some(events) = self.events {
            if events.send(event).await.is_err() {
                debug!("Event receiver dropped");
            }
        }
    }

    /// Give every call a unique, non-empty id
    fn normalize_calls(&mut self, calls: Vec<ToolCall>) -> Vec<ToolCall> {
        calls
            .into_iter()
            .map(|mut call| {
                if call.id.trim().is_empty() || self.call_ids.contains(&call.id) {
                    let replacement = format!("call_{}", uuid::Uuid::new_v4().simple());
                    debug!("Replacing tool call id {:?} with {}", call.id, replacement);
                    call.id = replacement;
                }
                self.call_ids.insert(call.id.clone());
                call
            })
            .collect()
    }

    fn tool_call_count(&self) -> usize {
        self.conversation.iter().map(|t| t.tool_calls().len()).sum()
    }
}

/// Runs tasks against one sandbox
pub struct AgentOrchestrator {
    session: Arc<RemoteSession>,
    registry: Arc<SessionRegistry>,
    model: Arc<dyn ModelBackend>,
    budget: ContextBudgetManager,
    max_iterations: usize,
    external_tools: Vec<Arc<dyn ExternalTool>>,
    tool_sources: Vec<Arc<dyn ToolSource>>,
    activity_logger: Option<ActivityLogger>,
}

impl AgentOrchestrator {
    pub fn new(
        session: Arc<RemoteSession>,
        registry: Arc<SessionRegistry>,
        model: Arc<dyn ModelBackend>,
    ) -> Self {
        Self {
            session,
            registry,
            model,
            budget: ContextBudgetManager::new(DEFAULT_KEEP_RECENT),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            external_tools: Vec::new(),
            tool_sources: Vec::new(),
            activity_logger: None,
        }
    }

    pub fn from_config(
        session: Arc<RemoteSession>,
        registry: Arc<SessionRegistry>,
        model: Arc<dyn ModelBackend>,
        config: &AgentConfig,
    ) -> Self {
        Self::new(session, registry, model)
            .with_max_iterations(config.max_iterations)
            .with_budget(ContextBudgetManager::from_config(config))
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_budget(mut self, budget: ContextBudgetManager) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_external_tool(mut self, tool: Arc<dyn ExternalTool>) -> Self {
        self.external_tools.push(tool);
        self
    }

    /// Tools from `source` are discovered again at the start of every task
    pub fn with_tool_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.tool_sources.push(source);
        self
    }

    /// Enable activity logging to `activity.md` in `sandbox_dir`
    pub fn with_activity_logging(mut self, sandbox_dir: PathBuf) -> Self {
        self.activity_logger = Some(ActivityLogger::new(sandbox_dir));
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn session(&self) -> &Arc<RemoteSession> {
        &self.session
    }

    /// Run `task` to completion
    pub async fn run(&self, task: &str, cancel: &CancellationToken) -> Result<TaskOutcome> {
        self.drive(task, cancel, None).await
    }

    /// Run `task`, sending every new turn to `events` as it happens and
    /// the outcome last
    pub async fn run_streaming(
        &self,
        task: &str,
        cancel: &CancellationToken,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<TaskOutcome> {
        let outcome = self.drive(task, cancel, Some(&events)).await?;
        if events.send(AgentEvent::Finished(outcome.clone())).await.is_err() {
            debug!("Event receiver dropped before the outcome");
        }
        Ok(outcome)
    }

    async fn drive(
        &self,
        task: &str,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<AgentEvent>>,
    ) -> Result<TaskOutcome> {
        info!("Running task with {} ({} iterations max)", self.model.name(), self.max_iterations);

        if let Some(logger) = &self.activity_logger {
            logger.log_task_start(task, self.max_iterations).await;
        }

        let toolbox = self.build_toolbox().await;
        let definitions = toolbox.definitions();

        let mut transcript = Transcript::new(events);
        transcript
            .push(Turn::system(system_prompt(self.session.working_directory())))
            .await;
        transcript.push(Turn::user(task)).await;

        let mut usage = Usage::default();
        let mut iterations = 0;
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut final_text = String::new();
        let mut forced_summary: Option<String> = None;
        let mut cancelled = false;

        let (mut state, mut actions) = transition(
            State::Init,
            Event::Start {
                task: task.to_string(),
            },
            self.max_iterations,
        );

        loop {
            let mut next: Option<Event> = None;

            for action in actions {
                match action {
                    Action::LogActivity { message } => info!("{}", message),

                    Action::TrimContext => {
                        if let Err(e) = self.trim_context(&mut transcript, &mut usage, cancel).await {
                            next = Some(failure_event(e));
                        }
                    }

                    Action::CallModel => {
                        let request =
                            ModelRequest::step(transcript.context.clone(), definitions.clone());
                        match self.call_model(request, cancel).await {
                            Ok(reply) => {
                                if let Some(reply_usage) = &reply.usage {
                                    usage.add(reply_usage);
                                }
                                let calls = transcript.normalize_calls(reply.tool_calls);
                                next = Some(Event::ModelReplied {
                                    tool_calls: calls.len(),
                                });
                                final_text = reply.content.clone();
                                transcript
                                    .push(Turn::assistant_with_calls(reply.content, calls.clone()))
                                    .await;
                                pending = calls;
                            }
                            Err(e) => next = Some(failure_event(e)),
                        }
                    }

                    Action::ExecuteTools { count } => {
                        debug!("Executing {} tool calls", count);
                        let calls = std::mem::take(&mut pending);
                        match self
                            .execute_tools(&toolbox, calls, iterations, &mut transcript, cancel)
                            .await
                        {
                            Ok(()) => {
                                iterations += 1;
                                next = Some(Event::ToolsFinished);
                            }
                            Err(e) => next = Some(failure_event(e)),
                        }
                    }

                    Action::ForceSummary => {
                        let text = self
                            .force_summary(&mut transcript, &mut usage, iterations, cancel)
                            .await?;
                        forced_summary = Some(text);
                    }

                    Action::Finish => {}
                }

                if matches!(next, Some(Event::Cancelled) | Some(Event::Error { .. })) {
                    break;
                }
            }

            if state.is_terminal() {
                break;
            }

            let event = match next {
                Some(event) => event,
                None => Event::Error {
                    message: format!("no event produced in state {:?}", state),
                },
            };
            cancelled = event == Event::Cancelled;
            (state, actions) = transition(state, event, self.max_iterations);
        }

        let (status, summary) = match state {
            State::Done => (TaskStatus::Completed, final_text),
            State::LimitReached => {
                let text = forced_summary.unwrap_or_else(|| best_effort_summary(&transcript, iterations));
                (TaskStatus::Incomplete, format!("{} {}", INCOMPLETE_MARKER, text))
            }
            State::Failed { .. } if cancelled => {
                warn!("Task cancelled after {} iterations", iterations);
                return Err(SandboxError::Cancelled);
            }
            State::Failed { error } => {
                warn!("Task stopped: {}", error);
                (
                    TaskStatus::Incomplete,
                    format!(
                        "{} The task stopped after an error: {}. {}",
                        INCOMPLETE_MARKER,
                        error,
                        best_effort_summary(&transcript, iterations)
                    ),
                )
            }
            other => {
                return Err(SandboxError::Other(format!(
                    "agent loop ended in non-terminal state {:?}",
                    other
                )))
            }
        };

        if let Some(logger) = &self.activity_logger {
            logger
                .log_task_complete(iterations, status == TaskStatus::Completed, &usage, &summary)
                .await;
        }

        info!(
            "Task finished: {:?} after {} iterations ({} input, {} output tokens)",
            status, iterations, usage.input_tokens, usage.output_tokens
        );

        Ok(TaskOutcome {
            status,
            summary,
            conversation: transcript.conversation,
            iterations,
            usage,
        })
    }

    /// Built-in tools, configured external tools, then discovered ones
    async fn build_toolbox(&self) -> ToolBox {
        let mut toolbox = ToolBox::new(self.session.clone(), self.registry.clone());
        for tool in &self.external_tools {
            toolbox.add_external(tool.clone());
        }
        for source in &self.tool_sources {
            match source.discover().await {
                Ok(tools) => {
                    debug!("Discovered {} external tools", tools.len());
                    for tool in tools {
                        toolbox.add_external(tool);
                    }
                }
                Err(e) => warn!("Tool discovery failed, continuing without it: {}", e),
            }
        }
        toolbox
    }

    async fn trim_context(
        &self,
        transcript: &mut Transcript<'_>,
        usage: &mut Usage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcome = self
            .budget
            .trim(&transcript.context, self.model.as_ref(), cancel)
            .await?;
        if outcome.replaced == 0 {
            return Ok(());
        }

        if let Some(trim_usage) = &outcome.usage {
            usage.add(trim_usage);
        }
        transcript.context = outcome.turns;
        transcript
            .emit(AgentEvent::Compacted {
                replaced: outcome.replaced,
            })
            .await;
        if let Some(logger) = &self.activity_logger {
            logger.log_compaction(outcome.replaced).await;
        }
        Ok(())
    }

    async fn call_model(&self, request: ModelRequest, cancel: &CancellationToken) -> Result<ModelReply> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            reply = self.model.complete(request) => reply,
        }
    }

    /// Run calls in order. Every call is answered before returning.
    async fn execute_tools(
        &self,
        toolbox: &ToolBox,
        calls: Vec<ToolCall>,
        iteration: usize,
        transcript: &mut Transcript<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for call in calls {
            let result = toolbox.dispatch(&call, cancel).await?;
            if let Some(logger) = &self.activity_logger {
                logger.log_tool_call(iteration, &call, &result).await;
            }
            transcript
                .push(Turn::tool_result(call.id, call.name, result))
                .await;
        }
        Ok(())
    }

    /// Ask for a summary without tools. A failed call falls back to a
    /// local summary; only cancellation is returned as an error.
    async fn force_summary(
        &self,
        transcript: &mut Transcript<'_>,
        usage: &mut Usage,
        iterations: usize,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.trim_context(transcript, usage, cancel).await?;
        transcript.push(Turn::user(FORCED_SUMMARY_PROMPT)).await;

        let request = ModelRequest::text_only(transcript.context.clone(), RequestPurpose::ForcedSummary);
        let text = match self.call_model(request, cancel).await {
            Ok(reply) if !reply.content.trim().is_empty() => {
                if let Some(reply_usage) = &reply.usage {
                    usage.add(reply_usage);
                }
                reply.content.trim().to_string()
            }
            Ok(_) => {
                warn!("Forced summary was empty, summarizing locally");
                best_effort_summary(transcript, iterations)
            }
            Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(e) => {
                warn!("Forced summary failed, summarizing locally: {}", e);
                best_effort_summary(transcript, iterations)
            }
        };

        transcript.push(Turn::assistant(text.clone())).await;
        Ok(text)
    }
}

fn failure_event(error: SandboxError) -> Event {
    match error {
        SandboxError::Cancelled => Event::Cancelled,
        other => Event::Error {
            message: other.to_string(),
        },
    }
}

/// Summary built without the model: tool usage plus the agent's last note
fn best_effort_summary(transcript: &Transcript<'_>, iterations: usize) -> String {
    let mut summary = format!(
        "Stopped after {} iterations and {} tool calls.",
        iterations,
        transcript.tool_call_count()
    );

    let last_note = transcript.conversation.iter().rev().find_map(|turn| match turn {
        Turn::Assistant { content, .. } if !content.trim().is_empty() => Some(content.trim()),
        _ => None,
    });
    if let Some(note) = last_note {
        let note: String = note.chars().take(NOTE_PREVIEW_CHARS).collect();
        summary.push_str(" Last note from the agent: ");
        summary.push_str(&note);
    }
    summary
}
