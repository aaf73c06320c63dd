//! # sandbox-agent
//!
//! The tool-calling agent that works inside the grading sandbox.
//!
//! A task runs as a loop: trim the context, ask the model for the next
//! step, run the requested tools on the remote host, feed the results
//! back. The loop stops when the model answers without tool calls, or when
//! the iteration cap is hit, in which case the model is asked for a
//! best-effort summary of the work so far.
//!
//! ## Pieces
//!
//! - [`ModelBackend`]: the language model ([`ChatCompletionsClient`] over
//!   HTTP, [`ScriptedModel`] in tests)
//! - [`ContextBudgetManager`]: keeps the model-facing context bounded
//! - [`ToolBox`]: built-in shell/tmux tools plus external ones
//! - [`state_machine`]: pure control flow of the loop
//! - [`AgentOrchestrator`]: drives everything

mod activity_logger;
mod auth;
mod budget;
mod circuit_breaker;
mod client;
mod orchestrator;
pub mod prompt;
mod scripted;
pub mod state_machine;
mod tools;
mod types;

pub use activity_logger::ActivityLogger;
pub use auth::get_api_token;
pub use budget::{ContextBudgetManager, TrimOutcome};
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use client::{ChatCompletionsClient, RetryPolicy};
pub use orchestrator::{AgentEvent, AgentOrchestrator, TaskOutcome, TaskStatus};
pub use scripted::ScriptedModel;
pub use tools::{
    builtin_definitions, check_follow_command, ExternalTool, ToolBox, ToolSource,
    END_SESSION_TOOL, EXECUTE_BACKGROUND_TOOL, EXECUTE_COMMAND_TOOL, VIEW_OUTPUT_TOOL,
};
pub use types::*;
