//! Pure state machine for the agent loop
//!
//! No async and no I/O: the orchestrator feeds events in and performs the
//! returned actions. Invalid transitions go to `Failed` (never panic).

/// Agent loop state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Conversation not seeded yet
    Init,
    /// Waiting for the model. `iteration` counts completed tool cycles.
    Thinking { iteration: usize },
    /// Running the tool calls of the last model reply
    ExecutingTool { iteration: usize, pending: usize },
    /// The model answered without tool calls
    Done,
    /// The iteration cap was exceeded; a forced summary follows
    LimitReached,
    /// Cancelled, errored, or driven through an invalid transition
    Failed { error: String },
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::LimitReached | State::Failed { .. })
    }

    /// Completed tool cycles, where the state still carries the count
    pub fn iteration(&self) -> Option<usize> {
        match self {
            State::Thinking { iteration } | State::ExecutingTool { iteration, .. } => {
                Some(*iteration)
            }
            _ => None,
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start { task: String },
    ModelReplied { tool_calls: usize },
    ToolsFinished,
    Cancelled,
    Error { message: String },
}

/// Side effects the orchestrator performs after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LogActivity { message: String },
    TrimContext,
    CallModel,
    ExecuteTools { count: usize },
    ForceSummary,
    Finish,
}

/// Pure transition function.
///
/// `max_iterations` is the number of tool cycles allowed; `LimitReached` is
/// entered when the cycle counter exceeds it.
pub fn transition(state: State, event: Event, max_iterations: usize) -> (State, Vec<Action>) {
    match (state, event) {
        (State::Init, Event::Start { task }) => (
            State::Thinking { iteration: 0 },
            vec![
                Action::LogActivity {
                    message: format!("Starting task: {}", task),
                },
                Action::TrimContext,
                Action::CallModel,
            ],
        ),

        (State::Thinking { .. }, Event::ModelReplied { tool_calls: 0 }) => (
            State::Done,
            vec![
                Action::LogActivity {
                    message: "Model finished without tool calls".to_string(),
                },
                Action::Finish,
            ],
        ),

        (State::Thinking { iteration }, Event::ModelReplied { tool_calls }) => (
            State::ExecutingTool {
                iteration,
                pending: tool_calls,
            },
            vec![Action::ExecuteTools { count: tool_calls }],
        ),

        (State::ExecutingTool { iteration, .. }, Event::ToolsFinished) => {
            let iteration = iteration + 1;
            if iteration > max_iterations {
                (
                    State::LimitReached,
                    vec![
                        Action::LogActivity {
                            message: format!(
                                "Iteration cap of {} exceeded, forcing a summary",
                                max_iterations
                            ),
                        },
                        Action::ForceSummary,
                        Action::Finish,
                    ],
                )
            } else {
                (
                    State::Thinking { iteration },
                    vec![Action::TrimContext, Action::CallModel],
                )
            }
        }

        (State::Init, Event::Cancelled)
        | (State::Thinking { .. }, Event::Cancelled)
        | (State::ExecutingTool { .. }, Event::Cancelled) => (
            State::Failed {
                error: "cancelled".to_string(),
            },
            vec![Action::LogActivity {
                message: "Task cancelled".to_string(),
            }],
        ),

        (State::Init, Event::Error { message })
        | (State::Thinking { .. }, Event::Error { message })
        | (State::ExecutingTool { .. }, Event::Error { message }) => (
            State::Failed {
                error: message.clone(),
            },
            vec![Action::LogActivity {
                message: format!("Error: {}", message),
            }],
        ),

        (state, event) if state.is_terminal() => (
            State::Failed {
                error: format!("Invalid transition from terminal state {:?} on {:?}", state, event),
            },
            vec![],
        ),

        (state, event) => (
            State::Failed {
                error: format!(
                    "Invalid state transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
            vec![],
        ),
    }
}
