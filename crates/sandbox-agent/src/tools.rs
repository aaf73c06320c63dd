//! Tools the agent can call, and their dispatch
//!
//! Tool-level problems (bad arguments, unknown tools, remote failures,
//! timeouts) become tool-result text for the model to react to. The only
//! error that escapes [`ToolBox::dispatch`] is cancellation.

use async_trait::async_trait;
use regex::Regex;
use sandbox_core::{markup, CommandOutput, Result, SandboxError, ToolCall};
use sandbox_remote::{RemoteSession, SessionRegistry};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::ToolDefinition;

pub const EXECUTE_COMMAND_TOOL: &str = "execute_command";
pub const EXECUTE_BACKGROUND_TOOL: &str = "execute_background_tmux_command";
pub const VIEW_OUTPUT_TOOL: &str = "view_tmux_session_output";
pub const END_SESSION_TOOL: &str = "end_tmux_background_session";

/// Per-stream cap on output returned to the model
const MAX_STREAM_CHARS: usize = 16_000;

/// A tool provided from outside the sandbox (browser automation, ...)
#[async_trait]
pub trait ExternalTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Run the tool and return the text handed back to the model
    async fn call(&self, arguments: &Value, cancel: &CancellationToken) -> Result<String>;
}

/// Discovers external tools when a task starts
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<Arc<dyn ExternalTool>>>;
}

/// Schemas of the built-in shell and tmux tools
pub fn builtin_definitions() -> Vec<ToolDefinition> {
    let session_name = json!({
        "type": "string",
        "description": "Name of the background session (letters, digits, '-' and '_'). Defaults to the shared background session."
    });

    vec![
        ToolDefinition {
            name: EXECUTE_COMMAND_TOOL.to_string(),
            description: "Run a shell command in the submission directory and return its stdout and stderr. The command must terminate on its own.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command line"}
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: EXECUTE_BACKGROUND_TOOL.to_string(),
            description: "Start a long-running command (server, watcher, container) in a named tmux session and return immediately with whatever it printed so far.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command line"},
                    "session_name": session_name.clone()
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: VIEW_OUTPUT_TOOL.to_string(),
            description: "Show the current output of a background tmux session without waiting.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"session_name": session_name.clone()}
            }),
        },
        ToolDefinition {
            name: END_SESSION_TOOL.to_string(),
            description: "Stop a background tmux session and everything running in it.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"session_name": session_name}
            }),
        },
    ]
}

fn follow_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\btail\b[^|;&]*\s-[a-zA-Z]*[fF]",
            r"--follow\b",
            r"\blogs\b[^|;&]*\s-[a-zA-Z]*f\b",
            r"\bjournalctl\b[^|;&]*\s-[a-zA-Z]*f\b",
            r"(^|[;&|(]\s*)(sudo\s+)?(watch|top|htop|less|more)\b",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Refusal message for foreground commands that would never terminate
pub fn check_follow_command(command: &str) -> Option<String> {
    let command = command.trim();
    if follow_patterns().iter().any(|re| re.is_match(command)) {
        Some(format!(
            "Refused: `{}` would not terminate and would block the session. \
             Start it with {} and poll it with {} instead, or drop the follow flag.",
            command, EXECUTE_BACKGROUND_TOOL, VIEW_OUTPUT_TOOL
        ))
    } else {
        None
    }
}

/// Render remote output for the model: escapes stripped, long streams cut
/// down to their tail.
pub(crate) fn format_output(output: &CommandOutput) -> String {
    let mut value = json!({
        "stdout": clip(&markup::strip_escapes(&output.stdout)),
        "stderr": clip(&markup::strip_escapes(&output.stderr)),
    });
    if let Some(code) = output.exit_code {
        value["exit_code"] = json!(code);
    }
    value.to_string()
}

fn clip(text: &str) -> String {
    let count = text.chars().count();
    if count <= MAX_STREAM_CHARS {
        return text.to_string();
    }
    let skip = count - MAX_STREAM_CHARS;
    let tail: String = text.chars().skip(skip).collect();
    format!("[... {} characters truncated ...]\n{}", skip, tail)
}

/// Extract a required string argument. A bare string (the model skipped
/// the JSON object) is accepted as the value itself.
fn required_str(arguments: &Value, field: &str) -> std::result::Result<String, String> {
    match arguments {
        Value::Object(map) => match map.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::String(_)) => Err(format!("`{}` is empty", field)),
            Some(other) => Err(format!("`{}` must be a string, got {}", field, other)),
            None => Err(format!("missing required field `{}`", field)),
        },
        Value::String(raw) if !raw.trim().is_empty() => Ok(raw.clone()),
        other => Err(format!("expected an object with `{}`, got {}", field, other)),
    }
}

fn optional_str(arguments: &Value, field: &str) -> Option<String> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The tool set of one task
pub struct ToolBox {
    session: Arc<RemoteSession>,
    registry: Arc<SessionRegistry>,
    external: Vec<Arc<dyn ExternalTool>>,
}

impl ToolBox {
    pub fn new(session: Arc<RemoteSession>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            session,
            registry,
            external: Vec::new(),
        }
    }

    /// Add an external tool. Tools whose name is already taken are skipped.
    pub fn add_external(&mut self, tool: Arc<dyn ExternalTool>) {
        let name = tool.definition().name;
        let taken: HashSet<String> = self.definitions().into_iter().map(|d| d.name).collect();
        if taken.contains(&name) {
            warn!("Ignoring external tool {}: name already in use", name);
            return;
        }
        self.external.push(tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = builtin_definitions();
        definitions.extend(self.external.iter().map(|t| t.definition()));
        definitions
    }

    /// Run one tool call and return the text for its tool-result turn
    pub async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<String> {
        debug!("Dispatching tool {} ({})", call.name, call.id);

        let result = match call.name.as_str() {
            EXECUTE_COMMAND_TOOL => self.execute_command(&call.arguments, cancel).await,
            EXECUTE_BACKGROUND_TOOL => self.execute_background(&call.arguments, cancel).await,
            VIEW_OUTPUT_TOOL => {
                let name = optional_str(&call.arguments, "session_name").unwrap_or_default();
                self.registry
                    .read_output(&name, cancel)
                    .await
                    .map(|output| format_output(&output))
            }
            END_SESSION_TOOL => {
                let name = optional_str(&call.arguments, "session_name");
                self.end_session(name.as_deref(), cancel).await
            }
            other => match self.external.iter().find(|t| t.definition().name == other) {
                Some(tool) => tool.call(&call.arguments, cancel).await,
                None => Err(SandboxError::UnknownTool(other.to_string())),
            },
        };

        match result {
            Ok(text) => Ok(text),
            Err(SandboxError::Cancelled) => Err(SandboxError::Cancelled),
            Err(SandboxError::UnknownTool(name)) => {
                let available: Vec<String> =
                    self.definitions().into_iter().map(|d| d.name).collect();
                Ok(format!(
                    "Error: unknown tool `{}`. Available tools: {}.",
                    name,
                    available.join(", ")
                ))
            }
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                Ok(format!("Error: {}", e))
            }
        }
    }

    async fn execute_command(&self, arguments: &Value, cancel: &CancellationToken) -> Result<String> {
        let command = required_str(arguments, "command").map_err(|e| {
            SandboxError::ToolArguments(format!("{}: {}", EXECUTE_COMMAND_TOOL, e))
        })?;

        if let Some(refusal) = check_follow_command(&command) {
            return Ok(refusal);
        }

        let output = self.session.run(&command, cancel).await?;
        Ok(format_output(&output))
    }

    async fn end_session(&self, name: Option<&str>, cancel: &CancellationToken) -> Result<String> {
        let name = self.registry.resolve_name(name)?;
        if self.registry.end(&name, cancel).await? {
            Ok(format!("Session {} ended.", name))
        } else {
            Ok(format!("No session named {} was running.", name))
        }
    }

    async fn execute_background(&self, arguments: &Value, cancel: &CancellationToken) -> Result<String> {
        let command = required_str(arguments, "command").map_err(|e| {
            SandboxError::ToolArguments(format!("{}: {}", EXECUTE_BACKGROUND_TOOL, e))
        })?;
        let name = optional_str(arguments, "session_name").unwrap_or_default();

        let output = self.registry.run_in_background(&name, &command, cancel).await?;
        Ok(format_output(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_remote::{CommandHistory, MockTransport};
    use std::time::Duration;

    fn toolbox(mock: &MockTransport) -> ToolBox {
        let session = Arc::new(RemoteSession::new(
            Arc::new(mock.clone()),
            "/work",
            Duration::from_millis(200),
            Arc::new(CommandHistory::new(20)),
        ));
        let registry = Arc::new(SessionRegistry::new(session.clone(), "background", 100));
        ToolBox::new(session, registry)
    }

    struct Browser;

    #[async_trait]
    impl ExternalTool for Browser {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "browse".to_string(),
                description: "Open a page".to_string(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn call(&self, arguments: &Value, _cancel: &CancellationToken) -> Result<String> {
            Ok(format!("opened {}", arguments["url"]))
        }
    }

    #[test]
    fn test_follow_guard() {
        for command in [
            "tail -f server.log",
            "tail -n 50 -F app.log",
            "docker logs -f web",
            "docker compose logs --follow",
            "journalctl -u nginx -f",
            "watch -n1 ls",
            "cd app && top",
            "kubectl logs -f pod/web",
        ] {
            assert!(check_follow_command(command).is_some(), "{}", command);
        }

        for command in [
            "tail -n 100 server.log",
            "docker logs web",
            "ls -f",
            "grep -rf patterns.txt src",
            "npm run format",
            "cat stopwatch.py",
        ] {
            assert!(check_follow_command(command).is_none(), "{}", command);
        }
    }

    #[test]
    fn test_format_output_strips_escapes() {
        let output = CommandOutput::new("\u{1b}[32mok\u{1b}[0m\r\n", "").with_exit_code(0);
        let text = format_output(&output);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["stdout"], "ok\n");
        assert_eq!(value["exit_code"], 0);
    }

    #[test]
    fn test_clip_keeps_tail() {
        let long = "x".repeat(MAX_STREAM_CHARS + 10) + "END";
        let clipped = clip(&long);
        assert!(clipped.starts_with("[... 13 characters truncated ...]"));
        assert!(clipped.ends_with("END"));
    }

    #[test]
    fn test_required_str_shapes() {
        assert_eq!(required_str(&json!({"command": "ls"}), "command").unwrap(), "ls");
        assert_eq!(required_str(&json!("ls -la"), "command").unwrap(), "ls -la");
        assert!(required_str(&json!({}), "command").is_err());
        assert!(required_str(&json!({"command": 5}), "command").is_err());
        assert!(required_str(&json!(null), "command").is_err());
    }

    #[tokio::test]
    async fn test_execute_command() {
        let mock = MockTransport::new().with_stdout("ls", "a.txt\nb.txt\n");
        let tools = toolbox(&mock);

        let text = tools
            .dispatch(
                &ToolCall::new("1", EXECUTE_COMMAND_TOOL, json!({"command": "ls"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["stdout"], "a.txt\nb.txt\n");
        assert_eq!(value["stderr"], "");
    }

    #[tokio::test]
    async fn test_follow_command_never_reaches_host() {
        let mock = MockTransport::new();
        let tools = toolbox(&mock);

        let text = tools
            .dispatch(
                &ToolCall::new("1", EXECUTE_COMMAND_TOOL, json!({"command": "tail -f log"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(text.starts_with("Refused"));
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_problems_become_text() {
        let mock = MockTransport::new().with_hang("sleep");
        let tools = toolbox(&mock);
        let cancel = CancellationToken::new();

        let bad_args = tools
            .dispatch(&ToolCall::new("1", EXECUTE_COMMAND_TOOL, json!({})), &cancel)
            .await
            .unwrap();
        assert!(bad_args.contains("missing required field `command`"));

        let unknown = tools
            .dispatch(&ToolCall::new("2", "rm_rf", json!({})), &cancel)
            .await
            .unwrap();
        assert!(unknown.contains("unknown tool `rm_rf`"));
        assert!(unknown.contains(EXECUTE_COMMAND_TOOL));

        let timeout = tools
            .dispatch(
                &ToolCall::new("3", EXECUTE_COMMAND_TOOL, json!({"command": "sleep 100"})),
                &cancel,
            )
            .await
            .unwrap();
        assert!(timeout.contains("timed out"));

        let bad_session = tools
            .dispatch(
                &ToolCall::new("4", VIEW_OUTPUT_TOOL, json!({"session_name": "a b"})),
                &cancel,
            )
            .await
            .unwrap();
        assert!(bad_session.starts_with("Error"));
    }

    #[tokio::test]
    async fn test_cancellation_escapes() {
        let tools = toolbox(&MockTransport::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = tools
            .dispatch(
                &ToolCall::new("1", EXECUTE_COMMAND_TOOL, json!({"command": "ls"})),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));
    }

    #[tokio::test]
    async fn test_background_tools_default_session() {
        let mock = MockTransport::new().with_stdout("kill-session", "__sandbox_session_ended__\n");
        let tools = toolbox(&mock);
        let cancel = CancellationToken::new();

        tools
            .dispatch(
                &ToolCall::new("1", EXECUTE_BACKGROUND_TOOL, json!({"command": "npm start"})),
                &cancel,
            )
            .await
            .unwrap();
        let ended = tools
            .dispatch(&ToolCall::new("2", END_SESSION_TOOL, json!({})), &cancel)
            .await
            .unwrap();

        assert_eq!(ended, "Session background ended.");
        assert!(mock.commands()[0].contains("new-session -d -s 'background'"));
    }

    #[tokio::test]
    async fn test_external_tools() {
        let mut tools = toolbox(&MockTransport::new());
        tools.add_external(Arc::new(Browser));
        tools.add_external(Arc::new(Browser));

        assert_eq!(tools.definitions().len(), 5);
        let text = tools
            .dispatch(
                &ToolCall::new("1", "browse", json!({"url": "http://localhost:3000"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "opened \"http://localhost:3000\"");
    }
}
