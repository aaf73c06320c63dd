//! Type definitions shared across the sandbox crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Who authored a turn, as seen by the language model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A structured request from the model to invoke a named tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as sent by the model. Usually an object; kept verbatim
    /// (possibly a raw string) when the model produced something else.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One step of an agent conversation.
///
/// The variant is decided once, when the turn is built. Turns are never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
    /// Condensed replacement for a run of older turns. Sent to the model as an
    /// assistant message and never summarized again.
    Summary {
        content: String,
    },
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Turn::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Turn::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Turn::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Turn::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Turn::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Turn::Summary {
            content: content.into(),
        }
    }

    /// Role presented to the model
    pub fn role(&self) -> Role {
        match self {
            Turn::System { .. } => Role::System,
            Turn::User { .. } => Role::User,
            Turn::Assistant { .. } | Turn::Summary { .. } => Role::Assistant,
            Turn::Tool { .. } => Role::Tool,
        }
    }

    /// Text content (possibly empty)
    pub fn content(&self) -> &str {
        match self {
            Turn::System { content }
            | Turn::User { content }
            | Turn::Assistant { content, .. }
            | Turn::Tool { content, .. }
            | Turn::Summary { content } => content,
        }
    }

    /// Tool calls requested by an assistant turn
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Turn::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, Turn::Summary { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Turn::Tool { .. })
    }
}

/// Check that every tool turn answers an earlier, still-open tool call and
/// that no call is left unanswered when the next assistant turn starts.
pub fn check_tool_pairing(turns: &[Turn]) -> std::result::Result<(), String> {
    let mut open: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (index, turn) in turns.iter().enumerate() {
        match turn {
            Turn::Assistant { tool_calls, .. } => {
                if !open.is_empty() {
                    return Err(format!(
                        "turn {}: assistant turn while tool calls {:?} are unanswered",
                        index, open
                    ));
                }
                for call in tool_calls {
                    if !seen.insert(call.id.clone()) {
                        return Err(format!("turn {}: duplicate tool call id {}", index, call.id));
                    }
                    open.push(call.id.clone());
                }
            }
            Turn::Tool { tool_call_id, .. } => match open.iter().position(|id| id == tool_call_id) {
                Some(pos) => {
                    open.remove(pos);
                }
                None => {
                    return Err(format!(
                        "turn {}: tool result for unknown or already answered call {}",
                        index, tool_call_id
                    ));
                }
            },
            _ => {}
        }
    }

    Ok(())
}

/// Output of a remote command.
///
/// A non-zero exit is not an error; stderr is returned as data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// True unless the command reported a non-zero exit status
    pub fn is_success(&self) -> bool {
        self.exit_code.map_or(true, |code| code == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// One entry of the command log polled by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHistoryEntry {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub timestamp: DateTime<Utc>,
    pub directory: String,
    /// Background session the command was sent to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl CommandHistoryEntry {
    pub fn new(command: &str, output: &CommandOutput, directory: &str) -> Self {
        Self {
            command: command.to_string(),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            timestamp: Utc::now(),
            directory: directory.to_string(),
            session: None,
        }
    }

    pub fn in_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }
}

/// A named tmux session living on the remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundSession {
    pub name: String,
    pub last_output: CommandOutput,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_roles() {
        assert_eq!(Turn::system("s").role(), Role::System);
        assert_eq!(Turn::user("u").role(), Role::User);
        assert_eq!(Turn::assistant("a").role(), Role::Assistant);
        assert_eq!(Turn::summary("s").role(), Role::Assistant);
        assert_eq!(Turn::tool_result("id", "execute_command", "").role(), Role::Tool);
    }

    #[test]
    fn test_turn_serialization_tag() {
        let turn = Turn::assistant_with_calls(
            "",
            vec![ToolCall::new("call_1", "execute_command", json!({"command": "ls"}))],
        );
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["kind"], "assistant");
        assert_eq!(value["tool_calls"][0]["name"], "execute_command");

        let back: Turn = serde_json::from_value(value).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn test_summary_is_not_tool() {
        let turn = Turn::summary("earlier work");
        assert!(turn.is_summary());
        assert!(!turn.is_tool());
        assert!(turn.tool_calls().is_empty());
    }

    #[test]
    fn test_tool_pairing_ok() {
        let turns = vec![
            Turn::system("s"),
            Turn::user("u"),
            Turn::assistant_with_calls(
                "",
                vec![
                    ToolCall::new("a", "execute_command", json!({})),
                    ToolCall::new("b", "execute_command", json!({})),
                ],
            ),
            Turn::tool_result("a", "execute_command", "1"),
            Turn::tool_result("b", "execute_command", "2"),
            Turn::assistant("done"),
        ];
        assert!(check_tool_pairing(&turns).is_ok());
    }

    #[test]
    fn test_tool_pairing_rejects_orphans_and_double_answers() {
        let orphan = vec![Turn::tool_result("x", "execute_command", "")];
        assert!(check_tool_pairing(&orphan).is_err());

        let twice = vec![
            Turn::assistant_with_calls("", vec![ToolCall::new("a", "t", json!({}))]),
            Turn::tool_result("a", "t", ""),
            Turn::tool_result("a", "t", ""),
        ];
        assert!(check_tool_pairing(&twice).is_err());

        let unanswered = vec![
            Turn::assistant_with_calls("", vec![ToolCall::new("a", "t", json!({}))]),
            Turn::assistant("next"),
        ];
        assert!(check_tool_pairing(&unanswered).is_err());
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::new("ok", "").is_success());
        assert!(CommandOutput::new("ok", "").with_exit_code(0).is_success());
        assert!(!CommandOutput::new("", "boom").with_exit_code(2).is_success());
    }

    #[test]
    fn test_history_entry_session() {
        let out = CommandOutput::new("hi\n", "");
        let entry = CommandHistoryEntry::new("echo hi", &out, "/srv/work").in_session("server");
        assert_eq!(entry.session.as_deref(), Some("server"));
        assert_eq!(entry.stdout, "hi\n");
        assert_eq!(entry.directory, "/srv/work");
    }
}
