//! Type definitions for model interactions

use async_trait::async_trait;
use sandbox_core::{Result, ToolCall, Turn};
use serde::{Deserialize, Serialize};

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A tool the model may call, described by a JSON schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Why a model call is made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    /// Next step of the agent loop
    Step,
    /// Condensing older turns into a summary
    Compaction,
    /// Final summary after the iteration cap
    ForcedSummary,
}

/// Input to one model call
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub turns: Vec<Turn>,
    /// Empty for summary calls
    pub tools: Vec<ToolDefinition>,
    pub purpose: RequestPurpose,
}

impl ModelRequest {
    pub fn step(turns: Vec<Turn>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            turns,
            tools,
            purpose: RequestPurpose::Step,
        }
    }

    /// A call without tools
    pub fn text_only(turns: Vec<Turn>, purpose: RequestPurpose) -> Self {
        Self {
            turns,
            tools: Vec::new(),
            purpose,
        }
    }
}

/// What the model answered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, input_tokens: usize, output_tokens: usize) -> Self {
        self.usage = Some(Usage {
            input_tokens,
            output_tokens,
        });
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Language model backend (allows mocking in tests)
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply>;

    /// Model identifier, for logs
    fn name(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usage_add() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 2,
        });
        total.add(&Usage {
            input_tokens: 5,
            output_tokens: 1,
        });
        assert_eq!(total.input_tokens, 15);
        assert_eq!(total.output_tokens, 3);
    }

    #[test]
    fn test_reply_builder() {
        let reply = ModelReply::text("")
            .with_tool_call(ToolCall::new("c1", "execute_command", json!({"command": "ls"})))
            .with_usage(100, 20);
        assert!(reply.has_tool_calls());
        assert_eq!(reply.usage.map(|u| u.output_tokens), Some(20));
        assert!(!ModelReply::text("done").has_tool_calls());
    }
}
