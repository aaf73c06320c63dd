//! Scripted model backend for tests

use async_trait::async_trait;
use sandbox_core::{Result, SandboxError, ToolCall};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{ModelBackend, ModelReply, ModelRequest, RequestPurpose};

const DEFAULT_COMPACTION: &str = "Earlier steps condensed.";

#[derive(Debug, Clone)]
enum Scripted {
    Reply(ModelReply),
    Fail(String),
}

#[derive(Default)]
struct Queues {
    steps: VecDeque<Scripted>,
    step_repeat: Option<ModelReply>,
    compactions: VecDeque<Scripted>,
    summaries: VecDeque<Scripted>,
    requests: Vec<ModelRequest>,
}

/// Model that answers from queues of prepared replies
///
/// Step calls are served from the step queue, then from the repeat reply
/// if one is set. Compaction calls fall back to a fixed summary text.
/// Forced-summary calls fail once their queue is empty.
#[derive(Default)]
pub struct ScriptedModel {
    queues: Mutex<Queues>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_reply(self, reply: ModelReply) -> Self {
        self.queues().steps.push_back(Scripted::Reply(reply));
        self
    }

    /// Final answer without tool calls
    pub fn with_text(self, content: &str) -> Self {
        self.with_reply(ModelReply::text(content))
    }

    /// A reply requesting one tool call
    pub fn with_tool_call(self, id: &str, name: &str, arguments: serde_json::Value) -> Self {
        self.with_reply(ModelReply::text("").with_tool_call(ToolCall::new(id, name, arguments)))
    }

    pub fn with_step_failure(self, message: &str) -> Self {
        self.queues().steps.push_back(Scripted::Fail(message.to_string()));
        self
    }

    /// Served for every step call once the queue runs dry
    pub fn repeating(self, reply: ModelReply) -> Self {
        self.queues().step_repeat = Some(reply);
        self
    }

    pub fn with_compaction(self, content: &str) -> Self {
        self.queues()
            .compactions
            .push_back(Scripted::Reply(ModelReply::text(content)));
        self
    }

    pub fn with_compaction_failure(self, message: &str) -> Self {
        self.queues()
            .compactions
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    pub fn with_forced_summary(self, content: &str) -> Self {
        self.queues()
            .summaries
            .push_back(Scripted::Reply(ModelReply::text(content)));
        self
    }

    pub fn with_forced_summary_failure(self, message: &str) -> Self {
        self.queues()
            .summaries
            .push_back(Scripted::Fail(message.to_string()));
        self
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.queues().requests.clone()
    }

    pub fn requests_for(&self, purpose: RequestPurpose) -> Vec<ModelRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.purpose == purpose)
            .collect()
    }
}

#[async_trait]
impl ModelBackend for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply> {
        let mut queues = self.queues();
        let purpose = request.purpose;
        queues.requests.push(request);

        let next = match purpose {
            RequestPurpose::Step => queues
                .steps
                .pop_front()
                .or_else(|| queues.step_repeat.clone().map(Scripted::Reply)),
            RequestPurpose::Compaction => Some(
                queues
                    .compactions
                    .pop_front()
                    .unwrap_or_else(|| Scripted::Reply(ModelReply::text(DEFAULT_COMPACTION))),
            ),
            RequestPurpose::ForcedSummary => queues.summaries.pop_front(),
        };

        match next {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fail(message)) => Err(SandboxError::Model(message)),
            None => Err(SandboxError::Model(format!(
                "no scripted reply left for {:?} call",
                purpose
            ))),
        }
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::Turn;

    #[tokio::test]
    async fn test_queues_by_purpose() {
        let model = ScriptedModel::new()
            .with_text("step one")
            .with_forced_summary("wrap up");

        let step = model
            .complete(ModelRequest::step(vec![Turn::user("go")], vec![]))
            .await
            .unwrap();
        assert_eq!(step.content, "step one");

        let compaction = model
            .complete(ModelRequest::text_only(vec![], RequestPurpose::Compaction))
            .await
            .unwrap();
        assert_eq!(compaction.content, DEFAULT_COMPACTION);

        let summary = model
            .complete(ModelRequest::text_only(vec![], RequestPurpose::ForcedSummary))
            .await
            .unwrap();
        assert_eq!(summary.content, "wrap up");

        assert!(model
            .complete(ModelRequest::step(vec![], vec![]))
            .await
            .is_err());
        assert_eq!(model.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_repeating_reply() {
        let model = ScriptedModel::new().repeating(ModelReply::text("again"));
        for _ in 0..3 {
            let reply = model.complete(ModelRequest::step(vec![], vec![])).await.unwrap();
            assert_eq!(reply.content, "again");
        }
    }
}
