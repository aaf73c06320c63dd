//! Context budget: bounding what the model sees
//!
//! The first two turns (system rules and the task) and the last
//! `keep_recent` turns are always sent verbatim. Everything in between is
//! replaced by one summary turn written by the model, so a trimmed context
//! never exceeds `2 + 1 + keep_recent` turns. With `merge_summaries` (the
//! default) summaries from earlier compactions are folded in by the model;
//! without it their text is never summarized again and is carried verbatim
//! at the front of the new summary turn.
//!
//! The recent window never starts with a tool result: if the cut would
//! separate tool results from the assistant turn that requested them, the
//! window grows backwards to include that assistant turn.

use sandbox_core::{AgentConfig, Result, SandboxError, Turn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prompt::{COMPACTION_PROMPT, COMPACTION_SYSTEM};
use crate::types::{ModelBackend, ModelRequest, RequestPurpose, Usage};

/// Turns that are never compacted: system rules and the task
const PINNED_HEAD: usize = 2;

const RENDERED_RESULT_CHARS: usize = 1_500;
const FALLBACK_SUMMARY_CHARS: usize = 4_000;

/// Result of one trim
#[derive(Debug, Clone, PartialEq)]
pub struct TrimOutcome {
    pub turns: Vec<Turn>,
    /// Number of turns folded into the new summary (0 when unchanged)
    pub replaced: usize,
    pub usage: Option<Usage>,
}

impl TrimOutcome {
    fn unchanged(turns: &[Turn]) -> Self {
        Self {
            turns: turns.to_vec(),
            replaced: 0,
            usage: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct TrimPlan {
    /// First turn of the verbatim recent window
    tail_start: usize,
    /// Middle summaries whose text is carried over verbatim
    kept: Vec<usize>,
    /// Middle turns condensed into the new summary
    condensed: Vec<usize>,
}

/// Decides which turns reach the model
#[derive(Debug, Clone)]
pub struct ContextBudgetManager {
    keep_recent: usize,
    merge_summaries: bool,
}

impl ContextBudgetManager {
    pub fn new(keep_recent: usize) -> Self {
        Self {
            keep_recent,
            merge_summaries: true,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.keep_recent).with_merge_summaries(config.merge_summaries)
    }

    pub fn with_merge_summaries(mut self, merge: bool) -> Self {
        self.merge_summaries = merge;
        self
    }

    pub fn keep_recent(&self) -> usize {
        self.keep_recent
    }

    /// Conversations at or below this length are never touched
    pub fn threshold(&self) -> usize {
        PINNED_HEAD + self.keep_recent
    }

    /// Whether `trim` would call the model
    pub fn needs_trim(&self, turns: &[Turn]) -> bool {
        self.plan(turns).is_some()
    }

    fn plan(&self, turns: &[Turn]) -> Option<TrimPlan> {
        if turns.len() <= self.threshold() {
            return None;
        }

        let mut tail_start = turns.len() - self.keep_recent;
        while tail_start > PINNED_HEAD && turns[tail_start].is_tool() {
            tail_start -= 1;
        }

        let middle = PINNED_HEAD..tail_start;
        if turns[middle.clone()].iter().all(Turn::is_summary) {
            return None;
        }

        let (kept, condensed): (Vec<usize>, Vec<usize>) = if self.merge_summaries {
            (Vec::new(), middle.collect())
        } else {
            middle.partition(|&i| turns[i].is_summary())
        };

        Some(TrimPlan {
            tail_start,
            kept,
            condensed,
        })
    }

    /// Compact `turns` for the next model call.
    ///
    /// A failed summary call does not fail the trim: the condensed turns
    /// are replaced by a locally rendered digest instead. Only cancellation
    /// is returned as an error.
    pub async fn trim(
        &self,
        turns: &[Turn],
        model: &dyn ModelBackend,
        cancel: &CancellationToken,
    ) -> Result<TrimOutcome> {
        let Some(plan) = self.plan(turns) else {
            return Ok(TrimOutcome::unchanged(turns));
        };

        let condensed: Vec<&Turn> = plan.condensed.iter().map(|&i| &turns[i]).collect();
        let rendered = render_turns(&condensed);
        debug!(
            "Compacting {} turns ({} chars rendered)",
            condensed.len(),
            rendered.len()
        );

        let request = ModelRequest::text_only(
            vec![
                Turn::system(COMPACTION_SYSTEM),
                Turn::user(format!("{}\n\n{}", COMPACTION_PROMPT, rendered)),
            ],
            RequestPurpose::Compaction,
        );

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            reply = model.complete(request) => reply,
        };

        let (summary, usage) = match reply {
            Ok(reply) if !reply.content.trim().is_empty() => {
                (reply.content.trim().to_string(), reply.usage)
            }
            Ok(_) => {
                warn!("Compaction returned an empty summary, using local digest");
                (fallback_summary(condensed.len(), &rendered), None)
            }
            Err(SandboxError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(e) => {
                warn!("Compaction failed, using local digest: {}", e);
                (fallback_summary(condensed.len(), &rendered), None)
            }
        };

        let mut parts: Vec<&str> = plan.kept.iter().map(|&i| turns[i].content()).collect();
        parts.push(&summary);

        let mut output = Vec::with_capacity(PINNED_HEAD + 1 + turns.len() - plan.tail_start);
        output.extend_from_slice(&turns[..PINNED_HEAD]);
        output.push(Turn::summary(parts.join("\n\n")));
        output.extend_from_slice(&turns[plan.tail_start..]);

        info!(
            "Context compacted: {} turns -> {} turns",
            turns.len(),
            output.len()
        );

        Ok(TrimOutcome {
            turns: output,
            replaced: plan.condensed.len(),
            usage,
        })
    }
}

/// Render turns as compact text lines for the summarizer
fn render_turns(turns: &[&Turn]) -> String {
    let mut lines = Vec::with_capacity(turns.len());
    for turn in turns {
        match turn {
            Turn::System { content } => lines.push(format!("[system] {}", content)),
            Turn::User { content } => lines.push(format!("[user] {}", content)),
            Turn::Assistant {
                content,
                tool_calls,
            } => {
                if !content.trim().is_empty() {
                    lines.push(format!("[assistant] {}", content.trim()));
                }
                for call in tool_calls {
                    lines.push(format!("[call] {}({})", call.name, call.arguments));
                }
            }
            Turn::Tool { name, content, .. } => lines.push(format!(
                "[result {}] {}",
                name,
                truncate_chars(content.trim(), RENDERED_RESULT_CHARS)
            )),
            Turn::Summary { content } => lines.push(format!("[earlier summary] {}", content)),
        }
    }
    lines.join("\n")
}

fn fallback_summary(count: usize, rendered: &str) -> String {
    format!(
        "{} earlier turns were condensed without a model summary. Last recorded steps:\n{}",
        count,
        tail_chars(rendered, FALLBACK_SUMMARY_CHARS)
    )
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedModel;
    use sandbox_core::ToolCall;
    use serde_json::json;

    fn conversation(cycles: usize) -> Vec<Turn> {
        let mut turns = vec![Turn::system("rules"), Turn::user("grade it")];
        for i in 0..cycles {
            let id = format!("c{}", i);
            turns.push(Turn::assistant_with_calls(
                "",
                vec![ToolCall::new(&id, "execute_command", json!({"command": format!("step {}", i)}))],
            ));
            turns.push(Turn::tool_result(&id, "execute_command", format!("out {}", i)));
        }
        turns
    }

    #[tokio::test]
    async fn test_short_conversation_is_identity() {
        let budget = ContextBudgetManager::new(4);
        let model = ScriptedModel::new();
        let turns = conversation(2); // 6 turns == threshold

        let outcome = budget
            .trim(&turns, &model, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.turns, turns);
        assert_eq!(outcome.replaced, 0);
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn test_long_conversation_shape() {
        let budget = ContextBudgetManager::new(4);
        let model = ScriptedModel::new().with_compaction("ran steps 0-2");
        let turns = conversation(5); // 12 turns

        let outcome = budget
            .trim(&turns, &model, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.turns.len(), 2 + 1 + 4);
        assert_eq!(outcome.turns[0], turns[0]);
        assert_eq!(outcome.turns[1], turns[1]);
        assert_eq!(outcome.turns[2], Turn::summary("ran steps 0-2"));
        assert_eq!(&outcome.turns[3..], &turns[8..]);
        assert_eq!(outcome.replaced, 6);
    }

    #[tokio::test]
    async fn test_window_never_starts_with_tool_result() {
        let budget = ContextBudgetManager::new(3);
        let model = ScriptedModel::new();
        let turns = conversation(5); // cut at len-3 lands on a tool result

        let outcome = budget
            .trim(&turns, &model, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.turns[3].is_tool());
        assert_eq!(&outcome.turns[3..], &turns[8..]);
        assert!(sandbox_core::check_tool_pairing(&outcome.turns).is_ok());
    }

    #[tokio::test]
    async fn test_trim_is_idempotent() {
        for keep in 1..8 {
            let budget = ContextBudgetManager::new(keep);
            let model = ScriptedModel::new();
            let turns = conversation(9);
            let cancel = CancellationToken::new();

            let once = budget.trim(&turns, &model, &cancel).await.unwrap().turns;
            let twice = budget.trim(&once, &model, &cancel).await.unwrap();
            assert_eq!(twice.turns, once, "keep_recent = {}", keep);
            assert_eq!(twice.replaced, 0);
        }
    }

    #[tokio::test]
    async fn test_unmerged_summaries_carried_verbatim() {
        let budget = ContextBudgetManager::new(4).with_merge_summaries(false);
        let model = ScriptedModel::new().with_compaction("second");
        let cancel = CancellationToken::new();

        let mut turns = budget
            .trim(&conversation(5), &ScriptedModel::new().with_compaction("first"), &cancel)
            .await
            .unwrap()
            .turns;
        turns.extend(conversation(8).into_iter().skip(12));

        let outcome = budget.trim(&turns, &model, &cancel).await.unwrap();
        assert_eq!(outcome.turns[2], Turn::summary("first\n\nsecond"));
        assert_eq!(outcome.turns.len(), 2 + 1 + 4);

        let request = &model.requests()[0];
        assert!(!request.turns[1].content().contains("first"));
    }

    #[tokio::test]
    async fn test_context_stays_bounded_while_conversation_grows() {
        for merge in [true, false] {
            let keep = 4;
            let budget = ContextBudgetManager::new(keep).with_merge_summaries(merge);
            let model = ScriptedModel::new();
            let cancel = CancellationToken::new();
            let full = conversation(20);

            // Two head turns, then one assistant/tool pair per step
            let mut context = full[..2].to_vec();
            for step in 0..20 {
                context.extend_from_slice(&full[2 + step * 2..4 + step * 2]);
                context = budget.trim(&context, &model, &cancel).await.unwrap().turns;

                assert!(
                    context.len() <= 2 + 1 + keep,
                    "merge = {}, step = {}, len = {}",
                    merge,
                    step,
                    context.len()
                );
                assert!(context.iter().filter(|t| t.is_summary()).count() <= 1);
                assert!(sandbox_core::check_tool_pairing(&context).is_ok());
            }
        }
    }

    #[tokio::test]
    async fn test_merge_summaries_folds_old_summary() {
        let budget = ContextBudgetManager::new(4).with_merge_summaries(true);
        let model = ScriptedModel::new().with_compaction("merged");
        let mut turns = conversation(3);
        turns.insert(2, Turn::summary("older work"));

        let outcome = budget
            .trim(&turns, &model, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.turns.len(), 2 + 1 + 4);
        assert_eq!(outcome.turns[2], Turn::summary("merged"));
        assert!(model.requests()[0].turns[1]
            .content()
            .contains("[earlier summary] older work"));
    }

    #[tokio::test]
    async fn test_failed_compaction_uses_local_digest() {
        let budget = ContextBudgetManager::new(2);
        let model = ScriptedModel::new().with_compaction_failure("overloaded");

        let outcome = budget
            .trim(&conversation(3), &model, &CancellationToken::new())
            .await
            .unwrap();

        let summary = outcome.turns[2].content();
        assert!(outcome.turns[2].is_summary());
        assert!(summary.contains("[call] execute_command"));
        assert!(summary.contains("[result execute_command] out 0"));
    }

    #[tokio::test]
    async fn test_cancelled_trim() {
        let budget = ContextBudgetManager::new(2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = budget.trim(&conversation(3), &ScriptedModel::new(), &cancel).await;
        assert!(matches!(result, Err(SandboxError::Cancelled)));
    }

    #[test]
    fn test_truncate_helpers() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("hi", 5), "hi");
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
