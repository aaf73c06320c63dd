//! Activity Logger - human-readable task transcript in `.sandbox/activity.md`
//!
//! Records:
//! - Task starts
//! - Every tool call with a preview of its result
//! - Context compactions
//! - The final outcome with token usage

use chrono::Utc;
use sandbox_core::fail_open::fail_open;
use sandbox_core::ToolCall;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::types::Usage;

/// Maximum characters of a tool result shown in the log
const ACTIVITY_LOG_PREVIEW_CHARS: usize = 500;

/// Activity logger for agent tasks
pub struct ActivityLogger {
    output_path: PathBuf,
}

impl ActivityLogger {
    /// Log into `activity.md` inside `sandbox_dir`
    pub fn new(sandbox_dir: PathBuf) -> Self {
        Self {
            output_path: sandbox_dir.join("activity.md"),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.output_path
    }

    /// Start a fresh log for a task
    ///
    /// This operation is fail-open - logging failures won't abort the task
    pub async fn log_task_start(&self, task: &str, max_iterations: usize) {
        fail_open("activity_logger::log_task_start", || async {
            if let Some(parent) = self.output_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
            let content = format!(
                "# Sandbox Activity Log\n\n## Task: {}\n**Started**: {}\n**Max Iterations**: {}\n\n---\n\n",
                task.lines().next().unwrap_or(task),
                timestamp,
                max_iterations
            );

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.output_path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
        .await;
    }

    /// Log one dispatched tool call and its result
    pub async fn log_tool_call(&self, iteration: usize, call: &ToolCall, result: &str) {
        fail_open("activity_logger::log_tool_call", || async {
            let timestamp = Utc::now().format("%H:%M:%S");

            let preview = if result.chars().count() > ACTIVITY_LOG_PREVIEW_CHARS {
                let truncated: String = result.chars().take(ACTIVITY_LOG_PREVIEW_CHARS).collect();
                format!("{truncated}...")
            } else {
                result.to_string()
            };

            let content = format!(
                "### Iteration {} · `{}` ({})\n```json\n{}\n```\n> {}\n\n",
                iteration + 1,
                call.name,
                timestamp,
                call.arguments,
                preview.replace('\n', "\n> ")
            );

            self.append_internal(&content).await
        })
        .await;
    }

    pub async fn log_compaction(&self, replaced: usize) {
        fail_open("activity_logger::log_compaction", || async {
            let content = format!("*Condensed {} earlier turns into a summary*\n\n", replaced);
            self.append_internal(&content).await
        })
        .await;
    }

    /// Log the final outcome
    ///
    /// This operation is fail-open - logging failures won't abort the task
    pub async fn log_task_complete(
        &self,
        iterations: usize,
        completed: bool,
        usage: &Usage,
        summary: &str,
    ) {
        fail_open("activity_logger::log_task_complete", || async {
            let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
            let status = if completed {
                "✓ Completed"
            } else {
                "✗ Incomplete"
            };

            let content = format!(
                "---\n\n## Task Summary\n\n\
                **Finished**: {}\n\
                **Iterations**: {}\n\
                **Status**: {}\n\
                **Tokens**: {} input, {} output\n\n\
                {}\n",
                timestamp,
                iterations,
                status,
                usage.input_tokens,
                usage.output_tokens,
                summary
            );

            self.append_internal(&content).await
        })
        .await;
    }

    async fn append_internal(&self, content: &str) -> sandbox_core::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
