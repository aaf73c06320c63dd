//! Local process helpers used to drive `ssh`, `sshpass` and `tar`

use sandbox_core::{CommandOutput, Result, SandboxError};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Raw output of a local process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn into_command_output(self) -> CommandOutput {
        CommandOutput::new(self.stdout_lossy(), self.stderr_lossy()).with_exit_code(self.exit_code)
    }
}

/// Spawn `program` with `args`, optionally feeding `stdin`, and collect its
/// output. The child is killed if the returned future is dropped, so
/// timeouts and cancellation do not leak processes.
pub async fn run_process(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    stdin: Option<Vec<u8>>,
) -> Result<ProcessOutput> {
    debug!("Spawning {} ({} args)", program, args.len());

    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::Remote(format!("{}: {}", program, e)))?;

    // Feed stdin from a separate task so a chatty child cannot fill its
    // stdout pipe while we are still writing.
    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut child_stdin)) => Some(tokio::spawn(async move {
            let result = child_stdin.write_all(&input).await;
            drop(child_stdin);
            result
        })),
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| SandboxError::Remote(format!("{}: {}", program, e)))?;

    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: stdin closed early: {}", program, e),
            Err(e) => debug!("{}: stdin writer failed: {}", program, e),
        }
    }

    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Turn a non-zero exit into an error carrying the most useful output
pub fn ensure_success(output: ProcessOutput, context: &str) -> Result<ProcessOutput> {
    if output.exit_code == 0 {
        return Ok(output);
    }

    let stderr = output.stderr_lossy();
    let mut details = if stderr.trim().is_empty() {
        output.stdout_lossy().trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    if details.is_empty() {
        details = format!("command exited with {}", output.exit_code);
    }

    Err(SandboxError::Remote(format!("{}: {}", context, details)))
}

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
