//! Named background sessions (tmux) on the remote host

use chrono::Utc;
use sandbox_core::{BackgroundSession, CommandHistoryEntry, CommandOutput, Result, SandboxError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::process::shell_quote;
use crate::session::RemoteSession;

const ENDED: &str = "__sandbox_session_ended__";

/// Check that a session name is usable as a tmux target
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SandboxError::Session("session name is empty".to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SandboxError::Session(format!(
            "invalid session name {:?}: use letters, digits, '-' and '_'",
            name
        )));
    }
    Ok(())
}

/// Tracks tmux sessions on the host and relays commands into them.
///
/// Sessions share the remote connection with foreground commands but not
/// the foreground lock, so a dev server keeps running while the agent
/// works.
pub struct SessionRegistry {
    session: Arc<RemoteSession>,
    default_session: String,
    capture_lines: usize,
    known: Mutex<HashMap<String, BackgroundSession>>,
}

impl SessionRegistry {
    pub fn new(
        session: Arc<RemoteSession>,
        default_session: impl Into<String>,
        capture_lines: usize,
    ) -> Self {
        Self {
            session,
            default_session: default_session.into(),
            capture_lines: capture_lines.max(1),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_session(&self) -> &str {
        &self.default_session
    }

    /// Resolve an optional caller-supplied name, falling back to the default
    pub fn resolve_name(&self, name: Option<&str>) -> Result<String> {
        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => self.default_session.clone(),
        };
        validate_session_name(&name)?;
        Ok(name)
    }

    /// Create `name` if absent, type `command` into it and return whatever
    /// the pane shows right away. Does not wait for the command.
    #[instrument(skip(self, cancel))]
    pub async fn run_in_background(
        &self,
        name: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let name = self.resolve_name(Some(name))?;
        let session_target = shell_quote(&format!("={}", name));
        let pane_target = shell_quote(&format!("={}:", name));

        let script = format!(
            "tmux has-session -t {s} 2>/dev/null || tmux new-session -d -s {n} -c {root} \
             && tmux send-keys -t {p} -l {cmd} \
             && tmux send-keys -t {p} Enter \
             && sleep 0.2 \
             && tmux capture-pane -p -e -t {p}",
            s = session_target,
            n = shell_quote(&name),
            root = shell_quote(self.session.working_directory()),
            p = pane_target,
            cmd = shell_quote(command),
        );

        let output = self.session.exec(&script, false, cancel).await?;
        if !output.is_success() {
            return Err(SandboxError::Session(format!(
                "failed to start {:?} in session {}: {}",
                command,
                name,
                output.stderr.trim()
            )));
        }

        let output = CommandOutput::new(trim_pane(&output.stdout), output.stderr);
        self.remember(&name, &output);
        self.session.history().record(
            CommandHistoryEntry::new(command, &output, self.session.working_directory())
                .in_session(&name),
        );
        info!("Sent command to background session {}", name);
        Ok(output)
    }

    /// Capture the current pane of `name` without waiting. A session that
    /// does not exist yields empty output.
    #[instrument(skip(self, cancel))]
    pub async fn read_output(&self, name: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let name = self.resolve_name(Some(name))?;
        let script = format!(
            "tmux has-session -t {s} 2>/dev/null || exit 0; tmux capture-pane -p -e -t {p} -S -{lines}",
            s = shell_quote(&format!("={}", name)),
            p = shell_quote(&format!("={}:", name)),
            lines = self.capture_lines,
        );

        let output = self.session.exec(&script, false, cancel).await?;
        let output = CommandOutput::new(trim_pane(&output.stdout), output.stderr);
        if output.stdout.is_empty() && !self.is_tracked(&name) {
            debug!("Session {} does not exist", name);
        } else {
            self.remember(&name, &output);
        }
        Ok(output)
    }

    /// Kill `name`. Returns whether a session was actually ended.
    #[instrument(skip(self, cancel))]
    pub async fn end(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let name = self.resolve_name(Some(name))?;
        let script = format!(
            "tmux kill-session -t {s} 2>/dev/null && echo {marker} || true",
            s = shell_quote(&format!("={}", name)),
            marker = ENDED,
        );

        let output = self.session.exec(&script, false, cancel).await?;
        self.forget(&name);

        let ended = output.stdout.contains(ENDED);
        if ended {
            info!("Ended background session {}", name);
        }
        Ok(ended)
    }

    /// Names of the sessions alive on the host
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let output = self
            .session
            .exec("tmux ls -F '#{session_name}' 2>/dev/null || true", false, cancel)
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Last captured state of every session this registry has touched
    pub fn tracked(&self) -> Vec<BackgroundSession> {
        let mut sessions: Vec<BackgroundSession> = self.known().values().cloned().collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    fn known(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackgroundSession>> {
        self.known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_tracked(&self, name: &str) -> bool {
        self.known().contains_key(name)
    }

    fn remember(&self, name: &str, output: &CommandOutput) {
        self.known().insert(
            name.to_string(),
            BackgroundSession {
                name: name.to_string(),
                last_output: output.clone(),
                updated_at: Utc::now(),
            },
        );
    }

    fn forget(&self, name: &str) {
        self.known().remove(name);
    }
}

/// Drop the blank rows tmux pads the pane with
fn trim_pane(captured: &str) -> String {
    let trimmed = captured.trim_end_matches(['\n', '\r', ' ']);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}
