//! Foreground command execution on the remote host

use sandbox_core::{CommandHistoryEntry, CommandOutput, RemoteConfig, Result, SandboxError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::history::CommandHistory;
use crate::process::shell_quote;
use crate::transport::RemoteTransport;

/// The one shared session with the remote host.
///
/// Foreground commands are serialized: the remote working directory is
/// implicit shared state, so two commands never run at once through
/// [`RemoteSession::run`]. Background tmux sessions go through
/// [`RemoteSession::exec`], which skips that lock.
pub struct RemoteSession {
    transport: Arc<dyn RemoteTransport>,
    working_root: String,
    timeout: Duration,
    history: Arc<CommandHistory>,
    run_lock: Mutex<()>,
}

impl RemoteSession {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        working_root: impl Into<String>,
        timeout: Duration,
        history: Arc<CommandHistory>,
    ) -> Self {
        Self {
            transport,
            working_root: working_root.into(),
            timeout,
            history,
            run_lock: Mutex::new(()),
        }
    }

    pub fn from_config(
        transport: Arc<dyn RemoteTransport>,
        config: &RemoteConfig,
        history: Arc<CommandHistory>,
    ) -> Self {
        Self::new(
            transport,
            config.working_root.clone(),
            Duration::from_secs(config.command_timeout_secs),
            history,
        )
    }

    /// Open the connection, reusing it if already open
    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Directory every foreground command starts in
    pub fn working_directory(&self) -> &str {
        &self.working_root
    }

    pub fn history(&self) -> &Arc<CommandHistory> {
        &self.history
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Run `command` from the working root with a pseudo-terminal.
    ///
    /// A non-zero exit is returned as data. Fails with `Timeout` after the
    /// configured limit, `Cancelled` when `cancel` fires, and `Connection`
    /// when the host is unreachable (the next call reconnects).
    #[instrument(skip(self, cancel), fields(root = %self.working_root))]
    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let _guard = self.run_lock.lock().await;

        let full = format!("cd {} && {}", shell_quote(&self.working_root), command);
        let output = self.exec_as(&full, command, true, cancel).await?;

        self.history
            .record(CommandHistoryEntry::new(command, &output, &self.working_root));
        debug!(
            "Command finished (exit {:?}, {} bytes stdout)",
            output.exit_code,
            output.stdout.len()
        );
        Ok(output)
    }

    /// Run a raw command line without the foreground lock or `cd` prefix.
    /// Connects lazily and applies the same timeout and cancellation.
    pub async fn exec(
        &self,
        command: &str,
        pty: bool,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        self.exec_as(command, command, pty, cancel).await
    }

    async fn exec_as(
        &self,
        command: &str,
        label: &str,
        pty: bool,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        self.ensure_connected().await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Command cancelled: {}", label);
                Err(SandboxError::Cancelled)
            }
            result = tokio::time::timeout(self.timeout, self.transport.exec(command, pty)) => {
                match result {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => {
                        if e.is_connection() {
                            warn!("Remote connection failed, will reconnect on next call: {}", e);
                        }
                        Err(e)
                    }
                    Err(_) => {
                        warn!("Command timed out after {:?}: {}", self.timeout, label);
                        Err(SandboxError::Timeout {
                            command: label.to_string(),
                            seconds: self.timeout.as_secs(),
                        })
                    }
                }
            }
        }
    }

    /// Replace the contents of the working root with a local directory.
    /// Holds the foreground lock so no command observes a half-copied tree.
    #[instrument(skip(self, cancel), fields(root = %self.working_root))]
    pub async fn replace_working_root(&self, local: &Path, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.run_lock.lock().await;

        let root = shell_quote(&self.working_root);
        let clear = format!("mkdir -p {root} && find {root} -mindepth 1 -delete", root = root);
        let output = self.exec_as(&clear, &clear, false, cancel).await?;
        if !output.is_success() {
            return Err(SandboxError::Remote(format!(
                "failed to clear {}: {}",
                self.working_root,
                output.stderr.trim()
            )));
        }

        let upload = self.transport.upload_dir(local, &self.working_root);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            result = tokio::time::timeout(self.timeout, upload) => match result {
                Ok(result) => result,
                Err(_) => Err(SandboxError::Timeout {
                    command: format!("upload {}", local.display()),
                    seconds: self.timeout.as_secs(),
                }),
            },
        }?;

        info!("Copied {} into {}", local.display(), self.working_root);
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<()> {
        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }
        Ok(())
    }
}
