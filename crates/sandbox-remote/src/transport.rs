//! Connection to the remote execution host

use async_trait::async_trait;
use sandbox_core::{CommandOutput, RemoteConfig, Result, SandboxError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::process::{ensure_success, run_process, shell_quote, ProcessOutput};

/// `ssh` reserves this exit status for its own failures
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Trait for reaching the remote host (allows mocking in tests)
///
/// `exec` returns `SandboxError::Connection` when the connection itself
/// failed; the transport is then disconnected and the next `connect`
/// re-establishes it. A non-zero exit of the remote command is returned as
/// data.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open the connection. Idempotent: a live connection is reused.
    async fn connect(&self) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Run a shell command line on the host
    async fn exec(&self, command: &str, pty: bool) -> Result<CommandOutput>;

    /// Copy the contents of a local directory into `remote_dir`
    async fn upload_dir(&self, local: &Path, remote_dir: &str) -> Result<()>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// Where and how to log in
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            identity_file: None,
            password: None,
            connect_timeout: Duration::from_secs(15),
        }
    }

    /// Build from configuration, reading the password from the environment
    /// variable named by `password_env` when one is configured.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let password = match &config.password_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                SandboxError::Auth(format!("password environment variable {} is not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            identity_file: config.identity_file.clone(),
            password,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        })
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by the master and every multiplexed client
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if self.password.is_none() {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args
    }
}

/// OpenSSH transport multiplexing every command over one ControlMaster
pub struct SshConnection {
    target: SshTarget,
    control_path: PathBuf,
    connected: AtomicBool,
    connect_lock: AsyncMutex<()>,
}

impl SshConnection {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            control_path: build_control_path(),
            connected: AtomicBool::new(false),
            connect_lock: AsyncMutex::new(()),
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Run `ssh` (wrapped in `sshpass -e` when a password is configured)
    async fn ssh(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<ProcessOutput> {
        match &self.target.password {
            Some(password) => {
                let mut wrapped = vec!["-e".to_string(), "ssh".to_string()];
                wrapped.extend(args);
                let envs = [("SSHPASS".to_string(), password.clone())];
                run_process("sshpass", &wrapped, &envs, stdin).await
            }
            None => run_process("ssh", &args, &[], stdin).await,
        }
    }

    fn client_args(&self, pty: bool) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            if pty { "-tt" } else { "-T" }.to_string(),
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.target.common_args());
        args
    }

    /// Map `ssh`'s own failure status to a connection error and drop the
    /// connection so the next call reconnects.
    fn check_connection(&self, output: &ProcessOutput) -> Result<()> {
        if output.exit_code == SSH_CONNECTION_FAILURE {
            self.connected.store(false, Ordering::SeqCst);
            let detail = output.stderr_lossy().trim().to_string();
            warn!("Connection to {} lost: {}", self.describe(), detail);
            return Err(SandboxError::Connection(if detail.is_empty() {
                format!("ssh to {} failed", self.describe())
            } else {
                detail
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for SshConnection {
    #[instrument(skip(self), fields(target = %self.describe()))]
    async fn connect(&self) -> Result<()> {
        // Concurrent callers wait here and then reuse the master.
        let _guard = self.connect_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        remove_control_socket(&self.control_path);

        let mut args = vec![
            "-MNf".to_string(),
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ];
        args.extend(self.target.common_args());
        args.push(self.target.destination());

        let output = self.ssh(args, None).await?;
        ensure_success(output, "failed to open persistent ssh connection")
            .map_err(|e| SandboxError::Connection(e.to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to {}", self.describe());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let args = vec![
            "-S".to_string(),
            self.control_path.display().to_string(),
            "-O".to_string(),
            "exit".to_string(),
            self.target.destination(),
        ];
        if let Err(e) = run_process("ssh", &args, &[], None).await {
            debug!("Closing control master failed: {}", e);
        }
        remove_control_socket(&self.control_path);
        info!("Disconnected from {}", self.describe());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, command), fields(target = %self.describe()))]
    async fn exec(&self, command: &str, pty: bool) -> Result<CommandOutput> {
        if !self.is_connected() {
            return Err(SandboxError::Connection("not connected".to_string()));
        }

        debug!("Executing remote command: {}", command);
        let mut args = self.client_args(pty);
        args.push(self.target.destination());
        args.push(command.to_string());

        let output = self.ssh(args, None).await?;
        self.check_connection(&output)?;
        Ok(output.into_command_output())
    }

    #[instrument(skip(self), fields(target = %self.describe()))]
    async fn upload_dir(&self, local: &Path, remote_dir: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(SandboxError::Connection("not connected".to_string()));
        }

        let archive = run_process(
            "tar",
            &[
                "-C".to_string(),
                local.display().to_string(),
                "-cf".to_string(),
                "-".to_string(),
                ".".to_string(),
            ],
            &[],
            None,
        )
        .await?;
        let archive = ensure_success(archive, "failed to archive submission")?;
        debug!("Uploading {} bytes to {}", archive.stdout.len(), remote_dir);

        let remote_dir = shell_quote(remote_dir);
        let mut args = self.client_args(false);
        args.push(self.target.destination());
        args.push(format!(
            "mkdir -p {dir} && tar -C {dir} -xf -",
            dir = remote_dir
        ));

        let output = self.ssh(args, Some(archive.stdout)).await?;
        self.check_connection(&output)?;
        ensure_success(output, "failed to unpack submission on remote host")?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.target.destination(), self.target.port)
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let closed = std::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = closed {
            debug!("Closing control master on drop failed: {}", e);
        }
        remove_control_socket(&self.control_path);
    }
}

/// Remove a stale control socket. A missing socket is the normal case.
fn remove_control_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed control socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove control socket {}: {}", path.display(), e),
    }
}

fn build_control_path() -> PathBuf {
    // Unix socket paths are short; keep the name compact.
    let id = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("sandbox-ssh-{}.sock", &id[..12]))
}

#[derive(Debug, Clone)]
enum MockResponse {
    Output(CommandOutput),
    ConnectionLost,
    Hang,
}

#[derive(Default)]
struct MockState {
    responses: Mutex<Vec<(String, MockResponse)>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
}

/// Mock transport for testing
///
/// Responses are matched by substring against the full command line, first
/// registered match wins. Unmatched commands succeed with empty output.
/// Clones share state, so a test can keep a handle while the session owns
/// another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, pattern: &str, output: CommandOutput) -> Self {
        self.push(pattern, MockResponse::Output(output));
        self
    }

    pub fn with_stdout(self, pattern: &str, stdout: &str) -> Self {
        self.with_response(pattern, CommandOutput::new(stdout, "").with_exit_code(0))
    }

    /// Commands matching `pattern` fail as if the connection dropped
    pub fn with_connection_loss(self, pattern: &str) -> Self {
        self.push(pattern, MockResponse::ConnectionLost);
        self
    }

    /// Commands matching `pattern` never complete
    pub fn with_hang(self, pattern: &str) -> Self {
        self.push(pattern, MockResponse::Hang);
        self
    }

    /// The next `count` connection attempts fail
    pub fn fail_connects(self, count: usize) -> Self {
        self.state.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    fn push(&self, pattern: &str, response: MockResponse) {
        lock(&self.state.responses).push((pattern.to_string(), response));
    }

    /// Every command line executed so far, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        lock(&self.state.uploads).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    fn response_for(&self, command: &str) -> Option<MockResponse> {
        lock(&self.state.responses)
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(&self) -> Result<()> {
        if self.state.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(SandboxError::Connection("mock host unreachable".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str, _pty: bool) -> Result<CommandOutput> {
        if !self.is_connected() {
            return Err(SandboxError::Connection("not connected".to_string()));
        }
        lock(&self.state.commands).push(command.to_string());

        match self.response_for(command) {
            Some(MockResponse::Output(output)) => Ok(output),
            Some(MockResponse::ConnectionLost) => {
                self.state.connected.store(false, Ordering::SeqCst);
                Err(SandboxError::Connection("mock connection reset".to_string()))
            }
            Some(MockResponse::Hang) => {
                std::future::pending::<()>().await;
                Ok(CommandOutput::default())
            }
            None => Ok(CommandOutput::new("", "").with_exit_code(0)),
        }
    }

    async fn upload_dir(&self, local: &Path, remote_dir: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(SandboxError::Connection("not connected".to_string()));
        }
        lock(&self.state.uploads).push((local.to_path_buf(), remote_dir.to_string()));
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_args() {
        let mut target = SshTarget::new("sandbox.internal", "grader");
        target.port = 2222;
        target.identity_file = Some(PathBuf::from("/keys/id_ed25519"));

        let args = target.common_args();
        assert_eq!(target.destination(), "grader@sandbox.internal");
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_remove_control_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("sandbox-ssh-test.sock");
        std::fs::write(&socket, b"").unwrap();

        remove_control_socket(&socket);
        assert!(!socket.exists());

        // Already gone: nothing to do
        remove_control_socket(&socket);

        // Not removable as a file: logged and skipped
        remove_control_socket(dir.path());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_password_disables_batch_mode() {
        let mut target = SshTarget::new("h", "u");
        target.password = Some("secret".to_string());
        assert!(!target.common_args().contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_from_config_missing_password_env() {
        let config = RemoteConfig {
            host: "h".to_string(),
            password_env: Some("SANDBOX_TEST_PASSWORD_THAT_IS_NEVER_SET".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SshTarget::from_config(&config),
            Err(SandboxError::Auth(_))
        ));
    }

    #[test]
    fn test_client_args_pty_flag() {
        let conn = SshConnection::new(SshTarget::new("h", "u"));
        assert!(conn.client_args(true).contains(&"-tt".to_string()));
        assert!(conn.client_args(false).contains(&"-T".to_string()));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_check_connection_flips_state() {
        let conn = SshConnection::new(SshTarget::new("h", "u"));
        conn.connected.store(true, Ordering::SeqCst);

        let ok = ProcessOutput {
            exit_code: 1,
            ..Default::default()
        };
        assert!(conn.check_connection(&ok).is_ok());
        assert!(conn.is_connected());

        let lost = ProcessOutput {
            exit_code: 255,
            stdout: Vec::new(),
            stderr: b"Connection closed by remote host".to_vec(),
        };
        let err = conn.check_connection(&lost).unwrap_err();
        assert!(err.is_connection());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_exec_requires_connection() {
        let conn = SshConnection::new(SshTarget::new("h", "u"));
        let err = conn.exec("ls", true).await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_mock_transport_matching() {
        let mock = MockTransport::new()
            .with_stdout("ls", "a.txt\nb.txt\n")
            .with_connection_loss("reboot");
        mock.connect().await.unwrap();

        let out = mock.exec("cd /srv && ls", true).await.unwrap();
        assert_eq!(out.stdout, "a.txt\nb.txt\n");

        let out = mock.exec("whoami", true).await.unwrap();
        assert!(out.is_empty());

        assert!(mock.exec("sudo reboot", true).await.unwrap_err().is_connection());
        assert!(!mock.is_connected());
        assert_eq!(mock.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_failing_connects() {
        let mock = MockTransport::new().fail_connects(1);
        assert!(mock.connect().await.is_err());
        assert!(mock.connect().await.is_ok());
        assert_eq!(mock.connect_count(), 1);
    }
}
