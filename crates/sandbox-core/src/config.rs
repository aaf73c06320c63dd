//! Configuration management for the sandbox
//!
//! Settings come from `.sandbox/config.toml` (or defaults) and are then
//! overridden by `SANDBOX_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Result, SandboxError};

/// Top-level sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub submissions: SubmissionsConfig,
}

/// Remote execution host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Private key passed to `ssh -i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Environment variable holding a password (uses `sshpass`)
    #[serde(default)]
    pub password_env: Option<String>,

    /// Directory every foreground command runs in
    #[serde(default = "default_working_root")]
    pub working_root: String,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Session used when a tool call names none
    #[serde(default = "default_session")]
    pub default_session: String,

    /// Scrollback lines captured from a background session
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Thinking cycles allowed before a forced summary
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Most recent turns always sent to the model verbatim
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    /// Let the model fold earlier summaries into each new summary. When off,
    /// their text is carried over verbatim into the new summary turn.
    #[serde(default = "default_true")]
    pub merge_summaries: bool,

    /// Write `.sandbox/activity.md`
    #[serde(default = "default_true")]
    pub activity_log: bool,
}

/// Language model backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Chat completions endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable containing the API token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default)]
    pub temperature: f32,
}

/// Command history retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

/// HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Local submission file store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionsConfig {
    #[serde(default = "default_submissions_root")]
    pub root: PathBuf,
}

// Default value providers
fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "ubuntu".to_string()
}

fn default_working_root() -> String {
    "/home/ubuntu/submission".to_string()
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_session() -> String {
    "background".to_string()
}

fn default_capture_lines() -> usize {
    200
}

fn default_max_iterations() -> usize {
    30
}

fn default_keep_recent() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "SANDBOX_MODEL_API_KEY".to_string()
}

fn default_max_tokens() -> usize {
    4096
}

fn default_history_capacity() -> usize {
    500
}

fn default_server_port() -> u16 {
    7080
}

fn default_submissions_root() -> PathBuf {
    PathBuf::from("submissions")
}

impl SandboxConfig {
    /// Load configuration from `.sandbox/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".sandbox/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.sandbox/config.toml`
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        let config_dir = root.join(".sandbox");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| SandboxError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Apply `SANDBOX_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SANDBOX_HOST") {
            self.remote.host = host;
        }
        if let Some(port) = lookup("SANDBOX_PORT") {
            self.remote.port = port
                .parse()
                .map_err(|_| SandboxError::Config(format!("SANDBOX_PORT is not a port: {}", port)))?;
        }
        if let Some(user) = lookup("SANDBOX_USER") {
            self.remote.user = user;
        }
        if let Some(identity) = lookup("SANDBOX_IDENTITY_FILE") {
            self.remote.identity_file = Some(PathBuf::from(identity));
        }
        if let Some(root) = lookup("SANDBOX_WORKING_ROOT") {
            self.remote.working_root = root;
        }
        if let Some(endpoint) = lookup("SANDBOX_MODEL_ENDPOINT") {
            self.model.endpoint = endpoint;
        }
        if let Some(model) = lookup("SANDBOX_MODEL") {
            self.model.model = model;
        }
        if let Some(dir) = lookup("SANDBOX_SUBMISSIONS_DIR") {
            self.submissions.root = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Reject configurations the sandbox cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            return Err(SandboxError::Config(
                "remote.host is not set (config file or SANDBOX_HOST)".to_string(),
            ));
        }
        if self.remote.user.trim().is_empty() {
            return Err(SandboxError::Config("remote.user is empty".to_string()));
        }
        if self.remote.working_root.trim().is_empty() || self.remote.working_root.trim() == "/" {
            return Err(SandboxError::Config(
                "remote.working_root must name a dedicated directory".to_string(),
            ));
        }
        if self.model.endpoint.trim().is_empty() {
            return Err(SandboxError::Config(
                "model.endpoint is not set (config file or SANDBOX_MODEL_ENDPOINT)".to_string(),
            ));
        }
        if self.agent.keep_recent == 0 {
            return Err(SandboxError::Config("agent.keep_recent must be > 0".to_string()));
        }
        if self.agent.max_iterations == 0 {
            return Err(SandboxError::Config("agent.max_iterations must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: default_user(),
            identity_file: None,
            password_env: None,
            working_root: default_working_root(),
            command_timeout_secs: default_command_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            default_session: default_session(),
            capture_lines: default_capture_lines(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            keep_recent: default_keep_recent(),
            merge_summaries: true,
            activity_log: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

impl Default for SubmissionsConfig {
    fn default() -> Self {
        Self {
            root: default_submissions_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.agent.max_iterations, 30);
        assert_eq!(config.agent.keep_recent, 20);
        assert!(config.agent.merge_summaries);
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.default_session, "background");
        assert_eq!(config.history.capacity, 500);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = SandboxConfig::from_toml(
            r#"
[remote]
host = "sandbox.internal"
working_root = "/srv/grading"

[agent]
max_iterations = 10
"#,
        )
        .unwrap();

        assert_eq!(config.remote.host, "sandbox.internal");
        assert_eq!(config.remote.working_root, "/srv/grading");
        assert_eq!(config.remote.command_timeout_secs, 120);
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.agent.keep_recent, 20);
        assert!(config.agent.merge_summaries);
        assert_eq!(config.model.api_key_env, "SANDBOX_MODEL_API_KEY");
    }

    #[test]
    fn test_invalid_toml() {
        let result = SandboxConfig::from_toml("[remote\nhost=");
        assert!(matches!(result, Err(SandboxError::Config(_))));
    }

    #[test]
    fn test_write_and_load_default() {
        let dir = TempDir::new().unwrap();
        let path = SandboxConfig::write_default(dir.path()).unwrap();
        assert!(path.ends_with(".sandbox/config.toml"));

        let loaded = SandboxConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.agent.max_iterations, 30);
        assert_eq!(loaded.remote.working_root, "/home/ubuntu/submission");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SandboxConfig::load_or_default(dir.path()).unwrap();
        assert!(config.remote.host.is_empty());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("SANDBOX_HOST", "10.0.0.5"),
            ("SANDBOX_PORT", "2222"),
            ("SANDBOX_MODEL", "local-model"),
        ]
        .into_iter()
        .collect();

        let mut config = SandboxConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.remote.host, "10.0.0.5");
        assert_eq!(config.remote.port, 2222);
        assert_eq!(config.model.model, "local-model");
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = SandboxConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "SANDBOX_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = SandboxConfig::default();
        assert!(config.validate().is_err());

        config.remote.host = "sandbox".to_string();
        assert!(config.validate().is_ok());

        config.remote.working_root = "/".to_string();
        assert!(config.validate().is_err());

        config.remote.working_root = "/srv/work".to_string();
        config.agent.keep_recent = 0;
        assert!(config.validate().is_err());
    }
}
