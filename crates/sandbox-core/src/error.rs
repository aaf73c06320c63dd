//! Unified error types for the sandbox

use thiserror::Error;

/// Unified error type for all sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    // Remote host errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Remote execution error: {0}")]
    Remote(String),

    #[error("Command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background session error: {0}")]
    Session(String),

    // Language model errors
    #[error("Model error: {0}")]
    Model(String),

    #[error("Model limit: {0}")]
    ModelLimit(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Setup errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Submission error: {0}")]
    Submission(String),

    // Tool errors
    #[error("Invalid tool arguments: {0}")]
    ToolArguments(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl SandboxError {
    /// Whether the error means the remote connection is gone
    pub fn is_connection(&self) -> bool {
        matches!(self, SandboxError::Connection(_))
    }
}

/// Result type alias using SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
