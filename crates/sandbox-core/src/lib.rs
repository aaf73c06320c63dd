//! # sandbox-core
//!
//! Core types for the grading sandbox.
//!
//! The sandbox gives an AI agent a live copy of a student's submission on a
//! remote host. This crate holds what every other crate agrees on:
//!
//! - Conversation turns exchanged with the language model
//! - Remote command output and the command history log
//! - The unified error type
//! - Configuration loaded from `.sandbox/config.toml`
//! - Terminal output rendering for the UI

mod config;
mod error;
pub mod fail_open;
pub mod markup;
mod types;

pub use config::{
    AgentConfig, HistoryConfig, ModelConfig, RemoteConfig, SandboxConfig, ServerConfig,
    SubmissionsConfig,
};
pub use error::{Result, SandboxError};
pub use types::*;
