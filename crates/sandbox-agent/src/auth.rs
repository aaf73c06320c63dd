//! API token lookup for the model backend
//!
//! The token is read from the environment variable named in
//! `model.api_key_env`, falling back to `OPENAI_API_KEY`.

use sandbox_core::{Result, SandboxError};
use std::env;

const FALLBACK_TOKEN_VAR: &str = "OPENAI_API_KEY";

/// Get the model API token
///
/// Priority:
/// 1. The configured variable
/// 2. `OPENAI_API_KEY`
pub fn get_api_token(configured_var: &str) -> Result<String> {
    if let Some(token) = read_non_empty(configured_var) {
        tracing::info!("Using model token from {}", configured_var);
        return Ok(token);
    }

    if configured_var != FALLBACK_TOKEN_VAR {
        if let Some(token) = read_non_empty(FALLBACK_TOKEN_VAR) {
            tracing::info!("Using model token from {}", FALLBACK_TOKEN_VAR);
            return Ok(token);
        }
    }

    Err(SandboxError::Auth(format!(
        "No model API token found. Set {} (or {}).",
        configured_var, FALLBACK_TOKEN_VAR
    )))
}

fn read_non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}
