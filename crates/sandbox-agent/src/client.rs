//! OpenAI-compatible chat completions client
//!
//! Turns are converted to the `/chat/completions` message format on every
//! call; nothing is cached between calls. 429 and 5xx responses are retried
//! with exponential backoff (honoring `retry-after`), and a circuit breaker
//! shared by all calls through one client stops hammering a dead endpoint.

use async_trait::async_trait;
use sandbox_core::{ModelConfig, Result, SandboxError, ToolCall, Turn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::auth;
use crate::circuit_breaker::CircuitBreaker;
use crate::types::{ModelBackend, ModelReply, ModelRequest, ToolDefinition, Usage};

const SUMMARY_PREFIX: &str = "Summary of earlier steps:\n";

/// Retry configuration for rate limits and server errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Model backend speaking the chat completions protocol
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: usize,
    temperature: f32,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ChatCompletionsClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            max_tokens: 4096,
            temperature: 0.0,
            retry: RetryPolicy::default(),
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    /// Build from configuration. Fails fast when no API token is available.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(SandboxError::Config("model.endpoint is not set".to_string()));
        }
        let api_key = auth::get_api_token(&config.api_key_env)?;
        Ok(Self::new(&config.endpoint, &config.model, api_key)
            .with_max_tokens(config.max_tokens)
            .with_temperature(config.temperature))
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    fn request_body(&self, request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": convert_turns(&request.turns),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(convert_tools(&request.tools));
        }
        body
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionsClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply> {
        // Held until the call returns; dropping it mid-call frees the half-open slot.
        let Some(_permit) = self.breaker.try_acquire() else {
            return Err(SandboxError::ModelLimit(format!(
                "Circuit breaker is open after repeated model failures. Retry in {}s.",
                self.breaker.time_until_retry().as_secs()
            )));
        };

        let body = self.request_body(&request);
        tracing::debug!(
            "Model request ({:?}): {} turns, {} tools",
            request.purpose,
            request.turns.len(),
            request.tools.len()
        );

        let mut retries = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            let response = match self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(SandboxError::Model(format!("Failed to send request: {}", e)));
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                retries += 1;
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                let error_text = response.text().await.unwrap_or_default();

                if retries > self.retry.max_retries {
                    self.breaker.record_failure();
                    let message = format!(
                        "{} after {} retries: {}",
                        status, self.retry.max_retries, error_text
                    );
                    return Err(if status.as_u16() == 429 {
                        SandboxError::ModelLimit(message)
                    } else {
                        SandboxError::Model(message)
                    });
                }

                let wait = if status.as_u16() == 429 {
                    retry_after.unwrap_or(backoff)
                } else {
                    backoff
                };
                tracing::warn!(
                    "Model endpoint returned {}. Waiting {:?} before retry {}/{}",
                    status,
                    wait,
                    retries,
                    self.retry.max_retries
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(self.retry.max_backoff);
                continue;
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                self.breaker.record_failure();
                tracing::error!(
                    "Model call failed with {} (breaker failures: {})",
                    status,
                    self.breaker.failure_count()
                );
                return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
                    SandboxError::Auth(format!("Model endpoint rejected token ({})", status))
                } else {
                    SandboxError::Model(format!("Model API error {}: {}", status, error_text))
                });
            }

            let reply = match response.text().await {
                Ok(text) => parse_reply(&text),
                Err(e) => Err(SandboxError::Model(format!("Failed to read response: {}", e))),
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(e);
                }
            };
            self.breaker.record_success();

            if let Some(usage) = &reply.usage {
                tracing::info!(
                    "Model replied ({} chars, {} tool calls, {} input tokens, {} output tokens)",
                    reply.content.len(),
                    reply.tool_calls.len(),
                    usage.input_tokens,
                    usage.output_tokens
                );
            }
            return Ok(reply);
        }
    }

    fn name(&self) -> String {
        self.model.clone()
    }
}

/// Convert turns to chat completions messages
pub(crate) fn convert_turns(turns: &[Turn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| match turn {
            Turn::System { content } => json!({"role": "system", "content": content}),
            Turn::User { content } => json!({"role": "user", "content": content}),
            Turn::Assistant {
                content,
                tool_calls,
            } => {
                if tool_calls.is_empty() {
                    json!({"role": "assistant", "content": content})
                } else {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": arguments_string(&call.arguments),
                                }
                            })
                        })
                        .collect();
                    json!({"role": "assistant", "content": content, "tool_calls": calls})
                }
            }
            Turn::Tool {
                tool_call_id,
                content,
                ..
            } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
            Turn::Summary { content } => json!({
                "role": "assistant",
                "content": format!("{}{}", SUMMARY_PREFIX, content),
            }),
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// Arguments go over the wire as a JSON-encoded string
fn arguments_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

/// Parse a chat completions response body
pub(crate) fn parse_reply(text: &str) -> Result<ModelReply> {
    let response: ChatResponse = serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        SandboxError::Model(format!("Failed to parse response ({}): {}", e, preview))
    })?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| SandboxError::Model("No choices in response".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            ToolCall::new(
                call.id.unwrap_or_default(),
                call.function.name,
                parse_arguments(call.function.arguments),
            )
        })
        .collect();

    Ok(ModelReply {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
    })
}

/// Decode arguments. Strings holding JSON are parsed; anything that is
/// not valid JSON is kept as the raw string.
fn parse_arguments(arguments: Option<Value>) -> Value {
    match arguments {
        None | Some(Value::Null) => json!({}),
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        Some(other) => other,
    }
}
