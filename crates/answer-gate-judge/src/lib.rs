//! Live entailment judge over an OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use answer_gate_core::{Judge, JudgeConfig, JudgeError};
use anyhow::{anyhow, Result};
use serde_json::{json, Value};

const ERROR_BODY_MAX_CHARS: usize = 200;

/// Judge that forwards each entailment prompt as a single user message.
///
/// No retries: a transport failure or non-success status surfaces as [`JudgeError`] and the
/// verifier labels the claim `UNKNOWN`.
pub struct HttpJudge {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpJudge {
    #[must_use]
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: resolve_chat_endpoint(endpoint),
            model: model.to_string(),
            api_key,
        }
    }

    /// Build from the `http` judge configuration, reading the API key from the named
    /// environment variable when one is configured.
    ///
    /// # Errors
    /// Returns an error for a non-`http` configuration or an unset key variable.
    pub fn from_config(config: &JudgeConfig) -> Result<Self> {
        let JudgeConfig::Http { endpoint, model, api_key_env, timeout_secs } = config else {
            return Err(anyhow!("judge kind `{}` is not served over http", config.kind()));
        };
        let api_key = match api_key_env {
            Some(name) => Some(
                std::env::var(name)
                    .map_err(|_| anyhow!("judge api key variable `{name}` is not set"))?,
            ),
            None => None,
        };
        Ok(Self::new(endpoint, model, api_key, Duration::from_secs(*timeout_secs)))
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }
}

impl Judge for HttpJudge {
    fn judge(&self, prompt: &str) -> Result<String, JudgeError> {
        let mut request = self.agent.post(&self.endpoint).set("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        tracing::debug!(endpoint = %self.endpoint, model = %self.model, "calling entailment judge");
        let response = request.send_json(self.request_body(prompt)).map_err(|err| match err {
            ureq::Error::Status(code, response) => {
                let body = response.into_string().unwrap_or_default();
                JudgeError::Rejected(format!(
                    "status {code}: {}",
                    truncate(&body, ERROR_BODY_MAX_CHARS)
                ))
            }
            ureq::Error::Transport(transport) => JudgeError::Transport(transport.to_string()),
        })?;

        let body: Value = response
            .into_json()
            .map_err(|err| JudgeError::Rejected(format!("invalid response body: {err}")))?;
        extract_reply(&body)
    }
}

/// Accept either a base URL or a full `/chat/completions` URL.
#[must_use]
pub fn resolve_chat_endpoint(endpoint: &str) -> String {
    if endpoint.contains("/chat/completions") {
        endpoint.to_string()
    } else {
        format!("{}/chat/completions", endpoint.trim_end_matches('/'))
    }
}

/// First choice's message content, as string or list of text parts.
///
/// # Errors
/// Returns [`JudgeError::Rejected`] when the body carries no usable content.
pub fn extract_reply(body: &Value) -> Result<String, JudgeError> {
    let content = &body["choices"][0]["message"]["content"];
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    if text.trim().is_empty() {
        return Err(JudgeError::Rejected("response carried no message content".to_string()));
    }
    Ok(text)
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{truncated}...")
    } else {
        truncated
    }
}
