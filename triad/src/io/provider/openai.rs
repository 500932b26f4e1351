//! OpenAI-compatible backend (`/v1/chat/completions`, `/v1/models`).
//!
//! Works against any server that speaks the chat completions dialect,
//! including llama.cpp, vLLM and Ollama's compatibility endpoint.

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use super::retry::RetryPolicy;
use super::transport::Transport;
use super::{ConnectionReport, GenerateResult, ModelConfig, Provider, ProviderError, model_names};
use crate::io::config::ProviderConfig;

const SYSTEM_PROMPT: &str = "You drive a Planner/Worker/QA workflow. Reply with a single JSON object and nothing else.";

pub struct OpenAiProvider {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: &str,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry,
        }
    }

    /// Reads the API key from `cfg.api_key_env` when set.
    pub fn from_config(transport: Arc<dyn Transport>, cfg: &ProviderConfig, retry: RetryPolicy) -> Self {
        let api_key = cfg.api_key_env.as_deref().and_then(|name| match env::var(name) {
            Ok(key) if !key.trim().is_empty() => Some(key),
            _ => {
                warn!(env = name, "api key environment variable is not set");
                None
            }
        });
        Self::new(transport, &cfg.endpoint, api_key, retry)
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.api_key
            .iter()
            .map(|key| ("Authorization".to_string(), format!("Bearer {key}")))
            .collect()
    }

    /// Chat completions body. `context_window` is not sent: the dialect has
    /// no context size field, strict servers reject unknown fields, and
    /// `max_tokens` would cap the reply instead.
    fn request_body(prompt: &str, model: &ModelConfig) -> Value {
        json!({
            "model": model.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": model.temperature,
            "response_format": {"type": "json_object"},
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip_all, fields(model = %model.model, prompt_bytes = prompt.len()))]
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> GenerateResult {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = Self::request_body(prompt, model);
        let headers = self.headers();
        let transport = &self.transport;
        let (url, body, headers) = (url.as_str(), &body, headers.as_slice());

        let response = self
            .retry
            .run("openai chat", move |timeout| {
                transport.post_json(url, headers, body, timeout)
            })
            .await?;

        let has_content = response
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.pointer("/message/content"))
            .and_then(Value::as_str)
            .is_some();
        if !has_content {
            return Err(ProviderError::InvalidResponse(
                "chat completion has no message content".to_string(),
            ));
        }
        Ok(response.to_string())
    }

    async fn test_connection(&self) -> Result<ConnectionReport, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let body = self
            .transport
            .get_json(&url, &self.headers(), self.retry.first_timeout())
            .await?;
        let models = model_names(&body, "data", "id");
        if models.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "endpoint reported no models".to_string(),
            ));
        }
        Ok(ConnectionReport {
            backend: self.name().to_string(),
            endpoint: self.base_url.clone(),
            models,
        })
    }
}
