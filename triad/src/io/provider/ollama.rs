//! Ollama backend (`/api/generate`, `/api/tags`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use super::retry::RetryPolicy;
use super::transport::Transport;
use super::{ConnectionReport, GenerateResult, ModelConfig, Provider, ProviderError, model_names};

pub struct OllamaProvider {
    transport: Arc<dyn Transport>,
    base_url: String,
    retry: RetryPolicy,
}

impl OllamaProvider {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn request_body(prompt: &str, model: &ModelConfig) -> Value {
        json!({
            "model": model.model,
            "prompt": prompt,
            "format": "json",
            "stream": false,
            "options": {
                "temperature": model.temperature,
                "num_ctx": model.context_window,
            },
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    #[instrument(skip_all, fields(model = %model.model, prompt_bytes = prompt.len()))]
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> GenerateResult {
        let url = format!("{}/api/generate", self.base_url);
        let body = Self::request_body(prompt, model);
        let transport = &self.transport;
        let (url, body) = (url.as_str(), &body);

        let response = self
            .retry
            .run("ollama generate", move |timeout| {
                transport.post_json(url, &[], body, timeout)
            })
            .await?;

        if response.get("response").and_then(Value::as_str).is_none() {
            return Err(ProviderError::InvalidResponse(
                "ollama reply has no `response` field".to_string(),
            ));
        }
        Ok(response.to_string())
    }

    async fn test_connection(&self) -> Result<ConnectionReport, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let body = self
            .transport
            .get_json(&url, &[], self.retry.first_timeout())
            .await?;
        let models = model_names(&body, "models", "name");
        if models.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "ollama reported no models; pull one with `ollama pull <model>`".to_string(),
            ));
        }
        Ok(ConnectionReport {
            backend: self.name().to_string(),
            endpoint: self.base_url.clone(),
            models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    fn model() -> ModelConfig {
        ModelConfig {
            model: "llama3.1".to_string(),
            temperature: 0.2,
            context_window: 4096,
        }
    }

    /// The request carries the JSON format flag and model options.
    #[tokio::test]
    async fn generate_posts_json_request() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_post(Ok(json!({"response": "{\"status\":\"running\"}"})));
        let provider = OllamaProvider::new(transport.clone(), "http://ollama:11434/", RetryPolicy::default());

        let body = provider.generate("plan it", &model()).await.expect("generate");
        assert!(body.contains("running"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://ollama:11434/api/generate");
        let sent = calls[0].body.as_ref().expect("post body");
        assert_eq!(sent["format"], "json");
        assert_eq!(sent["prompt"], "plan it");
        assert_eq!(sent["options"]["num_ctx"], 4096);
    }

    /// Replies without a `response` field are rejected.
    #[tokio::test]
    async fn generate_rejects_unexpected_body() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_post(Ok(json!({"done": true})));
        let provider = OllamaProvider::new(transport, "http://ollama:11434", RetryPolicy::default());
        let err = provider.generate("x", &model()).await.expect_err("invalid");
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    /// Connection tests list models from `/api/tags`.
    #[tokio::test]
    async fn test_connection_lists_models() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_get(Ok(json!({"models": [{"name": "llama3.1"}]})));
        transport.push_get(Ok(json!({"models": []})));
        let provider = OllamaProvider::new(transport.clone(), "http://ollama:11434", RetryPolicy::default());

        let report = provider.test_connection().await.expect("reachable");
        assert_eq!(report.models, vec!["llama3.1"]);
        assert_eq!(transport.calls()[0].url, "http://ollama:11434/api/tags");

        assert!(provider.test_connection().await.is_err());
    }
}
