//! Provider adapter: one [`Provider`] implementation per model backend.
//!
//! HTTP backends share a [`transport::Transport`] and a [`retry::RetryPolicy`]:
//! every attempt gets its own timeout and retryable failures back off linearly.
//! Errors are classified once, here, so callers branch on
//! [`ProviderError::is_retryable`] instead of inspecting messages.

pub mod command;
pub mod ollama;
pub mod openai;
pub mod retry;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::io::config::{Backend, ProviderConfig, TriadConfig};

use self::command::CommandProvider;
use self::ollama::OllamaProvider;
use self::openai::OpenAiProvider;
use self::retry::RetryPolicy;
use self::transport::{ReqwestTransport, Transport};

/// Classified provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn timeout(after: Duration) -> Self {
        ProviderError::Timeout {
            secs: after.as_secs(),
        }
    }

    /// Timeouts, connection failures, 408, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout { .. } | ProviderError::Connection(_) => true,
            ProviderError::Http { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            ProviderError::InvalidResponse(_) => false,
        }
    }
}

/// Result of one generation call: the raw response body.
pub type GenerateResult = Result<String, ProviderError>;

/// Per-call model settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f64,
    pub context_window: u32,
}

impl ModelConfig {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            context_window: cfg.context_window,
        }
    }
}

/// What `test_connection` found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub backend: String,
    pub endpoint: String,
    pub models: Vec<String>,
}

/// A model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Send `prompt` and return the raw response body.
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> GenerateResult;

    /// Succeeds when the backend is reachable and reports at least one model.
    async fn test_connection(&self) -> Result<ConnectionReport, ProviderError>;
}

/// Build the provider selected by `cfg.provider.backend`.
pub fn build_provider(cfg: &TriadConfig) -> Result<Arc<dyn Provider>> {
    let retry = RetryPolicy::from_config(&cfg.retry);
    let provider: Arc<dyn Provider> = match cfg.provider.backend {
        Backend::Ollama => {
            let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
            Arc::new(OllamaProvider::new(transport, &cfg.provider.endpoint, retry))
        }
        Backend::Openai => {
            let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
            Arc::new(OpenAiProvider::from_config(transport, &cfg.provider, retry))
        }
        Backend::Command => Arc::new(CommandProvider::from_config(&cfg.provider, retry)),
    };
    Ok(provider)
}

/// Model names listed in a `{"<list_key>": [{"<name_key>": "..."}]}` body.
pub(crate) fn model_names(body: &serde_json::Value, list_key: &str, name_key: &str) -> Vec<String> {
    body.get(list_key)
        .and_then(serde_json::Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get(name_key).and_then(serde_json::Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::timeout(Duration::from_secs(60)).is_retryable());
        assert!(ProviderError::Connection("refused".into()).is_retryable());
        assert!(ProviderError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(ProviderError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 404, message: String::new() }.is_retryable());
        assert!(!ProviderError::InvalidResponse("bad".into()).is_retryable());
    }

    #[test]
    fn timeout_message_names_the_limit() {
        let err = ProviderError::timeout(Duration::from_secs(180));
        assert_eq!(err.to_string(), "request timed out after 180s");
    }

    #[test]
    fn model_names_reads_listing() {
        let body = serde_json::json!({"models": [{"name": "llama3.1"}, {"size": 1}, {"name": "qwen2.5"}]});
        assert_eq!(model_names(&body, "models", "name"), vec!["llama3.1", "qwen2.5"]);
        assert!(model_names(&serde_json::json!({}), "data", "id").is_empty());
    }

    #[test]
    fn build_provider_selects_backend() {
        let mut cfg = TriadConfig::default();
        assert_eq!(build_provider(&cfg).expect("ollama").name(), "ollama");
        cfg.provider.backend = Backend::Command;
        cfg.provider.command = vec!["cat".to_string()];
        assert_eq!(build_provider(&cfg).expect("command").name(), "command");
    }
}
