//! JSON-over-HTTP transport shared by the HTTP backends and web search.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use super::ProviderError;

/// Longest error body echoed back in [`ProviderError::Http`].
const ERROR_BODY_CHARS: usize = 200;

/// Minimal JSON transport. Each call carries its own timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError>;

    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value, ProviderError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("triad/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    async fn send(&self, request: RequestBuilder, timeout: Duration) -> Result<Value, ProviderError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(&e, timeout))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| classify(&e, timeout))?;
        debug!(status = status.as_u16(), bytes = text.len(), "http response");

        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: sanitize_body(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, timeout).await
    }

    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        self.send(request, timeout).await
    }
}

fn classify(err: &reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(timeout)
    } else if err.is_connect() {
        ProviderError::Connection(format!("failed to connect: {err}"))
    } else if err.is_decode() || err.is_body() {
        ProviderError::InvalidResponse(err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

/// Short, single-line excerpt of an error body. Prefers a JSON `error` field.
fn sanitize_body(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| match v.get("error") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(obj)) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .unwrap_or_else(|| body.to_string());
    let single_line = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= ERROR_BODY_CHARS {
        return single_line;
    }
    let cut: String = single_line.chars().take(ERROR_BODY_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_prefers_json_error_field() {
        assert_eq!(sanitize_body(r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(
            sanitize_body(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
    }

    #[test]
    fn sanitize_collapses_and_bounds_plain_bodies() {
        assert_eq!(sanitize_body("bad\n\n gateway"), "bad gateway");
        let long = "x".repeat(500);
        assert_eq!(sanitize_body(&long).chars().count(), ERROR_BODY_CHARS + 1);
    }
}
