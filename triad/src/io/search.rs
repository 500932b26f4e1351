//! Internet search for `internet_query` tool calls.
//!
//! [`WebSearch`] asks two keyless public APIs, the DuckDuckGo Instant Answer
//! API and Wikipedia's search API, and merges what comes back. One source
//! failing is tolerated; the call fails only when every source fails.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::io::config::SearchConfig;
use crate::io::provider::transport::Transport;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern should compile"));

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub source: String,
    pub text: String,
}

impl Snippet {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Search for `query`. An empty result is not an error.
    async fn search(&self, query: &str) -> Result<Vec<Snippet>>;
}

/// Render snippets as `- [source] text` lines.
pub fn format_snippets(snippets: &[Snippet]) -> String {
    snippets
        .iter()
        .map(|s| format!("- [{}] {}", s.source, s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// DuckDuckGo + Wikipedia aggregate search.
pub struct WebSearch {
    transport: Arc<dyn Transport>,
    config: SearchConfig,
}

impl WebSearch {
    pub fn new(transport: Arc<dyn Transport>, config: SearchConfig) -> Self {
        Self { transport, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn duckduckgo(&self, query: &str) -> Result<Vec<Snippet>> {
        let url = format!(
            "{}?q={}&format=json&no_html=1&skip_disambig=1",
            self.config.duckduckgo_url,
            urlencoding::encode(query)
        );
        let body = self
            .transport
            .get_json(&url, &[], self.timeout())
            .await
            .map_err(|e| anyhow!("duckduckgo: {e}"))?;
        Ok(parse_duckduckgo(&body))
    }

    async fn wikipedia(&self, query: &str) -> Result<Vec<Snippet>> {
        let url = format!(
            "{}?action=query&list=search&format=json&srlimit=8&srsearch={}",
            self.config.wikipedia_url,
            urlencoding::encode(query)
        );
        let body = self
            .transport
            .get_json(&url, &[], self.timeout())
            .await
            .map_err(|e| anyhow!("wikipedia: {e}"))?;
        Ok(parse_wikipedia(&body))
    }
}

#[async_trait]
impl SearchProvider for WebSearch {
    #[instrument(skip_all, fields(query = %query))]
    async fn search(&self, query: &str) -> Result<Vec<Snippet>> {
        let (ddg, wiki) = tokio::join!(self.duckduckgo(query), self.wikipedia(query));

        let mut snippets = Vec::new();
        let mut errors = Vec::new();
        for result in [ddg, wiki] {
            match result {
                Ok(found) => snippets.extend(found),
                Err(err) => {
                    warn!(err = %err, "search source failed");
                    errors.push(err.to_string());
                }
            }
        }
        if snippets.is_empty() && errors.len() == 2 {
            return Err(anyhow!(errors.join("; ")));
        }
        snippets.truncate(self.config.max_snippets);
        debug!(count = snippets.len(), "search finished");
        Ok(snippets)
    }
}

fn parse_duckduckgo(body: &Value) -> Vec<Snippet> {
    let mut out = Vec::new();
    let source = body
        .get("AbstractSource")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("DuckDuckGo");
    for key in ["Answer", "AbstractText", "Definition"] {
        if let Some(text) = body.get(key).and_then(Value::as_str)
            && !text.trim().is_empty()
        {
            out.push(Snippet::new(source, clean_text(text)));
        }
    }
    if let Some(topics) = body.get("RelatedTopics").and_then(Value::as_array) {
        collect_topics(topics, &mut out);
    }
    out
}

fn collect_topics(topics: &[Value], out: &mut Vec<Snippet>) {
    for topic in topics {
        if let Some(text) = topic.get("Text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                out.push(Snippet::new("DuckDuckGo", clean_text(text)));
            }
        } else if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            collect_topics(nested, out);
        }
    }
}

fn parse_wikipedia(body: &Value) -> Vec<Snippet> {
    body.pointer("/query/search")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let title = hit.get("title").and_then(Value::as_str)?;
                    let snippet = hit.get("snippet").and_then(Value::as_str).unwrap_or_default();
                    let text = clean_text(snippet);
                    let text = if text.is_empty() {
                        title.to_string()
                    } else {
                        format!("{title}: {text}")
                    };
                    Some(Snippet::new("Wikipedia", text))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Strip HTML tags and the common entities, collapsing whitespace.
fn clean_text(raw: &str) -> String {
    let stripped = TAG_RE.replace_all(raw, "");
    let unescaped = stripped
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    unescaped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::io::provider::ProviderError;
    use crate::test_support::FakeTransport;

    fn search_with(transport: Arc<FakeTransport>, max_snippets: usize) -> WebSearch {
        let config = SearchConfig {
            max_snippets,
            duckduckgo_url: "https://ddg.test/".to_string(),
            wikipedia_url: "https://wiki.test/api.php".to_string(),
            ..SearchConfig::default()
        };
        WebSearch::new(transport, config)
    }

    #[test]
    fn duckduckgo_reads_abstract_and_nested_topics() {
        let body = json!({
            "AbstractText": "Rust is a systems language.",
            "AbstractSource": "Wikipedia",
            "RelatedTopics": [
                {"Text": "Cargo - the Rust package manager"},
                {"Name": "Tools", "Topics": [{"Text": "rustup - toolchain installer"}]}
            ]
        });
        let snippets = parse_duckduckgo(&body);
        assert_eq!(snippets.len(), 3);
        assert_eq!(snippets[0], Snippet::new("Wikipedia", "Rust is a systems language."));
        assert_eq!(snippets[2].text, "rustup - toolchain installer");
    }

    #[test]
    fn wikipedia_strips_markup() {
        let body = json!({"query": {"search": [
            {"title": "Ferris", "snippet": "the <span class=\"searchmatch\">crab</span> &amp; mascot"}
        ]}});
        assert_eq!(
            parse_wikipedia(&body),
            vec![Snippet::new("Wikipedia", "Ferris: the crab & mascot")]
        );
    }

    #[test]
    fn format_uses_source_prefix() {
        let text = format_snippets(&[Snippet::new("Wikipedia", "a"), Snippet::new("DuckDuckGo", "b")]);
        assert_eq!(text, "- [Wikipedia] a\n- [DuckDuckGo] b");
    }

    /// One failing source is tolerated and results are capped.
    #[tokio::test]
    async fn tolerates_one_failed_source_and_caps() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_get(
            "https://ddg.test/",
            Err(ProviderError::Connection("refused".into())),
        );
        let hits: Vec<Value> = (0..20)
            .map(|i| json!({"title": format!("T{i}"), "snippet": ""}))
            .collect();
        transport.route_get("https://wiki.test/", Ok(json!({"query": {"search": hits}})));

        let snippets = search_with(transport, 16).search("crab").await.expect("search");
        assert_eq!(snippets.len(), 16);
        assert!(snippets.iter().all(|s| s.source == "Wikipedia"));
    }

    /// Both sources failing is an error carrying both reasons.
    #[tokio::test]
    async fn fails_when_every_source_fails() {
        let transport = Arc::new(FakeTransport::new());
        let err = search_with(transport, 16)
            .search("crab")
            .await
            .expect_err("no sources");
        let message = err.to_string();
        assert!(message.contains("duckduckgo"));
        assert!(message.contains("wikipedia"));
    }
}
