//! Test-only fakes for providers, transports and search, plus state builders.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::types::WorkflowState;
use crate::io::provider::transport::Transport;
use crate::io::provider::{ConnectionReport, GenerateResult, ModelConfig, Provider, ProviderError};
use crate::io::search::{SearchProvider, Snippet};

/// One request seen by [`FakeTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportCall {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// `None` for GET requests.
    pub body: Option<Value>,
}

type Reply = Result<Value, ProviderError>;

/// Scripted [`Transport`]: FIFO queues for POST and GET plus sticky GET routes.
#[derive(Default)]
pub struct FakeTransport {
    posts: Mutex<VecDeque<Reply>>,
    gets: Mutex<VecDeque<Reply>>,
    routes: Mutex<Vec<(String, Reply)>>,
    calls: Mutex<Vec<TransportCall>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_post(&self, reply: Reply) {
        lock(&self.posts).push_back(reply);
    }

    pub fn push_get(&self, reply: Reply) {
        lock(&self.gets).push_back(reply);
    }

    /// Answer every GET whose URL starts with `prefix`, before the queue is consulted.
    pub fn route_get(&self, prefix: &str, reply: Reply) {
        lock(&self.routes).push((prefix.to_string(), reply));
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, url: &str, headers: &[(String, String)], body: Option<&Value>) {
        lock(&self.calls).push(TransportCall {
            url: url.to_string(),
            headers: headers.to_vec(),
            body: body.cloned(),
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn unscripted() -> Reply {
    Err(ProviderError::Connection("no scripted response".to_string()))
}

#[async_trait]
impl Transport for FakeTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        _timeout: Duration,
    ) -> Result<Value, ProviderError> {
        self.record(url, headers, Some(body));
        lock(&self.posts).pop_front().unwrap_or_else(unscripted)
    }

    async fn get_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<Value, ProviderError> {
        self.record(url, headers, None);
        let routed = lock(&self.routes)
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        match routed {
            Some(reply) => reply,
            None => lock(&self.gets).pop_front().unwrap_or_else(unscripted),
        }
    }
}

/// [`Provider`] that replays queued results and records every prompt.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<GenerateResult>>,
    /// Returned once the queue is empty; unscripted calls fail otherwise.
    fallback: Mutex<Option<GenerateResult>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: impl IntoIterator<Item = GenerateResult>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Provider whose every call fails with `err`.
    pub fn failing(err: ProviderError) -> Self {
        let provider = Self::default();
        *lock(&provider.fallback) = Some(Err(err));
        provider
    }

    pub fn push(&self, reply: GenerateResult) {
        lock(&self.replies).push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _model: &ModelConfig) -> GenerateResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());
        if let Some(reply) = lock(&self.replies).pop_front() {
            return reply;
        }
        lock(&self.fallback)
            .clone()
            .unwrap_or_else(|| Err(ProviderError::Connection("script exhausted".to_string())))
    }

    async fn test_connection(&self) -> Result<ConnectionReport, ProviderError> {
        Ok(ConnectionReport {
            backend: "scripted".to_string(),
            endpoint: "memory".to_string(),
            models: vec!["scripted".to_string()],
        })
    }
}

/// [`SearchProvider`] with a fixed answer that records queries.
pub struct FakeSearch {
    result: Result<Vec<Snippet>, String>,
    queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn returning(snippets: Vec<Snippet>) -> Self {
        Self {
            result: Ok(snippets),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<Snippet>> {
        lock(&self.queries).push(query.to_string());
        self.result.clone().map_err(|reason| anyhow!(reason))
    }
}

/// Model reply builder producing the JSON document a turn returns.
#[derive(Debug, Clone)]
pub struct TurnReply {
    value: Value,
}

impl TurnReply {
    pub fn new(status: &str) -> Self {
        Self {
            value: json!({
                "status": status,
                "runLog": [],
                "state": {"steps": [], "initialPlan": [], "artifacts": [], "notes": "", "progress": ""},
            }),
        }
    }

    /// Set both `steps` and `initialPlan`.
    pub fn plan(mut self, steps: &[&str]) -> Self {
        self.value["state"]["steps"] = json!(steps);
        self.value["state"]["initialPlan"] = json!(steps);
        self
    }

    pub fn progress(mut self, progress: &str) -> Self {
        self.value["state"]["progress"] = json!(progress);
        self
    }

    pub fn artifact(mut self, key: &str, value: &str) -> Self {
        if let Some(artifacts) = self.value["state"]["artifacts"].as_array_mut() {
            artifacts.push(json!({"key": key, "value": value}));
        }
        self
    }

    pub fn log(mut self, agent: &str, summary: &str) -> Self {
        if let Some(log) = self.value["runLog"].as_array_mut() {
            log.push(json!({"iteration": 0, "agent": agent, "summary": summary}));
        }
        self
    }

    pub fn json(&self) -> String {
        self.value.to_string()
    }

    /// The reply wrapped in an Ollama `/api/generate` envelope.
    pub fn ollama_body(&self) -> String {
        json!({"response": self.json()}).to_string()
    }
}

/// A state that finished planning `total` steps and sits on `step`.
pub fn planned_state(goal: &str, total: usize, step: usize) -> WorkflowState {
    let mut state = WorkflowState::new(goal, 20);
    let steps: Vec<String> = (1..=total).map(|i| format!("part {i}")).collect();
    state.state.steps = steps.clone();
    state.state.initial_plan = steps;
    state.state.progress = format!("step {step}");
    state.current_iteration = step as u32;
    state
}
