//! Inline tool calls requested through reserved artifacts.
//!
//! A turn asks for a tool by writing `rag_query` or `internet_query`. The
//! executor consumes the request, stores the answer under `rag_results` or
//! `internet_results` and records the outcome in the notes and run log.
//! Failures become result text; nothing here ends a run.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::retrieval::retrieve;
use crate::core::types::{
    Agent, INTERNET_QUERY_KEY, INTERNET_RESULTS_KEY, RAG_QUERY_KEY, RAG_RESULTS_KEY,
    WorkflowState,
};
use crate::io::search::{SearchProvider, format_snippets};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolExecutionError {
    #[error("{0} is empty")]
    EmptyQuery(&'static str),
    #[error("internet search is disabled")]
    SearchDisabled,
    #[error("{0}")]
    SearchFailed(String),
}

/// One consumed tool request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub query_key: &'static str,
    pub query: String,
    pub hits: usize,
    pub error: Option<ToolExecutionError>,
}

impl ToolCall {
    /// Human-readable outcome used for notes and the run log.
    pub fn describe(&self) -> String {
        match &self.error {
            Some(err) => format!("{} failed: {err}", self.query_key),
            None => format!(
                "{} \"{}\" returned {} result(s)",
                self.query_key, self.query, self.hits
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolReport {
    pub calls: Vec<ToolCall>,
}

impl ToolReport {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn notes(&self) -> Vec<String> {
        self.calls.iter().map(ToolCall::describe).collect()
    }
}

pub struct ToolExecutor {
    search: Option<Arc<dyn SearchProvider>>,
    max_snippets: usize,
}

impl ToolExecutor {
    pub fn new(search: Option<Arc<dyn SearchProvider>>, max_snippets: usize) -> Self {
        Self {
            search,
            max_snippets,
        }
    }

    /// Executor without internet search; retrieval still works.
    pub fn offline() -> Self {
        Self::new(None, 0)
    }

    /// Handle at most one retrieval and one internet request in `state`.
    #[instrument(skip_all, fields(iteration = state.current_iteration))]
    pub async fn execute(&self, state: &mut WorkflowState, knowledge: Option<&str>) -> ToolReport {
        let mut report = ToolReport::default();

        if let Some(request) = state.state.remove_artifact(RAG_QUERY_KEY) {
            let query = request.value.trim().to_string();
            let call = if query.is_empty() {
                replace_results(state, RAG_RESULTS_KEY, "Retrieval failed: empty query".to_string());
                ToolCall {
                    query_key: RAG_QUERY_KEY,
                    query,
                    hits: 0,
                    error: Some(ToolExecutionError::EmptyQuery(RAG_QUERY_KEY)),
                }
            } else {
                let (hits, text) = retrieve(&state.state, knowledge, &query);
                replace_results(state, RAG_RESULTS_KEY, text);
                ToolCall {
                    query_key: RAG_QUERY_KEY,
                    query,
                    hits,
                    error: None,
                }
            };
            record(state, &call);
            report.calls.push(call);
        }

        if let Some(request) = state.state.remove_artifact(INTERNET_QUERY_KEY) {
            let query = request.value.trim().to_string();
            let call = match self.internet(&query).await {
                Ok((hits, text)) => {
                    replace_results(state, INTERNET_RESULTS_KEY, text);
                    ToolCall {
                        query_key: INTERNET_QUERY_KEY,
                        query,
                        hits,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(err = %err, "internet search failed");
                    replace_results(
                        state,
                        INTERNET_RESULTS_KEY,
                        format!("Internet search failed: {err}"),
                    );
                    ToolCall {
                        query_key: INTERNET_QUERY_KEY,
                        query,
                        hits: 0,
                        error: Some(err),
                    }
                }
            };
            record(state, &call);
            report.calls.push(call);
        }

        debug!(calls = report.calls.len(), "tools executed");
        report
    }

    async fn internet(&self, query: &str) -> Result<(usize, String), ToolExecutionError> {
        if query.is_empty() {
            return Err(ToolExecutionError::EmptyQuery(INTERNET_QUERY_KEY));
        }
        let search = self
            .search
            .as_ref()
            .ok_or(ToolExecutionError::SearchDisabled)?;
        let mut snippets = search
            .search(query)
            .await
            .map_err(|err| ToolExecutionError::SearchFailed(format!("{err:#}")))?;
        snippets.truncate(self.max_snippets);
        if snippets.is_empty() {
            return Ok((0, format!("No internet results found for: {query}")));
        }
        Ok((snippets.len(), format_snippets(&snippets)))
    }
}

/// Drop any previous results and append the new ones at the end.
fn replace_results(state: &mut WorkflowState, key: &str, text: String) {
    state.state.remove_artifact(key);
    state.state.upsert_artifact(key, text);
}

fn record(state: &mut WorkflowState, call: &ToolCall) {
    let text = call.describe();
    state.state.append_note(&text);
    state.log(Agent::Worker, &format!("Tool {text}"));
}
