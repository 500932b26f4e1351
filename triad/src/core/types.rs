//! Workflow state record shared by every stage of the loop.
//!
//! These types define stable contracts between core components. They do not
//! depend on external state or I/O. Serialized keys follow the camelCase JSON
//! contract the model reads and writes.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::guard::GuardMemory;

/// Reserved artifact key for a retrieval request.
pub const RAG_QUERY_KEY: &str = "rag_query";
/// Reserved artifact key for retrieval results.
pub const RAG_RESULTS_KEY: &str = "rag_results";
/// Reserved artifact key for an internet search request.
pub const INTERNET_QUERY_KEY: &str = "internet_query";
/// Reserved artifact key for internet search results.
pub const INTERNET_RESULTS_KEY: &str = "internet_results";

/// Separator used when accumulating `notes`.
pub const NOTE_SEPARATOR: &str = " | ";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    NeedsClarification,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::NeedsClarification => "needs_clarification",
            RunStatus::Error => "error",
        }
    }

    /// Parse a model-reported status. Unknown values yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "needs_clarification" => Some(RunStatus::NeedsClarification),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    /// `completed` and `error` end a run; `needs_clarification` only pauses it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role that authored a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Agent {
    Planner,
    Worker,
    #[serde(rename = "QA")]
    Qa,
}

impl Agent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agent::Planner => "Planner",
            Agent::Worker => "Worker",
            Agent::Qa => "QA",
        }
    }

    /// Case-insensitive parse of an agent label.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "planner" => Some(Agent::Planner),
            "worker" => Some(Agent::Worker),
            "qa" => Some(Agent::Qa),
            _ => None,
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of deliverable produced by a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Code,
    Text,
    Table,
}

impl ResultType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "code" => Some(ResultType::Code),
            "text" => Some(ResultType::Text),
            "table" => Some(ResultType::Table),
            _ => None,
        }
    }
}

/// One audit entry in the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub iteration: u32,
    pub agent: Agent,
    pub summary: String,
}

impl RunLogEntry {
    /// Build an entry whose summary carries the `"<Agent>: "` prefix.
    pub fn new(iteration: u32, agent: Agent, text: &str) -> Self {
        Self {
            iteration,
            agent,
            summary: prefix_summary(agent, text),
        }
    }
}

/// Prefix `text` with `"<Agent>: "` unless it already carries that prefix.
pub fn prefix_summary(agent: Agent, text: &str) -> String {
    let text = text.trim();
    let prefix = format!("{}:", agent.as_str());
    if let Some(head) = text.get(..prefix.len())
        && head.eq_ignore_ascii_case(&prefix)
    {
        let rest = text[prefix.len()..].trim_start();
        return format!("{prefix} {rest}");
    }
    format!("{prefix} {text}")
}

/// A named string blob produced during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: String,
    pub value: String,
}

impl Artifact {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// True for the reserved tool request/response keys.
pub fn is_tool_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("rag_") || key.starts_with("internet_")
}

/// Model-visible inner state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InnerState {
    pub goal: String,
    pub steps: Vec<String>,
    pub initial_plan: Vec<String>,
    pub artifacts: Vec<Artifact>,
    pub notes: String,
    pub progress: String,
}

impl InnerState {
    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.key == key)
    }

    /// Insert or replace an artifact, keeping the original position on replace.
    pub fn upsert_artifact(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.artifacts.iter_mut().find(|a| a.key == key) {
            Some(existing) => existing.value = value,
            None => self.artifacts.push(Artifact::new(key, value)),
        }
    }

    pub fn remove_artifact(&mut self, key: &str) -> Option<Artifact> {
        let idx = self.artifacts.iter().position(|a| a.key == key)?;
        Some(self.artifacts.remove(idx))
    }

    /// Keys of non-tool artifacts.
    pub fn content_keys(&self) -> BTreeSet<String> {
        self.artifacts
            .iter()
            .filter(|a| !is_tool_key(&a.key))
            .map(|a| a.key.clone())
            .collect()
    }

    /// Append to `notes` with the `" | "` separator.
    pub fn append_note(&mut self, note: &str) {
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        if self.notes.trim().is_empty() {
            self.notes = note.to_string();
        } else {
            self.notes.push_str(NOTE_SEPARATOR);
            self.notes.push_str(note);
        }
    }
}

/// The single record threaded through a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub goal: String,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub status: RunStatus,
    pub run_log: Vec<RunLogEntry>,
    pub state: InnerState,
    pub final_result_markdown: String,
    pub final_result_summary: String,
    pub result_type: Option<ResultType>,
}

impl WorkflowState {
    /// Fresh state in the planning phase.
    pub fn new(goal: impl Into<String>, max_iterations: u32) -> Self {
        let goal = goal.into();
        Self {
            goal: goal.clone(),
            max_iterations,
            current_iteration: 0,
            status: RunStatus::Running,
            run_log: Vec::new(),
            state: InnerState {
                goal,
                ..InnerState::default()
            },
            final_result_markdown: String::new(),
            final_result_summary: String::new(),
            result_type: None,
        }
    }

    pub fn log(&mut self, agent: Agent, text: &str) {
        self.run_log
            .push(RunLogEntry::new(self.current_iteration, agent, text));
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.current_iteration >= self.max_iterations
    }
}

/// Driver bookkeeping persisted beside the state of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunMemory {
    pub guard: GuardMemory,
    /// Completion reports held back for confirmation so far.
    pub completion_reports: u32,
}

/// Coarse position of a run in the Planner → Worker/QA state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    /// Planned, waiting for a human to approve the step list.
    AwaitingApproval,
    Executing {
        step: usize,
        total: usize,
    },
    Completed,
    NeedsClarification,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Planning => f.write_str("planning"),
            Phase::AwaitingApproval => f.write_str("awaiting approval"),
            Phase::Executing { step, total } => write!(f, "executing step {step}/{total}"),
            Phase::Completed => f.write_str("completed"),
            Phase::NeedsClarification => f.write_str("needs clarification"),
            Phase::Error => f.write_str("error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_summary_is_not_doubled() {
        assert_eq!(prefix_summary(Agent::Qa, "looks good"), "QA: looks good");
        assert_eq!(prefix_summary(Agent::Qa, "qa:  looks good"), "QA: looks good");
        assert_eq!(
            prefix_summary(Agent::Worker, "Planner: wrote plan"),
            "Worker: Planner: wrote plan"
        );
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut inner = InnerState::default();
        inner.upsert_artifact("a", "1");
        inner.upsert_artifact("b", "2");
        inner.upsert_artifact("a", "3");
        let keys: Vec<&str> = inner.artifacts.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(inner.artifact("a").map(|a| a.value.as_str()), Some("3"));
    }

    #[test]
    fn append_note_joins_with_separator() {
        let mut inner = InnerState::default();
        inner.append_note("first");
        inner.append_note("  ");
        inner.append_note("second");
        assert_eq!(inner.notes, "first | second");
    }

    #[test]
    fn serializes_with_camel_case_contract() {
        let state = WorkflowState::new("goal", 10);
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["maxIterations"], 10);
        assert_eq!(value["status"], "running");
        assert!(value["state"]["initialPlan"].is_array());
        assert!(value["resultType"].is_null());
    }

    #[test]
    fn qa_agent_uses_uppercase_label() {
        let entry = RunLogEntry::new(1, Agent::Qa, "ok");
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["agent"], "QA");
    }
}
