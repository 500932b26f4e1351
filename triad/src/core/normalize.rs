//! Parse-then-coerce of raw model replies into a typed [`WorkflowState`].
//!
//! The model is asked for a JSON document but routinely wraps it in code fences,
//! surrounds it with prose, or drops fields. Only input with no parsable JSON
//! object is rejected; every field is otherwise coerced to a typed default.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::core::types::{
    Agent, Artifact, InnerState, ResultType, RunLogEntry, RunStatus, WorkflowState,
    prefix_summary,
};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern should compile")
});

/// The reply could not be turned into a JSON object. Retryable by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("reply is empty")]
    Empty,
    #[error("reply contains no JSON object")]
    NoJson,
    #[error("reply JSON is invalid: {0}")]
    InvalidJson(String),
    #[error("reply JSON is not an object")]
    NotAnObject,
}

/// Unwrap a provider envelope to the model's text.
///
/// Accepts `{"response": "..."}` (Ollama generate) and
/// `{"choices":[{"message":{"content":"..."}}]}` (OpenAI chat). Any other body is
/// returned unchanged.
pub fn extract_reply_text(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    if let Some(text) = value.get("response").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(text) = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
    {
        return text.to_string();
    }
    body.to_string()
}

/// Locate the JSON document inside a reply, stripping code fences and prose.
pub fn extract_json_text(reply: &str) -> Result<String, ParseError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }
    let unfenced = FENCE_RE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    if serde_json::from_str::<Value>(unfenced).is_ok() {
        return Ok(unfenced.to_string());
    }
    first_json_object(unfenced)
        .or_else(|| first_json_object(trimmed))
        .ok_or(ParseError::NoJson)
}

/// First balanced `{...}` in `text`, ignoring braces inside strings.
fn first_json_object(text: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' if start.is_some() => in_string = !in_string,
            '{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(p) = start
                {
                    return Some(text[p..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse and coerce a raw reply into a typed state.
///
/// Fields owned by the driver (goal, iteration counters) are coerced like any
/// other field here; reconciling them with the previous state is the job of
/// [`crate::core::state_update::merge_turn`].
pub fn normalize_reply(reply: &str) -> Result<WorkflowState, ParseError> {
    let json_text = extract_json_text(reply)?;
    let value: Value =
        serde_json::from_str(&json_text).map_err(|err| ParseError::InvalidJson(err.to_string()))?;
    let Value::Object(root) = value else {
        return Err(ParseError::NotAnObject);
    };
    let state = coerce_state(&root);
    debug!(
        status = %state.status,
        steps = state.state.steps.len(),
        artifacts = state.state.artifacts.len(),
        log_entries = state.run_log.len(),
        "normalized reply"
    );
    Ok(state)
}

fn coerce_state(root: &Map<String, Value>) -> WorkflowState {
    // Some models flatten the inner record into the root object.
    let inner_obj = match root.get("state") {
        Some(Value::Object(inner)) => inner,
        _ => root,
    };
    let goal = string_field(root, "goal");
    let inner_goal = match string_field(inner_obj, "goal") {
        g if g.is_empty() => goal.clone(),
        g => g,
    };

    WorkflowState {
        goal,
        max_iterations: u32_field(root, "maxIterations"),
        current_iteration: u32_field(root, "currentIteration"),
        status: root
            .get("status")
            .and_then(Value::as_str)
            .and_then(RunStatus::parse)
            .unwrap_or_default(),
        run_log: coerce_run_log(root.get("runLog")),
        state: InnerState {
            goal: inner_goal,
            steps: coerce_string_list(inner_obj.get("steps")),
            initial_plan: coerce_string_list(inner_obj.get("initialPlan")),
            artifacts: coerce_artifacts(inner_obj.get("artifacts")),
            notes: string_field(inner_obj, "notes"),
            progress: string_field(inner_obj, "progress"),
        },
        final_result_markdown: string_field(root, "finalResultMarkdown"),
        final_result_summary: string_field(root, "finalResultSummary"),
        result_type: root
            .get("resultType")
            .and_then(Value::as_str)
            .and_then(ResultType::parse),
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn u32_field(obj: &Map<String, Value>, key: &str) -> u32 {
    match obj.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn coerce_string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => ["description", "step", "title"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn coerce_run_log(value: Option<&Value>) -> Vec<RunLogEntry> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let agent = obj.get("agent").and_then(Value::as_str).and_then(Agent::parse)?;
            let summary = obj.get("summary").and_then(Value::as_str)?.trim();
            if summary.is_empty() {
                return None;
            }
            Some(RunLogEntry {
                iteration: u32_field(obj, "iteration"),
                agent,
                summary: prefix_summary(agent, summary),
            })
        })
        .collect()
}

fn coerce_artifacts(value: Option<&Value>) -> Vec<Artifact> {
    let pairs: Vec<(String, String)> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let key = ["key", "name"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_str))?;
                let value = ["value", "content"].iter().find_map(|k| obj.get(*k))?;
                Some((key.to_string(), value_text(value)))
            })
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| (key.clone(), value_text(value)))
            .collect(),
        _ => Vec::new(),
    };

    let mut artifacts: Vec<Artifact> = Vec::new();
    for (key, value) in pairs {
        let key = key.trim().to_string();
        if key.is_empty() {
            continue;
        }
        match artifacts.iter_mut().find(|a| a.key == key) {
            Some(existing) => existing.value = value,
            None => artifacts.push(Artifact { key, value }),
        }
    }
    artifacts
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let reply = "Here you go:\n```json\n{\"status\": \"running\"}\n```\nthanks";
        assert_eq!(
            extract_json_text(reply).expect("json"),
            "{\"status\": \"running\"}"
        );
    }

    #[test]
    fn extracts_object_from_noisy_text() {
        let reply = "Sure! {\"state\": {\"notes\": \"a } brace\"}} trailing words";
        let text = extract_json_text(reply).expect("json");
        assert_eq!(text, "{\"state\": {\"notes\": \"a } brace\"}}");
    }

    #[test]
    fn rejects_unparsable_reply() {
        assert_eq!(normalize_reply("   "), Err(ParseError::Empty));
        assert_eq!(normalize_reply("no json here"), Err(ParseError::NoJson));
        assert!(matches!(
            normalize_reply("{\"status\": }"),
            Err(ParseError::NoJson | ParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let state = normalize_reply("{}").expect("normalize");
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.state.steps.is_empty());
        assert!(state.state.artifacts.is_empty());
        assert_eq!(state.state.notes, "");
        assert_eq!(state.result_type, None);
    }

    #[test]
    fn wrong_types_are_coerced() {
        let reply = r#"{
            "status": "finished",
            "resultType": "spreadsheet",
            "state": {"steps": "one, two", "artifacts": 3, "notes": 7, "progress": ["step 1"]}
        }"#;
        let state = normalize_reply(reply).expect("normalize");
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.result_type, None);
        assert!(state.state.steps.is_empty());
        assert!(state.state.artifacts.is_empty());
        assert_eq!(state.state.notes, "");
        assert_eq!(state.state.progress, "");
    }

    #[test]
    fn run_log_is_prefixed_and_filtered() {
        let reply = r#"{"runLog": [
            {"iteration": 1, "agent": "Worker", "summary": "wrote intro"},
            {"iteration": 1, "agent": "qa", "summary": "QA: approved"},
            {"iteration": 2, "agent": "Critic", "summary": "unknown role"},
            {"iteration": 2, "agent": "Worker"}
        ]}"#;
        let state = normalize_reply(reply).expect("normalize");
        assert_eq!(state.run_log.len(), 2);
        assert_eq!(state.run_log[0].summary, "Worker: wrote intro");
        assert_eq!(state.run_log[1].agent, Agent::Qa);
        assert_eq!(state.run_log[1].summary, "QA: approved");
    }

    #[test]
    fn artifacts_accept_pairs_and_maps() {
        let pairs = normalize_reply(
            r#"{"state": {"artifacts": [
                {"key": "a.md", "value": "x"},
                {"key": "data.json", "value": {"n": 1}},
                {"key": "a.md", "value": "y"}
            ]}}"#,
        )
        .expect("normalize");
        assert_eq!(pairs.state.artifacts.len(), 2);
        assert_eq!(pairs.state.artifacts[0].value, "y");
        assert_eq!(pairs.state.artifacts[1].value, "{\"n\":1}");

        let map = normalize_reply(r#"{"state": {"artifacts": {"notes.md": "hello"}}}"#)
            .expect("normalize");
        assert_eq!(map.state.artifacts[0].key, "notes.md");
    }

    #[test]
    fn flattened_inner_state_is_accepted() {
        let state = normalize_reply(r#"{"steps": ["a", "b"], "progress": "step 1"}"#)
            .expect("normalize");
        assert_eq!(state.state.steps, vec!["a", "b"]);
        assert_eq!(state.state.progress, "step 1");
    }

    #[test]
    fn unwraps_provider_envelopes() {
        let ollama = r#"{"model": "m", "response": "{\"status\":\"running\"}", "done": true}"#;
        assert_eq!(extract_reply_text(ollama), "{\"status\":\"running\"}");

        let openai = r#"{"choices": [{"message": {"role": "assistant", "content": "{}"}}]}"#;
        assert_eq!(extract_reply_text(openai), "{}");

        assert_eq!(extract_reply_text("plain"), "plain");
    }
}
