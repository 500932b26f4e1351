//! Prompt pack builder for one workflow turn.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::core::guard::{MAX_PLAN_STEPS, MIN_PLAN_STEPS};
use crate::core::progress::phase_of;
use crate::core::types::WorkflowState;
use crate::io::config::PromptConfig;

const TURN_TEMPLATE: &str = include_str!("prompts/turn.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section pattern should compile")
});

/// Fields the model must not see before it has produced them.
const HIDDEN_FIELDS: [&str; 3] = ["finalResultMarkdown", "finalResultSummary", "resultType"];

#[derive(Debug, Clone, Serialize)]
struct ReminderContext {
    goal: String,
    plan: Vec<String>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("turn", TURN_TEMPLATE)
            .expect("turn template should be valid");
        Self { env }
    }

    fn render_turn(&self, input: &PromptInputs<'_>, reminder: Option<ReminderContext>) -> Result<String> {
        let state = input.state;
        let template = self.env.get_template("turn")?;
        let rendered = template.render(context! {
            goal => state.goal.trim(),
            iteration => state.current_iteration + 1,
            max_iterations => state.max_iterations,
            phase => phase_of(state, false).to_string(),
            min_steps => MIN_PLAN_STEPS,
            max_steps => MAX_PLAN_STEPS,
            reminder => reminder,
            knowledge => input.knowledge.map(str::trim).filter(|s| !s.is_empty()),
            state_json => embedded_state_json(state, input.run_log_limit)?,
        })?;
        Ok(rendered)
    }
}

/// Serialize the state the model sees: final fields removed, run log cut to
/// the most recent `run_log_limit` entries.
fn embedded_state_json(state: &WorkflowState, run_log_limit: usize) -> Result<String> {
    let mut value = serde_json::to_value(state)?;
    if let Value::Object(root) = &mut value {
        for field in HIDDEN_FIELDS {
            root.remove(field);
        }
        if let Some(Value::Array(log)) = root.get_mut("runLog") {
            let excess = log.len().saturating_sub(run_log_limit);
            log.drain(..excess);
        }
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, body_start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(_, _, next_start, _)| *next_start);
        let content = rendered[*body_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: knowledge -> reminder. The last section is truncated if the
/// required sections alone exceed the budget.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["knowledge", "reminder"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other_len: usize = rest.iter().map(|s| s.content.len()).sum();
    let allowed = budget.saturating_sub(other_len);
    if last.content.len() > allowed {
        let before_len = last.content.len();
        let marker = "\n[truncated]";
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
        last.content.truncate(keep);
        if allowed > marker.len() {
            last.content.push_str(marker);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// All inputs needed to build a prompt pack.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub state: &'a WorkflowState,
    /// Knowledge text supplied when the run was started.
    pub knowledge: Option<&'a str>,
    /// Run log entries to embed (most recent first to go).
    pub run_log_limit: usize,
}

/// Builds a prompt pack within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    reminder_every: u32,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, reminder_every: u32) -> Self {
        Self {
            budget_bytes,
            reminder_every,
        }
    }

    pub fn from_config(cfg: &PromptConfig) -> Self {
        Self::new(cfg.budget_bytes, cfg.reminder_every)
    }

    /// True when the turn about to run should carry the context reminder.
    pub fn wants_reminder(&self, state: &WorkflowState) -> bool {
        let upcoming = state.current_iteration + 1;
        self.reminder_every > 0
            && !state.state.initial_plan.is_empty()
            && upcoming % self.reminder_every == 0
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<PromptPack> {
        let reminder = self.wants_reminder(input.state).then(|| ReminderContext {
            goal: input.state.goal.clone(),
            plan: input.state.state.initial_plan.clone(),
        });
        let rendered = PromptEngine::new().render_turn(input, reminder)?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);

        Ok(PromptPack {
            content: render_sections(&sections),
        })
    }
}

/// A rendered prompt ready to send to the provider.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Agent, ResultType};

    fn planned_state(iterations_done: u32) -> WorkflowState {
        let mut state = WorkflowState::new("write a field guide to crabs", 20);
        let plan: Vec<String> = (1..=5).map(|i| format!("part {i}")).collect();
        state.state.steps = plan.clone();
        state.state.initial_plan = plan;
        state.state.progress = "step 2".to_string();
        state.current_iteration = iterations_done;
        state
    }

    fn build(state: &WorkflowState, knowledge: Option<&str>, budget: usize) -> String {
        PromptBuilder::new(budget, 5)
            .build(&PromptInputs {
                state,
                knowledge,
                run_log_limit: 200,
            })
            .expect("render")
            .render()
    }

    /// Sections render as contract -> goal -> reminder -> knowledge -> state.
    #[test]
    fn prompt_ordering_is_stable() {
        let state = planned_state(4);
        let content = build(&state, Some("crabs have ten legs"), 100_000);

        let contract = content.find("<contract>").expect("contract");
        let goal = content.find("<goal>").expect("goal");
        let reminder = content.find("<reminder>").expect("reminder");
        let knowledge = content.find("<knowledge>").expect("knowledge");
        let state_pos = content.find("<state>").expect("state");
        assert!(contract < goal);
        assert!(goal < reminder);
        assert!(reminder < knowledge);
        assert!(knowledge < state_pos);
        assert!(!content.contains("section:"), "markers are stripped");
    }

    /// The reminder appears only every fifth turn and only once a plan exists.
    #[test]
    fn reminder_follows_cadence() {
        let builder = PromptBuilder::new(100_000, 5);
        assert!(builder.wants_reminder(&planned_state(4)));
        assert!(!builder.wants_reminder(&planned_state(5)));
        assert!(builder.wants_reminder(&planned_state(9)));

        let mut unplanned = planned_state(4);
        unplanned.state.initial_plan.clear();
        assert!(!builder.wants_reminder(&unplanned));
    }

    /// Final result fields are hidden and the run log is cut to the limit.
    #[test]
    fn embedded_state_hides_final_fields() {
        let mut state = planned_state(3);
        state.final_result_markdown = "SECRET-MARKDOWN".to_string();
        state.final_result_summary = "SECRET-SUMMARY".to_string();
        state.result_type = Some(ResultType::Text);
        for i in 1..=6 {
            state.run_log.push(crate::core::types::RunLogEntry::new(
                i,
                Agent::Worker,
                &format!("entry-{i}"),
            ));
        }

        let json = embedded_state_json(&state, 2).expect("json");
        assert!(!json.contains("SECRET"));
        assert!(!json.contains("resultType"));
        assert!(!json.contains("entry-4"));
        assert!(json.contains("entry-5"));
        assert!(json.contains("entry-6"));
    }

    /// Over budget, knowledge goes before the reminder and required sections stay.
    #[test]
    fn budget_drops_knowledge_first() {
        let state = planned_state(4);
        let knowledge = "shell ".repeat(2_000);
        let full = build(&state, Some(&knowledge), 1_000_000);
        let without_knowledge = full.len() - knowledge.trim().len();

        let content = build(&state, Some(&knowledge), without_knowledge);
        assert!(!content.contains("<knowledge>"));
        assert!(content.contains("<reminder>"));
        assert!(content.contains("<contract>"));
        assert!(content.contains("<state>"));
    }

    /// When required sections alone exceed the budget the state is truncated.
    #[test]
    fn tight_budget_truncates_last_section() {
        let state = planned_state(1);
        let budget = build(&state, None, 1_000_000).len() - 100;
        let content = build(&state, None, budget);
        // Section joins are not counted against the budget.
        assert!(content.len() <= budget + 8);
        assert!(content.ends_with("[truncated]"));
        assert!(content.contains("<contract>"));
    }
}
