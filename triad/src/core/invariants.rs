//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::assembly::find_deliverable;
use crate::core::progress::parse_step;
use crate::core::types::{RunStatus, WorkflowState};

/// Check semantic invariants of a persisted workflow state:
/// - `maxIterations > 0` and `currentIteration <= maxIterations`
/// - artifact keys are unique
/// - run log iterations never decrease
/// - `initialPlan` is a prefix-compatible snapshot of `steps`
/// - progress never points past the plan
/// - a completed run carries a result type, final markdown, summary and deliverable
pub fn validate_invariants(state: &WorkflowState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.max_iterations == 0 {
        errors.push("maxIterations must be > 0".to_string());
    }
    if state.current_iteration > state.max_iterations {
        errors.push(format!(
            "currentIteration {} exceeds maxIterations {}",
            state.current_iteration, state.max_iterations
        ));
    }
    if state.state.goal != state.goal {
        errors.push("state.goal differs from goal".to_string());
    }

    let mut seen = HashSet::new();
    for artifact in &state.state.artifacts {
        if !seen.insert(artifact.key.as_str()) {
            errors.push(format!("duplicate artifact key '{}'", artifact.key));
        }
    }

    if !state
        .run_log
        .windows(2)
        .all(|pair| pair[0].iteration <= pair[1].iteration)
    {
        errors.push("runLog iterations must be non-decreasing".to_string());
    }

    let steps = &state.state.steps;
    let plan = &state.state.initial_plan;
    if !plan.is_empty() && plan.iter().any(|step| !steps.contains(step)) {
        errors.push("initialPlan contains steps missing from steps".to_string());
    }
    if let Some(step) = parse_step(&state.state.progress)
        && !steps.is_empty()
        && step > steps.len()
    {
        errors.push(format!(
            "progress step {step} exceeds plan length {}",
            steps.len()
        ));
    }

    if state.status == RunStatus::Completed {
        if state.result_type.is_none() {
            errors.push("completed run has no resultType".to_string());
        }
        if state.final_result_markdown.trim().is_empty() {
            errors.push("completed run has empty finalResultMarkdown".to_string());
        }
        if state.final_result_summary.trim().is_empty() {
            errors.push("completed run has empty finalResultSummary".to_string());
        }
        if find_deliverable(&state.state).is_none() {
            errors.push("completed run has no README or result artifact".to_string());
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Agent, ResultType, RunLogEntry};

    /// A fresh run is valid.
    #[test]
    fn fresh_state_is_valid() {
        assert!(validate_invariants(&WorkflowState::new("goal", 5)).is_empty());
    }

    /// Duplicate keys and out-of-order log entries are reported.
    #[test]
    fn reports_duplicates_and_log_order() {
        let mut state = WorkflowState::new("goal", 5);
        state.state.upsert_artifact("a", "1");
        state.state.artifacts.push(crate::core::types::Artifact::new("a", "2"));
        state.run_log.push(RunLogEntry::new(2, Agent::Worker, "later"));
        state.run_log.push(RunLogEntry::new(1, Agent::Qa, "earlier"));

        let errors = validate_invariants(&state);
        assert!(errors.contains(&"duplicate artifact key 'a'".to_string()));
        assert!(errors.contains(&"runLog iterations must be non-decreasing".to_string()));
    }

    /// Completion requires the final result fields.
    #[test]
    fn completed_requires_final_fields() {
        let mut state = WorkflowState::new("goal", 5);
        state.status = RunStatus::Completed;
        assert_eq!(validate_invariants(&state).len(), 4);

        state.result_type = Some(ResultType::Text);
        state.final_result_markdown = "# goal\n\ndone".to_string();
        state.final_result_summary = "done".to_string();
        state.state.upsert_artifact("README.md", "# goal\n\ndone");
        assert!(validate_invariants(&state).is_empty());
    }

    /// Iteration counters are bounded by the budget.
    #[test]
    fn current_iteration_is_bounded() {
        let mut state = WorkflowState::new("goal", 2);
        state.current_iteration = 3;
        assert_eq!(
            validate_invariants(&state),
            vec!["currentIteration 3 exceeds maxIterations 2".to_string()]
        );
    }
}
