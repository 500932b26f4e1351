//! Step number derivation from the free-form `progress` field.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Phase, RunStatus, WorkflowState};

static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)step\s*(\d+)").expect("step pattern should compile"));

/// Parse the 1-based step number out of a progress string, if any.
pub fn parse_step(progress: &str) -> Option<usize> {
    STEP_RE
        .captures(progress)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
}

/// Derive the current step number for a state.
///
/// - No plan yet: 0 (still planning).
/// - Progress without a step marker: `fallback` (the previously accepted step).
/// - Otherwise the parsed number, clamped to the plan length.
pub fn step_number(progress: &str, total_steps: usize, fallback: usize) -> usize {
    if total_steps == 0 {
        return 0;
    }
    match parse_step(progress) {
        Some(step) => step.min(total_steps),
        None => fallback.min(total_steps),
    }
}

/// Step number of an already-accepted state.
pub fn current_step(state: &WorkflowState) -> usize {
    step_number(&state.state.progress, state.state.steps.len(), 0)
}

/// Canonical progress text for a step.
pub fn progress_for(step: usize, steps: &[String]) -> String {
    match step.checked_sub(1).and_then(|idx| steps.get(idx)) {
        Some(desc) => format!("step {step}: {desc}"),
        None => format!("step {step}"),
    }
}

/// Map a state to its coarse phase.
pub fn phase_of(state: &WorkflowState, awaiting_approval: bool) -> Phase {
    match state.status {
        RunStatus::Completed => return Phase::Completed,
        RunStatus::Error => return Phase::Error,
        RunStatus::NeedsClarification => return Phase::NeedsClarification,
        RunStatus::Running => {}
    }
    let total = state.state.steps.len();
    if total == 0 {
        return Phase::Planning;
    }
    if awaiting_approval {
        return Phase::AwaitingApproval;
    }
    Phase::Executing {
        step: current_step(state),
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_step_is_case_insensitive() {
        assert_eq!(parse_step("Step 3: write tests"), Some(3));
        assert_eq!(parse_step("working on STEP 12"), Some(12));
        assert_eq!(parse_step("step2 done"), Some(2));
        assert_eq!(parse_step("planning complete"), None);
    }

    #[test]
    fn step_number_is_zero_while_planning() {
        assert_eq!(step_number("step 4", 0, 2), 0);
    }

    #[test]
    fn step_number_falls_back_and_clamps() {
        assert_eq!(step_number("reviewing", 5, 2), 2);
        assert_eq!(step_number("step 9", 3, 1), 3);
    }

    #[test]
    fn progress_for_includes_description() {
        let steps = vec!["gather".to_string(), "write".to_string()];
        assert_eq!(progress_for(2, &steps), "step 2: write");
        assert_eq!(progress_for(3, &steps), "step 3");
    }

    #[test]
    fn phase_reports_executing_step() {
        let mut state = WorkflowState::new("goal", 5);
        assert_eq!(phase_of(&state, false), Phase::Planning);
        state.state.steps = vec!["a".to_string(), "b".to_string()];
        state.state.progress = "step 2".to_string();
        assert_eq!(phase_of(&state, true), Phase::AwaitingApproval);
        assert_eq!(phase_of(&state, false), Phase::Executing { step: 2, total: 2 });
    }
}
