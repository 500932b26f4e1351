//! Step and finality guard.
//!
//! Runs after every model turn and rewrites the turn into a compliant state:
//! the plan stays fixed once made, progress only moves forward one step at a
//! time, every non-final step leaves a new artifact behind, QA rework is
//! bounded and a completed run always carries a deliverable and a summary.
//!
//! Each correction is recorded as a [`ProtocolViolation`]. Applying the guard a
//! second time with the same [`GuardContext`] leaves the state unchanged.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::assembly::{
    README_KEY, SUMMARY_KEY, content_artifacts, derive_summary, find_deliverable,
    infer_result_type, synthesize_readme, truncate_chars, SUMMARY_MAX_CHARS,
};
use crate::core::immutability::check_plan_immutability;
use crate::core::progress::{current_step, parse_step, progress_for, step_number};
use crate::core::types::{Agent, RunLogEntry, RunStatus, WorkflowState, prefix_summary};

/// Longest plan accepted from the Planner.
pub const MAX_PLAN_STEPS: usize = 20;
/// Shortest plan the Planner is asked for. Shorter plans are kept but reported.
pub const MIN_PLAN_STEPS: usize = 5;
/// QA rework requests allowed per non-final step.
pub const MAX_REWORKS_PER_STEP: u32 = 1;

/// Marks run log entries written by the guard itself.
const CORRECTION_TAG: &str = "[guard]";

/// Guard bookkeeping carried between iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardMemory {
    /// Highest step number ever accepted.
    pub high_water: usize,
    /// Content artifact keys present when the high-water step was entered.
    pub step_entry_keys: BTreeSet<String>,
    /// QA rework requests seen on the high-water step.
    pub reworks_on_step: u32,
    /// `README.md` was written by the guard and not touched by the model since.
    pub readme_synthesized: bool,
}

/// What the guard compares a turn against.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub prev: &'a WorkflowState,
    pub memory: &'a GuardMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolViolation {
    #[error("plan edited after planning: {detail}")]
    PlanEdited { detail: String },
    #[error("plan has {len} steps; truncated to {max}")]
    PlanTooLong { len: usize, max: usize },
    #[error("plan has only {len} steps")]
    PlanTooShort { len: usize },
    #[error("progress moved back from step {from} to step {to}")]
    BackwardStep { from: usize, to: usize },
    #[error("progress skipped from step {from} to step {to}")]
    StepSkipped { from: usize, to: usize },
    #[error("step {step} produced no new artifact")]
    MissingArtifact { step: usize },
    #[error("rework limit reached on step {step}")]
    ReworkLimit { step: usize },
    #[error("completion reported on step {step} of {total}")]
    PrematureCompletion { step: usize, total: usize },
    #[error("README synthesized from {sections} artifacts")]
    ReadmeSynthesized { sections: usize },
    #[error("QA entry after the final step relabelled as Worker")]
    QaAfterFinalStep,
    #[error("iteration budget spent on step {step} of {total}; completed as is")]
    BudgetExhausted { step: usize, total: usize },
}

/// Outcome of one guard pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardReport {
    /// Accepted step number (0 while planning).
    pub step: usize,
    pub violations: Vec<ProtocolViolation>,
    /// Memory to carry into the next iteration.
    pub memory: GuardMemory,
}

impl GuardReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Rewrite `next` so it complies with the step protocol relative to `ctx`.
pub fn apply_guard(ctx: &GuardContext<'_>, next: &mut WorkflowState) -> GuardReport {
    let prev = ctx.prev;
    let prev_step = current_step(prev);
    let turn_start = prev.run_log.len().min(next.run_log.len());
    let mut violations = Vec::new();
    let mut corrections = Vec::new();

    enforce_plan(prev, next, prev_step, &mut violations);

    let total = next.state.steps.len();
    if total == 0 {
        if next.status == RunStatus::Completed {
            next.status = RunStatus::Running;
            violations.push(ProtocolViolation::PrematureCompletion { step: 0, total: 0 });
        }
        return GuardReport {
            step: 0,
            violations,
            memory: ctx.memory.clone(),
        };
    }

    let high = ctx.memory.high_water.max(prev_step).min(total);
    let entry_keys = if ctx.memory.high_water == high && high > 0 {
        ctx.memory.step_entry_keys.clone()
    } else {
        prev.state.content_keys()
    };
    let new_keys: Vec<String> = next
        .state
        .content_keys()
        .difference(&entry_keys)
        .cloned()
        .collect();

    let proposed = step_number(&next.state.progress, total, prev_step.max(1));
    let mut target = proposed.max(1);
    let regressed = proposed < high;
    if regressed {
        target = (high + 1).min(total);
        violations.push(ProtocolViolation::BackwardStep {
            from: high,
            to: proposed,
        });
    } else if proposed > high + 1 {
        target = high + 1;
        violations.push(ProtocolViolation::StepSkipped {
            from: high,
            to: proposed,
        });
    }

    let leaves_non_final = target > high && (1..total).contains(&high);
    if leaves_non_final && new_keys.is_empty() {
        violations.push(ProtocolViolation::MissingArtifact { step: high });
        next.state.append_note(&format!(
            "QA: step {high} needs at least one new artifact before moving on"
        ));
        target = high;
        if next.status == RunStatus::Completed {
            next.status = RunStatus::Running;
        }
    }

    let mut rework = false;
    let qa_last = next.run_log[turn_start..]
        .last()
        .is_some_and(|entry| entry.agent == Agent::Qa);
    if proposed == high && qa_last && (1..total).contains(&high) {
        if ctx.memory.reworks_on_step >= MAX_REWORKS_PER_STEP && !new_keys.is_empty() {
            target = high + 1;
            violations.push(ProtocolViolation::ReworkLimit { step: high });
            next.state.append_note(&format!(
                "QA: rework limit reached on step {high}; moving on to step {target}"
            ));
        } else {
            rework = true;
        }
    }

    if parse_step(&next.state.progress) != Some(target) {
        next.state.progress = progress_for(target, &next.state.steps);
    }
    if regressed {
        corrections.push(format!(
            "progress regressed from step {high} to step {proposed}; resuming at step {target}"
        ));
    }

    let readme_untouched = prev.state.artifact(README_KEY).map(|a| &a.value)
        == next.state.artifact(README_KEY).map(|a| &a.value);
    let mut readme_synthesized = ctx.memory.readme_synthesized && readme_untouched;
    if target + 1 >= total {
        if find_deliverable(&next.state).is_none() {
            let sections = content_artifacts(&next.state).len();
            let readme = synthesize_readme(&next.goal, &next.state);
            next.state.upsert_artifact(README_KEY, readme);
            violations.push(ProtocolViolation::ReadmeSynthesized { sections });
            readme_synthesized = true;
        } else if readme_synthesized {
            // Refresh a guard-written README so it covers later artifacts.
            let readme = synthesize_readme(&next.goal, &next.state);
            next.state.upsert_artifact(README_KEY, readme);
        }
    }

    let is_final = target == total;
    if next.status == RunStatus::Completed && !is_final {
        next.status = RunStatus::Running;
        violations.push(ProtocolViolation::PrematureCompletion {
            step: target,
            total,
        });
    }
    let completes = is_final
        && (next.status == RunStatus::Completed
            || (prev_step == total && next.status == RunStatus::Running));
    if completes {
        finalize(next);
        if relabel_trailing_qa(&mut next.run_log[turn_start..]) {
            violations.push(ProtocolViolation::QaAfterFinalStep);
        }
    }

    for text in corrections {
        let entry = RunLogEntry::new(
            next.current_iteration,
            Agent::Qa,
            &format!("{CORRECTION_TAG} {text}"),
        );
        next.run_log.push(entry);
        next.state.append_note(&text);
    }

    let memory = if target > high {
        GuardMemory {
            high_water: target,
            step_entry_keys: next.state.content_keys(),
            reworks_on_step: 0,
            readme_synthesized,
        }
    } else {
        GuardMemory {
            high_water: high,
            step_entry_keys: entry_keys,
            reworks_on_step: ctx.memory.reworks_on_step + u32::from(rework),
            readme_synthesized,
        }
    };

    GuardReport {
        step: target,
        violations,
        memory,
    }
}

fn enforce_plan(
    prev: &WorkflowState,
    next: &mut WorkflowState,
    prev_step: usize,
    violations: &mut Vec<ProtocolViolation>,
) {
    if prev.state.initial_plan.is_empty() {
        let len = next.state.steps.len();
        if len > MAX_PLAN_STEPS {
            next.state.steps.truncate(MAX_PLAN_STEPS);
            violations.push(ProtocolViolation::PlanTooLong {
                len,
                max: MAX_PLAN_STEPS,
            });
        } else if (1..MIN_PLAN_STEPS).contains(&len) {
            violations.push(ProtocolViolation::PlanTooShort { len });
        }
        next.state.initial_plan = next.state.steps.clone();
        return;
    }

    // An omitted plan is an echo gap, not an edit.
    if next.state.initial_plan.is_empty() {
        next.state.initial_plan = prev.state.initial_plan.clone();
    }
    if next.state.steps.is_empty() {
        next.state.steps = prev.state.steps.clone();
    }

    let errors = check_plan_immutability(&prev.state, &next.state, prev_step);
    if errors.is_empty() {
        return;
    }
    next.state.initial_plan = prev.state.initial_plan.clone();
    if !check_plan_immutability(&prev.state, &next.state, prev_step).is_empty() {
        next.state.steps = prev.state.steps.clone();
    }
    violations.push(ProtocolViolation::PlanEdited {
        detail: errors.join("; "),
    });
}

/// Accept whatever the run has produced once its iteration budget is spent.
///
/// Builds the README when no deliverable exists, then finalizes as on the
/// last step. Returns the violation to record alongside the guard report.
pub fn complete_at_budget(next: &mut WorkflowState) -> ProtocolViolation {
    let step = current_step(next);
    let total = next.state.steps.len();
    if find_deliverable(&next.state).is_none() {
        let readme = synthesize_readme(&next.goal, &next.state);
        next.state.upsert_artifact(README_KEY, readme);
    }
    next.state.append_note(&format!(
        "QA: iteration budget of {} spent on step {step} of {total}; accepting the result as is",
        next.max_iterations
    ));
    finalize(next);
    ProtocolViolation::BudgetExhausted { step, total }
}

fn finalize(next: &mut WorkflowState) {
    let markdown = match find_deliverable(&next.state) {
        Some(artifact) if !artifact.value.trim().is_empty() => artifact.value.clone(),
        _ => synthesize_readme(&next.goal, &next.state),
    };
    let mut summary = derive_summary(&markdown);
    if summary.is_empty() {
        summary = truncate_chars(&next.goal, SUMMARY_MAX_CHARS);
    }
    next.state.upsert_artifact(SUMMARY_KEY, summary.clone());
    next.final_result_markdown = markdown;
    next.final_result_summary = summary;
    if next.result_type.is_none() {
        next.result_type = Some(infer_result_type(&next.state));
    }
    next.status = RunStatus::Completed;
}

fn relabel_trailing_qa(turn: &mut [RunLogEntry]) -> bool {
    let Some(entry) = turn.last_mut() else {
        return false;
    };
    if entry.agent != Agent::Qa || entry.summary.contains(CORRECTION_TAG) {
        return false;
    }
    let text = entry
        .summary
        .strip_prefix("QA:")
        .unwrap_or(&entry.summary)
        .to_string();
    entry.agent = Agent::Worker;
    entry.summary = prefix_summary(Agent::Worker, &text);
    true
}
