//! Multi-iteration loop and the human plan checkpoint.

use std::ops::ControlFlow;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::core::guard::{GuardMemory, complete_at_budget};
use crate::core::types::{Agent, RunStatus};
use crate::io::config::LoopConfig;
use crate::io::run_store::RunRecord;
use crate::step::{IterationOutcome, LoopDeps, run_iteration};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Completed,
    /// Two consecutive turn failures, see the run log for the cause.
    Error,
    NeedsClarification,
    /// Human-guided run waiting for `approve_plan` / `reject_plan`.
    AwaitingApproval,
    /// The `on_iteration` callback asked to stop.
    Cancelled,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub started_at_iteration: u32,
    pub iterations_executed: u32,
    pub stop: LoopStop,
}

/// Run iterations until the run completes, fails or pauses.
///
/// A run whose iteration budget is spent is completed with whatever it has
/// produced, so a running record never comes back exhausted.
///
/// `on_iteration` sees the record after every iteration (the natural place to
/// persist it) and may return `ControlFlow::Break` to stop between iterations.
pub async fn run_loop<F>(
    deps: &LoopDeps,
    record: &mut RunRecord,
    cfg: &LoopConfig,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    F: FnMut(&RunRecord, &IterationOutcome) -> Result<ControlFlow<()>>,
{
    let started_at_iteration = record.state.current_iteration + 1;
    let mut iterations_executed = 0u32;

    let stop = loop {
        if record.state.status == RunStatus::Running
            && !record.awaiting_approval
            && record.state.iterations_exhausted()
        {
            let violation = complete_at_budget(&mut record.state);
            warn!(run_id = %record.id, violation = %violation, "iteration budget spent");
        }
        if let Some(stop) = stop_reason(record) {
            break stop;
        }

        let planning = record.state.state.steps.is_empty();
        let outcome = run_iteration(deps, cfg, record).await?;
        iterations_executed += 1;

        if (cfg.human_guided || record.human_guided)
            && planning
            && !record.state.state.steps.is_empty()
            && record.state.status == RunStatus::Running
        {
            record.awaiting_approval = true;
        }

        if on_iteration(record, &outcome)?.is_break() {
            break stop_reason(record).unwrap_or(LoopStop::Cancelled);
        }
    };

    info!(run_id = %record.id, iterations_executed, stop = ?stop, "loop stopped");
    Ok(LoopOutcome {
        run_id: record.id.clone(),
        started_at_iteration,
        iterations_executed,
        stop,
    })
}

fn stop_reason(record: &RunRecord) -> Option<LoopStop> {
    match record.state.status {
        RunStatus::Completed => return Some(LoopStop::Completed),
        RunStatus::Error => return Some(LoopStop::Error),
        RunStatus::NeedsClarification => return Some(LoopStop::NeedsClarification),
        RunStatus::Running => {}
    }
    record.awaiting_approval.then_some(LoopStop::AwaitingApproval)
}

/// Accept the proposed plan; the next iteration executes step 1.
pub fn approve_plan(record: &mut RunRecord) -> Result<()> {
    if !record.awaiting_approval {
        bail!("run {} is not awaiting plan approval", record.id);
    }
    record.awaiting_approval = false;
    record.state.log(Agent::Planner, "plan approved by the user");
    Ok(())
}

/// Discard the proposed plan; the next iteration plans again.
pub fn reject_plan(record: &mut RunRecord) -> Result<()> {
    if !record.awaiting_approval {
        bail!("run {} is not awaiting plan approval", record.id);
    }
    record.awaiting_approval = false;
    let inner = &mut record.state.state;
    inner.steps.clear();
    inner.initial_plan.clear();
    inner.progress.clear();
    inner.append_note("Planner: plan rejected by the user; plan again");
    record.memory.guard = GuardMemory::default();
    record.state.log(Agent::Planner, "plan rejected by the user");
    Ok(())
}

/// Let a run that stopped for clarification continue.
pub fn resume_after_clarification(record: &mut RunRecord, answer: Option<&str>) -> Result<()> {
    if record.state.status != RunStatus::NeedsClarification {
        bail!("run {} is not waiting for clarification", record.id);
    }
    record.state.status = RunStatus::Running;
    if let Some(answer) = answer.map(str::trim).filter(|a| !a.is_empty()) {
        record.state.state.append_note(&format!("User clarification: {answer}"));
    }
    Ok(())
}
