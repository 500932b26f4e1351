//! Driver-owned state transitions applied to each model turn.

use crate::core::types::{Agent, Artifact, RunLogEntry, WorkflowState};

/// Reconcile a normalized model turn with the previous accepted state.
///
/// This enforces driver ownership of `goal`, `maxIterations`,
/// `currentIteration` and the persisted run log: the model only ever sees a
/// truncated log, so its copy is never trusted. Entries the model added this
/// turn (a later iteration number, or an entry not already recorded) are
/// appended, stamped with `iteration`. If the model added none, a
/// placeholder entry is appended so every iteration leaves an audit trail.
///
/// Artifacts are never lost: keys the model left out of its echo keep their
/// previous value and position, and new keys follow in reply order. Empty
/// notes are treated the same way.
pub fn merge_turn(prev: &WorkflowState, mut next: WorkflowState, iteration: u32) -> WorkflowState {
    next.goal = prev.goal.clone();
    next.state.goal = prev.goal.clone();
    next.max_iterations = prev.max_iterations;
    next.current_iteration = iteration;
    next.state.artifacts = merge_artifacts(&prev.state.artifacts, next.state.artifacts);
    if next.state.notes.trim().is_empty() {
        next.state.notes = prev.state.notes.clone();
    }

    let mut added: Vec<RunLogEntry> = next
        .run_log
        .iter()
        .filter(|entry| {
            entry.iteration > prev.current_iteration || !contains_entry(&prev.run_log, entry)
        })
        .map(|entry| RunLogEntry {
            iteration,
            agent: entry.agent,
            summary: entry.summary.clone(),
        })
        .collect();
    dedup_in_order(&mut added);

    if added.is_empty() {
        let agent = default_agent(prev);
        added.push(RunLogEntry::new(
            iteration,
            agent,
            "turn completed without a summary",
        ));
    }

    let mut run_log = prev.run_log.clone();
    run_log.extend(added);
    next.run_log = run_log;
    next
}

/// The role expected to act next given the previous state.
pub fn default_agent(prev: &WorkflowState) -> Agent {
    if prev.state.steps.is_empty() {
        Agent::Planner
    } else {
        Agent::Worker
    }
}

fn merge_artifacts(prev: &[Artifact], next: Vec<Artifact>) -> Vec<Artifact> {
    let mut merged: Vec<Artifact> = prev.to_vec();
    for artifact in next {
        match merged.iter_mut().find(|a| a.key == artifact.key) {
            Some(existing) => existing.value = artifact.value,
            None => merged.push(artifact),
        }
    }
    merged
}

fn contains_entry(log: &[RunLogEntry], entry: &RunLogEntry) -> bool {
    log.iter()
        .any(|existing| existing.agent == entry.agent && existing.summary == entry.summary)
}

fn dedup_in_order(entries: &mut Vec<RunLogEntry>) {
    let mut seen: Vec<(Agent, String)> = Vec::new();
    entries.retain(|entry| {
        let key = (entry.agent, entry.summary.clone());
        if seen.contains(&key) {
            return false;
        }
        seen.push(key);
        true
    });
}
