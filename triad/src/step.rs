//! Orchestration for a single workflow iteration.
//!
//! One iteration is: build the prompt, call the provider, normalize the reply,
//! run tool requests, apply the step guard and record the result. Provider and
//! parse failures get one retry; a second consecutive failure ends the run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::guard::{GuardContext, GuardReport, apply_guard, complete_at_budget};
use crate::core::normalize::{ParseError, extract_reply_text, normalize_reply};
use crate::core::progress::{current_step, phase_of};
use crate::core::state_update::merge_turn;
use crate::core::types::{Agent, Phase, RunMemory, RunStatus, WorkflowState};
use crate::io::config::{LoopConfig, TriadConfig};
use crate::io::iteration_log::{IterationMeta, IterationWriteRequest, write_iteration};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::provider::{ModelConfig, Provider, ProviderError};
use crate::io::run_store::RunRecord;
use crate::io::search::SearchProvider;
use crate::tools::{ToolExecutor, ToolReport};

/// Provider calls per iteration before the run is failed.
pub const TURN_ATTEMPTS: u32 = 2;

/// Why a single provider turn produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Consecutive turn failures; the run ends with `status = error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("iteration {iteration} failed after {attempts} attempts: {cause}")]
pub struct RunFatalError {
    pub iteration: u32,
    pub attempts: u32,
    #[source]
    pub cause: TurnError,
}

/// Shared collaborators for every iteration of a run.
pub struct LoopDeps {
    pub provider: Arc<dyn Provider>,
    pub model: ModelConfig,
    pub tools: ToolExecutor,
    pub prompt: PromptBuilder,
    /// Run log entries embedded in prompts outside human-guided mode.
    pub run_log_limit: usize,
    /// Root for iteration logs (`<runs_dir>/<run>/iterations/`); `None` disables them.
    pub runs_dir: Option<PathBuf>,
}

impl LoopDeps {
    pub fn from_config(
        cfg: &TriadConfig,
        provider: Arc<dyn Provider>,
        search: Option<Arc<dyn SearchProvider>>,
    ) -> Self {
        let search = search.filter(|_| cfg.search.enabled);
        Self {
            provider,
            model: ModelConfig::from_config(&cfg.provider),
            tools: ToolExecutor::new(search, cfg.search.max_snippets),
            prompt: PromptBuilder::from_config(&cfg.prompt),
            run_log_limit: cfg.prompt.run_log_limit,
            runs_dir: Some(PathBuf::from(&cfg.store.runs_dir)),
        }
    }
}

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub iteration: u32,
    /// Provider calls made (1, or 2 after a retry).
    pub attempts: u32,
    pub phase: Phase,
    pub status: RunStatus,
    /// `None` when the iteration failed.
    pub guard: Option<GuardReport>,
    pub tools: ToolReport,
    pub fatal: Option<RunFatalError>,
    /// First completion report held back for confirmation.
    pub completion_held: bool,
}

struct Turn {
    reply: String,
    parsed: WorkflowState,
}

/// Execute one iteration against `record`, updating its state and memory.
///
/// Returns `Err` only for local failures (prompt rendering, iteration logs);
/// provider and parse failures are folded into the outcome.
#[instrument(skip_all, fields(run_id = %record.id, iteration = record.state.current_iteration + 1))]
pub async fn run_iteration(
    deps: &LoopDeps,
    cfg: &LoopConfig,
    record: &mut RunRecord,
) -> Result<IterationOutcome> {
    let started_at = Utc::now();
    let clock = Instant::now();
    let before = record.state.clone();
    let iteration = before.current_iteration + 1;

    let run_log_limit = if cfg.human_guided || record.human_guided {
        before.max_iterations as usize
    } else {
        deps.run_log_limit
    };
    let prompt = deps.prompt.build(&PromptInputs {
        state: &before,
        knowledge: record.knowledge.as_deref(),
        run_log_limit,
    })?;

    let mut attempts = 0;
    let turn = loop {
        attempts += 1;
        match request_turn(deps, prompt.as_str()).await {
            Ok(turn) => break Ok(turn),
            Err(err) if attempts < TURN_ATTEMPTS => {
                warn!(attempt = attempts, err = %err, "turn failed; retrying");
                tokio::time::sleep(cfg.retry_delay()).await;
            }
            Err(err) => break Err(err),
        }
    };

    let mut completion_held = false;
    let (reply, guard, tools, fatal) = match turn {
        Ok(turn) => {
            let mut next = merge_turn(&before, turn.parsed, iteration);
            if next.status == RunStatus::Error {
                next.status = RunStatus::Running;
                next.state
                    .append_note("QA: error status from the model ignored; continuing");
            }
            let tools = deps.tools.execute(&mut next, record.knowledge.as_deref()).await;
            let mut report = apply_guard(
                &GuardContext {
                    prev: &before,
                    memory: &record.memory.guard,
                },
                &mut next,
            );
            for violation in &report.violations {
                warn!(violation = %violation, "protocol violation corrected");
            }
            completion_held = hold_first_completion(cfg, &before, &mut next, &mut record.memory);
            if next.status == RunStatus::Running && next.iterations_exhausted() {
                let violation = complete_at_budget(&mut next);
                warn!(violation = %violation, "iteration budget spent");
                report.violations.push(violation);
            }
            record.memory.guard = report.memory.clone();
            record.state = next;
            (Some(turn.reply), Some(report), tools, None)
        }
        Err(cause) => {
            let fatal = RunFatalError {
                iteration,
                attempts,
                cause,
            };
            warn!(err = %fatal, "run failed");
            fail_run(&mut record.state, iteration, &fatal.cause);
            (None, None, ToolReport::default(), Some(fatal))
        }
    };

    let phase = phase_of(&record.state, false);
    info!(phase = %phase, status = %record.state.status, attempts, "iteration finished");

    if let Some(runs_dir) = &deps.runs_dir {
        let meta = IterationMeta {
            run_id: record.id.clone(),
            iteration,
            attempts,
            phase: phase.to_string(),
            status: record.state.status.to_string(),
            step: current_step(&record.state),
            tool_notes: tools.notes(),
            error: fatal.as_ref().map(|f| f.cause.to_string()),
            started_at: Some(started_at.to_rfc3339()),
            ended_at: Some(Utc::now().to_rfc3339()),
            duration_ms: Some(clock.elapsed().as_millis() as u64),
        };
        write_iteration(&IterationWriteRequest {
            run_dir: &runs_dir.join(&record.id),
            meta: &meta,
            prompt: Some(prompt.as_str()),
            reply: reply.as_deref(),
            guard: guard.as_ref(),
            state_before: &before,
            state_after: &record.state,
        })?;
    }

    Ok(IterationOutcome {
        iteration,
        attempts,
        phase,
        status: record.state.status,
        guard,
        tools,
        fatal,
        completion_held,
    })
}

async fn request_turn(deps: &LoopDeps, prompt: &str) -> Result<Turn, TurnError> {
    let body = deps.provider.generate(prompt, &deps.model).await?;
    let reply = extract_reply_text(&body);
    let parsed = normalize_reply(&reply)?;
    Ok(Turn { reply, parsed })
}

/// Hold back the first completion reported on arrival at the final step.
///
/// The next turn then runs on the final step, where the guard completes the
/// run unless the model asks for clarification.
fn hold_first_completion(
    cfg: &LoopConfig,
    before: &WorkflowState,
    next: &mut WorkflowState,
    memory: &mut RunMemory,
) -> bool {
    let held = cfg.confirm_completion
        && next.status == RunStatus::Completed
        && memory.completion_reports == 0
        && current_step(before) < next.state.steps.len()
        && !next.iterations_exhausted();
    if held {
        next.status = RunStatus::Running;
        next.state
            .append_note("QA: completion reported; confirming on the next turn");
        memory.completion_reports += 1;
    }
    held
}

fn fail_run(state: &mut WorkflowState, iteration: u32, cause: &TurnError) {
    let text = format!("Workflow error: {cause}");
    state.current_iteration = iteration;
    state.status = RunStatus::Error;
    state.log(Agent::Qa, &text);
    state.state.append_note(&text);
}
