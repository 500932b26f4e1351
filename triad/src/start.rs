//! Orchestration for starting a new run.
//!
//! A "run" is one goal worked on by the Planner, Worker and QA roles, identified
//! by a stable run id. Starting a run creates the record in the store and
//! attaches the optional knowledge text; nothing is sent to the model yet.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::io::run_store::{RunRecord, RunStore};

/// Input of `triad run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub goal: String,
    pub max_iterations: u32,
    pub owner: Option<String>,
    /// Pause after planning until the plan is approved.
    pub human_guided: bool,
    /// Plain text file used as reference material for prompts and retrieval.
    pub knowledge_path: Option<PathBuf>,
}

/// Create a run for `req` and return its persisted record.
pub fn start_run(store: &dyn RunStore, req: &StartRequest) -> Result<RunRecord> {
    let knowledge = match &req.knowledge_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("read knowledge file {}", path.display()))?;
            if text.trim().is_empty() {
                bail!("knowledge file {} is empty", path.display());
            }
            debug!(path = %path.display(), bytes = text.len(), "knowledge loaded");
            Some(text)
        }
        None => None,
    };

    let id = store
        .create_run(&req.goal, req.max_iterations, req.owner.as_deref())
        .context("create run")?;
    let mut record = store.load_run(&id)?;
    if knowledge.is_some() || req.human_guided {
        record.knowledge = knowledge;
        record.human_guided = req.human_guided;
        store.save_record(&record)?;
    }

    info!(run_id = %record.id, max_iterations = req.max_iterations, "run started");
    Ok(record)
}
