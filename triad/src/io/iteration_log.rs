//! Iteration logging under `<runs_dir>/<run>/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::guard::GuardReport;
use crate::core::types::WorkflowState;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iteration: u32,
    /// Provider calls made by the loop for this iteration (1 or 2).
    pub attempts: u32,
    pub phase: String,
    pub status: String,
    pub step: usize,
    pub tool_notes: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub reply_path: PathBuf,
    pub guard_path: PathBuf,
    pub state_before_path: PathBuf,
    pub state_after_path: PathBuf,
}

impl IterationPaths {
    pub fn new(run_dir: &Path, iteration: u32) -> Self {
        let dir = run_dir.join("iterations").join(iteration.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            reply_path: dir.join("reply.txt"),
            guard_path: dir.join("guard.json"),
            state_before_path: dir.join("state.before.json"),
            state_after_path: dir.join("state.after.json"),
        }
    }
}

pub struct IterationWriteRequest<'a> {
    pub run_dir: &'a Path,
    pub meta: &'a IterationMeta,
    pub prompt: Option<&'a str>,
    pub reply: Option<&'a str>,
    pub guard: Option<&'a GuardReport>,
    pub state_before: &'a WorkflowState,
    pub state_after: &'a WorkflowState,
}

pub fn write_iteration(request: &IterationWriteRequest<'_>) -> Result<IterationPaths> {
    let paths = IterationPaths::new(request.run_dir, request.meta.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.meta_path, request.meta)?;
    if let Some(prompt) = request.prompt {
        write_text(&paths.prompt_path, prompt)?;
    }
    if let Some(reply) = request.reply {
        write_text(&paths.reply_path, reply)?;
    }
    if let Some(guard) = request.guard {
        write_json(&paths.guard_path, guard)?;
    }
    write_json(&paths.state_before_path, request.state_before)?;
    write_json(&paths.state_after_path, request.state_after)?;

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
