//! Run persistence with schema + invariant validation.
//!
//! Each run lives in its own directory, `<runs_dir>/<id>/`, holding
//! `run.json` (the [`RunRecord`]) and the per-iteration logs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::core::invariants::validate_invariants;
use crate::core::types::{RunMemory, RunStatus, WorkflowState};

const WORKFLOW_STATE_SCHEMA: &str = include_str!("../../schemas/workflow_state.schema.json");
const RUN_FILE: &str = "run.json";

pub type RunId = String;

/// Everything persisted for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    #[serde(default)]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Knowledge text fed to the prompt and to retrieval.
    #[serde(default)]
    pub knowledge: Option<String>,
    /// Pause after planning for a human to approve the plan.
    #[serde(default)]
    pub human_guided: bool,
    /// Set after planning in human-guided mode until the plan is approved.
    #[serde(default)]
    pub awaiting_approval: bool,
    #[serde(default)]
    pub memory: RunMemory,
    pub state: WorkflowState,
}

/// One line of `list_runs` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub goal: String,
    pub status: RunStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
}

impl From<&RunRecord> for RunSummary {
    fn from(record: &RunRecord) -> Self {
        Self {
            id: record.id.clone(),
            owner: record.owner.clone(),
            created_at: record.created_at,
            goal: record.state.goal.clone(),
            status: record.state.status,
            current_iteration: record.state.current_iteration,
            max_iterations: record.state.max_iterations,
        }
    }
}

pub trait RunStore {
    /// Create a fresh run in the planning phase.
    fn create_run(&self, goal: &str, max_iterations: u32, owner: Option<&str>) -> Result<RunId>;
    fn load_run(&self, id: &str) -> Result<RunRecord>;
    /// Replace the workflow state of an existing run.
    fn save_run(&self, id: &str, state: &WorkflowState) -> Result<()>;
    /// Replace the whole record, bookkeeping included.
    fn save_record(&self, record: &RunRecord) -> Result<()>;
    /// Runs owned by `owner` (all runs when `None`), oldest first.
    fn list_runs(&self, owner: Option<&str>) -> Result<Vec<RunSummary>>;
}

/// Stores runs as JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `run.json` and the iteration logs of run `id`.
    pub fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn run_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            bail!("invalid run id '{id}'");
        }
        Ok(self.run_dir(id).join(RUN_FILE))
    }
}

impl RunStore for FileRunStore {
    fn create_run(&self, goal: &str, max_iterations: u32, owner: Option<&str>) -> Result<RunId> {
        let goal = goal.trim();
        if goal.is_empty() {
            bail!("goal must not be empty");
        }
        if max_iterations == 0 {
            bail!("max_iterations must be > 0");
        }
        let record = RunRecord {
            id: Uuid::new_v4().to_string(),
            owner: owner.map(str::to_string),
            created_at: Utc::now(),
            knowledge: None,
            human_guided: false,
            awaiting_approval: false,
            memory: RunMemory::default(),
            state: WorkflowState::new(goal, max_iterations),
        };
        self.save_record(&record)?;
        debug!(run_id = %record.id, "run created");
        Ok(record.id)
    }

    fn load_run(&self, id: &str) -> Result<RunRecord> {
        let path = self.run_path(id)?;
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read run {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse run {}", path.display()))?;
        let state_value = value
            .get("state")
            .ok_or_else(|| anyhow!("run {} has no state", path.display()))?;
        validate_schema(state_value)?;
        let record: RunRecord = serde_json::from_value(value)
            .with_context(|| format!("deserialize run {}", path.display()))?;
        if record.id != id {
            bail!("run file {} carries id '{}'", path.display(), record.id);
        }
        validate_state_invariants(&record.state)?;
        Ok(record)
    }

    fn save_run(&self, id: &str, state: &WorkflowState) -> Result<()> {
        let mut record = self.load_run(id)?;
        record.state = state.clone();
        self.save_record(&record)
    }

    fn save_record(&self, record: &RunRecord) -> Result<()> {
        let path = self.run_path(&record.id)?;
        debug!(
            run_id = %record.id,
            status = %record.state.status,
            iteration = record.state.current_iteration,
            "writing run"
        );
        let mut buf = serde_json::to_string_pretty(record)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    fn list_runs(&self, owner: Option<&str>) -> Result<Vec<RunSummary>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("read runs dir {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(RUN_FILE).is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let record = self.load_run(&id)?;
            if owner.is_none() || record.owner.as_deref() == owner {
                runs.push(RunSummary::from(&record));
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }
}

fn validate_schema(state: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(WORKFLOW_STATE_SCHEMA).context("parse state schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(state) {
        let messages = compiled
            .iter_errors(state)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "run state schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_state_invariants(state: &WorkflowState) -> Result<()> {
    let errors = validate_invariants(state);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("run state invariants failed: {}", errors.join("; ")))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run {}", path.display()))?;
    Ok(())
}
