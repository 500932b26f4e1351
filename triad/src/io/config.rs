//! Triad configuration stored in `triad.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "triad.toml";

/// Triad configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to values that work against a local
/// Ollama install.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriadConfig {
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    #[serde(rename = "loop")]
    pub run_loop: LoopConfig,
    pub prompt: PromptConfig,
    pub search: SearchConfig,
    pub store: StoreConfig,
}

/// Which provider backend to talk to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Ollama,
    Openai,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub backend: Backend,
    /// Base URL of the HTTP backend.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key, if the backend needs one.
    pub api_key_env: Option<String>,
    pub temperature: f64,
    /// Context window passed to the model (`num_ctx` for Ollama). The chat
    /// completions API has no such field; those servers size it themselves.
    pub context_window: u32,
    /// Command for the `command` backend; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Command run by `test-connection` for the `command` backend.
    pub probe_command: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            api_key_env: None,
            temperature: 0.2,
            context_window: 8192,
            command: Vec::new(),
            probe_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Per-attempt timeouts; the number of entries is the attempt count.
    pub attempt_timeouts_secs: Vec<u64>,
    /// Linear backoff unit: attempt `n` waits `n * backoff_ms` before retrying.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempt_timeouts_secs: vec![60, 180, 300],
            backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn attempt_timeouts(&self) -> Vec<Duration> {
        self.attempt_timeouts_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Delay before the single outer retry of a failed iteration.
    pub retry_delay_ms: u64,
    /// Stop after planning and wait for a human to approve the plan.
    pub human_guided: bool,
    /// Require one confirmation turn before honouring a completion report.
    pub confirm_completion: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            retry_delay_ms: 1_500,
            human_guided: false,
            confirm_completion: true,
        }
    }
}

impl LoopConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Byte budget for the rendered prompt.
    pub budget_bytes: usize,
    /// Most recent run log entries embedded in the prompt.
    pub run_log_limit: usize,
    /// Iterations between context reminders.
    pub reminder_every: u32,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 60_000,
            run_log_limit: 200,
            reminder_every: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    pub max_snippets: usize,
    pub timeout_secs: u64,
    pub duckduckgo_url: String,
    pub wikipedia_url: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_snippets: 16,
            timeout_secs: 15,
            duckduckgo_url: "https://api.duckduckgo.com/".to_string(),
            wikipedia_url: "https://en.wikipedia.org/w/api.php".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one subdirectory per run.
    pub runs_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from(".triad").join("runs"),
        }
    }
}

impl TriadConfig {
    pub fn validate(&self) -> Result<()> {
        let provider = &self.provider;
        match provider.backend {
            Backend::Ollama | Backend::Openai => {
                if provider.endpoint.trim().is_empty() {
                    return Err(anyhow!("provider.endpoint must be set for http backends"));
                }
                if provider.model.trim().is_empty() {
                    return Err(anyhow!("provider.model must be set for http backends"));
                }
            }
            Backend::Command => {
                if provider.command.is_empty() || provider.command[0].trim().is_empty() {
                    return Err(anyhow!(
                        "provider.command must be a non-empty array for the command backend"
                    ));
                }
            }
        }
        if !(0.0..=2.0).contains(&provider.temperature) {
            return Err(anyhow!("provider.temperature must be within 0.0..=2.0"));
        }
        if provider.context_window == 0 {
            return Err(anyhow!("provider.context_window must be > 0"));
        }
        if self.retry.attempt_timeouts_secs.is_empty() {
            return Err(anyhow!("retry.attempt_timeouts_secs must not be empty"));
        }
        if self.retry.attempt_timeouts_secs.contains(&0) {
            return Err(anyhow!("retry.attempt_timeouts_secs entries must be > 0"));
        }
        if self.run_loop.max_iterations == 0 {
            return Err(anyhow!("loop.max_iterations must be > 0"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        if self.prompt.run_log_limit == 0 {
            return Err(anyhow!("prompt.run_log_limit must be > 0"));
        }
        if self.prompt.reminder_every == 0 {
            return Err(anyhow!("prompt.reminder_every must be > 0"));
        }
        if self.search.enabled && self.search.max_snippets == 0 {
            return Err(anyhow!("search.max_snippets must be > 0"));
        }
        if self.search.timeout_secs == 0 {
            return Err(anyhow!("search.timeout_secs must be > 0"));
        }
        if self.store.runs_dir.as_os_str().is_empty() {
            return Err(anyhow!("store.runs_dir must be set"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TriadConfig::default()`.
pub fn load_config(path: &Path) -> Result<TriadConfig> {
    if !path.exists() {
        let cfg = TriadConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TriadConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TriadConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
