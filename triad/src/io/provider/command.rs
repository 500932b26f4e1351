//! Local command backend: the prompt goes to stdin, the reply comes from stdout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::retry::RetryPolicy;
use super::{ConnectionReport, GenerateResult, ModelConfig, Provider, ProviderError};
use crate::io::config::ProviderConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Replies larger than this are truncated.
const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

pub struct CommandProvider {
    command: Vec<String>,
    probe_command: Vec<String>,
    retry: RetryPolicy,
}

impl CommandProvider {
    pub fn new(command: Vec<String>, probe_command: Vec<String>, retry: RetryPolicy) -> Self {
        Self {
            command,
            probe_command,
            retry,
        }
    }

    pub fn from_config(cfg: &ProviderConfig, retry: RetryPolicy) -> Self {
        Self::new(cfg.command.clone(), cfg.probe_command.clone(), retry)
    }

    /// Run `argv` off the async runtime and map the outcome to a [`ProviderError`].
    async fn run(
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let output = tokio::task::spawn_blocking(move || {
            let cmd = command_from_argv(&argv)?;
            run_command_with_timeout(cmd, stdin, timeout, OUTPUT_LIMIT_BYTES)
        })
        .await
        .map_err(|e| ProviderError::Connection(format!("command task failed: {e}")))?
        .map_err(|e| ProviderError::Connection(format!("{e:#}")))?;

        if output.timed_out {
            return Err(ProviderError::timeout(timeout));
        }
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(ProviderError::Connection(format!(
                "command exited with {code}: {}",
                output.stderr_tail()
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(ProviderError::InvalidResponse(format!(
                "command output exceeded {OUTPUT_LIMIT_BYTES} bytes"
            )));
        }
        Ok(output.stdout_text())
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    #[instrument(skip_all, fields(program = ?self.command.first(), prompt_bytes = prompt.len()))]
    async fn generate(&self, prompt: &str, _model: &ModelConfig) -> GenerateResult {
        let stdout = self
            .retry
            .run("command generate", |timeout| {
                Self::run(
                    self.command.clone(),
                    Some(prompt.as_bytes().to_vec()),
                    timeout,
                )
            })
            .await?;
        if stdout.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "command produced no output".to_string(),
            ));
        }
        Ok(stdout)
    }

    /// Runs the probe command; each non-empty stdout line is a model name.
    async fn test_connection(&self) -> Result<ConnectionReport, ProviderError> {
        let argv = if self.probe_command.is_empty() {
            self.command.clone()
        } else {
            self.probe_command.clone()
        };
        let endpoint = argv.join(" ");
        let stdout = Self::run(argv, None, self.retry.first_timeout()).await?;
        let models: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if models.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "probe command reported no models".to_string(),
            ));
        }
        Ok(ConnectionReport {
            backend: self.name().to_string(),
            endpoint,
            models,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn model() -> ModelConfig {
        ModelConfig {
            model: "local".to_string(),
            temperature: 0.0,
            context_window: 2048,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempt_timeouts: vec![Duration::from_secs(5), Duration::from_secs(5)],
            backoff: Duration::from_millis(1),
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// The prompt is fed on stdin and stdout is the reply.
    #[tokio::test]
    async fn generate_echoes_stdout() {
        let provider = CommandProvider::new(argv(&["cat"]), Vec::new(), fast_retry());
        let reply = provider
            .generate("{\"status\":\"running\"}", &model())
            .await
            .expect("generate");
        assert_eq!(reply, "{\"status\":\"running\"}");
    }

    /// A failing command surfaces as a connection error with stderr.
    #[tokio::test]
    async fn generate_reports_failures() {
        let provider = CommandProvider::new(
            argv(&["sh", "-c", "echo broken >&2; exit 3"]),
            Vec::new(),
            fast_retry(),
        );
        let err = provider.generate("x", &model()).await.expect_err("fails");
        assert_eq!(
            err,
            ProviderError::Connection("command exited with 3: broken".to_string())
        );
    }

    /// The probe lists one model per line.
    #[tokio::test]
    async fn test_connection_runs_probe() {
        let provider = CommandProvider::new(
            argv(&["cat"]),
            argv(&["printf", "alpha\\nbeta\\n"]),
            fast_retry(),
        );
        let report = provider.test_connection().await.expect("probe");
        assert_eq!(report.models, vec!["alpha", "beta"]);
    }
}
