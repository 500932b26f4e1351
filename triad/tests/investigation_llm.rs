//! Investigation tests against a live model backend.
//!
//! These tests talk to a real provider and are excluded from regular CI runs
//! because they need a running backend. They read `triad.toml` from
//! `TRIAD_CONFIG` (defaults apply when unset, i.e. a local Ollama).
//!
//! Run with: `cargo test -p triad --test investigation_llm -- --ignored --nocapture`

use std::path::PathBuf;

use triad::core::normalize::{extract_reply_text, normalize_reply};
use triad::core::types::WorkflowState;
use triad::io::config::{DEFAULT_CONFIG_FILE, TriadConfig, load_config};
use triad::io::prompt::{PromptBuilder, PromptInputs};
use triad::io::provider::{ModelConfig, build_provider};

fn config() -> TriadConfig {
    let path = std::env::var_os("TRIAD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    load_config(&path).expect("load config")
}

/// The configured backend answers and lists the configured model.
#[tokio::test]
#[ignore]
async fn backend_lists_configured_model() {
    let cfg = config();
    let provider = build_provider(&cfg).expect("provider");
    let report = provider.test_connection().await.expect("backend reachable");
    println!("{} at {}: {:?}", report.backend, report.endpoint, report.models);
    assert!(
        report.models.iter().any(|m| m.starts_with(&cfg.provider.model)),
        "model {} not listed",
        cfg.provider.model
    );
}

/// A planning prompt yields a reply the normalizer accepts, with a plan.
#[tokio::test]
#[ignore]
async fn planning_reply_normalizes() {
    let cfg = config();
    let provider = build_provider(&cfg).expect("provider");
    let state = WorkflowState::new("write a three paragraph note on tide pool safety", 10);
    let prompt = PromptBuilder::from_config(&cfg.prompt)
        .build(&PromptInputs {
            state: &state,
            knowledge: None,
            run_log_limit: cfg.prompt.run_log_limit,
        })
        .expect("prompt");

    let body = provider
        .generate(prompt.as_str(), &ModelConfig::from_config(&cfg.provider))
        .await
        .expect("generate");
    let reply = extract_reply_text(&body);
    println!("{reply}");

    let parsed = normalize_reply(&reply).expect("normalized reply");
    assert!(!parsed.state.steps.is_empty(), "planner produced no steps");
}
