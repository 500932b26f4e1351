//! Planner / Worker / QA workflow runner.
//!
//! Runs live under `store.runs_dir` (default `.triad/runs/<id>/`), one JSON
//! record plus iteration logs each. A run that stops for plan approval or
//! clarification is picked up with `triad resume`; a run that spends its
//! iteration budget is completed with what it has produced.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use triad::core::progress::phase_of;
use triad::exit_codes;
use triad::io::approval::{PlanApprover, PlanDecision, TerminalApprover};
use triad::io::config::{DEFAULT_CONFIG_FILE, TriadConfig, load_config};
use triad::io::init::{InitOptions, init_workspace};
use triad::io::provider::build_provider;
use triad::io::provider::transport::{ReqwestTransport, Transport};
use triad::io::run_store::{FileRunStore, RunRecord, RunStore};
use triad::io::search::{SearchProvider, WebSearch};
use triad::logging;
use triad::looping::{
    LoopOutcome, LoopStop, approve_plan, reject_plan, resume_after_clarification, run_loop,
};
use triad::start::{StartRequest, start_run};
use triad::step::{IterationOutcome, LoopDeps};

#[derive(Parser)]
#[command(
    name = "triad",
    version,
    about = "Planner / Worker / QA workflow runner for a single LLM"
)]
struct Cli {
    /// Path to the TOML config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// More diagnostics on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `triad.toml` and create the runs directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run and drive it until it stops.
    Run {
        #[arg(long)]
        goal: String,
        /// Overrides `loop.max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Pause after planning for plan approval.
        #[arg(long)]
        guided: bool,
        /// Text file with reference material.
        #[arg(long)]
        knowledge: Option<PathBuf>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Continue a stopped run.
    Resume {
        id: String,
        /// Approve the pending plan.
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject the pending plan and plan again.
        #[arg(long)]
        reject: bool,
        /// Answer for a run that needs clarification.
        #[arg(long)]
        answer: Option<String>,
    },
    /// List stored runs, oldest first.
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print a stored run as JSON.
    Show { id: String },
    /// Check that the configured provider is reachable.
    TestConnection,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            goal,
            max_iterations,
            guided,
            knowledge,
            owner,
        } => {
            let cfg = load_config(&cli.config)?;
            let req = StartRequest {
                goal,
                max_iterations: max_iterations.unwrap_or(cfg.run_loop.max_iterations),
                owner,
                human_guided: guided || cfg.run_loop.human_guided,
                knowledge_path: knowledge,
            };
            cmd_run(&cfg, &req).await
        }
        Command::Resume {
            id,
            approve,
            reject,
            answer,
        } => {
            let cfg = load_config(&cli.config)?;
            cmd_resume(&cfg, &id, approve, reject, answer.as_deref()).await
        }
        Command::List { owner } => {
            let cfg = load_config(&cli.config)?;
            cmd_list(&cfg, owner.as_deref())
        }
        Command::Show { id } => {
            let cfg = load_config(&cli.config)?;
            cmd_show(&cfg, &id)
        }
        Command::TestConnection => {
            let cfg = load_config(&cli.config)?;
            cmd_test_connection(&cfg).await
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    let root = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    println!("runs in {}", paths.runs_dir.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(cfg: &TriadConfig, req: &StartRequest) -> Result<i32> {
    let store = FileRunStore::new(&cfg.store.runs_dir);
    let record = start_run(&store, req)?;
    println!("run {}", record.id);
    drive(cfg, &store, record, true).await
}

async fn cmd_resume(
    cfg: &TriadConfig,
    id: &str,
    approve: bool,
    reject: bool,
    answer: Option<&str>,
) -> Result<i32> {
    let store = FileRunStore::new(&cfg.store.runs_dir);
    let mut record = store.load_run(id)?;
    if approve {
        approve_plan(&mut record)?;
    } else if reject {
        reject_plan(&mut record)?;
    }
    if answer.is_some() {
        resume_after_clarification(&mut record, answer)?;
    }
    store.save_record(&record)?;

    if record.awaiting_approval {
        print_plan(&record);
        println!("run {id} is awaiting plan approval (use --approve or --reject)");
        return Ok(exit_codes::PAUSED);
    }
    drive(cfg, &store, record, false).await
}

/// Run the loop, persisting after every iteration. With `interactive`, plan
/// approval is asked on the terminal instead of pausing the run.
async fn drive(
    cfg: &TriadConfig,
    store: &FileRunStore,
    mut record: RunRecord,
    interactive: bool,
) -> Result<i32> {
    let provider = build_provider(cfg)?;
    let search: Option<Arc<dyn SearchProvider>> = if cfg.search.enabled {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
        Some(Arc::new(WebSearch::new(transport, cfg.search.clone())))
    } else {
        None
    };
    let deps = LoopDeps::from_config(cfg, provider, search);

    loop {
        let outcome = run_loop(&deps, &mut record, &cfg.run_loop, |record, iteration| {
            store
                .save_record(record)
                .with_context(|| format!("persist run {}", record.id))?;
            print_iteration(iteration);
            Ok(ControlFlow::Continue(()))
        })
        .await?;
        store.save_record(&record)?;

        if interactive && outcome.stop == LoopStop::AwaitingApproval {
            let mut approver = TerminalApprover::stdio();
            match approver.present_plan(&record.state.state.steps)? {
                PlanDecision::Approve => approve_plan(&mut record)?,
                PlanDecision::Reject => reject_plan(&mut record)?,
            }
            store.save_record(&record)?;
            continue;
        }

        return Ok(report(&record, &outcome));
    }
}

fn print_iteration(outcome: &IterationOutcome) {
    let mut line = format!(
        "iteration {}: {} [{}]",
        outcome.iteration, outcome.phase, outcome.status
    );
    if outcome.attempts > 1 {
        line.push_str(&format!(" after {} attempts", outcome.attempts));
    }
    if let Some(guard) = &outcome.guard
        && !guard.violations.is_empty()
    {
        line.push_str(&format!(", {} correction(s)", guard.violations.len()));
    }
    for note in outcome.tools.notes() {
        line.push_str(&format!("\n  tool: {note}"));
    }
    println!("{line}");
}

fn print_plan(record: &RunRecord) {
    println!("Proposed plan:");
    for (i, step) in record.state.state.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step);
    }
}

fn report(record: &RunRecord, outcome: &LoopOutcome) -> i32 {
    let phase = phase_of(&record.state, record.awaiting_approval);
    println!(
        "run {} stopped after {} iteration(s) this session: {}",
        outcome.run_id, outcome.iterations_executed, phase
    );
    match &outcome.stop {
        LoopStop::Completed => exit_codes::OK,
        LoopStop::Error => {
            if let Some(last) = record.state.run_log.last() {
                eprintln!("{}", last.summary);
            }
            exit_codes::RUN_ERROR
        }
        LoopStop::NeedsClarification => {
            println!("answer with: triad resume {} --answer \"...\"", outcome.run_id);
            exit_codes::PAUSED
        }
        LoopStop::AwaitingApproval => {
            print_plan(record);
            println!(
                "approve with: triad resume {} --approve (or --reject)",
                outcome.run_id
            );
            exit_codes::PAUSED
        }
        LoopStop::Cancelled => exit_codes::PAUSED,
    }
}

fn cmd_list(cfg: &TriadConfig, owner: Option<&str>) -> Result<i32> {
    let store = FileRunStore::new(&cfg.store.runs_dir);
    for run in store.list_runs(owner)? {
        println!(
            "{}  {:<20}  {:>3}/{:<3}  {:<12}  {}",
            run.id,
            run.status.to_string(),
            run.current_iteration,
            run.max_iterations,
            run.owner.as_deref().unwrap_or("-"),
            run.goal
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_show(cfg: &TriadConfig, id: &str) -> Result<i32> {
    let store = FileRunStore::new(&cfg.store.runs_dir);
    let record = store.load_run(id)?;
    println!("{}", to_json(&record)?);
    Ok(exit_codes::OK)
}

async fn cmd_test_connection(cfg: &TriadConfig) -> Result<i32> {
    let provider = build_provider(cfg)?;
    match provider.test_connection().await {
        Ok(report) => {
            println!(
                "{} at {}: {} model(s)",
                report.backend,
                report.endpoint,
                report.models.len()
            );
            for model in &report.models {
                println!("  {model}");
            }
            if !report.models.iter().any(|m| m == &cfg.provider.model) {
                println!("warning: configured model '{}' not listed", cfg.provider.model);
            }
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{} unreachable: {err}", provider.name());
            Ok(exit_codes::RUN_ERROR)
        }
    }
}

/// Serialize `value` to pretty-printed JSON.
fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("serialize json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["triad", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["triad", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_options() {
        let cli = Cli::parse_from([
            "triad",
            "--config",
            "alt.toml",
            "run",
            "--goal",
            "map the tide pools",
            "--max-iterations",
            "6",
            "--guided",
        ]);
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        match cli.command {
            Command::Run {
                goal,
                max_iterations,
                guided,
                knowledge,
                owner,
            } => {
                assert_eq!(goal, "map the tide pools");
                assert_eq!(max_iterations, Some(6));
                assert!(guided);
                assert!(knowledge.is_none());
                assert!(owner.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    /// Approve and reject are mutually exclusive.
    #[test]
    fn resume_rejects_conflicting_decisions() {
        let parsed = Cli::try_parse_from(["triad", "resume", "abc", "--approve", "--reject"]);
        assert!(parsed.is_err());
    }
}
