//! Host CLI for the orchestration core.
//!
//! Validates worker envelopes and workflow definitions, and runs workflows
//! against subprocess workers configured in `conductor.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use conductor::core::aggregate::PhaseReport;
use conductor::core::state::{Decision, WorkflowState};
use conductor::exit_codes;
use conductor::invoke::WorkerInvoker;
use conductor::io::config::{ConductorConfig, DEFAULT_CONFIG_PATH, load_config};
use conductor::io::definition::load_definition;
use conductor::logging;
use conductor::schedule::Scheduler;
use conductor::workflow::{ApprovalHost, Stage, WorkflowDefinition, WorkflowEngine};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Run approval-gated workflows over contract-speaking workers"
)]
struct Cli {
    /// Path to the TOML config (defaults apply when the file is missing).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug-level tracing on stderr (ignored when `RUST_LOG` is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate one worker response envelope (JSON file, `-` for stdin).
    CheckEnvelope {
        file: PathBuf,
        /// Require the envelope to come from this agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Validate a workflow definition against the schema and invariants.
    CheckWorkflow { file: PathBuf },
    /// Run a workflow, asking on stdin at each approval gate.
    Run {
        file: PathBuf,
        /// Approve every gate without asking.
        #[arg(long)]
        auto_approve: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::CheckEnvelope { file, agent } => {
            cmd_check_envelope(&cli.config, &file, agent.as_deref())
        }
        Command::CheckWorkflow { file } => cmd_check_workflow(&file),
        Command::Run { file, auto_approve } => cmd_run(&cli.config, &file, auto_approve),
    }
}

fn cmd_check_envelope(config: &Path, file: &Path, agent: Option<&str>) -> Result<i32> {
    let cfg = load_config(config)?;
    let raw = if file == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("read envelope from stdin")?
    } else {
        fs::read_to_string(file).with_context(|| format!("read envelope {}", file.display()))?
    };
    match cfg.validator().validate(&raw, agent) {
        Ok(envelope) => {
            println!("ok: {} {}", envelope.agent, envelope.status);
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            println!("invalid: {failure}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_check_workflow(file: &Path) -> Result<i32> {
    let definition = load_definition(file)?;
    println!(
        "ok: {} ({} phases)",
        definition.name,
        definition.phases.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(config: &Path, file: &Path, auto_approve: bool) -> Result<i32> {
    let cfg = load_config(config)?;
    let definition = load_definition(file)?;
    check_workers_configured(&cfg, &definition)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run_workflow(cfg, definition, auto_approve))
}

fn check_workers_configured(cfg: &ConductorConfig, definition: &WorkflowDefinition) -> Result<()> {
    let mut missing = Vec::new();
    for phase in &definition.phases {
        let execute = phase.gate.as_ref().and_then(|g| g.execute.as_ref());
        for node in std::iter::once(&phase.schedule).chain(execute) {
            for id in node.leaf_ids() {
                if !cfg.workers.contains_key(id) && !missing.contains(&id) {
                    missing.push(id);
                }
            }
        }
    }
    if !missing.is_empty() {
        bail!("no [workers.<id>] command configured for: {}", missing.join(", "));
    }
    Ok(())
}

async fn run_workflow(
    cfg: ConductorConfig,
    definition: WorkflowDefinition,
    auto_approve: bool,
) -> Result<i32> {
    let invoker = WorkerInvoker::new(
        Arc::new(cfg.process_registry()),
        cfg.validator(),
        cfg.invoker_settings(),
    );
    let scheduler = Scheduler::new(invoker, cfg.scheduler.pool_size);
    let mut engine = WorkflowEngine::new(definition, scheduler);

    let handle = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let host: Box<dyn ApprovalHost> = if auto_approve {
        Box::new(AutoApprove)
    } else {
        Box::new(StdinHost::new())
    };
    let state = engine
        .run_with_host(host.as_ref())
        .await
        .context("drive workflow")?
        .clone();

    let summary = RunSummary {
        workflow: &engine.definition().name,
        state: &state,
        phases: engine
            .records()
            .iter()
            .map(|record| RecordSummary {
                phase: &record.phase,
                stage: record.stage,
                report: &record.report,
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize run summary")?
    );

    Ok(match state {
        WorkflowState::Completed => exit_codes::OK,
        _ => exit_codes::ABORTED,
    })
}

#[derive(Serialize)]
struct RunSummary<'a> {
    workflow: &'a str,
    state: &'a WorkflowState,
    phases: Vec<RecordSummary<'a>>,
}

#[derive(Serialize)]
struct RecordSummary<'a> {
    phase: &'a str,
    stage: Stage,
    report: &'a PhaseReport,
}

struct AutoApprove;

#[async_trait]
impl ApprovalHost for AutoApprove {
    fn present_report(&self, phase: &str, report: &PhaseReport) {
        eprintln!("auto-approving {phase} ({})", report.status);
    }

    async fn await_decision(&self, _phase: &str) -> Decision {
        Decision::Approve
    }
}

/// Prompts on stderr and reads `approve`, `reject` or `modify <json>` from stdin.
struct StdinHost {
    lines: Mutex<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
}

impl StdinHost {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl ApprovalHost for StdinHost {
    fn present_report(&self, phase: &str, report: &PhaseReport) {
        match serde_json::to_string_pretty(report) {
            Ok(rendered) => eprintln!("phase {phase} finished:\n{rendered}"),
            Err(err) => eprintln!("phase {phase} finished ({}): {err}", report.status),
        }
    }

    async fn await_decision(&self, phase: &str) -> Decision {
        let mut lines = self.lines.lock().await;
        loop {
            eprintln!("{phase}: approve | reject | modify <json>");
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                // No more input: nobody can approve.
                Ok(None) | Err(_) => return Decision::Reject,
            };
            match parse_decision(&line) {
                Some(decision) => return decision,
                None => eprintln!("unrecognized decision: {}", line.trim()),
            }
        }
    }
}

fn parse_decision(line: &str) -> Option<Decision> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match word {
        "approve" | "a" => Some(Decision::Approve),
        "reject" | "r" => Some(Decision::Reject),
        "modify" | "m" => serde_json::from_str::<Value>(rest.trim())
            .ok()
            .map(Decision::Modify),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_decisions() {
        assert_eq!(parse_decision("approve\n"), Some(Decision::Approve));
        assert_eq!(parse_decision(" r "), Some(Decision::Reject));
        assert_eq!(
            parse_decision("modify {\"scope\": \"api\"}"),
            Some(Decision::Modify(json!({"scope": "api"})))
        );
        assert_eq!(parse_decision("modify not-json"), None);
        assert_eq!(parse_decision("maybe"), None);
    }
}
