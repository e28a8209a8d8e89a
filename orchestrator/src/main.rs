//! Task orchestrator CLI.
//!
//! Validates and runs workflow documents against command-backed tools, and
//! dispatches batches of agents into isolated sandboxes. Results are printed
//! as JSON on stdout; the exit code summarises the outcome.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use orchestrator::cancel::CancelToken;
use orchestrator::core::conflict::ConflictPolicy;
use orchestrator::core::types::ExecutionStatus;
use orchestrator::core::workflow::Params;
use orchestrator::dispatch::DispatchOptions;
use orchestrator::engine::ExecuteOptions;
use orchestrator::exit_codes;
use orchestrator::io::agent_store::load_agents;
use orchestrator::io::config::{DEFAULT_CONFIG_FILE, OrchestratorConfig, load_config};
use orchestrator::io::execution_log::ExecutionLog;
use orchestrator::io::workflow_store::load_workflow;
use orchestrator::logging;
use orchestrator::orchestrator::Orchestrator;
use serde::Serialize;
use serde_json::Value;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run tool workflows and dispatch sandboxed agents"
)]
struct Cli {
    /// Config file (defaults to `orchestrator.toml` in the current directory, if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for this crate (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a workflow document against the schema and structural rules.
    Validate { workflow: PathBuf },
    /// Execute a workflow and print its execution record.
    Run {
        workflow: PathBuf,
        /// Workflow parameter `key=value` (value parsed as JSON, else taken as a string).
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        /// Forward the dry-run flag to tools instead of running them.
        #[arg(long)]
        dry_run: bool,
        /// Approve tools that require approval.
        #[arg(long)]
        approve: bool,
        /// Directory tools run in (defaults to the current directory).
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Write the execution record to `<dir>/<execution_id>.json`.
        #[arg(long)]
        record_dir: Option<PathBuf>,
    },
    /// Run a JSON array of agents in sandboxes and print the dispatch report.
    Dispatch {
        agents: PathBuf,
        /// Agents running at once (defaults to `max_concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,
        /// Schedule conflicting agents together.
        #[arg(long)]
        allow_conflicts: bool,
        /// Copy each agent's artifacts to `<dir>/<agent_id>/`.
        #[arg(long)]
        artifacts_dir: Option<PathBuf>,
    },
    /// Report conflicts between agents without running them.
    Conflicts {
        agents: PathBuf,
        /// Plan batches as if conflicts were allowed.
        #[arg(long)]
        allow_conflicts: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = resolve_config(cli.config.as_deref())?;
    match cli.command {
        Command::Validate { workflow } => cmd_validate(&workflow),
        Command::Run {
            workflow,
            params,
            dry_run,
            approve,
            workdir,
            record_dir,
        } => {
            let options = ExecuteOptions {
                approved: approve,
                dry_run,
                working_dir: workdir,
                ..ExecuteOptions::default()
            };
            cmd_run(config, &workflow, params.into_iter().collect(), options, record_dir)
        }
        Command::Dispatch {
            agents,
            concurrency,
            allow_conflicts,
            artifacts_dir,
        } => {
            let options = DispatchOptions {
                concurrency: concurrency.unwrap_or(config.max_concurrency).max(1),
                policy: ConflictPolicy {
                    allow_conflicts,
                    ..ConflictPolicy::default()
                },
                artifacts_dir,
            };
            cmd_dispatch(config, &agents, &options)
        }
        Command::Conflicts {
            agents,
            allow_conflicts,
        } => cmd_conflicts(config, &agents, allow_conflicts),
    }
}

fn resolve_config(explicit: Option<&Path>) -> Result<OrchestratorConfig> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            load_config(path)
        }
        None => load_config(Path::new(DEFAULT_CONFIG_FILE)),
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let workflow = load_workflow(path)?;
    println!(
        "ok: workflow '{}' v{} ({} steps)",
        workflow.id,
        workflow.version,
        workflow.steps.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_run(
    config: OrchestratorConfig,
    path: &Path,
    params: Params,
    options: ExecuteOptions,
    record_dir: Option<PathBuf>,
) -> Result<i32> {
    let workflow = load_workflow(path)?;
    let mut orchestrator = Orchestrator::from_config(config);
    if let Some(dir) = record_dir {
        orchestrator = orchestrator.with_execution_log(ExecutionLog::new(dir));
    }
    let execution = orchestrator.run_workflow(workflow, params, options)?;
    print_json(&execution)?;
    Ok(match execution.status {
        ExecutionStatus::Completed => exit_codes::OK,
        ExecutionStatus::Cancelled => exit_codes::CANCELLED,
        ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Failed => {
            exit_codes::FAILED
        }
    })
}

fn cmd_dispatch(config: OrchestratorConfig, path: &Path, options: &DispatchOptions) -> Result<i32> {
    let agents = load_agents(path)?;
    let orchestrator = Orchestrator::from_config(config);
    let report = orchestrator.dispatch(&agents, options, &CancelToken::new());
    print_json(&report)?;
    Ok(if report.all_succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_conflicts(config: OrchestratorConfig, path: &Path, allow_conflicts: bool) -> Result<i32> {
    let agents = load_agents(path)?;
    let summary = Orchestrator::from_config(config).conflicts(&agents, allow_conflicts);
    print_json(&summary)?;
    Ok(if summary.has_file_conflicts() {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
