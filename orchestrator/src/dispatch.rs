//! Multi-agent dispatch: conflict-aware batches of sandboxed tasks.
//!
//! Agents are partitioned into conflict-free batches. Batches run one after
//! another; agents inside a batch run concurrently under a bounded pool, each
//! in its own sandbox that is torn down once its artifacts are collected.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::agent::{Agent, AgentRunResult};
use crate::core::conflict::{
    ConflictPolicy, ConflictReport, detect_env_conflicts, detect_file_conflicts, partition_batches,
};
use crate::io::config::SandboxConfig;
use crate::io::sandbox::{AgentSandbox, SandboxContext, WorktreeLocks};
use crate::pool::run_bounded;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Agents running at once within a batch.
    pub concurrency: usize,
    pub policy: ConflictPolicy,
    /// Copy each agent's artifacts to `<dir>/<agent_id>/` before cleanup.
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            policy: ConflictPolicy::default(),
            artifacts_dir: None,
        }
    }
}

/// Conflict report for one pair of agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConflict {
    pub first: String,
    pub second: String,
    pub report: ConflictReport,
}

/// Pre-flight analysis of an agent set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    /// Non-empty pairwise reports, in input order.
    pub pairs: Vec<PairConflict>,
    /// Working directories shared by several agents.
    pub env_conflicts: Vec<String>,
    /// Agent ids per batch.
    pub batches: Vec<Vec<String>>,
}

impl ConflictSummary {
    /// Whether any pair has a file conflict.
    pub fn has_file_conflicts(&self) -> bool {
        self.pairs
            .iter()
            .any(|pair| !pair.report.file_conflicts.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub conflicts: ConflictSummary,
    /// One result per agent, in input order.
    pub results: Vec<AgentRunResult>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|result| result.success)
    }
}

/// Compare every pair of agents and plan batches under `policy`.
pub fn analyze_conflicts(agents: &[Agent], policy: &ConflictPolicy) -> ConflictSummary {
    let mut pairs = Vec::new();
    for (i, first) in agents.iter().enumerate() {
        for second in &agents[i + 1..] {
            let report = detect_file_conflicts(first, second);
            if !report.is_empty() {
                pairs.push(PairConflict {
                    first: first.id.clone(),
                    second: second.id.clone(),
                    report,
                });
            }
        }
    }
    let env_conflicts =
        detect_env_conflicts(agents.iter().map(|agent| agent.context.working_dir.as_path()));
    let batches = partition_batches(agents, policy)
        .into_iter()
        .map(|batch| batch.into_iter().map(|idx| agents[idx].id.clone()).collect())
        .collect();
    ConflictSummary {
        pairs,
        env_conflicts,
        batches,
    }
}

/// Run every agent in its own sandbox.
///
/// Never fails as a whole: per-agent faults are reported in the agent's result.
#[instrument(skip_all, fields(agents = agents.len(), concurrency = options.concurrency))]
pub fn dispatch(
    agents: &[Agent],
    sandbox: &SandboxConfig,
    locks: &WorktreeLocks,
    options: &DispatchOptions,
    cancel: &CancelToken,
) -> DispatchReport {
    let conflicts = analyze_conflicts(agents, &options.policy);
    for pair in &conflicts.pairs {
        debug!(first = %pair.first, second = %pair.second, report = ?pair.report, "conflict detected");
    }

    let mut results: Vec<Option<AgentRunResult>> = vec![None; agents.len()];
    let batches = partition_batches(agents, &options.policy);
    info!(batches = batches.len(), "dispatching agents");
    for (batch_no, batch) in batches.iter().enumerate() {
        debug!(batch_no, size = batch.len(), "starting batch");
        let batch_results = run_bounded(batch.clone(), options.concurrency, |idx| {
            run_agent(&agents[idx], sandbox, locks, options, cancel)
        });
        for (idx, result) in batch.iter().zip(batch_results) {
            results[*idx] = Some(result);
        }
    }

    let results = results
        .into_iter()
        .zip(agents)
        .map(|(result, agent)| {
            result.unwrap_or_else(|| AgentRunResult::fault(&agent.id, "agent was never scheduled"))
        })
        .collect();
    DispatchReport { conflicts, results }
}

fn run_agent(
    agent: &Agent,
    config: &SandboxConfig,
    locks: &WorktreeLocks,
    options: &DispatchOptions,
    cancel: &CancelToken,
) -> AgentRunResult {
    if cancel.is_cancelled() {
        return AgentRunResult::fault(&agent.id, "dispatch cancelled before start");
    }
    let mut sandbox = match AgentSandbox::new(&agent.context.working_dir, config, locks.clone()) {
        Ok(sandbox) => sandbox,
        Err(err) => return AgentRunResult::fault(&agent.id, format!("{err:#}")),
    };
    let mut agent = agent.clone();
    match sandbox.create(&agent.id) {
        Ok(root) => agent.sandbox_root = Some(root),
        Err(err) => return AgentRunResult::fault(&agent.id, format!("{err:#}")),
    }

    let mut result = sandbox.execute_with_cancel(&agent, cancel);
    if let (Some(dir), Some(context)) = (&options.artifacts_dir, sandbox.context())
        && let Err(err) = collect_artifacts(context, &result.artifacts, &dir.join(&agent.id))
    {
        warn!(agent_id = %agent.id, err = %format!("{err:#}"), "failed to collect artifacts");
        result.error.get_or_insert_with(|| format!("collect artifacts: {err:#}"));
    }

    sandbox.cleanup();
    for problem in sandbox.cleanup_errors() {
        debug!(agent_id = %agent.id, problem = %problem, "cleanup diagnostic");
    }
    result
}

fn collect_artifacts(context: &SandboxContext, artifacts: &[String], dest: &Path) -> Result<()> {
    for artifact in artifacts {
        let src = context.resolve(artifact)?;
        let target = dest.join(artifact);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::copy(&src, &target)
            .with_context(|| format!("copy {} to {}", src.display(), target.display()))?;
    }
    Ok(())
}
