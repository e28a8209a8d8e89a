//! Pre-flight conflict detection between agents.
//!
//! Comparisons are lexical: paths are normalised but never resolved against
//! the filesystem, so results are deterministic for a given input.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::agent::Agent;

/// Fixed message reported when two agents share a working directory.
pub const SHARED_WORKDIR_MESSAGE: &str = "agents share the same working directory";

/// Why two agents should not run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub file_conflicts: Vec<String>,
    pub env_conflicts: Vec<String>,
    pub resource_conflicts: Vec<String>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.file_conflicts.is_empty()
            && self.env_conflicts.is_empty()
            && self.resource_conflicts.is_empty()
    }

    /// Whether this report forbids concurrent scheduling under `policy`.
    pub fn blocks(&self, policy: &ConflictPolicy) -> bool {
        if policy.allow_conflicts {
            return false;
        }
        !self.file_conflicts.is_empty()
            || (policy.serialize_on_resource && !self.resource_conflicts.is_empty())
    }
}

/// Scheduling policy applied to conflict reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictPolicy {
    /// Also serialize agents that share a working directory.
    pub serialize_on_resource: bool,
    /// Caller override: schedule everything together regardless of conflicts.
    pub allow_conflicts: bool,
}

/// Compare the declared resources of two agents.
pub fn detect_file_conflicts(a: &Agent, b: &Agent) -> ConflictReport {
    let a_files: BTreeSet<String> = a.context.files.iter().map(|f| normalize_file(f)).collect();
    let b_files: BTreeSet<String> = b.context.files.iter().map(|f| normalize_file(f)).collect();
    let file_conflicts = a_files.intersection(&b_files).cloned().collect();

    let mut resource_conflicts = Vec::new();
    if normalize_path(&a.context.working_dir) == normalize_path(&b.context.working_dir) {
        resource_conflicts.push(SHARED_WORKDIR_MESSAGE.to_string());
    }

    // Same role is only a weak signal; it never blocks scheduling on its own.
    let mut env_conflicts = Vec::new();
    if a.role == b.role {
        env_conflicts.push(format!(
            "agents '{}' and '{}' share role '{}'",
            a.id, b.id, a.role
        ));
    }

    ConflictReport {
        file_conflicts,
        env_conflicts,
        resource_conflicts,
    }
}

/// Flag working directories that more than one context resolves to.
pub fn detect_env_conflicts<'a, I>(dirs: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut counts: BTreeMap<PathBuf, usize> = BTreeMap::new();
    for dir in dirs {
        *counts.entry(normalize_path(dir)).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(dir, count)| {
            format!(
                "{count} contexts resolve to working directory {}",
                dir.display()
            )
        })
        .collect()
}

/// Assign agents (by index) to batches that can run concurrently.
///
/// Agents are placed, in input order, into the earliest batch that holds no
/// agent they conflict with. Conflicting agents end up serialized across
/// batches; none are dropped.
pub fn partition_batches(agents: &[Agent], policy: &ConflictPolicy) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    for (idx, agent) in agents.iter().enumerate() {
        let slot = batches.iter().position(|batch| {
            batch
                .iter()
                .all(|&other| !detect_file_conflicts(agent, &agents[other]).blocks(policy))
        });
        match slot {
            Some(slot) => batches[slot].push(idx),
            None => batches.push(vec![idx]),
        }
    }
    batches
}

fn normalize_file(file: &str) -> String {
    normalize_path(Path::new(file)).to_string_lossy().into_owned()
}

/// Lexical normalisation: drops `.` components and folds `..` where possible.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
