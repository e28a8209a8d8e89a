//! Agent task descriptors and isolation strategies.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a sandbox is realised on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationStrategy {
    /// Copy the project tree into a fresh directory.
    #[default]
    TempDirectory,
    /// Add a detached git worktree of the project's repository.
    GitWorktree,
    /// Reserved for OS-level isolation. Currently provisioned like `TempDirectory`.
    Constrained,
}

impl fmt::Display for IsolationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationStrategy::TempDirectory => "temp-directory",
            IsolationStrategy::GitWorktree => "git-worktree",
            IsolationStrategy::Constrained => "constrained",
        };
        f.write_str(name)
    }
}

/// Where an agent works and what it declares it will touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    /// Project directory the agent operates on (seed for its sandbox).
    pub working_dir: PathBuf,
    /// Files the agent declares it will modify, relative to `working_dir`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// One independently dispatched, isolated task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub role: String,
    /// Task description; run through the sandbox launcher unless `command` is set.
    pub task: String,
    pub context: AgentContext,
    /// Explicit argv for the task, bypassing the launcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Extra environment variables for the task process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Assigned once the sandbox exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        role: impl Into<String>,
        task: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            task: task.into(),
            context: AgentContext {
                working_dir: working_dir.into(),
                files: Vec::new(),
            },
            command: None,
            env: BTreeMap::new(),
            sandbox_root: None,
            timeout_ms: None,
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Agent timeout, or `default` when none is declared.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Outcome of running one agent's task in its sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResult {
    pub agent_id: String,
    pub success: bool,
    /// Captured stdout.
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Files created or modified by the task, relative to the sandbox root.
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_root: Option<PathBuf>,
    pub duration_ms: u64,
}

impl AgentRunResult {
    /// A run that never produced process output.
    pub fn fault(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            success: false,
            output: String::new(),
            stderr: String::new(),
            artifacts: Vec::new(),
            exit_code: -1,
            error: Some(error.into()),
            sandbox_root: None,
            duration_ms: 0,
        }
    }
}
