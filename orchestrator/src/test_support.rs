//! Test-only collaborators and fixtures.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use crate::core::agent::IsolationStrategy;
use crate::core::types::ToolResult;
use crate::io::config::SandboxConfig;
use crate::io::tool::{ExecutionContext, ToolCall, ToolExecutor};

/// A call observed by [`ScriptedToolExecutor`], with the context flags it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub call: ToolCall,
    pub session_id: String,
    pub approved: bool,
    pub dry_run: bool,
    pub sandbox: bool,
}

/// Tool executor returning queued results.
///
/// Results are queued per key; a call consumes from the queue named by its step
/// id, or else by its tool name. With nothing queued the call succeeds with
/// empty output.
#[derive(Debug, Default)]
pub struct ScriptedToolExecutor {
    queues: Mutex<HashMap<String, VecDeque<ToolResult>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for a step id or tool name.
    pub fn push(&self, key: &str, result: ToolResult) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make calls for a step id or tool name take `delay` (cut short by cancellation).
    pub fn delay(&self, key: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_result(&self, call: &ToolCall) -> ToolResult {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        for key in [&call.step_id, &call.tool] {
            if let Some(result) = queues.get_mut(key).and_then(VecDeque::pop_front) {
                return result;
            }
        }
        ToolResult::ok("")
    }

    fn delay_for(&self, call: &ToolCall) -> Option<Duration> {
        let delays = self.delays.lock().unwrap_or_else(PoisonError::into_inner);
        delays
            .get(&call.step_id)
            .or_else(|| delays.get(&call.tool))
            .copied()
    }
}

impl ToolExecutor for ScriptedToolExecutor {
    fn execute(&self, call: &ToolCall, context: &ExecutionContext) -> Result<ToolResult> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                call: call.clone(),
                session_id: context.session_id.clone(),
                approved: context.approved,
                dry_run: context.dry_run,
                sandbox: context.sandbox,
            });
        if let Some(delay) = self.delay_for(call) {
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline {
                if context.cancel.is_cancelled() {
                    return Ok(ToolResult::failed("cancelled"));
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        Ok(self.next_result(call))
    }
}

/// Scratch directory holding a seeded project and a sandbox base next to it.
pub struct TestProject {
    temp: tempfile::TempDir,
    project: PathBuf,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let project = temp.path().join("project");
        seed_project(&project)?;
        Ok(Self { temp, project })
    }

    /// Like [`new`](Self::new), with the project committed to a git repository.
    pub fn with_git() -> Result<Self> {
        let fixture = Self::new()?;
        init_git_repo(&fixture.project)?;
        Ok(fixture)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn sandbox_base(&self) -> PathBuf {
        self.temp.path().join("sandboxes")
    }

    pub fn sandbox_config(&self, strategy: IsolationStrategy) -> SandboxConfig {
        SandboxConfig {
            base_dir: Some(self.sandbox_base()),
            strategy,
            ..SandboxConfig::default()
        }
    }
}

/// Populate `dir` with a small project: a manifest, sources and skip-listed noise.
pub fn seed_project(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir.join("src")).with_context(|| format!("create {}", dir.display()))?;
    fs::create_dir_all(dir.join("node_modules").join("dep"))
        .with_context(|| format!("create node_modules in {}", dir.display()))?;
    fs::write(dir.join(".gitignore"), "node_modules/\n*.log\n")?;
    fs::write(dir.join("package.json"), "{\"name\":\"fixture\"}\n")?;
    fs::write(dir.join("src").join("index.js"), "console.log('hi');\n")?;
    fs::write(dir.join("node_modules").join("dep").join("index.js"), "\n")?;
    fs::write(dir.join("npm-debug.log"), "noise\n")?;
    Ok(())
}

/// Turn `dir` into a git repository with everything committed.
pub fn init_git_repo(dir: &Path) -> Result<()> {
    run_git(dir, &["init"])?;
    run_git(dir, &["config", "user.name", "Orchestrator Test"])?;
    run_git(dir, &["config", "user.email", "orchestrator-test@local.invalid"])?;
    run_git(dir, &["add", "."])?;
    run_git(dir, &["commit", "-m", "fixture"])?;
    Ok(())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
