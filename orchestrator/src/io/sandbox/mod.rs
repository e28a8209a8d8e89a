//! Agent sandboxes: private working directories with an isolated environment.
//!
//! A sandbox is provisioned by [`AgentSandbox::create`], used through its
//! [`SandboxContext`], and torn down by [`AgentSandbox::cleanup`] (also run on
//! drop). Cleanup never fails; problems are kept for diagnostics.

mod context;
mod locks;
mod seed;

pub use context::SandboxContext;
pub use locks::WorktreeLocks;
pub use seed::{DEFAULT_SKIP, SkipList, Snapshot, changed_files, copy_tree, prune_tree, snapshot};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::agent::{Agent, AgentRunResult, IsolationStrategy};
use crate::ids::sandbox_dir_name;
use crate::io::config::SandboxConfig;
use crate::io::git::Git;

/// A provisioned sandbox directory.
#[derive(Debug)]
struct Provisioned {
    /// Directory created for this sandbox (removed on cleanup).
    root: PathBuf,
    /// Strategy actually used, after any fallback.
    strategy: IsolationStrategy,
    /// Repository top-level when `strategy` is `GitWorktree`.
    repo: Option<PathBuf>,
    context: SandboxContext,
}

/// Owns one sandbox for one agent.
#[derive(Debug)]
pub struct AgentSandbox {
    project_dir: PathBuf,
    config: SandboxConfig,
    skip: SkipList,
    locks: WorktreeLocks,
    agent_id: Option<String>,
    provisioned: Option<Provisioned>,
    cleanup_errors: Vec<String>,
}

impl AgentSandbox {
    /// Prepare (but do not create) a sandbox seeded from `project_dir`.
    pub fn new(
        project_dir: impl Into<PathBuf>,
        config: &SandboxConfig,
        locks: WorktreeLocks,
    ) -> Result<Self> {
        let skip = SkipList::new(&config.extra_skip)?;
        Ok(Self {
            project_dir: project_dir.into(),
            config: config.clone(),
            skip,
            locks,
            agent_id: None,
            provisioned: None,
            cleanup_errors: Vec::new(),
        })
    }

    /// Sandbox root, once created.
    pub fn root(&self) -> Option<&Path> {
        self.provisioned.as_ref().map(|p| p.context.root())
    }

    pub fn context(&self) -> Option<&SandboxContext> {
        self.provisioned.as_ref().map(|p| &p.context)
    }

    /// Strategy the sandbox was realised with (after fallback).
    pub fn strategy(&self) -> Option<IsolationStrategy> {
        self.provisioned.as_ref().map(|p| p.strategy)
    }

    /// Diagnostics recorded by cleanup.
    pub fn cleanup_errors(&self) -> &[String] {
        &self.cleanup_errors
    }

    /// Create and seed the sandbox root for `agent_id`.
    ///
    /// The skip list applies to every strategy: a copy never includes skipped
    /// entries, and a git worktree has tracked ones pruned after checkout. A
    /// git worktree that cannot be added falls back to a copied directory.
    #[instrument(skip_all, fields(agent_id, strategy = %self.config.strategy))]
    pub fn create(&mut self, agent_id: &str) -> Result<PathBuf> {
        if let Some(existing) = &self.provisioned {
            bail!(
                "sandbox for agent '{}' already exists at {}",
                self.agent_id.as_deref().unwrap_or_default(),
                existing.root.display()
            );
        }
        let base = self.config.base_dir();
        fs::create_dir_all(&base)
            .with_context(|| format!("create sandbox base {}", base.display()))?;
        let root = base.join(sandbox_dir_name(agent_id));

        let (strategy, repo, workdir) = match self.config.strategy {
            IsolationStrategy::GitWorktree => match self.add_worktree(&root) {
                Ok((repo, workdir)) => (IsolationStrategy::GitWorktree, Some(repo), workdir),
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "git worktree unavailable, falling back to temp directory");
                    if root.exists() {
                        fs::remove_dir_all(&root).with_context(|| {
                            format!("remove failed worktree {}", root.display())
                        })?;
                    }
                    self.seed_copy(&root, &base)?;
                    (IsolationStrategy::TempDirectory, None, root.clone())
                }
            },
            IsolationStrategy::TempDirectory | IsolationStrategy::Constrained => {
                self.seed_copy(&root, &base)?;
                (self.config.strategy, None, root.clone())
            }
        };

        let mut env = BTreeMap::new();
        env.insert("SANDBOXED".to_string(), "1".to_string());
        env.insert("AGENT_MODE".to_string(), "1".to_string());
        env.insert("AGENT_ID".to_string(), agent_id.to_string());
        env.insert(
            "SANDBOX_ROOT".to_string(),
            workdir.to_string_lossy().into_owned(),
        );
        let context = SandboxContext::new(workdir.clone(), env, self.config.output_limit_bytes);

        info!(root = %workdir.display(), %strategy, "sandbox created");
        self.agent_id = Some(agent_id.to_string());
        self.provisioned = Some(Provisioned {
            root,
            strategy,
            repo,
            context,
        });
        Ok(workdir)
    }

    fn seed_copy(&self, root: &Path, base: &Path) -> Result<()> {
        fs::create_dir(root).with_context(|| format!("create sandbox {}", root.display()))?;
        if let Err(err) = copy_tree(&self.project_dir, root, &self.skip, Some(base)) {
            // Leave nothing half-seeded behind.
            if let Err(remove_err) = fs::remove_dir_all(root) {
                warn!(err = %remove_err, root = %root.display(), "failed to remove partial sandbox");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Returns the repository top-level and the agent's working directory inside the worktree.
    fn add_worktree(&self, root: &Path) -> Result<(PathBuf, PathBuf)> {
        let git = Git::new(&self.project_dir);
        if !git.is_repository() {
            return Err(anyhow!(
                "{} is not inside a git repository",
                self.project_dir.display()
            ));
        }
        let toplevel = git.toplevel()?;
        let project = self
            .project_dir
            .canonicalize()
            .with_context(|| format!("resolve {}", self.project_dir.display()))?;
        let toplevel_canonical = toplevel
            .canonicalize()
            .with_context(|| format!("resolve {}", toplevel.display()))?;
        let subdir = project
            .strip_prefix(&toplevel_canonical)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let git = Git::new(&toplevel_canonical);
        self.locks
            .with_lock(&toplevel_canonical, || git.worktree_add_detached(root))?;
        if let Err(err) = prune_tree(root, &self.skip) {
            let removed = self
                .locks
                .with_lock(&toplevel_canonical, || git.worktree_remove(root));
            if let Err(remove_err) = removed {
                warn!(err = %format!("{remove_err:#}"), "failed to remove unpruned worktree");
            }
            return Err(err);
        }
        debug!(repo = %toplevel_canonical.display(), subdir = %subdir.display(), "worktree added");
        Ok((toplevel_canonical, root.join(subdir)))
    }

    /// Run the agent's task inside the sandbox, creating the sandbox first if needed.
    pub fn execute_in_sandbox(&mut self, agent: &Agent) -> AgentRunResult {
        self.execute_with_cancel(agent, &CancelToken::new())
    }

    /// Like [`execute_in_sandbox`](Self::execute_in_sandbox), stopping early when `cancel` trips.
    ///
    /// Faults are reported in the result, never returned.
    #[instrument(skip_all, fields(agent_id = %agent.id, role = %agent.role))]
    pub fn execute_with_cancel(&mut self, agent: &Agent, cancel: &CancelToken) -> AgentRunResult {
        let started = Instant::now();
        let mut result = match self.run_task(agent, cancel) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "sandbox run failed");
                AgentRunResult::fault(&agent.id, format!("{err:#}"))
            }
        };
        result.sandbox_root = self.root().map(Path::to_path_buf);
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    fn run_task(&mut self, agent: &Agent, cancel: &CancelToken) -> Result<AgentRunResult> {
        if self.provisioned.is_none() {
            self.create(&agent.id)?;
        }
        let context = self
            .context()
            .cloned()
            .ok_or_else(|| anyhow!("sandbox was not created"))?;

        let argv = match &agent.command {
            Some(argv) => argv.clone(),
            None => {
                let mut argv = self.config.launcher.clone();
                argv.push(agent.task.clone());
                argv
            }
        };
        let timeout = agent.timeout_or(self.config.default_timeout());
        let mut extra_env = agent.env.clone();
        extra_env.insert("AGENT_ROLE".to_string(), agent.role.clone());

        let before = snapshot(context.root(), &self.skip)?;
        let output = context.exec_with_env(&argv, &extra_env, timeout, cancel)?;
        let after = snapshot(context.root(), &self.skip)?;
        let artifacts = changed_files(&before, &after);

        let error = if output.timed_out {
            Some(format!(
                "agent '{}' timed out after {}ms",
                agent.id,
                timeout.as_millis()
            ))
        } else if output.cancelled {
            Some(format!("agent '{}' was cancelled", agent.id))
        } else if !output.success() {
            Some(format!(
                "agent '{}' exited with code {}",
                agent.id,
                output.exit_code()
            ))
        } else {
            None
        };
        debug!(
            exit_code = output.exit_code(),
            artifacts = artifacts.len(),
            "task finished"
        );

        Ok(AgentRunResult {
            agent_id: agent.id.clone(),
            success: output.success(),
            output: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            artifacts,
            exit_code: output.exit_code(),
            error,
            sandbox_root: None,
            duration_ms: 0,
        })
    }

    /// Tear the sandbox down. Idempotent; failures are logged and kept in
    /// [`cleanup_errors`](Self::cleanup_errors).
    #[instrument(skip_all)]
    pub fn cleanup(&mut self) {
        let Some(provisioned) = self.provisioned.take() else {
            return;
        };
        match provisioned.strategy {
            IsolationStrategy::GitWorktree => {
                if let Some(repo) = &provisioned.repo {
                    let git = Git::new(repo);
                    let removed = self
                        .locks
                        .with_lock(repo, || git.worktree_remove(&provisioned.root));
                    if let Err(err) = removed {
                        self.record_cleanup_error(format!("{err:#}"));
                    }
                }
                self.remove_root(&provisioned.root);
                if let Some(repo) = &provisioned.repo {
                    let git = Git::new(repo);
                    if let Err(err) = self.locks.with_lock(repo, || git.worktree_prune()) {
                        self.record_cleanup_error(format!("{err:#}"));
                    }
                }
            }
            IsolationStrategy::TempDirectory | IsolationStrategy::Constrained => {
                self.remove_root(&provisioned.root);
            }
        }
        debug!(root = %provisioned.root.display(), "sandbox cleaned up");
    }

    fn remove_root(&mut self, root: &Path) {
        if !root.exists() {
            return;
        }
        if let Err(err) = fs::remove_dir_all(root) {
            self.record_cleanup_error(format!("remove {}: {err}", root.display()));
        }
    }

    fn record_cleanup_error(&mut self, message: String) {
        warn!(error = %message, "sandbox cleanup problem");
        self.cleanup_errors.push(message);
    }
}

impl Drop for AgentSandbox {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(base: &Path, strategy: IsolationStrategy) -> SandboxConfig {
        SandboxConfig {
            base_dir: Some(base.to_path_buf()),
            strategy,
            ..SandboxConfig::default()
        }
    }

    fn project(root: &Path) -> PathBuf {
        let project = root.join("project");
        fs::create_dir_all(project.join("node_modules")).expect("mkdir");
        fs::write(project.join("package.json"), "{}").expect("write");
        fs::write(project.join("debug.log"), "x").expect("write");
        project
    }

    #[test]
    fn create_seeds_filtered_copy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::TempDirectory);
        let mut sandbox = AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");

        let root = sandbox.create("agent-1").expect("create");
        assert!(root.join("package.json").is_file());
        assert!(!root.join("node_modules").exists());
        assert!(!root.join("debug.log").exists());
        assert!(
            root.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("agent-1_"))
        );
        assert!(sandbox.create("agent-1").is_err());
    }

    #[test]
    fn cleanup_is_idempotent_and_removes_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::Constrained);
        let mut sandbox = AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");
        let root = sandbox.create("agent-2").expect("create");
        assert_eq!(sandbox.strategy(), Some(IsolationStrategy::Constrained));

        sandbox.cleanup();
        sandbox.cleanup();
        assert!(!root.exists());
        assert!(sandbox.root().is_none());
        assert!(sandbox.cleanup_errors().is_empty());
    }

    #[test]
    fn drop_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::TempDirectory);
        let root = {
            let mut sandbox =
                AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");
            sandbox.create("agent-3").expect("create")
        };
        assert!(!root.exists());
    }

    #[test]
    fn worktree_falls_back_outside_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::GitWorktree);
        let mut sandbox = AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");
        let root = sandbox.create("agent-7").expect("create");
        assert!(root.join("package.json").is_file());
        assert_eq!(sandbox.strategy(), Some(IsolationStrategy::TempDirectory));
    }

    #[cfg(unix)]
    #[test]
    fn execute_reports_output_env_and_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::TempDirectory);
        let mut sandbox = AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");
        let agent = Agent::new(
            "writer",
            "author",
            "echo \"$SANDBOXED $AGENT_MODE $AGENT_ID $AGENT_ROLE\"; mkdir -p out; echo hi > out/new.txt",
            &project,
        );

        let result = sandbox.execute_in_sandbox(&agent);
        assert!(result.success, "{result:?}");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "1 1 writer author\n");
        assert_eq!(result.artifacts, vec!["out/new.txt".to_string()]);
        assert!(!project.join("out").exists());
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_task_and_reports_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::TempDirectory);
        let mut sandbox = AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");
        let agent = Agent::new("slow", "worker", "sleep 30", &project)
            .with_timeout(Duration::from_millis(200));

        let result = sandbox.execute_in_sandbox(&agent);
        assert!(!result.success);
        assert_eq!(result.exit_code, crate::io::process::TIMEOUT_EXIT_CODE);
        assert!(result.error.as_deref().unwrap_or_default().contains("timed out"));

        let root = result.sandbox_root.expect("root");
        sandbox.cleanup();
        assert!(!root.exists());
    }

    #[test]
    fn spawn_fault_is_a_failed_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = project(temp.path());
        let cfg = config(&temp.path().join("sandboxes"), IsolationStrategy::TempDirectory);
        let mut sandbox = AgentSandbox::new(&project, &cfg, WorktreeLocks::new()).expect("new");
        let mut agent = Agent::new("ghost", "worker", "", &project);
        agent.command = Some(vec!["/definitely/not/a/binary".to_string()]);

        let result = sandbox.execute_in_sandbox(&agent);
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.output.is_empty());
        assert!(result.error.is_some());
    }
}
