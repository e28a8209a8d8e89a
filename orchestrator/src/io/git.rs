//! Git adapter used to provision worktree sandboxes.
//!
//! Only the handful of plumbing calls the sandbox needs are wrapped; everything
//! goes through the `git` binary so behavior matches the user's installation.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True if `workdir` lies inside a git working tree.
    ///
    /// A missing `git` binary counts as "not a repository".
    pub fn is_repository(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true",
            Err(err) => {
                debug!(err = %err, "git unavailable");
                false
            }
        }
    }

    /// Absolute path of the repository's top-level directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Add a detached worktree of the current HEAD at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_add_detached(&self, path: &Path) -> Result<()> {
        debug!("adding detached worktree");
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--detach", path.as_ref(), "HEAD"])?;
        Ok(())
    }

    /// Remove a worktree, discarding any local modifications in it.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        debug!("removing worktree");
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", path.as_ref()])?;
        Ok(())
    }

    /// Drop administrative entries for worktrees whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        if let Err(err) = self.run_checked(&["worktree", "prune"]) {
            warn!(err = %err, "worktree prune failed");
            return Err(err);
        }
        Ok(())
    }

    /// Paths of all worktrees registered with the repository (main one included).
    pub fn worktree_list(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(|path| PathBuf::from(path.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain() {
        let listing = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /tmp/wt\nHEAD abc\ndetached\n";
        assert_eq!(
            parse_worktree_list(listing),
            vec![PathBuf::from("/repo"), PathBuf::from("/tmp/wt")]
        );
    }

    #[test]
    fn plain_directory_is_not_a_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repository());
    }
}
