//! Per-repository serialization of git worktree operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Registry of one mutex per repository top-level directory.
///
/// Cloning shares the registry. Owned by whoever creates sandboxes (usually the
/// orchestrator); there is no process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct WorktreeLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl WorktreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex guarding worktree add/remove for `repo`.
    pub fn lock_for(&self, repo: &Path) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(repo.to_path_buf()).or_default().clone()
    }

    /// Run `f` while holding the lock for `repo`.
    pub fn with_lock<R>(&self, repo: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
