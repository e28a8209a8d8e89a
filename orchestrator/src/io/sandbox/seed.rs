//! Seeding sandbox directories from a project tree, and detecting what a run changed.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Entries never copied into a sandbox. `*` matches any run of characters.
pub const DEFAULT_SKIP: &[&str] = &[
    "node_modules",
    ".git",
    ".vibe",
    "dist",
    "build",
    "coverage",
    ".DS_Store",
    "*.log",
];

/// File-name filter applied at every depth of the tree.
#[derive(Debug, Clone)]
pub struct SkipList {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl SkipList {
    /// Built-in entries plus `extra` names or globs.
    pub fn new<I, S>(extra: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut patterns = Vec::new();
        let defaults = DEFAULT_SKIP.iter().map(|s| s.to_string());
        let extra = extra.into_iter().map(|s| s.as_ref().to_string());
        for entry in defaults.chain(extra) {
            if entry.contains('*') || entry.contains('?') {
                patterns.push(glob_to_regex(&entry)?);
            } else {
                exact.insert(entry);
            }
        }
        Ok(Self { exact, patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.exact.contains(name) || self.patterns.iter().any(|re| re.is_match(name))
    }
}

impl Default for SkipList {
    fn default() -> Self {
        let exact = DEFAULT_SKIP
            .iter()
            .filter(|entry| !entry.contains('*'))
            .map(|entry| entry.to_string())
            .collect();
        // Built-in globs are fixed and known to compile.
        let patterns = DEFAULT_SKIP
            .iter()
            .filter(|entry| entry.contains('*'))
            .filter_map(|entry| glob_to_regex(entry).ok())
            .collect();
        Self { exact, patterns }
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|err| anyhow!("invalid skip pattern '{glob}': {err}"))
}

/// Copy `src` into the existing directory `dst`, filtered through `skip`.
///
/// `exclude` (typically the sandbox base directory) is never descended into.
/// Symlinks are recreated rather than followed. Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path, skip: &SkipList, exclude: Option<&Path>) -> Result<usize> {
    let src = src
        .canonicalize()
        .with_context(|| format!("resolve project dir {}", src.display()))?;
    let exclude = exclude.and_then(|path| path.canonicalize().ok());
    let mut copied = 0usize;

    let walker = WalkDir::new(&src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if exclude.as_deref() == Some(entry.path()) {
                return false;
            }
            !skip.matches(&entry.file_name().to_string_lossy())
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(&src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} to {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }
    debug!(copied, src = %src.display(), dst = %dst.display(), "seeded sandbox");
    Ok(copied)
}

/// Delete skip-listed entries from an already populated tree, such as a fresh
/// worktree checkout.
///
/// The root's own `.git` entry is kept. Returns the number of entries removed.
pub fn prune_tree(root: &Path, skip: &SkipList) -> Result<usize> {
    let mut doomed = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if entry.depth() == 0 {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let keep_git_link = entry.depth() == 1 && name == ".git";
        if !keep_git_link && !skip.matches(&name) {
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        if is_dir {
            walker.skip_current_dir();
        }
        if !keep_git_link {
            doomed.push((entry.path().to_path_buf(), is_dir));
        }
    }
    for (path, is_dir) in &doomed {
        let removed = if *is_dir {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.with_context(|| format!("prune {}", path.display()))?;
    }
    debug!(pruned = doomed.len(), root = %root.display(), "pruned skip-listed entries");
    Ok(doomed.len())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
    std::os::unix::fs::symlink(&link, target)
        .with_context(|| format!("create symlink {}", target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _target: &Path) -> Result<()> {
    warn!(path = %src.display(), "skipping symlink on this platform");
    Ok(())
}

/// Size and mtime of every regular file under a root, keyed by relative path.
pub type Snapshot = BTreeMap<PathBuf, (u64, Option<SystemTime>)>;

pub fn snapshot(root: &Path, skip: &SkipList) -> Result<Snapshot> {
    let mut files = Snapshot::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !skip.matches(&entry.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // Files can vanish while a task is still cleaning up after itself.
                warn!(err = %err, "skipping unreadable entry in snapshot");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        files.insert(rel.to_path_buf(), (meta.len(), meta.modified().ok()));
    }
    Ok(files)
}

/// Files present in `after` that are new or differ from `before`, sorted.
pub fn changed_files(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    after
        .iter()
        .filter(|(path, stamp)| before.get(*path) != Some(*stamp))
        .map(|(path, _)| path.to_string_lossy().into_owned())
        .collect()
}
