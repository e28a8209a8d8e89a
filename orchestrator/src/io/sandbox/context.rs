//! File and process operations bound to one sandbox directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::instrument;

use crate::cancel::CancelToken;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Working directory plus isolated environment for one sandbox.
///
/// Paths given to the file operations are relative to the sandbox root and may
/// not escape it.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    root: PathBuf,
    env: BTreeMap<String, String>,
    output_limit_bytes: usize,
}

impl SandboxContext {
    pub(crate) fn new(
        root: PathBuf,
        env: BTreeMap<String, String>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            root,
            env,
            output_limit_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Variables injected into every process spawned in this sandbox.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Map a sandbox-relative path to an absolute one, rejecting escapes.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let mut clean = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !clean.pop() {
                        bail!("path {} escapes the sandbox", relative.display());
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("path {} must be relative to the sandbox", relative.display());
                }
            }
        }
        Ok(self.root.join(clean))
    }

    pub fn read_file(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn read_to_string(&self, relative: impl AsRef<Path>) -> Result<String> {
        let path = self.resolve(relative)?;
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Write a file, creating missing parent directories.
    pub fn write_file(&self, relative: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Run `argv` in the sandbox root with the sandbox environment.
    pub fn exec(
        &self,
        argv: &[String],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput> {
        self.exec_with_env(argv, &BTreeMap::new(), timeout, cancel)
    }

    /// Like [`exec`](Self::exec), with `extra_env` layered over the sandbox environment.
    #[instrument(skip_all, fields(root = %self.root.display(), timeout_ms = timeout.as_millis() as u64))]
    pub fn exec_with_env(
        &self,
        argv: &[String],
        extra_env: &BTreeMap<String, String>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .envs(&self.env)
            .envs(extra_env);
        run_command_with_timeout(cmd, None, Some(timeout), self.output_limit_bytes, cancel)
            .with_context(|| format!("run {program} in sandbox"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(root: &Path) -> SandboxContext {
        let mut env = BTreeMap::new();
        env.insert("SANDBOXED".to_string(), "1".to_string());
        SandboxContext::new(root.to_path_buf(), env, 10_000)
    }

    #[test]
    fn write_then_read_returns_same_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        ctx.write_file("nested/dir/out.bin", [0u8, 159, 146, 150])
            .expect("write");
        assert_eq!(
            ctx.read_file("nested/dir/out.bin").expect("read"),
            vec![0u8, 159, 146, 150]
        );
    }

    #[test]
    fn rejects_escaping_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        assert!(ctx.resolve("../outside.txt").is_err());
        assert!(ctx.resolve("/etc/passwd").is_err());
        assert!(ctx.write_file("a/../../b", "x").is_err());
        assert_eq!(
            ctx.resolve("a/./b/../c").expect("resolve"),
            temp.path().join("a").join("c")
        );
    }

    #[cfg(unix)]
    #[test]
    fn exec_runs_in_root_with_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context(temp.path());
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf '%s' \"$SANDBOXED\" > flag.txt".to_string(),
        ];
        let out = ctx
            .exec(&argv, Duration::from_secs(10), &CancelToken::new())
            .expect("exec");
        assert!(out.success());
        assert_eq!(ctx.read_to_string("flag.txt").expect("read"), "1");
    }
}
