//! Execution records written as `<dir>/<execution_id>.json` for auditing.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::WorkflowExecution;
use crate::io::write_atomic;

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    dir: PathBuf,
}

impl ExecutionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }

    /// Write (or replace) the record for an execution.
    pub fn write(&self, execution: &WorkflowExecution) -> Result<PathBuf> {
        let path = self.record_path(&execution.execution_id);
        let mut buf = serde_json::to_string_pretty(execution).context("serialize execution")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(path = %path.display(), status = ?execution.status, "execution record written");
        Ok(path)
    }

    pub fn read(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let path = self.record_path(execution_id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read execution record {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse execution record {}", path.display()))
    }

    /// Ids of all recorded executions, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in
            fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))?
        {
            let path = entry
                .with_context(|| format!("read entry in {}", self.dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem()
            {
                ids.push(stem.to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
