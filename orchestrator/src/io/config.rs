//! Orchestrator configuration stored as TOML (default `orchestrator.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::agent::IsolationStrategy;

/// Default config file name looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "orchestrator.toml";

/// Orchestrator configuration (TOML).
///
/// Missing fields default to values suitable for local runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running parallel-group members and agents.
    pub max_concurrency: usize,

    /// Timeout applied to steps that do not declare one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_ms: Option<u64>,

    /// Step visits allowed per execution before goto routing is treated as a loop.
    pub max_step_visits: usize,

    /// Delay between retry attempts of a failing step.
    pub retry_backoff_ms: u64,

    /// Finished executions kept in memory; the oldest are evicted first.
    pub execution_history: usize,

    pub sandbox: SandboxConfig,

    /// Command-backed tools, keyed by tool name.
    pub tools: BTreeMap<String, ToolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory sandbox roots are created under (defaults to the system temp dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,

    pub strategy: IsolationStrategy,

    /// Program the task description is appended to (e.g. `["sh","-c"]`).
    pub launcher: Vec<String>,

    /// Agent timeout when the agent declares none.
    pub default_timeout_secs: u64,

    /// Truncate agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Names or `*` globs skipped when seeding, on top of the built-in list.
    pub extra_skip: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    /// Argv template; `{name}` placeholders are replaced by step arguments.
    pub command: Vec<String>,

    /// Ask the approval gate before running this tool.
    pub requires_approval: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            strategy: IsolationStrategy::TempDirectory,
            launcher: vec!["sh".to_string(), "-c".to_string()],
            default_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            extra_skip: Vec::new(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_step_timeout_ms: None,
            max_step_visits: 1_000,
            retry_backoff_ms: 0,
            execution_history: 1_000,
            sandbox: SandboxConfig::default(),
            tools: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("orchestrator-sandboxes"))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be > 0"));
        }
        if self.max_step_visits == 0 {
            return Err(anyhow!("max_step_visits must be > 0"));
        }
        if self.execution_history == 0 {
            return Err(anyhow!("execution_history must be > 0"));
        }
        if self.default_step_timeout_ms == Some(0) {
            return Err(anyhow!("default_step_timeout_ms must be > 0 when set"));
        }
        if self.sandbox.default_timeout_secs == 0 {
            return Err(anyhow!("sandbox.default_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.launcher.is_empty() || self.sandbox.launcher[0].trim().is_empty() {
            return Err(anyhow!("sandbox.launcher must be a non-empty array"));
        }
        for (name, tool) in &self.tools {
            if tool.command.is_empty() || tool.command[0].trim().is_empty() {
                return Err(anyhow!("tools.{name}.command must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
