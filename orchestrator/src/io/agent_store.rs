//! Agent batch documents: a JSON array of agent descriptors.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::core::agent::Agent;

/// Parse an agent batch.
///
/// Relative working directories are resolved against `base_dir`.
pub fn parse_agents(raw: &str, base_dir: &Path) -> Result<Vec<Agent>> {
    let mut agents: Vec<Agent> = serde_json::from_str(raw).context("parse agents json")?;
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for agent in &mut agents {
        if agent.id.trim().is_empty() {
            errors.push("agent id must be non-empty".to_string());
        } else if !seen.insert(agent.id.clone()) {
            errors.push(format!("duplicate agent id '{}'", agent.id));
        }
        if agent.command.as_ref().is_some_and(Vec::is_empty) {
            errors.push(format!("agent '{}' has an empty command", agent.id));
        }
        if agent.context.working_dir.is_relative() {
            agent.context.working_dir = base_dir.join(&agent.context.working_dir);
        }
    }
    if !errors.is_empty() {
        bail!("agent violations:\n- {}", errors.join("\n- "));
    }
    Ok(agents)
}

pub fn load_agents(path: &Path) -> Result<Vec<Agent>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read agents {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_agents(&raw, base_dir).with_context(|| format!("load agents {}", path.display()))
}
