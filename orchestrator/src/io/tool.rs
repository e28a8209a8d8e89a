//! Tool executor and approval seams.
//!
//! The workflow engine never runs tools itself: every step is resolved to a
//! [`ToolCall`] and handed to a [`ToolExecutor`]. Tests use scripted executors
//! that return predetermined results without spawning processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::ToolResult;
use crate::io::config::ToolConfig;
use crate::io::process::run_command_with_timeout;

/// One resolved step invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub step_id: String,
    pub tool: String,
    /// Arguments with parameter references already substituted.
    pub args: BTreeMap<String, Value>,
}

/// Per-call context handed to the tool executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Execution id the call belongs to.
    pub session_id: String,
    /// Whether the approval gate allowed this call.
    pub approved: bool,
    pub dry_run: bool,
    /// Whether the call runs inside an agent sandbox.
    pub sandbox: bool,
    /// Directory commands should run in (process cwd when `None`).
    pub working_dir: Option<PathBuf>,
    /// Tripped on execution cancel or attempt timeout.
    pub cancel: CancelToken,
}

/// Abstraction over tool backends.
///
/// `Ok` with a failed [`ToolResult`] is an ordinary step failure; `Err` is a
/// fault in the executor itself, which the engine also records as a failed
/// attempt.
pub trait ToolExecutor: Send + Sync {
    fn execute(&self, call: &ToolCall, context: &ExecutionContext) -> Result<ToolResult>;
}

/// Yes/no gate consulted before each step.
pub trait ApprovalGate: Send + Sync {
    fn approve(&self, call: &ToolCall) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysApprove;

impl ApprovalGate for AlwaysApprove {
    fn approve(&self, _call: &ToolCall) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl ApprovalGate for DenyAll {
    fn approve(&self, _call: &ToolCall) -> bool {
        false
    }
}

/// Tool executor backed by configured command templates.
///
/// `{name}` placeholders in the template are replaced by the matching
/// argument, and every argument is also exported as `TOOL_ARG_<NAME>`.
#[derive(Debug, Clone)]
pub struct CommandToolExecutor {
    tools: BTreeMap<String, ToolConfig>,
    output_limit_bytes: usize,
}

impl CommandToolExecutor {
    pub fn new(tools: BTreeMap<String, ToolConfig>, output_limit_bytes: usize) -> Self {
        Self {
            tools,
            output_limit_bytes,
        }
    }

    fn argv(template: &[String], args: &BTreeMap<String, Value>) -> Vec<String> {
        template
            .iter()
            .map(|part| {
                args.iter().fold(part.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{name}}}"), &render_arg(value))
                })
            })
            .collect()
    }
}

impl ToolExecutor for CommandToolExecutor {
    #[instrument(skip_all, fields(tool = %call.tool, step = %call.step_id, dry_run = context.dry_run))]
    fn execute(&self, call: &ToolCall, context: &ExecutionContext) -> Result<ToolResult> {
        let Some(tool) = self.tools.get(&call.tool) else {
            warn!("unknown tool");
            return Ok(ToolResult::failed(format!("unknown tool '{}'", call.tool)));
        };
        if tool.requires_approval && !context.approved {
            warn!("tool call not approved");
            return Ok(ToolResult::failed(format!(
                "tool '{}' requires approval",
                call.tool
            )));
        }

        let argv = Self::argv(&tool.command, &call.args);
        if context.dry_run {
            debug!(?argv, "dry run, not spawning");
            return Ok(ToolResult::ok(format!("[dry-run] {}", argv.join(" "))));
        }
        let Some((program, rest)) = argv.split_first() else {
            return Ok(ToolResult::failed(format!(
                "tool '{}' has an empty command",
                call.tool
            )));
        };

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.env("ORCHESTRATOR_SESSION_ID", &context.session_id);
        cmd.env("ORCHESTRATOR_STEP_ID", &call.step_id);
        for (name, value) in &call.args {
            cmd.env(env_name(name), render_arg(value));
        }
        if let Some(dir) = &context.working_dir {
            cmd.current_dir(dir);
        }

        let output = run_command_with_timeout(
            cmd,
            None,
            None,
            self.output_limit_bytes,
            &context.cancel,
        )
        .with_context(|| format!("run tool '{}'", call.tool))?;

        if output.cancelled {
            return Ok(ToolResult {
                success: false,
                output: output.stdout_lossy(),
                error: Some(format!("tool '{}' was cancelled", call.tool)),
            });
        }
        if !output.success() {
            let stderr = output.stderr_lossy();
            return Ok(ToolResult {
                success: false,
                output: output.stdout_lossy(),
                error: Some(format!(
                    "tool '{}' exited with code {}: {}",
                    call.tool,
                    output.exit_code(),
                    stderr.trim()
                )),
            });
        }
        Ok(ToolResult::ok(output.stdout_lossy()))
    }
}

fn render_arg(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn env_name(arg: &str) -> String {
    let mut name = String::from("TOOL_ARG_");
    name.extend(arg.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}
