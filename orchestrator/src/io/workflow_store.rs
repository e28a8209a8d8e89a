//! Workflow document load/save helpers with schema + structural validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::workflow::Workflow;
use crate::io::write_atomic;

/// JSON Schema for persisted workflow documents.
pub const WORKFLOW_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/workflow.v1.schema.json"
));

/// Parse and validate a workflow document: schema conformance + structural checks.
pub fn parse_workflow(raw: &str) -> Result<Workflow> {
    let instance: Value = serde_json::from_str(raw).context("parse workflow json")?;
    validate_schema(&instance)?;
    let workflow: Workflow =
        serde_json::from_value(instance).context("parse workflow as v1 struct")?;
    let errors = workflow.validate();
    if !errors.is_empty() {
        bail!("workflow violations:\n- {}", errors.join("\n- "));
    }
    Ok(workflow)
}

/// Load and validate a workflow from disk.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read workflow {}", path.display()))?;
    let workflow =
        parse_workflow(&raw).with_context(|| format!("load workflow {}", path.display()))?;
    debug!(workflow_id = %workflow.id, steps = workflow.steps.len(), "workflow loaded");
    Ok(workflow)
}

/// Atomically write a workflow document (pretty JSON, trailing newline).
pub fn save_workflow(path: &Path, workflow: &Workflow) -> Result<()> {
    let errors = workflow.validate();
    if !errors.is_empty() {
        bail!(
            "refusing to save invalid workflow '{}':\n- {}",
            workflow.id,
            errors.join("\n- ")
        );
    }
    let mut buf = serde_json::to_string_pretty(workflow).context("serialize workflow json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(WORKFLOW_SCHEMA).context("parse workflow schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::{ArgExpr, FailureRoute};

    const CICD: &str = r#"{
  "id": "cicd",
  "name": "CI/CD",
  "steps": [
    {"id": "install", "name": "Install", "tool": "npm", "args": {"cmd": "install"}, "retry": 3, "onFailure": "abort"},
    {"id": "lint", "name": "Lint", "tool": "npm", "args": {"cmd": "run lint"}, "parallel": true},
    {"id": "test", "name": "Test", "tool": "npm", "args": {"cmd": "test", "env": "${env}"}, "parallel": true},
    {"id": "deploy", "name": "Deploy", "tool": "deploy", "timeoutMs": 60000, "onFailure": "rollback"},
    {"id": "rollback", "name": "Rollback", "tool": "deploy", "args": {"undo": true}}
  ],
  "metadata": {"parameters": [{"name": "env", "default": "staging"}]}
}"#;

    #[test]
    fn parses_document() {
        let wf = parse_workflow(CICD).expect("parse");
        assert_eq!(wf.version, "1.0.0");
        assert_eq!(wf.steps.len(), 5);
        let test = wf.step("test").expect("test step");
        assert_eq!(test.args["env"], ArgExpr::Param("env".to_string()));
        assert_eq!(
            wf.step("deploy").and_then(|s| s.on_failure.clone()),
            Some(FailureRoute::Rollback)
        );
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("cicd.json");
        let wf = parse_workflow(CICD).expect("parse");
        save_workflow(&path, &wf).expect("save");
        let loaded = load_workflow(&path).expect("load");
        assert_eq!(loaded, wf);
    }

    #[test]
    fn schema_rejects_unknown_step_fields() {
        let raw = r#"{"id":"w","name":"w","steps":[{"id":"a","name":"a","tool":"t","retries":2}]}"#;
        let err = parse_workflow(raw).expect_err("schema violation");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn structural_violations_are_reported() {
        let raw = r#"{"id":"w","name":"w","steps":[{"id":"a","name":"a","tool":"t","onFailure":"nowhere"}]}"#;
        let err = parse_workflow(raw).expect_err("unknown target");
        assert!(format!("{err:#}").contains("unknown step 'nowhere'"));
    }
}
