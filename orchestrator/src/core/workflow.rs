//! Workflow definitions: steps, argument expressions and routing policy.
//!
//! The JSON shape of these types is the persisted workflow document format, so
//! every type here must round-trip through `serde_json` unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::condition;

/// Parameter set passed to `execute`.
pub type Params = BTreeMap<String, Value>;

/// Step id reserved for the compensating step run on a `rollback` failure route.
pub const ROLLBACK_STEP_ID: &str = "rollback";

/// A named, versioned, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<WorkflowStep>,
    /// Groups of step ids that run concurrently.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WorkflowMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSpec>,
}

/// A parameter the workflow declares it accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One tool invocation plus its retry/timeout/condition/routing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<SuccessRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailureRoute>,
}

/// An argument value: a literal, or a reference to a workflow parameter.
///
/// In JSON a string of exactly `"${name}"` is a reference; everything else is
/// a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ArgExpr {
    Literal(Value),
    Param(String),
}

/// Where to go after a step succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SuccessRoute {
    Continue,
    Goto(String),
}

/// Where to go after a step exhausts its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureRoute {
    Continue,
    Abort,
    Rollback,
    Goto(String),
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == id)
    }

    /// The compensating step, if the workflow declares one.
    pub fn compensation_step(&self) -> Option<&WorkflowStep> {
        self.step(ROLLBACK_STEP_ID)
    }

    /// Fill declared parameter defaults and report missing required parameters.
    pub fn bind_params(&self, params: &Params) -> Result<Params, Vec<String>> {
        let mut bound = params.clone();
        let mut missing = Vec::new();
        let specs = self
            .metadata
            .as_ref()
            .map(|meta| meta.parameters.as_slice())
            .unwrap_or_default();
        for spec in specs {
            if bound.contains_key(&spec.name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    bound.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => missing.push(spec.name.clone()),
                None => {}
            }
        }
        if missing.is_empty() {
            Ok(bound)
        } else {
            Err(missing)
        }
    }

    /// Check structural invariants. Returns a list of human-readable violations.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("workflow id must be non-empty".to_string());
        }
        if self.steps.is_empty() {
            errors.push(format!("workflow '{}' declares no steps", self.id));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                errors.push(format!("step '{}' has an empty id", step.name));
            } else if !seen.insert(step.id.as_str()) {
                errors.push(format!("duplicate step id '{}'", step.id));
            }
            if step.tool.trim().is_empty() {
                errors.push(format!("step '{}' has an empty tool", step.id));
            }
            if let Some(source) = &step.condition
                && let Err(err) = condition::parse(source)
            {
                errors.push(format!("step '{}': {err}", step.id));
            }
            if let Some(SuccessRoute::Goto(target)) = &step.on_success
                && self.step(target).is_none()
            {
                errors.push(format!(
                    "step '{}' routes onSuccess to unknown step '{target}'",
                    step.id
                ));
            }
            if let Some(SuccessRoute::Goto(target)) = &step.on_success
                && target == ROLLBACK_STEP_ID
            {
                errors.push(format!(
                    "step '{}' routes onSuccess to the compensation step '{ROLLBACK_STEP_ID}'",
                    step.id
                ));
            }
            if let Some(FailureRoute::Goto(target)) = &step.on_failure
                && self.step(target).is_none()
            {
                errors.push(format!(
                    "step '{}' routes onFailure to unknown step '{target}'",
                    step.id
                ));
            }
        }

        let mut group_of: HashMap<&str, usize> = HashMap::new();
        for (group_no, group) in self.parallel.iter().enumerate() {
            for member in group {
                if self.step(member).is_none() {
                    errors.push(format!(
                        "parallel group {group_no} references unknown step '{member}'"
                    ));
                    continue;
                }
                if member == ROLLBACK_STEP_ID {
                    errors.push(format!(
                        "parallel group {group_no} must not contain the '{ROLLBACK_STEP_ID}' step"
                    ));
                }
                if let Some(previous) = group_of.insert(member.as_str(), group_no)
                    && previous != group_no
                {
                    errors.push(format!(
                        "step '{member}' belongs to parallel groups {previous} and {group_no}"
                    ));
                }
            }
        }
        errors
    }
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tool: tool.into(),
            args: BTreeMap::new(),
            condition: None,
            parallel: None,
            retry: 0,
            timeout_ms: None,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel.unwrap_or(false)
    }

    /// Substitute parameter references; unresolved references stay literal.
    pub fn resolve_args(&self, params: &Params) -> BTreeMap<String, Value> {
        self.args
            .iter()
            .map(|(key, expr)| (key.clone(), expr.resolve(params)))
            .collect()
    }
}

impl ArgExpr {
    pub fn resolve(&self, params: &Params) -> Value {
        match self {
            ArgExpr::Literal(value) => value.clone(),
            ArgExpr::Param(name) => params
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::String(param_ref(name))),
        }
    }
}

fn param_ref(name: &str) -> String {
    format!("${{{name}}}")
}

fn parse_param_ref(text: &str) -> Option<&str> {
    let name = text.strip_prefix("${")?.strip_suffix('}')?;
    condition::is_param_name(name).then_some(name)
}

impl From<Value> for ArgExpr {
    fn from(value: Value) -> Self {
        if let Value::String(text) = &value
            && let Some(name) = parse_param_ref(text)
        {
            return ArgExpr::Param(name.to_string());
        }
        ArgExpr::Literal(value)
    }
}

impl From<ArgExpr> for Value {
    fn from(expr: ArgExpr) -> Self {
        match expr {
            ArgExpr::Literal(value) => value,
            ArgExpr::Param(name) => Value::String(param_ref(&name)),
        }
    }
}

impl From<String> for SuccessRoute {
    fn from(text: String) -> Self {
        match text.trim() {
            "" | "continue" => SuccessRoute::Continue,
            _ => SuccessRoute::Goto(text),
        }
    }
}

impl From<SuccessRoute> for String {
    fn from(route: SuccessRoute) -> Self {
        match route {
            SuccessRoute::Continue => "continue".to_string(),
            SuccessRoute::Goto(target) => target,
        }
    }
}

impl From<String> for FailureRoute {
    fn from(text: String) -> Self {
        match text.trim() {
            "" | "continue" => FailureRoute::Continue,
            "abort" => FailureRoute::Abort,
            "rollback" => FailureRoute::Rollback,
            _ => FailureRoute::Goto(text),
        }
    }
}

impl From<FailureRoute> for String {
    fn from(route: FailureRoute) -> Self {
        match route {
            FailureRoute::Continue => "continue".to_string(),
            FailureRoute::Abort => "abort".to_string(),
            FailureRoute::Rollback => "rollback".to_string(),
            FailureRoute::Goto(target) => target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Workflow {
        let mut install = WorkflowStep::new("install", "npm");
        install
            .args
            .insert("cmd".to_string(), ArgExpr::from(json!("install")));
        install
            .args
            .insert("registry".to_string(), ArgExpr::from(json!("${registry}")));
        install.retry = 2;
        install.on_failure = Some(FailureRoute::Abort);
        let mut deploy = WorkflowStep::new("deploy", "kubectl");
        deploy.condition = Some("${env} == 'prod'".to_string());
        deploy.on_failure = Some(FailureRoute::Rollback);
        deploy.timeout_ms = Some(5_000);
        Workflow {
            id: "cicd".to_string(),
            name: "CI/CD".to_string(),
            version: "1.0.0".to_string(),
            steps: vec![install, deploy, WorkflowStep::new("rollback", "kubectl")],
            parallel: Vec::new(),
            metadata: Some(WorkflowMetadata {
                author: Some("ops".to_string()),
                tags: vec!["ci".to_string()],
                parameters: vec![ParameterSpec {
                    name: "env".to_string(),
                    description: None,
                    required: false,
                    default: Some(json!("staging")),
                }],
            }),
        }
    }

    #[test]
    fn document_round_trips_through_json() {
        let wf = sample();
        let json = serde_json::to_string_pretty(&wf).expect("serialize");
        assert!(json.contains("\"onFailure\": \"abort\""));
        assert!(json.contains("\"${registry}\""));
        assert!(json.contains("\"timeoutMs\": 5000"));
        let back: Workflow = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, wf);
    }

    #[test]
    fn arg_expressions_distinguish_params_from_literals() {
        assert_eq!(
            ArgExpr::from(json!("${name}")),
            ArgExpr::Param("name".to_string())
        );
        assert_eq!(
            ArgExpr::from(json!("prefix-${name}")),
            ArgExpr::Literal(json!("prefix-${name}"))
        );
        assert_eq!(ArgExpr::from(json!("${}")), ArgExpr::Literal(json!("${}")));
        assert_eq!(ArgExpr::from(json!(3)), ArgExpr::Literal(json!(3)));
    }

    #[test]
    fn resolve_args_falls_back_to_literal_reference() {
        let wf = sample();
        let install = wf.step("install").expect("install");
        let resolved = install.resolve_args(&Params::new());
        assert_eq!(resolved["registry"], json!("${registry}"));

        let mut params = Params::new();
        params.insert("registry".to_string(), json!("https://npm.local"));
        let resolved = install.resolve_args(&params);
        assert_eq!(resolved["registry"], json!("https://npm.local"));
        assert_eq!(resolved["cmd"], json!("install"));
    }

    #[test]
    fn routes_parse_from_strings() {
        assert_eq!(FailureRoute::from("abort".to_string()), FailureRoute::Abort);
        assert_eq!(
            FailureRoute::from("cleanup".to_string()),
            FailureRoute::Goto("cleanup".to_string())
        );
        assert_eq!(
            SuccessRoute::from("continue".to_string()),
            SuccessRoute::Continue
        );
    }

    #[test]
    fn bind_params_applies_defaults_and_reports_missing() {
        let mut wf = sample();
        let bound = wf.bind_params(&Params::new()).expect("bind");
        assert_eq!(bound["env"], json!("staging"));

        if let Some(meta) = wf.metadata.as_mut() {
            meta.parameters.push(ParameterSpec {
                name: "token".to_string(),
                description: None,
                required: true,
                default: None,
            });
        }
        let missing = wf.bind_params(&Params::new()).unwrap_err();
        assert_eq!(missing, vec!["token".to_string()]);
    }

    #[test]
    fn validate_reports_structural_errors() {
        let mut wf = sample();
        wf.steps.push(WorkflowStep::new("install", "npm"));
        wf.steps[1].on_success = Some(SuccessRoute::Goto("nowhere".to_string()));
        wf.steps[0].condition = Some("(".to_string());
        wf.parallel = vec![
            vec!["install".to_string(), "ghost".to_string()],
            vec!["install".to_string(), "rollback".to_string()],
        ];

        let errors = wf.validate();
        let has = |needle: &str| errors.iter().any(|err| err.contains(needle));
        assert!(has("duplicate step id 'install'"), "{errors:?}");
        assert!(has("unknown step 'nowhere'"), "{errors:?}");
        assert!(has("invalid condition"), "{errors:?}");
        assert!(has("unknown step 'ghost'"), "{errors:?}");
        assert!(has("belongs to parallel groups 0 and 1"), "{errors:?}");
        assert!(has("must not contain the 'rollback' step"), "{errors:?}");
    }

    #[test]
    fn valid_workflow_has_no_errors() {
        assert!(sample().validate().is_empty());
    }
}
