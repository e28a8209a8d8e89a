//! Shared deterministic types for orchestration core logic.
//!
//! These types define stable contracts between the workflow engine, the tool
//! executor seam and the execution record log. They must not depend on I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one tool invocation, as reported by a tool executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Human-readable failure reason (falls back to a generic message).
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("tool reported failure")
    }
}

/// Lifecycle of a workflow execution.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`; terminal states
/// never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Record of one visited step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub tool: String,
    /// Result of the last attempt.
    pub result: ToolResult,
    /// Number of attempts actually made (1-indexed).
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Runtime record of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Step currently (or most recently) visited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Visited steps in visitation order. A step revisited through routing
    /// replaces its earlier record in place.
    #[serde(default)]
    pub results: Vec<StepRecord>,
    /// Record of the compensating `rollback` step, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<StepRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            status: ExecutionStatus::Pending,
            current_step: None,
            results: Vec::new(),
            compensation: None,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Latest recorded result for `step_id`.
    pub fn result(&self, step_id: &str) -> Option<&ToolResult> {
        self.results
            .iter()
            .find(|record| record.step_id == step_id)
            .map(|record| &record.result)
    }

    /// Visited step ids in visitation order.
    pub fn visited(&self) -> Vec<&str> {
        self.results
            .iter()
            .map(|record| record.step_id.as_str())
            .collect()
    }

    /// Insert or replace the record for a step, keeping first-visit order.
    pub fn record(&mut self, record: StepRecord) {
        if let Some(existing) = self
            .results
            .iter_mut()
            .find(|existing| existing.step_id == record.step_id)
        {
            *existing = record;
        } else {
            self.results.push(record);
        }
    }

    /// Move to a terminal state. Terminal executions are never modified again.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
    }
}
