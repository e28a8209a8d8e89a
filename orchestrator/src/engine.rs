//! Workflow executor: owns workflow definitions and drives executions.
//!
//! Each execution walks the workflow's [`ExecutionPlan`] one unit at a time.
//! A unit is a single step or a parallel group. Steps are resolved to
//! [`ToolCall`]s and handed to the configured [`ToolExecutor`], retried and
//! routed according to the step's policy.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::condition;
use crate::core::plan::{ExecutionPlan, Unit};
use crate::core::types::{ExecutionStatus, StepRecord, ToolResult, WorkflowExecution};
use crate::core::workflow::{FailureRoute, Params, SuccessRoute, Workflow, WorkflowStep};
use crate::ids::execution_id;
use crate::io::config::OrchestratorConfig;
use crate::io::execution_log::ExecutionLog;
use crate::io::tool::{ApprovalGate, ExecutionContext, ToolCall, ToolExecutor};
use crate::pool::run_bounded;

/// Unknown workflow or execution id.
///
/// Returned inside `anyhow::Error`; callers can `downcast_ref::<LookupError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),
    #[error("unknown execution '{0}'")]
    UnknownExecution(String),
}

/// Engine-wide execution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound on concurrently running members of a parallel group.
    pub max_concurrency: usize,
    /// Applied to steps that declare no timeout.
    pub default_step_timeout: Option<Duration>,
    /// Step visits allowed per execution.
    pub max_step_visits: usize,
    /// Delay between attempts of a failing step.
    pub retry_backoff: Duration,
    /// Finished executions kept for `get_execution`/`list_executions`.
    pub execution_history: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for EngineSettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_concurrency: cfg.max_concurrency,
            default_step_timeout: cfg.default_step_timeout_ms.map(Duration::from_millis),
            max_step_visits: cfg.max_step_visits,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            execution_history: cfg.execution_history,
        }
    }
}

/// Per-execution flags forwarded to the tool executor.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Approval used when the engine has no approval gate.
    pub approved: bool,
    pub dry_run: bool,
    pub sandbox: bool,
    pub working_dir: Option<PathBuf>,
    /// External cancellation, in addition to [`WorkflowEngine::cancel`].
    pub cancel: Option<CancelToken>,
}

/// What the loop does after a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    Next,
    Jump(String),
    Halt(String),
    Rollback(String),
}

/// A registered workflow with its step conditions parsed once.
#[derive(Debug)]
struct PreparedWorkflow {
    workflow: Workflow,
    conditions: HashMap<String, condition::Expr>,
}

impl PreparedWorkflow {
    fn new(workflow: Workflow) -> Result<Self> {
        let mut conditions = HashMap::new();
        for step in &workflow.steps {
            if let Some(source) = &step.condition {
                let expr = condition::parse(source)
                    .with_context(|| format!("step '{}'", step.id))?;
                conditions.insert(step.id.clone(), expr);
            }
        }
        Ok(Self {
            workflow,
            conditions,
        })
    }

    fn enabled(&self, step: &WorkflowStep, params: &Params) -> bool {
        self.conditions
            .get(&step.id)
            .is_none_or(|expr| expr.holds(params))
    }
}

/// Executions by id, remembered in start order.
///
/// Once more than `capacity` are held, the oldest finished ones are evicted.
/// Running executions are never evicted.
#[derive(Debug)]
struct ExecutionHistory {
    capacity: usize,
    by_id: HashMap<String, WorkflowExecution>,
    order: VecDeque<String>,
}

impl ExecutionHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            by_id: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn upsert(&mut self, execution: &WorkflowExecution) {
        match self.by_id.get_mut(&execution.execution_id) {
            Some(slot) => *slot = execution.clone(),
            None => {
                self.order.push_back(execution.execution_id.clone());
                self.by_id
                    .insert(execution.execution_id.clone(), execution.clone());
            }
        }
        self.evict();
    }

    fn evict(&mut self) {
        while self.by_id.len() > self.capacity {
            let by_id = &self.by_id;
            let Some(pos) = self
                .order
                .iter()
                .position(|id| by_id.get(id).is_some_and(|exec| exec.status.is_terminal()))
            else {
                return;
            };
            if let Some(id) = self.order.remove(pos) {
                self.by_id.remove(&id);
            }
        }
    }

    fn get(&self, execution_id: &str) -> Option<&WorkflowExecution> {
        self.by_id.get(execution_id)
    }

    fn in_order(&self) -> Vec<WorkflowExecution> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }
}

/// Registry of workflows and executions plus the loop that drives them.
pub struct WorkflowEngine {
    executor: Arc<dyn ToolExecutor>,
    approval: Option<Arc<dyn ApprovalGate>>,
    settings: EngineSettings,
    log: Option<ExecutionLog>,
    workflows: Mutex<HashMap<String, Arc<PreparedWorkflow>>>,
    executions: Mutex<ExecutionHistory>,
    running: Mutex<HashMap<String, CancelToken>>,
}

impl WorkflowEngine {
    pub fn new(executor: Arc<dyn ToolExecutor>, settings: EngineSettings) -> Self {
        Self {
            executor,
            approval: None,
            log: None,
            workflows: Mutex::new(HashMap::new()),
            executions: Mutex::new(ExecutionHistory::new(settings.execution_history)),
            running: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Consult `gate` before every step to set the call's approval flag.
    pub fn with_approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Write every finished execution to `log`.
    pub fn with_execution_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Register (or replace) a workflow after validating it.
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub fn register(&self, workflow: Workflow) -> Result<()> {
        let errors = workflow.validate();
        if !errors.is_empty() {
            bail!(
                "invalid workflow '{}':\n- {}",
                workflow.id,
                errors.join("\n- ")
            );
        }
        let id = workflow.id.clone();
        let prepared = PreparedWorkflow::new(workflow)
            .with_context(|| format!("invalid workflow '{id}'"))?;
        let replaced = lock(&self.workflows)
            .insert(id, Arc::new(prepared))
            .is_some();
        debug!(replaced, "workflow registered");
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> Option<Workflow> {
        lock(&self.workflows)
            .get(workflow_id)
            .map(|prepared| prepared.workflow.clone())
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        lock(&self.executions).get(execution_id).cloned()
    }

    /// Retained executions in start order.
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        lock(&self.executions).in_order()
    }

    /// Request cancellation of a running execution.
    ///
    /// Returns `Ok(false)` when the execution already finished.
    pub fn cancel(&self, execution_id: &str) -> Result<bool> {
        if let Some(token) = lock(&self.running).get(execution_id) {
            info!(execution_id, "cancelling execution");
            token.cancel();
            return Ok(true);
        }
        if self.get_execution(execution_id).is_some() {
            return Ok(false);
        }
        Err(LookupError::UnknownExecution(execution_id.to_string()).into())
    }

    /// Run a registered workflow to completion.
    ///
    /// Only an unknown workflow id is an error; every failure while running is
    /// captured in the returned execution.
    pub fn execute(
        &self,
        workflow_id: &str,
        params: Params,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution> {
        let prepared = lock(&self.workflows)
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| LookupError::UnknownWorkflow(workflow_id.to_string()))?;

        let mut execution = WorkflowExecution::new(&prepared.workflow.id, execution_id());
        let cancel = options.cancel.clone().unwrap_or_default().child();
        execution.status = ExecutionStatus::Running;
        lock(&self.running).insert(execution.execution_id.clone(), cancel.clone());
        self.publish(&execution);

        self.drive(&prepared, params, &options, &cancel, &mut execution);

        lock(&self.running).remove(&execution.execution_id);
        self.publish(&execution);
        if let Some(log) = &self.log
            && let Err(err) = log.write(&execution)
        {
            warn!(err = %format!("{err:#}"), "failed to write execution record");
        }
        Ok(execution)
    }

    #[instrument(skip_all, fields(workflow_id = %prepared.workflow.id, execution_id = %execution.execution_id))]
    fn drive(
        &self,
        prepared: &PreparedWorkflow,
        params: Params,
        options: &ExecuteOptions,
        cancel: &CancelToken,
        execution: &mut WorkflowExecution,
    ) {
        info!("execution started");
        let workflow = &prepared.workflow;
        let params = match workflow.bind_params(&params) {
            Ok(params) => params,
            Err(missing) => {
                execution.finish(
                    ExecutionStatus::Failed,
                    Some(format!(
                        "missing required parameters: {}",
                        missing.join(", ")
                    )),
                );
                return;
            }
        };

        let plan = ExecutionPlan::build(workflow);
        let mut unit_idx = 0;
        let mut visits = 0usize;
        loop {
            if cancel.is_cancelled() {
                execution.finish(
                    ExecutionStatus::Cancelled,
                    Some("execution cancelled".to_string()),
                );
                break;
            }
            let Some(unit) = plan.units.get(unit_idx) else {
                execution.finish(ExecutionStatus::Completed, None);
                break;
            };
            visits += unit.steps().len();
            if visits > self.settings.max_step_visits {
                execution.finish(
                    ExecutionStatus::Failed,
                    Some(format!(
                        "step visit limit of {} exceeded; routing loops",
                        self.settings.max_step_visits
                    )),
                );
                break;
            }

            let flow = match unit {
                Unit::Single(idx) => self.run_single(
                    prepared,
                    &workflow.steps[*idx],
                    &params,
                    options,
                    cancel,
                    execution,
                ),
                Unit::Group(members) => {
                    self.run_group(prepared, members, &params, options, cancel, execution)
                }
            };
            self.publish(execution);

            // A step cut short by cancellation reports failure; its route must not apply.
            if cancel.is_cancelled() {
                continue;
            }

            match flow {
                Flow::Next => unit_idx += 1,
                Flow::Jump(target) => match plan.unit_index(&target) {
                    Some(next) => {
                        debug!(target = %target, "routing to step");
                        unit_idx = next;
                    }
                    None => {
                        execution.finish(
                            ExecutionStatus::Failed,
                            Some(format!("step '{target}' cannot be routed to")),
                        );
                        break;
                    }
                },
                Flow::Halt(error) => {
                    execution.finish(ExecutionStatus::Failed, Some(error));
                    break;
                }
                Flow::Rollback(error) => {
                    self.compensate(workflow, &params, options, cancel, execution);
                    execution.finish(ExecutionStatus::Failed, Some(error));
                    break;
                }
            }
        }
        info!(status = ?execution.status, steps = execution.results.len(), "execution finished");
    }

    fn run_single(
        &self,
        prepared: &PreparedWorkflow,
        step: &WorkflowStep,
        params: &Params,
        options: &ExecuteOptions,
        cancel: &CancelToken,
        execution: &mut WorkflowExecution,
    ) -> Flow {
        if !prepared.enabled(step, params) {
            debug!(step = %step.id, "condition false, skipping step");
            return Flow::Next;
        }
        execution.current_step = Some(step.id.clone());
        let record = self.run_step(step, params, options, &execution.execution_id, cancel);
        let succeeded = record.result.success;
        let error = failure_message(&record);
        execution.record(record);

        if succeeded {
            return match &step.on_success {
                Some(SuccessRoute::Goto(target)) => Flow::Jump(target.clone()),
                Some(SuccessRoute::Continue) | None => Flow::Next,
            };
        }
        match &step.on_failure {
            Some(FailureRoute::Abort) => Flow::Halt(error),
            Some(FailureRoute::Rollback) => Flow::Rollback(error),
            Some(FailureRoute::Goto(target)) => Flow::Jump(target.clone()),
            Some(FailureRoute::Continue) | None => {
                debug!(step = %step.id, "step failed, continuing");
                Flow::Next
            }
        }
    }

    /// Run group members concurrently, then apply failure routes in declaration order.
    ///
    /// Goto routes do not apply inside a group.
    fn run_group(
        &self,
        prepared: &PreparedWorkflow,
        members: &[usize],
        params: &Params,
        options: &ExecuteOptions,
        cancel: &CancelToken,
        execution: &mut WorkflowExecution,
    ) -> Flow {
        let mut enabled = Vec::new();
        for &idx in members {
            let step = &prepared.workflow.steps[idx];
            if prepared.enabled(step, params) {
                enabled.push(step);
            } else {
                debug!(step = %step.id, "condition false, skipping step");
            }
        }
        if enabled.is_empty() {
            return Flow::Next;
        }

        let limit = enabled.len().min(self.settings.max_concurrency);
        debug!(members = enabled.len(), limit, "running parallel group");
        let execution_id = execution.execution_id.clone();
        let records = run_bounded(enabled.clone(), limit, |step| {
            self.run_step(step, params, options, &execution_id, cancel)
        });

        let mut flow = Flow::Next;
        for (step, record) in enabled.iter().zip(records) {
            execution.current_step = Some(step.id.clone());
            let error = failure_message(&record);
            let failed = !record.result.success;
            execution.record(record);
            if !failed || flow != Flow::Next {
                continue;
            }
            flow = match &step.on_failure {
                Some(FailureRoute::Abort) => Flow::Halt(error),
                Some(FailureRoute::Rollback) => Flow::Rollback(error),
                _ => Flow::Next,
            };
        }
        flow
    }

    fn compensate(
        &self,
        workflow: &Workflow,
        params: &Params,
        options: &ExecuteOptions,
        cancel: &CancelToken,
        execution: &mut WorkflowExecution,
    ) {
        let Some(step) = workflow.compensation_step() else {
            warn!("failure routed to rollback but no rollback step is declared");
            return;
        };
        info!(step = %step.id, "running compensation step");
        let record = self.run_step(step, params, options, &execution.execution_id, cancel);
        if !record.result.success {
            warn!(error = %record.result.error_message(), "compensation step failed");
        }
        execution.compensation = Some(record);
    }

    /// Invoke a step with its attempt budget and return the last attempt's record.
    #[instrument(skip_all, fields(step = %step.id, tool = %step.tool))]
    fn run_step(
        &self,
        step: &WorkflowStep,
        params: &Params,
        options: &ExecuteOptions,
        execution_id: &str,
        cancel: &CancelToken,
    ) -> StepRecord {
        let call = ToolCall {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            args: step.resolve_args(params),
        };
        let approved = match &self.approval {
            Some(gate) => gate.approve(&call),
            None => options.approved,
        };
        let timeout = step.timeout().or(self.settings.default_step_timeout);
        let budget = step.retry.saturating_add(1);

        let started_at = Utc::now();
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let context = ExecutionContext {
                session_id: execution_id.to_string(),
                approved,
                dry_run: options.dry_run,
                sandbox: options.sandbox,
                working_dir: options.working_dir.clone(),
                cancel: cancel.child(),
            };
            let result = self.invoke(&call, context, timeout);
            if result.success || attempts >= budget || cancel.is_cancelled() {
                break result;
            }
            debug!(attempt = attempts, budget, error = %result.error_message(), "attempt failed, retrying");
            if !self.settings.retry_backoff.is_zero() {
                thread::sleep(self.settings.retry_backoff);
            }
        };
        if !result.success {
            warn!(attempts, error = %result.error_message(), "step failed");
        }
        StepRecord {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            result,
            attempts,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// One attempt. Executor faults, panics and timeouts become failed results.
    fn invoke(
        &self,
        call: &ToolCall,
        context: ExecutionContext,
        timeout: Option<Duration>,
    ) -> ToolResult {
        let Some(limit) = timeout else {
            let outcome = catch_unwind(AssertUnwindSafe(|| self.executor.execute(call, &context)));
            return match outcome {
                Ok(result) => fault_to_result(result),
                Err(_) => ToolResult::failed(format!("tool '{}' panicked", call.tool)),
            };
        };

        let attempt_cancel = context.cancel.clone();
        let (tx, rx) = mpsc::channel();
        let executor = Arc::clone(&self.executor);
        let owned_call = call.clone();
        thread::spawn(move || {
            let result = executor.execute(&owned_call, &context);
            if tx.send(result).is_err() {
                debug!(step = %owned_call.step_id, "attempt finished after its deadline");
            }
        });
        match rx.recv_timeout(limit) {
            Ok(result) => fault_to_result(result),
            Err(RecvTimeoutError::Timeout) => {
                attempt_cancel.cancel();
                warn!(timeout_ms = limit.as_millis() as u64, "attempt timed out");
                ToolResult::failed(format!(
                    "step '{}' timed out after {}ms",
                    call.step_id,
                    limit.as_millis()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                ToolResult::failed(format!("tool '{}' panicked", call.tool))
            }
        }
    }

    fn publish(&self, execution: &WorkflowExecution) {
        lock(&self.executions).upsert(execution);
    }
}

fn failure_message(record: &StepRecord) -> String {
    format!(
        "step '{}' failed after {} attempt(s): {}",
        record.step_id,
        record.attempts,
        record.result.error_message()
    )
}

fn fault_to_result(result: Result<ToolResult>) -> ToolResult {
    result.unwrap_or_else(|err| ToolResult::failed(format!("{err:#}")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
