//! Composition root: one object owning the engine, the sandbox settings and
//! the worktree locks shared by every sandbox it creates.

use std::sync::Arc;

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::core::agent::Agent;
use crate::core::conflict::ConflictPolicy;
use crate::core::types::WorkflowExecution;
use crate::core::workflow::{Params, Workflow};
use crate::dispatch::{self, ConflictSummary, DispatchOptions, DispatchReport};
use crate::engine::{EngineSettings, ExecuteOptions, WorkflowEngine};
use crate::io::config::OrchestratorConfig;
use crate::io::execution_log::ExecutionLog;
use crate::io::sandbox::WorktreeLocks;
use crate::io::tool::{CommandToolExecutor, ToolExecutor};

pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: WorkflowEngine,
    locks: WorktreeLocks,
}

impl Orchestrator {
    /// Build with an explicit tool executor.
    pub fn new(config: OrchestratorConfig, executor: Arc<dyn ToolExecutor>) -> Self {
        let engine = WorkflowEngine::new(executor, EngineSettings::from(&config));
        Self {
            config,
            engine,
            locks: WorktreeLocks::new(),
        }
    }

    /// Build with the command-backed tools declared in `config`.
    pub fn from_config(config: OrchestratorConfig) -> Self {
        let executor = CommandToolExecutor::new(
            config.tools.clone(),
            config.sandbox.output_limit_bytes,
        );
        Self::new(config, Arc::new(executor))
    }

    /// Persist every finished execution under `log`.
    pub fn with_execution_log(mut self, log: ExecutionLog) -> Self {
        self.engine = self.engine.with_execution_log(log);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn locks(&self) -> &WorktreeLocks {
        &self.locks
    }

    /// Register `workflow` (replacing any previous version) and run it.
    pub fn run_workflow(
        &self,
        workflow: Workflow,
        params: Params,
        options: ExecuteOptions,
    ) -> Result<WorkflowExecution> {
        let id = workflow.id.clone();
        self.engine.register(workflow)?;
        self.engine.execute(&id, params, options)
    }

    /// Pre-flight conflict analysis with the default policy and an optional override.
    pub fn conflicts(&self, agents: &[Agent], allow_conflicts: bool) -> ConflictSummary {
        let policy = ConflictPolicy {
            allow_conflicts,
            ..ConflictPolicy::default()
        };
        dispatch::analyze_conflicts(agents, &policy)
    }

    /// Run agents in sandboxes seeded from their working directories.
    pub fn dispatch(
        &self,
        agents: &[Agent],
        options: &DispatchOptions,
        cancel: &CancelToken,
    ) -> DispatchReport {
        dispatch::dispatch(agents, &self.config.sandbox, &self.locks, options, cancel)
    }
}
