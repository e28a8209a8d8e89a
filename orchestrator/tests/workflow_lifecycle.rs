//! Workflow lifecycle tests.
//!
//! Loads workflow documents through the store, runs them through the
//! orchestrator with a scripted tool executor, and checks the resulting
//! execution records and persisted logs.

use std::sync::Arc;

use orchestrator::core::types::{ExecutionStatus, ToolResult};
use orchestrator::core::workflow::Params;
use orchestrator::engine::ExecuteOptions;
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::io::execution_log::ExecutionLog;
use orchestrator::io::tool::ToolExecutor;
use orchestrator::io::workflow_store::{load_workflow, parse_workflow, save_workflow};
use orchestrator::orchestrator::Orchestrator;
use orchestrator::test_support::ScriptedToolExecutor;
use serde_json::json;

const CICD: &str = r#"{
  "id": "cicd",
  "name": "CI/CD pipeline",
  "version": "2.1.0",
  "steps": [
    {"id": "install", "name": "Install", "tool": "npm", "args": {"cmd": "install"}, "retry": 3, "onFailure": "abort"},
    {"id": "lint", "name": "Lint", "tool": "npm", "args": {"cmd": "run lint"}},
    {"id": "test", "name": "Test", "tool": "npm", "args": {"cmd": "test", "env": "${env}"}},
    {"id": "build", "name": "Build", "tool": "npm", "args": {"cmd": "run build"}},
    {"id": "deploy", "name": "Deploy", "tool": "deploy", "args": {"env": "${env}"}, "onFailure": "rollback"},
    {"id": "notify", "name": "Notify", "tool": "slack"},
    {"id": "rollback", "name": "Rollback", "tool": "deploy", "args": {"undo": true}}
  ],
  "metadata": {
    "author": "platform",
    "tags": ["ci"],
    "parameters": [{"name": "env", "default": "staging"}]
  }
}"#;

fn orchestrator_with(scripted: &Arc<ScriptedToolExecutor>) -> Orchestrator {
    let executor: Arc<dyn ToolExecutor> = scripted.clone();
    Orchestrator::new(OrchestratorConfig::default(), executor)
}

#[test]
fn deploy_failure_rolls_back_and_stops() {
    let scripted = Arc::new(ScriptedToolExecutor::new());
    scripted.push("deploy", ToolResult::failed("cluster unreachable"));
    let orchestrator = orchestrator_with(&scripted);

    let workflow = parse_workflow(CICD).expect("parse");
    let exec = orchestrator
        .run_workflow(workflow, Params::new(), ExecuteOptions::default())
        .expect("run");

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(
        exec.visited(),
        vec!["install", "lint", "test", "build", "deploy"]
    );
    let deploy = exec.result("deploy").expect("deploy result");
    assert!(!deploy.success);
    assert!(exec.result("notify").is_none());
    let compensation = exec.compensation.as_ref().expect("rollback ran");
    assert_eq!(compensation.step_id, "rollback");
    assert!(compensation.result.success);
    assert!(exec.ended_at.is_some());

    // The rollback step never runs as part of the main sequence.
    let rollback_calls = scripted
        .calls()
        .iter()
        .filter(|recorded| recorded.call.step_id == "rollback")
        .count();
    assert_eq!(rollback_calls, 1);
}

#[test]
fn install_abort_after_every_attempt_fails() {
    let scripted = Arc::new(ScriptedToolExecutor::new());
    for _ in 0..4 {
        scripted.push("install", ToolResult::failed("registry timeout"));
    }
    let orchestrator = orchestrator_with(&scripted);

    let workflow = parse_workflow(CICD).expect("parse");
    let exec = orchestrator
        .run_workflow(workflow, Params::new(), ExecuteOptions::default())
        .expect("run");

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.visited(), vec!["install"]);
    assert_eq!(exec.results[0].attempts, 4);
    assert!(exec.compensation.is_none());
    let error = exec.error.as_deref().expect("error");
    assert!(error.contains("install"), "{error}");
    assert!(error.contains("registry timeout"), "{error}");
    assert_eq!(scripted.calls().len(), 4);
}

#[test]
fn get_returns_identical_data_on_repeat_calls() {
    let scripted = Arc::new(ScriptedToolExecutor::new());
    let orchestrator = orchestrator_with(&scripted);
    let workflow = parse_workflow(CICD).expect("parse");
    orchestrator.engine().register(workflow.clone()).expect("register");

    let first = orchestrator.engine().get("cicd").expect("registered");
    let second = orchestrator.engine().get("cicd").expect("registered");
    assert_eq!(first, second);
    assert_eq!(first, workflow);
    assert!(orchestrator.engine().get("missing").is_none());
}

#[test]
fn parameters_reach_tools_and_execution_is_persisted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let scripted = Arc::new(ScriptedToolExecutor::new());
    let orchestrator =
        orchestrator_with(&scripted).with_execution_log(ExecutionLog::new(temp.path()));

    let mut params = Params::new();
    params.insert("env".to_string(), json!("production"));
    let exec = orchestrator
        .run_workflow(
            parse_workflow(CICD).expect("parse"),
            params,
            ExecuteOptions::default(),
        )
        .expect("run");
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(
        exec.visited(),
        vec!["install", "lint", "test", "build", "deploy", "notify"]
    );

    let calls = scripted.calls();
    let deploy = calls
        .iter()
        .find(|recorded| recorded.call.step_id == "deploy")
        .expect("deploy call");
    assert_eq!(deploy.call.args["env"], json!("production"));
    assert!(calls.iter().all(|recorded| recorded.session_id == exec.execution_id));

    let log = ExecutionLog::new(temp.path());
    assert_eq!(log.list().expect("list"), vec![exec.execution_id.clone()]);
    assert_eq!(log.read(&exec.execution_id).expect("read"), exec);
}

#[test]
fn conditional_step_is_skipped_without_a_record() {
    let raw = r#"{
      "id": "release",
      "name": "Release",
      "steps": [
        {"id": "build", "name": "Build", "tool": "npm"},
        {"id": "publish", "name": "Publish", "tool": "npm", "condition": "env == 'production'"},
        {"id": "tag", "name": "Tag", "tool": "git"}
      ],
      "metadata": {"parameters": [{"name": "env", "default": "staging"}]}
    }"#;
    let scripted = Arc::new(ScriptedToolExecutor::new());
    let orchestrator = orchestrator_with(&scripted);
    let exec = orchestrator
        .run_workflow(
            parse_workflow(raw).expect("parse"),
            Params::new(),
            ExecuteOptions::default(),
        )
        .expect("run");
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.visited(), vec!["build", "tag"]);
}

#[test]
fn flaky_step_succeeds_within_its_retry_budget() {
    let scripted = Arc::new(ScriptedToolExecutor::new());
    scripted.push("install", ToolResult::failed("flaky"));
    scripted.push("install", ToolResult::failed("flaky"));
    scripted.push("install", ToolResult::ok("installed"));
    let orchestrator = orchestrator_with(&scripted);
    let exec = orchestrator
        .run_workflow(
            parse_workflow(CICD).expect("parse"),
            Params::new(),
            ExecuteOptions::default(),
        )
        .expect("run");
    assert_eq!(exec.status, ExecutionStatus::Completed);
    let install = &exec.results[0];
    assert_eq!(install.step_id, "install");
    assert_eq!(install.attempts, 3);
    assert_eq!(install.result.output, "installed");
}

#[test]
fn stored_workflow_loads_back_unchanged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("workflows").join("cicd.json");
    let workflow = parse_workflow(CICD).expect("parse");
    save_workflow(&path, &workflow).expect("save");
    let loaded = load_workflow(&path).expect("load");
    assert_eq!(loaded, workflow);
    assert_eq!(loaded.version, "2.1.0");
}

#[cfg(unix)]
#[test]
fn command_tools_run_end_to_end() {
    use orchestrator::io::tool::CommandToolExecutor;
    use orchestrator::io::config::ToolConfig;

    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = OrchestratorConfig::default();
    config.tools.insert(
        "write".to_string(),
        ToolConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf '%s' \"$TOOL_ARG_TEXT\" > out.txt".to_string(),
            ],
            requires_approval: false,
        },
    );
    config.tools.insert(
        "fail".to_string(),
        ToolConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            requires_approval: false,
        },
    );
    let executor = CommandToolExecutor::new(config.tools.clone(), 4_096);
    let orchestrator = Orchestrator::new(config, Arc::new(executor));

    let raw = r#"{
      "id": "files",
      "name": "Files",
      "steps": [
        {"id": "write", "name": "Write", "tool": "write", "args": {"text": "${text}"}},
        {"id": "check", "name": "Check", "tool": "fail", "onFailure": "continue"}
      ],
      "metadata": {"parameters": [{"name": "text", "required": true}]}
    }"#;
    let mut params = Params::new();
    params.insert("text".to_string(), json!("hello"));
    let options = ExecuteOptions {
        working_dir: Some(temp.path().to_path_buf()),
        ..ExecuteOptions::default()
    };
    let exec = orchestrator
        .run_workflow(parse_workflow(raw).expect("parse"), params, options)
        .expect("run");

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let written = std::fs::read_to_string(temp.path().join("out.txt")).expect("out.txt");
    assert_eq!(written, "hello");
    let check = exec.result("check").expect("check result");
    assert!(!check.success);
    assert!(check.error_message().contains("exited with code 3"));
}

#[cfg(unix)]
#[test]
fn cancelling_a_running_command_tool_kills_it_without_rolling_back() {
    use std::thread;
    use std::time::{Duration, Instant};

    use orchestrator::io::config::ToolConfig;
    use orchestrator::io::tool::CommandToolExecutor;

    let temp = tempfile::tempdir().expect("tempdir");
    let shell = |script: &str| ToolConfig {
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        requires_approval: false,
    };
    let mut config = OrchestratorConfig::default();
    config.tools.insert(
        "deploy".to_string(),
        shell("(sleep 1; touch late.txt) & wait"),
    );
    config
        .tools
        .insert("undo".to_string(), shell("touch undone.txt"));
    let executor = CommandToolExecutor::new(config.tools.clone(), 4_096);
    let orchestrator = Orchestrator::new(config, Arc::new(executor));

    let raw = r#"{
      "id": "release",
      "name": "Release",
      "steps": [
        {"id": "deploy", "name": "Deploy", "tool": "deploy", "onFailure": "rollback"},
        {"id": "rollback", "name": "Rollback", "tool": "undo"}
      ]
    }"#;
    let engine = orchestrator.engine();
    engine
        .register(parse_workflow(raw).expect("parse"))
        .expect("register");
    let options = ExecuteOptions {
        working_dir: Some(temp.path().to_path_buf()),
        ..ExecuteOptions::default()
    };

    let started = Instant::now();
    let exec = thread::scope(|scope| {
        let handle = scope.spawn(move || engine.execute("release", Params::new(), options));
        let deadline = Instant::now() + Duration::from_secs(5);
        let running = loop {
            if let Some(exec) = engine
                .list_executions()
                .into_iter()
                .find(|exec| exec.status == ExecutionStatus::Running)
            {
                break exec;
            }
            assert!(Instant::now() < deadline, "execution never started");
            thread::sleep(Duration::from_millis(10));
        };
        thread::sleep(Duration::from_millis(200));
        assert!(engine.cancel(&running.execution_id).expect("known execution"));
        handle.join().expect("join").expect("execute")
    });
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert!(exec.compensation.is_none());
    let deploy = exec.result("deploy").expect("deploy result");
    assert_eq!(deploy.error.as_deref(), Some("tool 'deploy' was cancelled"));

    // Neither the killed background child nor the rollback ever ran.
    thread::sleep(Duration::from_millis(1_500));
    assert!(!temp.path().join("late.txt").exists());
    assert!(!temp.path().join("undone.txt").exists());
}
