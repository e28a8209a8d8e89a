//! Sandbox lifecycle tests.
//!
//! Creates sandboxes from a seeded project under each isolation strategy,
//! runs tasks inside them and verifies teardown leaves nothing behind.

use std::fs;
use std::time::Duration;

use orchestrator::core::agent::{Agent, IsolationStrategy};
use orchestrator::io::git::Git;
use orchestrator::io::sandbox::{AgentSandbox, WorktreeLocks};
use orchestrator::test_support::{TestProject, init_git_repo};

fn top_level_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read sandbox")
        .map(|entry| {
            entry
                .expect("entry")
                .file_name()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    names.sort();
    names
}

#[test]
fn worktree_strategy_outside_git_falls_back_to_a_copy() {
    let fixture = TestProject::new().expect("fixture");
    let config = fixture.sandbox_config(IsolationStrategy::GitWorktree);
    let mut sandbox =
        AgentSandbox::new(fixture.project(), &config, WorktreeLocks::new()).expect("sandbox");

    let root = sandbox.create("agent-7").expect("create");
    assert!(root.is_dir());
    assert!(root.starts_with(fixture.sandbox_base()));
    assert!(root.join("package.json").is_file());
    assert!(root.join("src").join("index.js").is_file());
    assert_eq!(sandbox.strategy(), Some(IsolationStrategy::TempDirectory));

    sandbox.cleanup();
    assert!(!root.exists());
}

#[test]
fn seeded_copy_skips_dependencies_and_logs() {
    let fixture = TestProject::new().expect("fixture");
    let config = fixture.sandbox_config(IsolationStrategy::TempDirectory);
    let mut sandbox =
        AgentSandbox::new(fixture.project(), &config, WorktreeLocks::new()).expect("sandbox");
    let root = sandbox.create("agent-1").expect("create");

    let names = top_level_names(&root);
    assert!(names.contains(&"package.json".to_string()), "{names:?}");
    assert!(!names.contains(&"node_modules".to_string()), "{names:?}");
    assert!(!names.contains(&".git".to_string()), "{names:?}");
    assert!(!names.iter().any(|name| name.ends_with(".log")), "{names:?}");
}

#[test]
fn context_round_trips_bytes_and_cleanup_removes_root() {
    let fixture = TestProject::new().expect("fixture");
    let config = fixture.sandbox_config(IsolationStrategy::Constrained);
    let mut sandbox =
        AgentSandbox::new(fixture.project(), &config, WorktreeLocks::new()).expect("sandbox");
    let root = sandbox.create("agent-2").expect("create");
    assert_eq!(sandbox.strategy(), Some(IsolationStrategy::Constrained));

    let context = sandbox.context().expect("context");
    let payload = [0u8, 159, 146, 150, b'\n', 255];
    context
        .write_file("out/blob.bin", payload)
        .expect("write");
    assert_eq!(context.read_file("out/blob.bin").expect("read"), payload);
    assert!(context.write_file("../escape.txt", "x").is_err());
    assert!(!fixture.project().join("out").exists());

    sandbox.cleanup();
    assert!(!root.exists());
    sandbox.cleanup();
    assert!(sandbox.cleanup_errors().is_empty());
}

#[cfg(unix)]
#[test]
fn task_exceeding_timeout_reports_failure_and_still_cleans_up() {
    let fixture = TestProject::new().expect("fixture");
    let config = fixture.sandbox_config(IsolationStrategy::TempDirectory);
    let mut sandbox =
        AgentSandbox::new(fixture.project(), &config, WorktreeLocks::new()).expect("sandbox");

    let agent = Agent::new("slow", "builder", "sleep 5", fixture.project())
        .with_timeout(Duration::from_millis(200));
    let result = sandbox.execute_in_sandbox(&agent);
    assert!(!result.success);
    assert_ne!(result.exit_code, 0);
    let error = result.error.as_deref().expect("error");
    assert!(error.contains("timed out"), "{error}");
    assert!(result.duration_ms < 5_000);

    let root = result.sandbox_root.clone().expect("sandbox root");
    assert!(root.exists());
    sandbox.cleanup();
    assert!(!root.exists());
}

#[cfg(unix)]
#[test]
fn task_runs_inside_the_sandbox_and_reports_artifacts() {
    let fixture = TestProject::new().expect("fixture");
    let config = fixture.sandbox_config(IsolationStrategy::TempDirectory);
    let mut sandbox =
        AgentSandbox::new(fixture.project(), &config, WorktreeLocks::new()).expect("sandbox");

    let agent = Agent::new(
        "writer",
        "docs",
        "printf '%s:%s' \"$AGENT_ID\" \"$SANDBOXED\" > notes.txt && cat notes.txt",
        fixture.project(),
    );
    let result = sandbox.execute_in_sandbox(&agent);
    assert!(result.success, "{result:?}");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output, "writer:1");
    assert_eq!(result.artifacts, vec!["notes.txt"]);
    assert!(!fixture.project().join("notes.txt").exists());
}

#[test]
fn worktree_strategy_inside_git_adds_a_worktree() {
    let Ok(fixture) = TestProject::with_git() else {
        // git is not installed here.
        return;
    };
    let config = fixture.sandbox_config(IsolationStrategy::GitWorktree);
    let mut sandbox =
        AgentSandbox::new(fixture.project(), &config, WorktreeLocks::new()).expect("sandbox");

    let root = sandbox.create("agent-9").expect("create");
    assert_eq!(sandbox.strategy(), Some(IsolationStrategy::GitWorktree));
    assert!(root.join(".git").exists());
    assert!(root.join("package.json").is_file());
    assert!(!root.join("node_modules").exists());
    let registered = |git: &Git| git.worktree_list().expect("worktree list").len();
    let git = Git::new(fixture.project());
    assert_eq!(registered(&git), 2);

    sandbox.cleanup();
    assert!(!root.exists(), "{:?}", sandbox.cleanup_errors());
    assert_eq!(registered(&git), 1);
}

#[test]
fn worktree_prunes_tracked_entries_on_the_skip_list() {
    let fixture = TestProject::new().expect("fixture");
    let project = fixture.project();
    fs::create_dir_all(project.join("dist")).expect("mkdir dist");
    fs::create_dir_all(project.join("src").join("coverage")).expect("mkdir coverage");
    fs::write(project.join("dist").join("bundle.js"), "bundle\n").expect("write bundle");
    fs::write(project.join("src").join("coverage").join("lcov.info"), "TN:\n").expect("write lcov");
    if init_git_repo(project).is_err() {
        // git is not installed here.
        return;
    }
    let config = fixture.sandbox_config(IsolationStrategy::GitWorktree);
    let mut sandbox =
        AgentSandbox::new(project, &config, WorktreeLocks::new()).expect("sandbox");

    let root = sandbox.create("agent-4").expect("create");
    assert_eq!(sandbox.strategy(), Some(IsolationStrategy::GitWorktree));
    assert!(root.join(".git").exists());
    assert!(root.join("src").join("index.js").is_file());
    assert!(!root.join("dist").exists());
    assert!(!root.join("src").join("coverage").exists());
    // The checkout in the project itself is untouched.
    assert!(project.join("dist").join("bundle.js").is_file());

    sandbox.cleanup();
    assert!(!root.exists(), "{:?}", sandbox.cleanup_errors());
    assert_eq!(Git::new(project).worktree_list().expect("worktree list").len(), 1);
}
