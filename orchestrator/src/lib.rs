//! Task-orchestration core: workflows of tool steps and sandboxed agent dispatch.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (workflow model and validation,
//!   conditions, execution plans, conflict detection). No I/O.
//! - **[`io`]**: Side-effecting operations (processes, git, config, persistence,
//!   tool execution, sandboxes). Isolated behind seams for testing.
//!
//! Orchestration modules ([`engine`], [`dispatch`], [`orchestrator`]) combine
//! the two. [`cancel`] and [`pool`] provide the cancellation and bounded
//! concurrency they share.

pub mod cancel;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod exit_codes;
pub mod ids;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod pool;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
