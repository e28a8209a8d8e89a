//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod agent;
pub mod condition;
pub mod conflict;
pub mod plan;
pub mod types;
pub mod workflow;
