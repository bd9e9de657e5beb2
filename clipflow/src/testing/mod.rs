//! Testing utilities for clipflow.
//!
//! This module provides:
//! - Scripted executors, gates, backends and channels
//! - Run fixtures and well-known artifacts
//! - A store that records and fails run saves
//! - Assertions over run records

mod assertions;
mod fixtures;
mod mocks;
mod store;

pub use assertions::{assert_consistent, assert_escalation_state, assert_stage, assert_trail_contains};
pub use fixtures::{content_artifacts, moment_artifacts, run_at};
pub use mocks::{
    default_artifacts, ScriptedBackend, ScriptedChannel, ScriptedEvaluator, ScriptedExecutor,
};
pub use store::RecordingStore;
