//! Orchestration events.
//!
//! Components emit through an injected [`EventSink`]; there is no global
//! sink. Event names are the constants below.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run was created.
pub const RUN_CREATED: &str = "run.created";
/// A stage attempt is starting.
pub const STAGE_ATTEMPT: &str = "stage.attempt";
/// A stage passed its gate (or completed, for ungated stages).
pub const STAGE_PASSED: &str = "stage.passed";
/// A run was suspended for external input.
pub const RUN_ESCALATED: &str = "run.escalated";
/// An escalation was resolved.
pub const ESCALATION_RESOLVED: &str = "escalation.resolved";
/// A generation batch was submitted.
pub const JOBS_FIRED: &str = "jobs.fired";
/// A generation job changed status.
pub const JOB_STATUS: &str = "job.status";
/// The await gate returned.
pub const GATE_RESOLVED: &str = "gate.resolved";
/// A run reached `COMPLETED`.
pub const RUN_COMPLETED: &str = "run.completed";
/// A run reached `FAILED`.
pub const RUN_FAILED: &str = "run.failed";
/// A revision request was applied.
pub const REVISION_APPLIED: &str = "revision.applied";
