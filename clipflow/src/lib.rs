//! # Clipflow
//!
//! Orchestration engine for a quality-gated clip production pipeline.
//!
//! A run moves through a fixed sequence of stages (router, research,
//! transcript, content, layout analysis, encoding, assembly, delivery). The
//! engine provides:
//!
//! - **FSM**: a data-driven transition table with guards; every transition is
//!   persisted before anything else happens
//! - **QA reflection loop**: bounded rework against a quality gate, with
//!   prescriptive fixes fed into the next attempt and best-of acceptance
//! - **Escalation**: runs suspend on questions they cannot answer and resume
//!   on an answer, a remembered resolution, or a safe default after a timeout
//! - **Async generation jobs**: idempotent remote jobs polled in the
//!   background and awaited behind a deadline gate
//! - **Revisions**: post-completion edits that fork artifacts and re-enter the
//!   pipeline at the earliest affected stage
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clipflow::prelude::*;
//!
//! let store = Arc::new(FileStateStore::new(".clipflow"));
//! let ports = Ports::new(executor, evaluator, backend, channel);
//! let orchestrator = Orchestrator::new(OrchestratorConfig::from_env()?, store, ports, events)?;
//!
//! orchestrator.start_run("run-1", "yt:abc123").await?;
//! let run = orchestrator.run_pipeline("run-1").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod escalation;
pub mod events;
pub mod fsm;
pub mod jobs;
pub mod observability;
pub mod orchestrator;
pub mod ports;
pub mod qa;
pub mod revision;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{
        Decision, EscalationReason, EscalationState, FailureClass, FsmEvent, QualityVerdict,
        Run, Stage, StageArtifacts,
    };
    pub use crate::errors::{
        BackendError, ChannelError, ClipflowError, ExecutorError, RevisionError, StoreError,
    };
    pub use crate::escalation::{EscalationQuestion, Resolution};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::fsm::FsmEngine;
    pub use crate::jobs::{BatchOutcome, GateOutcome, GenerationRequest, VariantTag};
    pub use crate::observability::init_tracing;
    pub use crate::orchestrator::Orchestrator;
    pub use crate::ports::{
        EscalationChannel, GenerationBackend, Ports, QualityGateEvaluator, StageExecutor,
        StageInput,
    };
    pub use crate::revision::{RevisionKind, RevisionRequest};
    pub use crate::store::{FileStateStore, InMemoryStateStore, StateStore, Store};
    pub use std::sync::Arc;
}
