//! Error types for the clipflow orchestration engine.
//!
//! Errors are split by layer. `ClipflowError` aggregates them for callers
//! that drive whole runs; the policies that decide whether an error is
//! retried, escalated or fatal live in the QA loop and the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::{FsmEvent, Stage};

/// The main error type for clipflow operations.
#[derive(Debug, Error)]
pub enum ClipflowError {
    /// Missing or invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The FSM rejected a transition.
    #[error("{0}")]
    Fsm(#[from] FsmError),

    /// The durable store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A revision request could not be applied.
    #[error("{0}")]
    Revision(#[from] RevisionError),

    /// The run does not exist.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// The requested operation does not fit the run's state.
    #[error("Run {run_id} is in an invalid state: {reason}")]
    InvalidRunState {
        /// The run.
        run_id: String,
        /// Why the operation was refused.
        reason: String,
    },
}

impl ClipflowError {
    /// Creates an invalid-run-state error.
    #[must_use]
    pub fn invalid_state(run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRunState {
            run_id: run_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors that must stop the run rather than be retried.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Store(_))
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let kind = match self {
            Self::Config(_) => "configuration",
            Self::Fsm(_) => "invalid_transition",
            Self::Store(_) => "store",
            Self::Revision(_) => "revision",
            Self::RunNotFound(_) => "run_not_found",
            Self::InvalidRunState { .. } => "invalid_run_state",
        };
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("fatal".to_string(), serde_json::json!(self.is_fatal()));
        map
    }
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },

    /// A value parsed but is out of range.
    #[error("{0}")]
    OutOfRange(String),
}

/// Errors produced by the FSM engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsmError {
    /// The `(stage, event)` pair is not in the transition table.
    #[error("Invalid transition: no entry for ({stage}, {event})")]
    InvalidTransition {
        /// Current stage.
        stage: Stage,
        /// Event applied.
        event: FsmEvent,
    },

    /// The pair exists but its guard rejected the run.
    #[error("Invalid transition: guard '{guard}' rejected ({stage}, {event})")]
    GuardRejected {
        /// Current stage.
        stage: Stage,
        /// Event applied.
        event: FsmEvent,
        /// Guard name.
        guard: &'static str,
    },
}

/// Errors produced by the durable state and artifact stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be (de)serialized.
    #[error("store serialization error for {what}: {source}")]
    Serialization {
        /// Record description.
        what: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A record the run points at is missing.
    #[error("{what} '{key}' not found for run {run_id}")]
    NotFound {
        /// Record kind.
        what: &'static str,
        /// Run identifier.
        run_id: String,
        /// Record key.
        key: String,
    },

    /// An artifact key is already taken; artifacts are never overwritten.
    #[error("artifact '{key}' already exists for run {run_id}")]
    AlreadyExists {
        /// Run identifier.
        run_id: String,
        /// Artifact key.
        key: String,
    },
}

impl StoreError {
    /// Wraps an I/O error with its path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a serialization error.
    pub fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            what: what.into(),
            source,
        }
    }
}

/// Failures reported by a stage executor.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorError {
    /// The executor errored. Retried up to the attempt cap.
    #[error("stage execution failed: {0}")]
    Failed(String),

    /// The stage could not classify its input. Routed to escalation.
    #[error("unclassifiable input: {item}")]
    Unclassifiable {
        /// What could not be classified.
        item: String,
    },

    /// Output failed structural checks before reaching the gate.
    #[error("stage output invalid: {0}")]
    Validation(String),
}

impl ExecutorError {
    /// Creates a failed error.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Creates an unclassifiable-input error.
    #[must_use]
    pub fn unclassifiable(item: impl Into<String>) -> Self {
        Self::Unclassifiable { item: item.into() }
    }
}

/// Errors from the remote generation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The remote call failed; polling errors are transient.
    #[error("generation backend error: {0}")]
    Remote(String),

    /// The remote service rejected the request permanently.
    #[error("generation request rejected: {0}")]
    Rejected(String),
}

/// Errors from the escalation channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The question could not be delivered.
    #[error("escalation channel unavailable: {0}")]
    Unavailable(String),

    /// The channel was closed before an answer arrived.
    #[error("escalation question {0} was cancelled")]
    Cancelled(String),
}

/// Errors from the revision handler.
#[derive(Debug, Error)]
pub enum RevisionError {
    /// The artifact the revision mutates is missing.
    #[error("run {run_id} has no '{artifact}' artifact to revise")]
    MissingArtifact {
        /// Run identifier.
        run_id: String,
        /// Artifact name.
        artifact: String,
    },

    /// The artifact could not be decoded.
    #[error("artifact '{artifact}' is malformed: {reason}")]
    MalformedArtifact {
        /// Artifact name.
        artifact: String,
        /// Decode failure.
        reason: String,
    },

    /// The parameter payload does not fit the revision kind.
    #[error("invalid parameters for revision '{kind}': {reason}")]
    InvalidParameters {
        /// Revision kind token.
        kind: String,
        /// Why.
        reason: String,
    },

    /// Widening would exceed the bounded clip duration.
    #[error("selection {start:.1}s-{end:.1}s cannot be widened further (max {max_secs:.1}s)")]
    WideningLimitReached {
        /// Current start.
        start: f64,
        /// Current end.
        end: f64,
        /// Duration cap.
        max_secs: f64,
    },

    /// Writing the revised artifact failed.
    #[error("{0}")]
    Store(#[from] StoreError),
}
