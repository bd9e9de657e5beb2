//! Core data model: stages, verdicts, artifacts and the run aggregate.

pub mod artifact;
mod run;
mod stage;
mod verdict;

pub use artifact::StageArtifacts;
pub use run::{
    EscalationReason, EscalationState, HistoryEntry, HistoryKind, QaStatus, Run,
};
pub use stage::{FsmEvent, Stage};
pub use verdict::{BlockingIssue, Decision, FailureClass, QualityVerdict, Severity};
