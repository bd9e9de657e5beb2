//! The `Run` aggregate root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::{FsmEvent, QualityVerdict, Stage};

/// Quality gate status of the current stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaStatus {
    /// No verdict yet for the current stage.
    #[default]
    Pending,
    /// The last verdict passed (or was overridden).
    Passed,
    /// The last verdict asked for rework.
    Rework,
    /// The last verdict failed.
    Failed,
}

/// Why a run was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// A stage could not place its input into a known category.
    UnclassifiableInput,
    /// The QA loop used every attempt without a pass.
    QaExhausted,
    /// A hard failure that a human may still rescue.
    StageFailure,
    /// The stage executor kept erroring until the attempt cap.
    ExecutionExhausted,
}

impl EscalationReason {
    const ALL: [Self; 4] = [
        Self::UnclassifiableInput,
        Self::QaExhausted,
        Self::StageFailure,
        Self::ExecutionExhausted,
    ];

    /// Snake token used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnclassifiableInput => "unclassifiable_input",
            Self::QaExhausted => "qa_exhausted",
            Self::StageFailure => "stage_failure",
            Self::ExecutionExhausted => "execution_exhausted",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orthogonal escalation flag of a run.
///
/// Persisted as `none`, the reason token while suspended, `resolved` when a
/// human (or the knowledge base) answered, and `resolved_default` when the
/// safe default was applied after the wait elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EscalationState {
    /// Never escalated, or cleared by a revision.
    #[default]
    None,
    /// Suspended waiting for input.
    Pending(EscalationReason),
    /// Resolved by external input or a stored resolution.
    Resolved,
    /// Resolved by the safe default after timeout.
    ResolvedByDefault,
}

impl EscalationState {
    /// Returns true while the run is suspended.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Returns true once an escalation has been resolved either way.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved | Self::ResolvedByDefault)
    }
}

impl From<EscalationState> for String {
    fn from(state: EscalationState) -> Self {
        match state {
            EscalationState::None => "none".to_string(),
            EscalationState::Pending(reason) => reason.as_str().to_string(),
            EscalationState::Resolved => "resolved".to_string(),
            EscalationState::ResolvedByDefault => "resolved_default".to_string(),
        }
    }
}

impl TryFrom<String> for EscalationState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "none" => Ok(Self::None),
            "resolved" => Ok(Self::Resolved),
            "resolved_default" => Ok(Self::ResolvedByDefault),
            other => EscalationReason::ALL
                .into_iter()
                .find(|r| r.as_str() == other)
                .map(Self::Pending)
                .ok_or_else(|| format!("unknown escalation state '{other}'")),
        }
    }
}

/// What happened, for the reason trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum HistoryKind {
    /// A gate verdict for one attempt.
    Verdict {
        /// Stage evaluated.
        stage: Stage,
        /// The verdict.
        verdict: QualityVerdict,
        /// Where the attempt's artifacts were kept, if they were.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_key: Option<String>,
    },
    /// An FSM transition.
    Transition {
        /// Source stage.
        from: Stage,
        /// Event applied.
        event: FsmEvent,
        /// Target stage.
        to: Stage,
    },
    /// The stage executor failed for one attempt.
    ExecutionError {
        /// Stage executed.
        stage: Stage,
        /// Attempt number.
        attempt: u32,
        /// Error text.
        error: String,
    },
    /// The run was suspended for external input.
    Escalation {
        /// Stage at escalation time.
        stage: Stage,
        /// Why.
        reason: EscalationReason,
        /// The item needing resolution.
        item: String,
    },
    /// An escalation was resolved.
    EscalationResolved {
        /// Why it had been raised.
        reason: EscalationReason,
        /// Resolution applied.
        resolution: String,
        /// True when the safe default was applied.
        by_default: bool,
    },
    /// A best-of attempt was accepted instead of a pass.
    Override {
        /// Gate overridden.
        gate: String,
        /// Attempt whose artifacts were accepted.
        attempt: u32,
        /// Its score.
        score: f64,
    },
    /// A revision request re-entered the pipeline.
    Revision {
        /// Revision kind token.
        kind: String,
        /// Re-entry stage.
        resume_at: Stage,
    },
    /// The run was moved to `FAILED`.
    Failure {
        /// Why.
        reason: String,
    },
}

/// One timestamped history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Revision cycle the entry belongs to.
    pub cycle: u32,
    /// What happened.
    #[serde(flatten)]
    pub kind: HistoryKind,
}

impl HistoryEntry {
    /// Renders the entry as a human-readable line.
    #[must_use]
    pub fn describe(&self) -> String {
        let ts = self.at.to_rfc3339();
        let body = match &self.kind {
            HistoryKind::Verdict { stage, verdict, .. } => format!("{stage}: {}", verdict.summary()),
            HistoryKind::Transition { from, event, to } => format!("{from} --{event}--> {to}"),
            HistoryKind::ExecutionError {
                stage,
                attempt,
                error,
            } => format!("{stage} attempt {attempt}: executor error: {error}"),
            HistoryKind::Escalation {
                stage,
                reason,
                item,
            } => format!("{stage}: escalated ({reason}) on '{item}'"),
            HistoryKind::EscalationResolved {
                reason,
                resolution,
                by_default,
            } => {
                let how = if *by_default { "safe default" } else { "input" };
                format!("escalation {reason} resolved by {how}: {resolution}")
            }
            HistoryKind::Override {
                gate,
                attempt,
                score,
            } => format!("{gate}: override accepted attempt {attempt} (score {score:.1})"),
            HistoryKind::Revision { kind, resume_at } => {
                format!("revision {kind}: resuming at {resume_at}")
            }
            HistoryKind::Failure { reason } => format!("failed: {reason}"),
        };
        format!("[{ts}] {body}")
    }
}

/// Aggregate root: one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub id: String,
    /// Reference to the source video.
    pub source_ref: String,
    /// Current FSM stage.
    pub current_stage: Stage,
    /// 1-based attempt counter for the current stage.
    pub attempt: u32,
    /// Attempt cap fixed at creation.
    pub attempt_cap: u32,
    /// Quality gate status of the current stage.
    pub qa_status: QaStatus,
    /// Completed stages in completion order.
    pub stages_completed: Vec<Stage>,
    /// Escalation flag.
    pub escalation_state: EscalationState,
    /// Gates with a standing best-of override.
    #[serde(default)]
    pub overrides: BTreeSet<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Fixes to feed into the next attempt.
    #[serde(default)]
    pub pending_fixes: Vec<String>,
    /// Logical artifact name to current storage key.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Number of revisions applied.
    #[serde(default)]
    pub revision: u32,
    /// Escalation resolution values awaiting use, keyed by stage token.
    #[serde(default)]
    pub resolutions: BTreeMap<String, String>,
    /// Why the run failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Append-only reason trail.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Run {
    /// Creates a run in the initial stage.
    #[must_use]
    pub fn new(id: impl Into<String>, source_ref: impl Into<String>, attempt_cap: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            source_ref: source_ref.into(),
            current_stage: Stage::INITIAL,
            attempt: 1,
            attempt_cap,
            qa_status: QaStatus::Pending,
            stages_completed: Vec::new(),
            escalation_state: EscalationState::None,
            overrides: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            pending_fixes: Vec::new(),
            artifacts: BTreeMap::new(),
            revision: 0,
            resolutions: BTreeMap::new(),
            failure_reason: None,
            history: Vec::new(),
        }
    }

    /// Returns true in `COMPLETED` or `FAILED`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Returns true while suspended on an escalation.
    #[must_use]
    pub fn is_escalated(&self) -> bool {
        self.escalation_state.is_pending()
    }

    /// Returns true if the gate has a standing override.
    #[must_use]
    pub fn has_override(&self, gate: &str) -> bool {
        self.overrides.contains(gate)
    }

    /// Appends a history entry and bumps `updated_at`.
    pub fn record(&mut self, kind: HistoryKind) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            at: now,
            cycle: self.revision,
            kind,
        });
        self.updated_at = now;
    }

    /// Marks `stage` as completed (idempotent).
    pub fn mark_completed(&mut self, stage: Stage) {
        if !self.stages_completed.contains(&stage) {
            self.stages_completed.push(stage);
        }
    }

    /// Moves the run to a new stage, resetting per-stage state.
    pub fn enter_stage(&mut self, stage: Stage) {
        self.current_stage = stage;
        self.attempt = 1;
        self.qa_status = QaStatus::Pending;
        self.pending_fixes.clear();
        self.updated_at = Utc::now();
    }

    /// Moves the run to `FAILED` with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.record(HistoryKind::Failure {
            reason: reason.clone(),
        });
        self.current_stage = Stage::Failed;
        self.qa_status = QaStatus::Failed;
        self.failure_reason = Some(reason);
    }

    /// Verdicts recorded for `stage` in the current revision cycle.
    pub fn verdicts_for(&self, stage: Stage) -> impl Iterator<Item = &QualityVerdict> {
        let cycle = self.revision;
        self.history.iter().filter_map(move |entry| match &entry.kind {
            HistoryKind::Verdict {
                stage: s, verdict, ..
            } if *s == stage && entry.cycle == cycle => {
                Some(verdict)
            }
            _ => None,
        })
    }

    /// Human-readable reason trail, oldest first.
    #[must_use]
    pub fn reason_trail(&self) -> Vec<String> {
        self.history.iter().map(HistoryEntry::describe).collect()
    }
}
