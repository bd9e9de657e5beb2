//! Resolutions, answer parsing and the knowledge-base fingerprint.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

use crate::core::{EscalationReason, Stage};

/// Value a resolved escalation applies to the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Accept the best-scoring attempt of the exhausted gate.
    AcceptBest,
    /// Stop the run in `FAILED`.
    FailRun,
    /// Free-form value handed to the stage as input.
    Value(String),
}

impl Resolution {
    /// Safe default applied when nobody answers in time.
    #[must_use]
    pub fn safe_default(reason: EscalationReason) -> Self {
        match reason {
            EscalationReason::UnclassifiableInput => Self::Value(DEFAULT_STRATEGY.to_string()),
            EscalationReason::QaExhausted => Self::AcceptBest,
            EscalationReason::StageFailure | EscalationReason::ExecutionExhausted => Self::FailRun,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptBest => f.write_str("accept_best"),
            Self::FailRun => f.write_str("fail"),
            Self::Value(v) => write!(f, "value:{v}"),
        }
    }
}

/// Strategy applied to unclassifiable input when nobody answers.
pub const DEFAULT_STRATEGY: &str = "default";

/// A resolution kept for reuse on equivalent inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResolution {
    /// Input fingerprint.
    pub fingerprint: String,
    /// Escalation reason.
    pub reason: EscalationReason,
    /// Stage that raised it.
    pub stage: Stage,
    /// The item as first seen.
    pub item: String,
    /// Resolution applied.
    pub resolution: Resolution,
    /// When it was learned.
    pub resolved_at: DateTime<Utc>,
}

#[allow(clippy::expect_used)]
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

#[allow(clippy::expect_used)]
static ACCEPT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(accept|yes|y|ok|best)\b").expect("static regex")
});

#[allow(clippy::expect_used)]
static REJECT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(reject|no|n|fail|abort)\b").expect("static regex")
});

/// Fingerprint of an escalation input.
///
/// Case and whitespace runs are normalized so trivially different spellings
/// of the same input share a knowledge-base entry.
#[must_use]
pub fn fingerprint(reason: EscalationReason, stage: Stage, item: &str) -> String {
    let normalized = WHITESPACE
        .replace_all(item.trim(), " ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(reason.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(stage.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parses a free-text answer. Returns `None` for a blank answer.
#[must_use]
pub fn parse_answer(text: &str) -> Option<Resolution> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if ACCEPT_WORDS.is_match(trimmed) {
        Some(Resolution::AcceptBest)
    } else if REJECT_WORDS.is_match(trimmed) {
        Some(Resolution::FailRun)
    } else {
        Some(Resolution::Value(trimmed.to_string()))
    }
}
