//! Quality gate verdicts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decision returned by a quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Output accepted.
    Pass,
    /// Output should be regenerated with the prescribed fixes.
    Rework,
    /// Output rejected; retrying the same stage will not help.
    Fail,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Rework => write!(f, "rework"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Severity of a blocking issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic.
    Low,
    /// Noticeable.
    #[default]
    Medium,
    /// Must be fixed before delivery.
    High,
    /// Not recoverable.
    Critical,
}

/// How a hard `fail` verdict is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The run cannot recover; go to `FAILED`.
    #[default]
    Fatal,
    /// A human may still rescue the run; escalate.
    NeedsReview,
}

/// One problem found by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingIssue {
    /// Issue severity.
    #[serde(default)]
    pub severity: Severity,
    /// What is wrong.
    pub description: String,
}

impl BlockingIssue {
    /// Creates a new blocking issue.
    #[must_use]
    pub fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
        }
    }
}

/// Result of evaluating one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Gate decision.
    pub decision: Decision,
    /// Numeric score, higher is better.
    pub score: f64,
    /// Gate that produced the verdict.
    pub gate: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Blocking issues.
    #[serde(default)]
    pub issues: Vec<BlockingIssue>,
    /// Prescriptive fixes for the next attempt.
    #[serde(default)]
    pub fixes: Vec<String>,
    /// Evaluator confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: f64,
    /// Routing for `fail` decisions.
    #[serde(default)]
    pub failure_class: FailureClass,
}

impl QualityVerdict {
    fn with_decision(decision: Decision, gate: impl Into<String>, attempt: u32, score: f64) -> Self {
        Self {
            decision,
            score,
            gate: gate.into(),
            attempt,
            issues: Vec::new(),
            fixes: Vec::new(),
            confidence: 1.0,
            failure_class: FailureClass::Fatal,
        }
    }

    /// Creates a passing verdict.
    #[must_use]
    pub fn pass(gate: impl Into<String>, attempt: u32, score: f64) -> Self {
        Self::with_decision(Decision::Pass, gate, attempt, score)
    }

    /// Creates a rework verdict.
    #[must_use]
    pub fn rework(gate: impl Into<String>, attempt: u32, score: f64) -> Self {
        Self::with_decision(Decision::Rework, gate, attempt, score)
    }

    /// Creates a failing verdict.
    #[must_use]
    pub fn fail(gate: impl Into<String>, attempt: u32, score: f64) -> Self {
        Self::with_decision(Decision::Fail, gate, attempt, score)
    }

    /// Adds a blocking issue.
    #[must_use]
    pub fn with_issue(mut self, severity: Severity, description: impl Into<String>) -> Self {
        self.issues.push(BlockingIssue::new(severity, description));
        self
    }

    /// Adds a prescriptive fix.
    #[must_use]
    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Sets the evaluator confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Sets the failure class.
    #[must_use]
    pub fn with_failure_class(mut self, class: FailureClass) -> Self {
        self.failure_class = class;
        self
    }

    /// One-line description used in the reason trail.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} attempt {}: {} (score {:.1})",
            self.gate, self.attempt, self.decision, self.score
        );
        if !self.issues.is_empty() {
            let issues: Vec<&str> = self.issues.iter().map(|i| i.description.as_str()).collect();
            line.push_str(&format!(" [{}]", issues.join("; ")));
        }
        line
    }
}
