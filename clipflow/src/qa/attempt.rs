//! Kept attempts and best-of selection.

use crate::core::{HistoryKind, Run, Stage};

/// A stored attempt eligible for best-of acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptCandidate {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Gate score.
    pub score: f64,
    /// Artifact key holding the attempt's bundle.
    pub artifact_key: String,
}

/// Base artifact name under which an attempt's bundle is kept.
#[must_use]
pub fn attempt_artifact_name(stage: Stage, revision: u32, attempt: u32) -> String {
    format!("{}-c{revision}-a{attempt}", stage.as_str())
}

/// Stored attempts of `stage` in the run's current revision cycle, in
/// attempt order.
#[must_use]
pub fn candidates(run: &Run, stage: Stage) -> Vec<AttemptCandidate> {
    run.history
        .iter()
        .filter(|entry| entry.cycle == run.revision)
        .filter_map(|entry| match &entry.kind {
            HistoryKind::Verdict {
                stage: s,
                verdict,
                artifact_key: Some(key),
            } if *s == stage => Some(AttemptCandidate {
                attempt: verdict.attempt,
                score: verdict.score,
                artifact_key: key.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Highest score wins; on an exact tie the earliest attempt wins.
#[must_use]
pub fn best_attempt(run: &Run, stage: Stage) -> Option<AttemptCandidate> {
    candidates(run, stage).into_iter().reduce(|best, next| {
        if next.score > best.score || (next.score == best.score && next.attempt < best.attempt) {
            next
        } else {
            best
        }
    })
}
