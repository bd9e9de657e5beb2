//! Await gate over a generation batch.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use super::{JobRegistry, JobStatus, VariantTag};

/// Batch classification when the gate returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every job succeeded (also an empty batch).
    AllSucceeded,
    /// Some jobs succeeded.
    Partial,
    /// No job succeeded.
    ZeroSuccess,
}

/// A clip the consuming stage may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedClip {
    /// Idempotent job key.
    pub key: String,
    /// Variant tag.
    pub variant: VariantTag,
    /// Reference to the produced clip.
    pub artifact_ref: String,
}

/// What the await gate resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    /// Batch classification.
    pub outcome: BatchOutcome,
    /// Succeeded clips.
    pub clips: Vec<GeneratedClip>,
    /// Keys that failed remotely.
    pub failed: Vec<String>,
    /// Keys still outstanding when the deadline passed. Treated as failed for
    /// this run; the remote jobs are left alone.
    pub unresolved: Vec<String>,
    /// True if the gate returned at the deadline.
    pub timed_out: bool,
}

impl GateOutcome {
    /// Classifies a registry snapshot.
    #[must_use]
    pub fn from_registry(registry: &JobRegistry, timed_out: bool) -> Self {
        let clips: Vec<GeneratedClip> = registry
            .succeeded()
            .filter_map(|job| {
                job.artifact_ref.as_ref().map(|artifact_ref| GeneratedClip {
                    key: job.key.clone(),
                    variant: job.variant,
                    artifact_ref: artifact_ref.clone(),
                })
            })
            .collect();
        let failed = registry
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| j.key.clone())
            .collect();
        let unresolved = registry.outstanding_keys();

        let outcome = if clips.len() == registry.jobs.len() {
            BatchOutcome::AllSucceeded
        } else if clips.is_empty() {
            BatchOutcome::ZeroSuccess
        } else {
            BatchOutcome::Partial
        };

        Self {
            outcome,
            clips,
            failed,
            unresolved,
            timed_out,
        }
    }

    /// Artifact handed to the consuming stage.
    #[must_use]
    pub fn to_artifact(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Waits until every job in the published registry is terminal or
/// `deadline` passes.
///
/// Returns on the deadline without polling again: jobs still outstanding
/// are reported as unresolved.
pub async fn await_gate(mut status: watch::Receiver<JobRegistry>, deadline: Instant) -> GateOutcome {
    let deadline_sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(deadline_sleep);

    loop {
        {
            let snapshot = status.borrow_and_update();
            if snapshot.all_terminal() {
                return GateOutcome::from_registry(&snapshot, false);
            }
        }

        tokio::select! {
            biased;
            () = &mut deadline_sleep => {
                let snapshot = status.borrow();
                return GateOutcome::from_registry(&snapshot, true);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    // Poller gone; nothing further will be published.
                    deadline_sleep.as_mut().await;
                    let snapshot = status.borrow();
                    return GateOutcome::from_registry(&snapshot, true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{GenerationJob, RemoteStatus};
    use pretty_assertions::assert_eq;
    use tokio::time::Duration;

    fn registry(statuses: &[(&str, VariantTag, Option<RemoteStatus>)]) -> JobRegistry {
        let mut registry = JobRegistry::new("R1");
        for (key, variant, status) in statuses {
            let mut job = GenerationJob::pending(*key, *variant);
            if let Some(s) = status {
                job.observe(s.clone());
            }
            registry.upsert(job);
        }
        registry
    }

    fn ok(artifact: &str) -> Option<RemoteStatus> {
        Some(RemoteStatus::Succeeded {
            artifact_ref: artifact.to_string(),
        })
    }

    #[test]
    fn test_classification() {
        let all = registry(&[
            ("R1_intro", VariantTag::Intro, ok("a")),
            ("R1_outro", VariantTag::Outro, ok("b")),
        ]);
        assert_eq!(
            GateOutcome::from_registry(&all, false).outcome,
            BatchOutcome::AllSucceeded
        );

        let partial = registry(&[
            ("R1_intro", VariantTag::Intro, ok("a")),
            (
                "R1_outro",
                VariantTag::Outro,
                Some(RemoteStatus::Failed {
                    reason: "quota".into(),
                }),
            ),
        ]);
        let outcome = GateOutcome::from_registry(&partial, false);
        assert_eq!(outcome.outcome, BatchOutcome::Partial);
        assert_eq!(outcome.failed, vec!["R1_outro".to_string()]);

        let none = registry(&[("R1_intro", VariantTag::Intro, None)]);
        let outcome = GateOutcome::from_registry(&none, true);
        assert_eq!(outcome.outcome, BatchOutcome::ZeroSuccess);
        assert_eq!(outcome.unresolved, vec!["R1_intro".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_when_all_terminal() {
        let (_tx, rx) = watch::channel(registry(&[("R1_intro", VariantTag::Intro, ok("a"))]));
        let start = Instant::now();
        let outcome = await_gate(rx, start + Duration::from_secs(180)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.clips.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_success_at_exact_deadline() {
        let (_tx, rx) = watch::channel(registry(&[
            ("R1_intro", VariantTag::Intro, None),
            ("R1_broll", VariantTag::Broll, None),
        ]));
        let start = Instant::now();
        let outcome = await_gate(rx, start + Duration::from_secs(180)).await;

        assert_eq!(start.elapsed(), Duration::from_secs(180));
        assert!(outcome.timed_out);
        assert_eq!(outcome.outcome, BatchOutcome::ZeroSuccess);
        assert_eq!(outcome.unresolved.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_releases_when_last_job_resolves() {
        let (tx, rx) = watch::channel(registry(&[("R1_broll", VariantTag::Broll, None)]));
        let start = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(40)).await;
            tx.send_replace(registry(&[("R1_broll", VariantTag::Broll, ok("broll.mp4"))]));
            tokio::time::sleep(Duration::from_secs(600)).await;
        });

        let outcome = await_gate(rx, start + Duration::from_secs(180)).await;
        assert_eq!(start.elapsed(), Duration::from_secs(40));
        assert_eq!(outcome.outcome, BatchOutcome::AllSucceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_gone_still_waits_for_deadline() {
        let (tx, rx) = watch::channel(registry(&[("R1_intro", VariantTag::Intro, None)]));
        drop(tx);
        let start = Instant::now();
        let outcome = await_gate(rx, start + Duration::from_secs(30)).await;
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(outcome.timed_out);
    }
}
