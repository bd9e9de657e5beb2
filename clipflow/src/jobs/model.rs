//! Generation jobs and the per-run job registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a generated clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantTag {
    /// Opening animation.
    Intro,
    /// Cutaway footage over narration.
    Broll,
    /// Closing animation.
    Outro,
    /// Emphasis overlay on the key moment.
    Highlight,
}

impl VariantTag {
    /// Lowercase token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Broll => "broll",
            Self::Outro => "outro",
            Self::Highlight => "highlight",
        }
    }
}

impl fmt::Display for VariantTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request selected by the content stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Variant tag.
    pub variant: VariantTag,
    /// Generation prompt.
    pub prompt: String,
    /// Backend specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl GenerationRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(variant: VariantTag, prompt: impl Into<String>) -> Self {
        Self {
            variant,
            prompt: prompt.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// Acknowledgement from the remote service on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAck {
    /// New job created.
    Accepted,
    /// The service already knows this key.
    Duplicate,
}

/// Remote job status as reported by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Queued.
    Pending,
    /// In progress.
    Running,
    /// Finished with an artifact.
    Succeeded {
        /// Reference to the produced clip.
        artifact_ref: String,
    },
    /// Finished without an artifact.
    Failed {
        /// Failure reason.
        reason: String,
    },
}

/// Job status stored in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Recorded, maybe dispatched, not yet seen running.
    Pending,
    /// Seen running.
    Running,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
}

impl JobStatus {
    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One external generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Idempotent key.
    pub key: String,
    /// Variant tag.
    pub variant: VariantTag,
    /// Current status.
    pub status: JobStatus,
    /// When the job was recorded for submission.
    pub submitted_at: DateTime<Utc>,
    /// When the status was last polled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Produced artifact, only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    /// Failure reason, only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationJob {
    /// Creates a pending job.
    #[must_use]
    pub fn pending(key: impl Into<String>, variant: VariantTag) -> Self {
        Self {
            key: key.into(),
            variant,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            last_polled_at: None,
            artifact_ref: None,
            error: None,
        }
    }

    /// Applies a polled status. Returns true if the stored status changed.
    pub fn observe(&mut self, remote: RemoteStatus) -> bool {
        self.last_polled_at = Some(Utc::now());
        if self.status.is_terminal() {
            return false;
        }
        let before = self.status;
        match remote {
            RemoteStatus::Pending => {}
            RemoteStatus::Running => self.status = JobStatus::Running,
            RemoteStatus::Succeeded { artifact_ref } => {
                self.status = JobStatus::Succeeded;
                self.artifact_ref = Some(artifact_ref);
            }
            RemoteStatus::Failed { reason } => {
                self.status = JobStatus::Failed;
                self.error = Some(reason);
            }
        }
        self.status != before
    }

    /// Marks the job failed locally (e.g. rejected at submission).
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(reason.into());
    }
}

/// All generation jobs of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRegistry {
    /// Run identifier.
    pub run_id: String,
    /// Jobs in submission order.
    #[serde(default)]
    pub jobs: Vec<GenerationJob>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            jobs: Vec::new(),
        }
    }

    /// Looks up a job by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&GenerationJob> {
        self.jobs.iter().find(|j| j.key == key)
    }

    /// Looks up a job by key, mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut GenerationJob> {
        self.jobs.iter_mut().find(|j| j.key == key)
    }

    /// Inserts a job, replacing any job with the same key.
    pub fn upsert(&mut self, job: GenerationJob) {
        match self.get_mut(&job.key) {
            Some(existing) => *existing = job,
            None => self.jobs.push(job),
        }
    }

    /// Returns true if every job is terminal (vacuously true when empty).
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Keys of jobs that are not terminal.
    #[must_use]
    pub fn outstanding_keys(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.key.clone())
            .collect()
    }

    /// Jobs that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &GenerationJob> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Succeeded)
    }
}
