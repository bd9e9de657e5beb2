//! A store wrapper that records and fails run saves on request.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::{Run, Stage};
use crate::errors::StoreError;
use crate::escalation::StoredResolution;
use crate::jobs::JobRegistry;
use crate::store::{ArtifactStore, InMemoryStateStore, StateStore};

/// Delegates to an in-memory store and keeps a copy of every run save.
///
/// A save can be made to fail by its position (1-based) or by the stage
/// the saved run is in. Failed saves are recorded but not applied.
#[derive(Debug)]
pub struct RecordingStore {
    inner: Arc<InMemoryStateStore>,
    fail_nth: Option<usize>,
    fail_at: Option<Stage>,
    saved: Mutex<Vec<Run>>,
}

impl RecordingStore {
    /// Wraps `inner`; every save succeeds.
    #[must_use]
    pub fn new(inner: Arc<InMemoryStateStore>) -> Self {
        Self {
            inner,
            fail_nth: None,
            fail_at: None,
            saved: Mutex::new(Vec::new()),
        }
    }

    /// The `n`th run save fails.
    #[must_use]
    pub fn fail_save(mut self, n: usize) -> Self {
        self.fail_nth = Some(n);
        self
    }

    /// Every save of a run positioned at `stage` fails.
    #[must_use]
    pub fn fail_at_stage(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    /// Every run passed to `save_run`, in order.
    #[must_use]
    pub fn saved(&self) -> Vec<Run> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl StateStore for RecordingStore {
    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let n = {
            let mut saved = self.saved.lock();
            saved.push(run.clone());
            saved.len()
        };
        if self.fail_nth == Some(n) || self.fail_at == Some(run.current_stage) {
            return Err(StoreError::Io {
                path: format!("runs/{}.json", run.id).into(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.save_run(run).await
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.inner.load_run(run_id).await
    }

    async fn list_incomplete(&self) -> Result<Vec<Run>, StoreError> {
        self.inner.list_incomplete().await
    }

    async fn save_job_registry(&self, registry: &JobRegistry) -> Result<(), StoreError> {
        self.inner.save_job_registry(registry).await
    }

    async fn load_job_registry(&self, run_id: &str) -> Result<Option<JobRegistry>, StoreError> {
        self.inner.load_job_registry(run_id).await
    }

    async fn save_resolution(&self, resolution: &StoredResolution) -> Result<(), StoreError> {
        self.inner.save_resolution(resolution).await
    }

    async fn find_resolution(
        &self,
        fingerprint: &str,
    ) -> Result<Option<StoredResolution>, StoreError> {
        self.inner.find_resolution(fingerprint).await
    }
}

#[async_trait]
impl ArtifactStore for RecordingStore {
    async fn create_artifact(
        &self,
        run_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner.create_artifact(run_id, key, value).await
    }

    async fn read_artifact(
        &self,
        run_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.inner.read_artifact(run_id, key).await
    }
}
