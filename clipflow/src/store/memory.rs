//! In-memory store for tests and embedding.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

use super::{ArtifactStore, StateStore};
use crate::core::Run;
use crate::errors::StoreError;
use crate::escalation::StoredResolution;
use crate::jobs::JobRegistry;

/// Keeps serialized records in memory.
///
/// Records are stored as JSON text so every read returns an independent
/// snapshot, matching the file store's replace-whole-record semantics.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    runs: RwLock<HashMap<String, String>>,
    jobs: RwLock<HashMap<String, String>>,
    knowledge: RwLock<HashMap<String, String>>,
    artifacts: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts for a run.
    #[must_use]
    pub fn artifact_count(&self, run_id: &str) -> usize {
        self.artifacts
            .read()
            .keys()
            .filter(|(run, _)| run == run_id)
            .count()
    }
}

fn encode<T: Serialize + ?Sized>(what: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::serialization(what, e))
}

fn decode<T: DeserializeOwned>(what: &str, raw: Option<&String>) -> Result<Option<T>, StoreError> {
    raw.map(|s| serde_json::from_str(s).map_err(|e| StoreError::serialization(what, e)))
        .transpose()
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let raw = encode("run", run)?;
        self.runs.write().insert(run.id.clone(), raw);
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        decode("run", self.runs.read().get(run_id))
    }

    async fn list_incomplete(&self) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read();
        let mut ids: Vec<&String> = runs.keys().collect();
        ids.sort();
        let mut incomplete = Vec::new();
        for id in ids {
            if let Some(run) = decode::<Run>("run", runs.get(id))? {
                if !run.is_terminal() {
                    incomplete.push(run);
                }
            }
        }
        Ok(incomplete)
    }

    async fn save_job_registry(&self, registry: &JobRegistry) -> Result<(), StoreError> {
        let raw = encode("job registry", registry)?;
        self.jobs.write().insert(registry.run_id.clone(), raw);
        Ok(())
    }

    async fn load_job_registry(&self, run_id: &str) -> Result<Option<JobRegistry>, StoreError> {
        decode("job registry", self.jobs.read().get(run_id))
    }

    async fn save_resolution(&self, resolution: &StoredResolution) -> Result<(), StoreError> {
        let raw = encode("resolution", resolution)?;
        self.knowledge
            .write()
            .insert(resolution.fingerprint.clone(), raw);
        Ok(())
    }

    async fn find_resolution(
        &self,
        fingerprint: &str,
    ) -> Result<Option<StoredResolution>, StoreError> {
        decode("resolution", self.knowledge.read().get(fingerprint))
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStateStore {
    async fn create_artifact(
        &self,
        run_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let raw = encode("artifact", value)?;
        let mut artifacts = self.artifacts.write();
        let slot = (run_id.to_string(), key.to_string());
        if artifacts.contains_key(&slot) {
            return Err(StoreError::AlreadyExists {
                run_id: run_id.to_string(),
                key: key.to_string(),
            });
        }
        artifacts.insert(slot, raw);
        Ok(())
    }

    async fn read_artifact(
        &self,
        run_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let artifacts = self.artifacts.read();
        decode(
            "artifact",
            artifacts.get(&(run_id.to_string(), key.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;

    #[tokio::test]
    async fn test_list_incomplete_skips_terminal_runs() {
        let store = InMemoryStateStore::new();
        let mut failed = Run::new("R0", "src", 3);
        failed.current_stage = Stage::Failed;
        store.save_run(&failed).await.unwrap();
        store.save_run(&Run::new("R1", "src", 3)).await.unwrap();

        let ids: Vec<String> = store
            .list_incomplete()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["R1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_artifact_refuses_existing_key() {
        let store = InMemoryStateStore::new();
        let value = serde_json::json!({"a": 1});
        store.create_artifact("R1", "k", &value).await.unwrap();
        assert!(store.create_artifact("R1", "k", &value).await.is_err());
        assert!(store.create_artifact("R2", "k", &value).await.is_ok());
        assert_eq!(store.artifact_count("R1"), 1);
    }
}
