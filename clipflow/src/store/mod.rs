//! Durable state.
//!
//! [`StateStore`] holds run records, job registries and the escalation
//! knowledge base; [`ArtifactStore`] holds stage artifacts. Every write
//! replaces a whole record, so a concurrent reader sees either the previous
//! or the new complete value. Artifacts are create-only.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use async_trait::async_trait;

use crate::core::{Run, StageArtifacts};
use crate::errors::StoreError;
use crate::escalation::StoredResolution;
use crate::jobs::JobRegistry;

/// Persistence for run records, job registries and resolutions.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically replaces the run record.
    async fn save_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Loads a run record.
    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Lists runs not in a terminal stage.
    async fn list_incomplete(&self) -> Result<Vec<Run>, StoreError>;

    /// Atomically replaces a run's job registry.
    async fn save_job_registry(&self, registry: &JobRegistry) -> Result<(), StoreError>;

    /// Loads a run's job registry.
    async fn load_job_registry(&self, run_id: &str) -> Result<Option<JobRegistry>, StoreError>;

    /// Stores an escalation resolution in the knowledge base.
    async fn save_resolution(&self, resolution: &StoredResolution) -> Result<(), StoreError>;

    /// Looks up a resolution by input fingerprint.
    async fn find_resolution(&self, fingerprint: &str)
        -> Result<Option<StoredResolution>, StoreError>;
}

/// Create-only storage for stage artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes a new artifact. Fails with `AlreadyExists` if the key is taken.
    async fn create_artifact(
        &self,
        run_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Reads an artifact.
    async fn read_artifact(
        &self,
        run_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Returns true if the key is taken.
    async fn artifact_exists(&self, run_id: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.read_artifact(run_id, key).await?.is_some())
    }
}

/// Both stores behind one handle.
pub trait Store: StateStore + ArtifactStore {}

impl<T: StateStore + ArtifactStore> Store for T {}

/// Suffix appended to forked artifact keys.
pub const REVISED_SUFFIX: &str = "-revised";

/// Candidate key for the `index`-th write of an artifact name.
///
/// `0` is the bare name, `1` is `name-revised`, `n > 1` is `name-revised-n`.
#[must_use]
pub fn artifact_key(name: &str, index: u32) -> String {
    match index {
        0 => name.to_string(),
        1 => format!("{name}{REVISED_SUFFIX}"),
        n => format!("{name}{REVISED_SUFFIX}-{n}"),
    }
}

/// Picks the first free key for `name`, starting at `from_index`.
pub async fn allocate_artifact_key<S: ArtifactStore + ?Sized>(
    store: &S,
    run_id: &str,
    name: &str,
    from_index: u32,
) -> Result<String, StoreError> {
    let mut index = from_index;
    loop {
        let key = artifact_key(name, index);
        if !store.artifact_exists(run_id, &key).await? {
            return Ok(key);
        }
        index += 1;
    }
}

/// Writes every artifact of a committed bundle under a fresh key and points
/// the run record at it. Earlier keys stay untouched.
pub async fn commit_artifacts<S: ArtifactStore + ?Sized>(
    store: &S,
    run: &mut Run,
    bundle: &StageArtifacts,
) -> Result<(), StoreError> {
    for (name, value) in bundle.iter() {
        let key = allocate_artifact_key(store, &run.id, name, 0).await?;
        store.create_artifact(&run.id, &key, value).await?;
        run.artifacts.insert(name.to_string(), key);
    }
    Ok(())
}

/// Loads the current version of every artifact the run points at.
pub async fn load_current_artifacts<S: ArtifactStore + ?Sized>(
    store: &S,
    run: &Run,
) -> Result<StageArtifacts, StoreError> {
    let mut bundle = StageArtifacts::new();
    for (name, key) in &run.artifacts {
        let value = store
            .read_artifact(&run.id, key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                what: "artifact",
                run_id: run.id.clone(),
                key: key.clone(),
            })?;
        bundle.insert(name.clone(), value);
    }
    Ok(bundle)
}

/// Rejects identifiers that would escape the store root when used in paths.
pub(crate) fn is_safe_component(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_key_sequence() {
        assert_eq!(artifact_key("moment_selection", 0), "moment_selection");
        assert_eq!(artifact_key("moment_selection", 1), "moment_selection-revised");
        assert_eq!(artifact_key("moment_selection", 2), "moment_selection-revised-2");
    }

    #[test]
    fn test_safe_component() {
        assert!(is_safe_component("R1"));
        assert!(is_safe_component("moment_selection-revised-2"));
        assert!(!is_safe_component("../etc"));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component(".hidden"));
        assert!(!is_safe_component(""));
    }

    #[tokio::test]
    async fn test_allocate_skips_taken_keys() {
        let store = InMemoryStateStore::new();
        store
            .create_artifact("R1", "moment_selection", &serde_json::json!({}))
            .await
            .unwrap();
        let key = allocate_artifact_key(&store, "R1", "moment_selection", 0)
            .await
            .unwrap();
        assert_eq!(key, "moment_selection-revised");

        let forked = allocate_artifact_key(&store, "R1", "content_package", 1)
            .await
            .unwrap();
        assert_eq!(forked, "content_package-revised");
    }

    #[tokio::test]
    async fn test_commit_forks_keys_and_keeps_originals() {
        let store = InMemoryStateStore::new();
        let mut run = Run::new("R1", "src", 3);
        let first = StageArtifacts::new().with("encoded_video", serde_json::json!("v1.mp4"));
        commit_artifacts(&store, &mut run, &first).await.unwrap();
        assert_eq!(run.artifacts["encoded_video"], "encoded_video");

        let second = StageArtifacts::new().with("encoded_video", serde_json::json!("v2.mp4"));
        commit_artifacts(&store, &mut run, &second).await.unwrap();
        assert_eq!(run.artifacts["encoded_video"], "encoded_video-revised");

        let current = load_current_artifacts(&store, &run).await.unwrap();
        assert_eq!(current.get("encoded_video"), Some(&serde_json::json!("v2.mp4")));
        assert_eq!(
            store.read_artifact("R1", "encoded_video").await.unwrap(),
            Some(serde_json::json!("v1.mp4"))
        );
    }
}
