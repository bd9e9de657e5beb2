//! JSON file store.
//!
//! Layout under the root directory:
//!
//! ```text
//! runs/<run_id>.json
//! jobs/<run_id>.json
//! knowledge/<fingerprint>.json
//! artifacts/<run_id>/<key>.json
//! ```
//!
//! Writes go to a temp file in the destination directory, are fsynced and
//! then renamed over the target, so readers never observe a torn record.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{is_safe_component, ArtifactStore, StateStore};
use crate::core::Run;
use crate::errors::StoreError;
use crate::escalation::StoredResolution;
use crate::jobs::JobRegistry;

/// File-backed [`StateStore`] and [`ArtifactStore`].
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

/// How a write treats an existing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Replace,
    CreateNew,
}

impl FileStateStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, dir: &str, id: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_component(id) {
            return Err(StoreError::io(
                self.root.join(dir),
                io::Error::new(io::ErrorKind::InvalidInput, format!("unsafe identifier '{id}'")),
            ));
        }
        Ok(self.root.join(dir).join(format!("{id}.json")))
    }

    fn artifact_path(&self, run_id: &str, key: &str) -> Result<PathBuf, StoreError> {
        let dir = self.record_path("artifacts", run_id)?.with_extension("");
        if !is_safe_component(key) {
            return Err(StoreError::io(
                dir,
                io::Error::new(io::ErrorKind::InvalidInput, format!("unsafe artifact key '{key}'")),
            ));
        }
        Ok(dir.join(format!("{key}.json")))
    }

    async fn write_json<T: Serialize + ?Sized>(
        path: PathBuf,
        value: &T,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::serialization(path.display().to_string(), e))?;
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes, mode))
            .await
            .map_err(|e| StoreError::io(PathBuf::new(), io::Error::new(io::ErrorKind::Other, e)))?
    }

    async fn read_json<T: DeserializeOwned + Send + 'static>(
        path: PathBuf,
    ) -> Result<Option<T>, StoreError> {
        tokio::task::spawn_blocking(move || read_json_blocking(&path))
            .await
            .map_err(|e| StoreError::io(PathBuf::new(), io::Error::new(io::ErrorKind::Other, e)))?
    }
}

fn read_json_blocking<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::serialization(path.display().to_string(), e))
}

/// Writes `data` to a temp file beside `target`, fsyncs it and renames it
/// into place. In `CreateNew` mode an existing target is never replaced.
fn atomic_write(target: &Path, data: &[u8], mode: WriteMode) -> Result<(), StoreError> {
    let parent = target.parent().ok_or_else(|| {
        StoreError::io(
            target,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
        )
    })?;
    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
    temp.write_all(data).map_err(|e| StoreError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(temp.path(), e))?;

    let persisted = match mode {
        WriteMode::Replace => temp.persist(target),
        WriteMode::CreateNew => temp.persist_noclobber(target),
    };
    persisted.map_err(|e| StoreError::io(target, e.error))?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let path = self.record_path("runs", &run.id)?;
        Self::write_json(path, run, WriteMode::Replace).await
    }

    async fn load_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let path = self.record_path("runs", run_id)?;
        Self::read_json(path).await
    }

    async fn list_incomplete(&self) -> Result<Vec<Run>, StoreError> {
        let dir = self.root.join("runs");
        let paths = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || -> Result<Vec<PathBuf>, StoreError> {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(StoreError::io(&dir, e)),
                };
                let mut paths = Vec::new();
                for entry in entries {
                    let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
                    let is_record = path.extension().is_some_and(|ext| ext == "json")
                        && !path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with('.'));
                    if is_record {
                        paths.push(path);
                    }
                }
                paths.sort();
                Ok(paths)
            }
        })
        .await
        .map_err(|e| StoreError::io(&dir, io::Error::new(io::ErrorKind::Other, e)))??;

        let mut runs = Vec::new();
        for path in paths {
            if let Some(run) = Self::read_json::<Run>(path).await? {
                if !run.is_terminal() {
                    runs.push(run);
                }
            }
        }
        Ok(runs)
    }

    async fn save_job_registry(&self, registry: &JobRegistry) -> Result<(), StoreError> {
        let path = self.record_path("jobs", &registry.run_id)?;
        Self::write_json(path, registry, WriteMode::Replace).await
    }

    async fn load_job_registry(&self, run_id: &str) -> Result<Option<JobRegistry>, StoreError> {
        let path = self.record_path("jobs", run_id)?;
        Self::read_json(path).await
    }

    async fn save_resolution(&self, resolution: &StoredResolution) -> Result<(), StoreError> {
        let path = self.record_path("knowledge", &resolution.fingerprint)?;
        Self::write_json(path, resolution, WriteMode::Replace).await
    }

    async fn find_resolution(
        &self,
        fingerprint: &str,
    ) -> Result<Option<StoredResolution>, StoreError> {
        let path = self.record_path("knowledge", fingerprint)?;
        Self::read_json(path).await
    }
}

#[async_trait]
impl ArtifactStore for FileStateStore {
    async fn create_artifact(
        &self,
        run_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let path = self.artifact_path(run_id, key)?;
        Self::write_json(path, value, WriteMode::CreateNew)
            .await
            .map_err(|e| match e {
                StoreError::Io { ref source, .. } if source.kind() == io::ErrorKind::AlreadyExists => {
                    StoreError::AlreadyExists {
                        run_id: run_id.to_string(),
                        key: key.to_string(),
                    }
                }
                other => other,
            })
    }

    async fn read_artifact(
        &self,
        run_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let path = self.artifact_path(run_id, key)?;
        Self::read_json(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;
    use crate::jobs::{GenerationJob, VariantTag};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_run_round_trip_and_list_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        let active = Run::new("R1", "yt:a", 3);
        let mut done = Run::new("R2", "yt:b", 3);
        done.current_stage = Stage::Completed;

        store.save_run(&active).await.unwrap();
        store.save_run(&done).await.unwrap();

        assert_eq!(store.load_run("R1").await.unwrap(), Some(active.clone()));
        assert_eq!(store.load_run("missing").await.unwrap(), None);

        let incomplete = store.list_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "R1");
    }

    #[tokio::test]
    async fn test_save_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let mut registry = JobRegistry::new("R1");
        registry.upsert(GenerationJob::pending("R1_intro", VariantTag::Intro));
        store.save_job_registry(&registry).await.unwrap();

        registry.upsert(GenerationJob::pending("R1_outro", VariantTag::Outro));
        store.save_job_registry(&registry).await.unwrap();

        let loaded = store.load_job_registry("R1").await.unwrap().unwrap();
        assert_eq!(loaded.jobs.len(), 2);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("jobs"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temp files must not linger: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_artifacts_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let original = serde_json::json!({"start": 10.0, "end": 40.0});

        store
            .create_artifact("R1", "moment_selection", &original)
            .await
            .unwrap();
        let err = store
            .create_artifact("R1", "moment_selection", &serde_json::json!({"start": 0.0}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let stored = store
            .read_artifact("R1", "moment_selection")
            .await
            .unwrap();
        assert_eq!(stored, Some(original));
    }

    #[tokio::test]
    async fn test_unsafe_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load_run("../escape").await.is_err());
        assert!(store
            .create_artifact("R1", "../x", &serde_json::json!(null))
            .await
            .is_err());
    }
}
