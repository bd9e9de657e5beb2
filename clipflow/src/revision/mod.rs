//! Post-delivery revisions.
//!
//! A revision forks the moment-selection artifact under a new
//! `-revised` key, rewinds the run to the kind's re-entry stage and leaves
//! the pipeline to run forward again from there. The original artifact is
//! never touched.

mod kind;
mod moment;

pub use kind::{
    MutationContext, RevisionKind, RevisionRequest, RevisionRule, ADD_CONTEXT_DELTA_SECS,
    EXTEND_DELTA_SECS, REVISION_TABLE,
};
pub use moment::{MomentSelection, ReframeTarget, TimeRange};

use std::sync::Arc;
use tracing::info;

use crate::core::artifact::{GENERATED_CLIPS, MOMENT_SELECTION};
use crate::core::{EscalationState, HistoryKind, Run, Stage};
use crate::errors::{ClipflowError, RevisionError};
use crate::events::{self, EventSink};
use crate::store::{allocate_artifact_key, Store};

/// Applies revision requests to completed runs.
pub struct RevisionHandler {
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    max_clip_secs: f64,
}

impl std::fmt::Debug for RevisionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionHandler")
            .field("max_clip_secs", &self.max_clip_secs)
            .finish_non_exhaustive()
    }
}

impl RevisionHandler {
    /// Creates a handler enforcing `max_clip_secs` on widening.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventSink>, max_clip_secs: f64) -> Self {
        Self {
            store,
            events,
            max_clip_secs,
        }
    }

    /// Applies a revision and returns the stage the run now sits in.
    ///
    /// Only `COMPLETED` runs can be revised. Nothing is written if the
    /// mutation is rejected.
    pub async fn apply_revision(
        &self,
        run: &mut Run,
        request: &RevisionRequest,
    ) -> Result<Stage, ClipflowError> {
        if run.current_stage != Stage::Completed {
            return Err(ClipflowError::invalid_state(
                &run.id,
                format!("only completed runs can be revised, run is in {}", run.current_stage),
            ));
        }
        let rule = request.kind.rule();

        let key = run
            .artifacts
            .get(MOMENT_SELECTION)
            .cloned()
            .ok_or_else(|| missing(&run.id))?;
        let value = self
            .store
            .read_artifact(&run.id, &key)
            .await?
            .ok_or_else(|| missing(&run.id))?;
        let mut moment: MomentSelection =
            serde_json::from_value(value).map_err(|e| RevisionError::MalformedArtifact {
                artifact: MOMENT_SELECTION.to_string(),
                reason: e.to_string(),
            })?;

        (rule.mutate)(
            &mut moment,
            MutationContext {
                params: &request.params,
                max_clip_secs: self.max_clip_secs,
            },
        )?;

        let revised_key = allocate_artifact_key(&*self.store, &run.id, MOMENT_SELECTION, 1).await?;
        let revised = serde_json::to_value(&moment).map_err(|e| RevisionError::MalformedArtifact {
            artifact: MOMENT_SELECTION.to_string(),
            reason: e.to_string(),
        })?;
        self.store
            .create_artifact(&run.id, &revised_key, &revised)
            .await?;
        run.artifacts
            .insert(MOMENT_SELECTION.to_string(), revised_key.clone());

        let resume_at = rule.resume_at;
        if resume_at.ordinal() <= Stage::Content.ordinal() {
            // Generation is requested again from the new moment.
            run.artifacts.remove(GENERATED_CLIPS);
        }
        run.stages_completed
            .retain(|stage| stage.ordinal() < resume_at.ordinal());
        run.revision += 1;
        run.escalation_state = EscalationState::None;
        run.failure_reason = None;
        run.resolutions.clear();
        run.enter_stage(resume_at);
        run.record(HistoryKind::Revision {
            kind: request.kind.to_string(),
            resume_at,
        });
        self.store.save_run(run).await?;

        info!(run_id = %run.id, kind = %request.kind, %resume_at, key = %revised_key, "Revision applied");
        self.events
            .emit(
                events::REVISION_APPLIED,
                Some(serde_json::json!({
                    "run_id": run.id,
                    "kind": request.kind,
                    "resume_at": resume_at,
                    "artifact_key": revised_key,
                    "revision": run.revision,
                })),
            )
            .await;
        Ok(resume_at)
    }
}

fn missing(run_id: &str) -> RevisionError {
    RevisionError::MissingArtifact {
        run_id: run_id.to_string(),
        artifact: MOMENT_SELECTION.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::fsm::FsmEngine;
    use crate::store::{ArtifactStore, InMemoryStateStore, StateStore};
    use crate::testing::run_at;
    use pretty_assertions::assert_eq;

    async fn completed_run(store: &InMemoryStateStore) -> Run {
        let mut run = run_at("R1", Stage::Completed, 3);
        let moment = serde_json::json!({"start": 30.0, "end": 60.0, "source_duration": 600.0});
        store.create_artifact("R1", MOMENT_SELECTION, &moment).await.unwrap();
        store
            .create_artifact("R1", "content_package", &serde_json::json!({"title": "t"}))
            .await
            .unwrap();
        run.artifacts.insert(MOMENT_SELECTION.into(), MOMENT_SELECTION.into());
        run.artifacts.insert("content_package".into(), "content_package".into());
        run
    }

    fn handler(store: &Arc<InMemoryStateStore>) -> (RevisionHandler, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let handler = RevisionHandler::new(
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(&events) as Arc<dyn EventSink>,
            90.0,
        );
        (handler, events)
    }

    #[tokio::test]
    async fn test_extend_forks_artifact_and_rewinds() {
        let store = Arc::new(InMemoryStateStore::new());
        let (handler, events) = handler(&store);
        let mut run = completed_run(&store).await;
        let original = serde_json::to_vec(&store.read_artifact("R1", MOMENT_SELECTION).await.unwrap()).unwrap();

        let resume = handler
            .apply_revision(&mut run, &RevisionRequest::new(RevisionKind::Extend))
            .await
            .unwrap();

        assert_eq!(resume, Stage::Encoding);
        assert_eq!(run.current_stage, Stage::Encoding);
        assert_eq!(run.attempt, 1);
        assert_eq!(run.revision, 1);
        assert_eq!(run.stages_completed.last(), Some(&Stage::LayoutAnalysis));
        assert!(FsmEngine::new().is_consistent(&run));

        let after = serde_json::to_vec(&store.read_artifact("R1", MOMENT_SELECTION).await.unwrap()).unwrap();
        assert_eq!(original, after);

        assert_eq!(
            run.artifacts.get(MOMENT_SELECTION).map(String::as_str),
            Some("moment_selection-revised")
        );
        let revised = store
            .read_artifact("R1", "moment_selection-revised")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revised["start"], 25.0);
        assert_eq!(revised["end"], 65.0);
        assert_eq!(run.artifacts.get("content_package").map(String::as_str), Some("content_package"));

        let persisted = store.load_run("R1").await.unwrap().unwrap();
        assert_eq!(persisted.current_stage, Stage::Encoding);
        assert_eq!(events.events_of_type("revision.applied").len(), 1);
    }

    #[tokio::test]
    async fn test_second_revision_gets_next_key() {
        let store = Arc::new(InMemoryStateStore::new());
        let (handler, _) = handler(&store);
        let mut run = completed_run(&store).await;

        handler
            .apply_revision(&mut run, &RevisionRequest::new(RevisionKind::AddContext))
            .await
            .unwrap();
        run.stages_completed = run_at("R1", Stage::Completed, 3).stages_completed;
        run.current_stage = Stage::Completed;
        handler
            .apply_revision(&mut run, &RevisionRequest::new(RevisionKind::Extend))
            .await
            .unwrap();

        assert_eq!(
            run.artifacts.get(MOMENT_SELECTION).map(String::as_str),
            Some("moment_selection-revised-2")
        );
        let revised = store
            .read_artifact("R1", "moment_selection-revised-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revised["start"], 10.0);
        assert_eq!(revised["end"], 80.0);
    }

    #[tokio::test]
    async fn test_different_moment_reenters_transcript() {
        let store = Arc::new(InMemoryStateStore::new());
        let (handler, _) = handler(&store);
        let mut run = completed_run(&store).await;
        run.artifacts.insert(GENERATED_CLIPS.into(), GENERATED_CLIPS.into());

        let resume = handler
            .apply_revision(&mut run, &RevisionRequest::new(RevisionKind::DifferentMoment))
            .await
            .unwrap();

        assert_eq!(resume, Stage::Transcript);
        assert_eq!(run.stages_completed, vec![Stage::Router, Stage::Research]);
        assert!(!run.artifacts.contains_key(GENERATED_CLIPS));
        let key = run.artifacts.get(MOMENT_SELECTION).unwrap();
        let revised = store.read_artifact("R1", key).await.unwrap().unwrap();
        assert_eq!(revised["excluded_ranges"][0]["start"], 30.0);
    }

    #[tokio::test]
    async fn test_rejections_write_nothing() {
        let store = Arc::new(InMemoryStateStore::new());
        let (handler, _) = handler(&store);

        let mut running = run_at("R1", Stage::Encoding, 3);
        assert!(matches!(
            handler
                .apply_revision(&mut running, &RevisionRequest::new(RevisionKind::Extend))
                .await,
            Err(ClipflowError::InvalidRunState { .. })
        ));

        let mut run = completed_run(&store).await;
        let err = handler
            .apply_revision(&mut run, &RevisionRequest::new(RevisionKind::Reframe))
            .await
            .unwrap_err();
        assert!(matches!(err, ClipflowError::Revision(RevisionError::InvalidParameters { .. })));
        assert_eq!(run.current_stage, Stage::Completed);
        assert_eq!(store.artifact_count("R1"), 2);

        let mut bare = run_at("R2", Stage::Completed, 3);
        assert!(matches!(
            handler
                .apply_revision(&mut bare, &RevisionRequest::new(RevisionKind::Extend))
                .await,
            Err(ClipflowError::Revision(RevisionError::MissingArtifact { .. }))
        ));
    }
}
