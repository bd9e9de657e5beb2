//! The orchestrator: drives runs through the pipeline.
//!
//! One driver owns a run at a time. Each stage goes through the QA loop;
//! escalations are settled by the escalation handler and acted on here; the
//! generation batch is fired when the content stage passes and awaited
//! before assembly. The run record is saved after every transition, so any
//! incomplete run can be picked up again by [`Orchestrator::resume_incomplete`].

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::core::artifact::{GENERATED_CLIPS, GENERATION_REQUESTS};
use crate::core::{EscalationReason, FsmEvent, Run, Stage, StageArtifacts};
use crate::errors::ClipflowError;
use crate::escalation::{EscalationHandler, EscalationOutcome, Resolution};
use crate::events::{self, EventSink};
use crate::fsm::FsmEngine;
use crate::jobs::{AsyncJobCoordinator, GenerationRequest};
use crate::observability::run_span;
use crate::ports::Ports;
use crate::qa::{QaReflectionLoop, RetryBackoff, StageOutcome};
use crate::revision::{RevisionHandler, RevisionRequest};
use crate::store::{commit_artifacts, is_safe_component, StateStore, Store};


/// Marks a run as driven; removed on drop.
struct ActiveRun<'a> {
    active: &'a DashMap<String, ()>,
    run_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// Drives pipeline runs.
pub struct Orchestrator {
    config: OrchestratorConfig,
    fsm: FsmEngine,
    state: Arc<dyn StateStore>,
    store: Arc<dyn Store>,
    qa: QaReflectionLoop,
    escalation: EscalationHandler,
    jobs: AsyncJobCoordinator,
    revisions: RevisionHandler,
    events: Arc<dyn EventSink>,
    active: DashMap<String, ()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator. Fails on invalid configuration.
    pub fn new<S: Store + 'static>(
        config: OrchestratorConfig,
        store: Arc<S>,
        ports: Ports,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ClipflowError> {
        config.validate()?;
        let state: Arc<dyn StateStore> = Arc::clone(&store) as Arc<dyn StateStore>;
        let store: Arc<dyn Store> = store;
        let fsm = FsmEngine::new();

        let qa = QaReflectionLoop::new(
            fsm.clone(),
            Arc::clone(&store),
            ports.executor,
            ports.evaluator,
            Arc::clone(&events),
            &config,
        );
        let escalation = EscalationHandler::new(
            Arc::clone(&state),
            ports.channel,
            Arc::clone(&events),
            config.escalation_wait(),
        );
        let jobs = AsyncJobCoordinator::new(
            Arc::clone(&state),
            ports.backend,
            Arc::clone(&events),
            &config,
        );
        let revisions = RevisionHandler::new(Arc::clone(&store), Arc::clone(&events), config.max_clip_secs);

        Ok(Self {
            config,
            fsm,
            state,
            store,
            qa,
            escalation,
            jobs,
            revisions,
            events,
            active: DashMap::new(),
        })
    }

    /// Replaces the retry backoff used between errored attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.qa = self.qa.with_backoff(backoff);
        self
    }

    /// The generation job coordinator.
    pub const fn jobs(&self) -> &AsyncJobCoordinator {
        &self.jobs
    }

    /// The configuration in use.
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Loads a run record.
    pub async fn load_run(&self, run_id: &str) -> Result<Run, ClipflowError> {
        self.state
            .load_run(run_id)
            .await?
            .ok_or_else(|| ClipflowError::RunNotFound(run_id.to_string()))
    }

    /// Creates and persists a new run in the initial stage.
    pub async fn start_run(&self, run_id: &str, source_ref: &str) -> Result<Run, ClipflowError> {
        if !is_safe_component(run_id) {
            return Err(ClipflowError::invalid_state(run_id, "run id is not a valid key"));
        }
        if self.state.load_run(run_id).await?.is_some() {
            return Err(ClipflowError::invalid_state(run_id, "run already exists"));
        }
        let run = Run::new(run_id, source_ref, self.config.max_qa_attempts);
        self.state.save_run(&run).await?;
        info!(run_id, source_ref, "Run created");
        self.events
            .emit(
                events::RUN_CREATED,
                Some(serde_json::json!({"run_id": run_id, "source_ref": source_ref})),
            )
            .await;
        Ok(run)
    }

    /// Drives a run until it completes or fails.
    pub async fn run_pipeline(&self, run_id: &str) -> Result<Run, ClipflowError> {
        let _active = self.claim(run_id)?;
        let mut run = self.load_run(run_id).await?;
        let span = run_span(&run);
        self.drive_or_stop(&mut run).instrument(span).await?;
        Ok(run)
    }

    /// Applies a revision to a completed run and drives it again.
    pub async fn apply_revision(
        &self,
        run_id: &str,
        request: &RevisionRequest,
    ) -> Result<Run, ClipflowError> {
        let _active = self.claim(run_id)?;
        let mut run = self.load_run(run_id).await?;
        self.revisions.apply_revision(&mut run, request).await?;
        let span = run_span(&run);
        self.drive_or_stop(&mut run).instrument(span).await?;
        Ok(run)
    }

    /// Drives every incomplete run concurrently, one task per run.
    pub async fn resume_incomplete(
        self: &Arc<Self>,
    ) -> Result<Vec<(String, Result<Run, ClipflowError>)>, ClipflowError> {
        let runs = self.state.list_incomplete().await?;
        info!(count = runs.len(), "Resuming incomplete runs");

        let tasks = runs.into_iter().map(|run| {
            let orchestrator = Arc::clone(self);
            let run_id = run.id;
            async move {
                let driven = {
                    let run_id = run_id.clone();
                    tokio::spawn(async move { orchestrator.run_pipeline(&run_id).await })
                };
                let result = match driven.await {
                    Ok(result) => result,
                    Err(e) => Err(ClipflowError::invalid_state(
                        &run_id,
                        format!("driver task ended abnormally: {e}"),
                    )),
                };
                if let Err(ref e) = result {
                    error!(run_id = %run_id, error = %e, "Resumed run errored");
                }
                (run_id, result)
            }
        });
        Ok(join_all(tasks).await)
    }

    /// Stops every generation poller.
    pub fn shutdown(&self) {
        self.jobs.shutdown();
    }

    fn claim(&self, run_id: &str) -> Result<ActiveRun<'_>, ClipflowError> {
        if self.active.insert(run_id.to_string(), ()).is_some() {
            return Err(ClipflowError::invalid_state(run_id, "run is already being driven"));
        }
        Ok(ActiveRun {
            active: &self.active,
            run_id: run_id.to_string(),
        })
    }

    /// Drives the run; a failed drive leaves no poller behind.
    async fn drive_or_stop(&self, run: &mut Run) -> Result<(), ClipflowError> {
        let driven = self.drive(run).await;
        if let Err(ref e) = driven {
            self.jobs.stop(&run.id);
            warn!(run_id = %run.id, error = %e, "Run driver errored, generation polling stopped");
        }
        driven
    }

    async fn drive(&self, run: &mut Run) -> Result<(), ClipflowError> {
        if !self.fsm.is_consistent(run) {
            return Err(ClipflowError::invalid_state(
                &run.id,
                format!(
                    "stage {} is not reachable from completed stages {:?}",
                    run.current_stage, run.stages_completed
                ),
            ));
        }

        if run.is_escalated() {
            if let Some(outcome) = self.escalation.resume(&self.fsm, run).await? {
                self.act_on_resolution(run, &outcome).await?;
            }
        }
        if self.generation_in_flight(run) {
            self.fire_generation(run).await?;
        }

        while !run.is_terminal() {
            let stage = run.current_stage;
            if stage == Stage::Assembly && !run.artifacts.contains_key(GENERATED_CLIPS) {
                self.await_generation(run).await?;
            }

            match self.qa.run_stage(run).await? {
                StageOutcome::Advanced { .. } | StageOutcome::Overridden { .. } | StageOutcome::Failed { .. } => {}
                StageOutcome::Escalate { reason, item } => {
                    if reason == EscalationReason::UnclassifiableInput
                        && run.resolutions.contains_key(stage.as_str())
                    {
                        let reason = format!("{stage} still cannot classify '{item}' after a resolution was applied");
                        self.fail_run(run, &reason).await?;
                        continue;
                    }
                    let outcome = self.escalation.escalate(&self.fsm, run, reason, &item).await?;
                    self.act_on_resolution(run, &outcome).await?;
                }
            }

            if stage == Stage::Content && run.current_stage == Stage::LayoutAnalysis {
                self.fire_generation(run).await?;
            }
        }

        self.jobs.stop(&run.id);
        self.finish(run).await;
        Ok(())
    }

    /// True when a batch may be outstanding: content has passed but the
    /// gate before assembly has not resolved yet.
    fn generation_in_flight(&self, run: &Run) -> bool {
        let stage = run.current_stage;
        !stage.is_terminal()
            && stage.ordinal() > Stage::Content.ordinal()
            && stage.ordinal() <= Stage::Assembly.ordinal()
            && !run.artifacts.contains_key(GENERATED_CLIPS)
    }

    async fn act_on_resolution(
        &self,
        run: &mut Run,
        outcome: &EscalationOutcome,
    ) -> Result<(), ClipflowError> {
        let stage = run.current_stage;
        match (&outcome.resolution, outcome.reason) {
            (Resolution::FailRun, reason) => {
                self.fail_run(run, &format!("escalation ({reason}) at {stage} resolved as fail"))
                    .await
            }
            // The stage runs again with the resolution in its input.
            (_, EscalationReason::UnclassifiableInput) => Ok(()),
            (Resolution::AcceptBest | Resolution::Value(_), reason) => {
                if self.qa.accept_best(run).await?.is_none() {
                    self.fail_run(
                        run,
                        &format!("escalation ({reason}) at {stage} left no attempt to accept"),
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    async fn fail_run(&self, run: &mut Run, reason: &str) -> Result<(), ClipflowError> {
        if !run.is_terminal() {
            self.fsm.apply(run, FsmEvent::QaFail)?;
        }
        run.fail(reason);
        self.state.save_run(run).await?;
        warn!(run_id = %run.id, reason, "Run failed");
        Ok(())
    }

    async fn fire_generation(&self, run: &Run) -> Result<(), ClipflowError> {
        let Some(key) = run.artifacts.get(GENERATION_REQUESTS) else {
            debug!(run_id = %run.id, "No generation requests");
            return Ok(());
        };
        let Some(value) = self.store.read_artifact(&run.id, key).await? else {
            warn!(run_id = %run.id, key = %key, "Generation requests artifact missing");
            return Ok(());
        };
        let requests: Vec<GenerationRequest> = match serde_json::from_value(value) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Generation requests malformed, proceeding without clips");
                return Ok(());
            }
        };
        self.jobs.fire(&run.id, &requests).await?;
        Ok(())
    }

    async fn await_generation(&self, run: &mut Run) -> Result<(), ClipflowError> {
        let outcome = self.jobs.await_gate(&run.id).await?;
        let bundle = StageArtifacts::new().with(GENERATED_CLIPS, outcome.to_artifact());
        commit_artifacts(&*self.store, run, &bundle).await?;
        self.state.save_run(run).await?;
        Ok(())
    }

    async fn finish(&self, run: &Run) {
        match run.current_stage {
            Stage::Completed => {
                info!(run_id = %run.id, revision = run.revision, "Run completed");
                self.events
                    .emit(
                        events::RUN_COMPLETED,
                        Some(serde_json::json!({
                            "run_id": run.id,
                            "revision": run.revision,
                            "escalation_state": run.escalation_state,
                            "artifacts": run.artifacts,
                        })),
                    )
                    .await;
            }
            Stage::Failed => {
                self.events
                    .emit(
                        events::RUN_FAILED,
                        Some(serde_json::json!({
                            "run_id": run.id,
                            "reason": run.failure_reason,
                            "trail": run.reason_trail(),
                        })),
                    )
                    .await;
            }
            _ => {}
        }
    }
}
