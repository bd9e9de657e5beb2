//! Fires generation batches and owns the per-run pollers.

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use super::gate::{await_gate, GateOutcome};
use super::poller::{spawn_poller, PollSchedule, PollerHandle};
use super::{job_key, GenerationJob, GenerationRequest, JobRegistry, JobStatus, SubmitAck, VariantTag};
use crate::config::OrchestratorConfig;
use crate::errors::{BackendError, StoreError};
use crate::events::{self, EventSink};
use crate::ports::GenerationBackend;
use crate::store::StateStore;

/// Per-run locks serializing registry read-modify-write cycles.
#[derive(Debug, Default)]
pub(crate) struct RegistryLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RegistryLocks {
    pub(crate) fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(run_id.to_string()).or_default().clone()
    }
}

/// Collaborators shared by the coordinator and its pollers.
pub(crate) struct JobContext {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) backend: Arc<dyn GenerationBackend>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) locks: RegistryLocks,
}

/// What a call to [`AsyncJobCoordinator::fire`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireReport {
    /// Keys dispatched to the backend.
    pub submitted: Vec<String>,
    /// Keys already pending, running or succeeded.
    pub skipped: Vec<String>,
    /// Keys the backend rejected; recorded as failed.
    pub rejected: Vec<String>,
    /// Variants dropped by the cap or as duplicates.
    pub dropped: Vec<VariantTag>,
}

/// Fires bounded generation batches and tracks them until the await gate.
pub struct AsyncJobCoordinator {
    ctx: Arc<JobContext>,
    max_jobs: usize,
    timeout: Duration,
    config: OrchestratorConfig,
    pollers: DashMap<String, PollerHandle>,
}

impl std::fmt::Debug for AsyncJobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJobCoordinator")
            .field("max_jobs", &self.max_jobs)
            .field("timeout", &self.timeout)
            .field("active_pollers", &self.pollers.len())
            .finish_non_exhaustive()
    }
}

impl AsyncJobCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: Arc<dyn GenerationBackend>,
        events: Arc<dyn EventSink>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(JobContext {
                store,
                backend,
                events,
                locks: RegistryLocks::default(),
            }),
            max_jobs: config.max_generation_jobs,
            timeout: config.generation_timeout(),
            config: config.clone(),
            pollers: DashMap::new(),
        }
    }

    /// Submits a batch for a run and starts its poller.
    ///
    /// Requests beyond the cap and repeated variants are dropped. Keys
    /// already pending, running or succeeded are skipped; failed keys are
    /// submitted again. New jobs are persisted as `pending` before any
    /// remote call is issued.
    pub async fn fire(
        &self,
        run_id: &str,
        requests: &[GenerationRequest],
    ) -> Result<FireReport, StoreError> {
        let mut report = FireReport::default();
        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for request in requests {
            if !seen.insert(request.variant) || batch.len() >= self.max_jobs {
                report.dropped.push(request.variant);
                continue;
            }
            batch.push(request);
        }
        if !report.dropped.is_empty() {
            warn!(run_id, dropped = ?report.dropped, cap = self.max_jobs, "Generation requests dropped");
        }

        let lock = self.ctx.locks.lock_for(run_id);
        let guard = lock.lock().await;

        let mut registry = self
            .ctx
            .store
            .load_job_registry(run_id)
            .await?
            .unwrap_or_else(|| JobRegistry::new(run_id));

        let mut dispatch = Vec::new();
        for request in batch {
            let key = job_key(run_id, request.variant);
            match registry.get(&key).map(|job| job.status) {
                Some(JobStatus::Pending | JobStatus::Running | JobStatus::Succeeded) => {
                    report.skipped.push(key);
                }
                Some(JobStatus::Failed) | None => {
                    registry.upsert(GenerationJob::pending(&key, request.variant));
                    dispatch.push((key, request));
                }
            }
        }

        if !dispatch.is_empty() {
            self.ctx.store.save_job_registry(&registry).await?;

            let results = join_all(dispatch.into_iter().map(|(key, request)| async move {
                let result = self.ctx.backend.submit(&key, request).await;
                (key, result)
            }))
            .await;

            let mut rejected_any = false;
            for (key, result) in results {
                match result {
                    Ok(SubmitAck::Accepted | SubmitAck::Duplicate) => report.submitted.push(key),
                    Err(BackendError::Rejected(reason)) => {
                        warn!(run_id, key = %key, reason = %reason, "Generation request rejected");
                        if let Some(job) = registry.get_mut(&key) {
                            job.mark_failed(reason);
                        }
                        rejected_any = true;
                        report.rejected.push(key);
                    }
                    Err(e @ BackendError::Remote(_)) => {
                        // Left pending: the key is idempotent and the poller
                        // resolves it or the gate times it out.
                        warn!(run_id, key = %key, error = %e, "Generation submit failed, tracking as pending");
                        report.submitted.push(key);
                    }
                }
            }
            if rejected_any {
                self.ctx.store.save_job_registry(&registry).await?;
            }
        }
        drop(guard);

        info!(
            run_id,
            submitted = report.submitted.len(),
            skipped = report.skipped.len(),
            rejected = report.rejected.len(),
            "Generation batch fired"
        );
        self.ctx
            .events
            .emit(
                events::JOBS_FIRED,
                Some(serde_json::json!({
                    "run_id": run_id,
                    "submitted": report.submitted,
                    "skipped": report.skipped,
                    "rejected": report.rejected,
                })),
            )
            .await;

        self.start_poller(registry, Instant::now() + self.timeout);
        Ok(report)
    }

    /// Restarts polling for a run from its persisted registry.
    ///
    /// The deadline restarts from now. Returns false when the run has no
    /// outstanding jobs.
    pub async fn resume(&self, run_id: &str) -> Result<bool, StoreError> {
        if self.is_polling(run_id) {
            return Ok(true);
        }
        let Some(registry) = self.ctx.store.load_job_registry(run_id).await? else {
            return Ok(false);
        };
        if registry.all_terminal() {
            return Ok(false);
        }
        info!(run_id, outstanding = registry.outstanding_keys().len(), "Resuming generation poller");
        self.start_poller(registry, Instant::now() + self.timeout);
        Ok(true)
    }

    fn start_poller(&self, registry: JobRegistry, deadline: Instant) {
        if registry.all_terminal() || self.is_polling(&registry.run_id) {
            return;
        }
        let run_id = registry.run_id.clone();
        let schedule = PollSchedule::from_config(&self.config, Instant::now());
        let handle = spawn_poller(Arc::clone(&self.ctx), registry, schedule, deadline);
        self.pollers.insert(run_id, handle);
    }

    /// Blocks until the run's batch resolves or its deadline passes, then
    /// stops the poller.
    pub async fn await_gate(&self, run_id: &str) -> Result<GateOutcome, StoreError> {
        if !self.pollers.contains_key(run_id) {
            self.resume(run_id).await?;
        }

        let watched = self
            .pollers
            .get(run_id)
            .map(|handle| (handle.subscribe(), handle.deadline()));

        let outcome = match watched {
            Some((status, deadline)) => await_gate(status, deadline).await,
            None => {
                let registry = self
                    .ctx
                    .store
                    .load_job_registry(run_id)
                    .await?
                    .unwrap_or_else(|| JobRegistry::new(run_id));
                GateOutcome::from_registry(&registry, false)
            }
        };
        self.stop(run_id);

        info!(
            run_id,
            outcome = ?outcome.outcome,
            clips = outcome.clips.len(),
            unresolved = outcome.unresolved.len(),
            timed_out = outcome.timed_out,
            "Await gate resolved"
        );
        self.ctx
            .events
            .emit(
                events::GATE_RESOLVED,
                Some(serde_json::json!({
                    "run_id": run_id,
                    "outcome": outcome.outcome,
                    "clips": outcome.clips.iter().map(|c| &c.key).collect::<Vec<_>>(),
                    "unresolved": outcome.unresolved,
                    "timed_out": outcome.timed_out,
                })),
            )
            .await;
        Ok(outcome)
    }

    /// Current registry snapshot for a run.
    pub async fn registry(&self, run_id: &str) -> Result<Option<JobRegistry>, StoreError> {
        self.ctx.store.load_job_registry(run_id).await
    }

    /// Returns true while a poller is tracked for the run.
    #[must_use]
    pub fn is_polling(&self, run_id: &str) -> bool {
        self.pollers
            .get(run_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops and forgets the run's poller.
    pub fn stop(&self, run_id: &str) {
        if let Some((_, handle)) = self.pollers.remove(run_id) {
            handle.stop();
        }
    }

    /// Stops every poller.
    pub fn shutdown(&self) {
        for entry in self.pollers.iter() {
            entry.value().stop();
        }
        self.pollers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::jobs::BatchOutcome;
    use crate::store::InMemoryStateStore;
    use crate::testing::ScriptedBackend;
    use pretty_assertions::assert_eq;

    fn requests() -> Vec<GenerationRequest> {
        vec![
            GenerationRequest::new(VariantTag::Intro, "open on the speaker"),
            GenerationRequest::new(VariantTag::Broll, "city skyline"),
            GenerationRequest::new(VariantTag::Outro, "logo sting"),
        ]
    }

    fn coordinator(
        backend: Arc<ScriptedBackend>,
        store: Arc<InMemoryStateStore>,
        config: &OrchestratorConfig,
    ) -> AsyncJobCoordinator {
        AsyncJobCoordinator::new(store, backend, Arc::new(CollectingEventSink::new()), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_returns_at_timeout() {
        let backend = Arc::new(
            ScriptedBackend::new().succeed_after("R1_broll", Duration::from_secs(40), "clips/broll.mp4"),
        );
        let store = Arc::new(InMemoryStateStore::new());
        let config = OrchestratorConfig::default().with_generation_timeout_secs(180);
        let jobs = coordinator(Arc::clone(&backend), Arc::clone(&store), &config);

        let start = Instant::now();
        let report = jobs.fire("R1", &requests()).await.unwrap();
        assert_eq!(report.submitted, vec!["R1_intro", "R1_broll", "R1_outro"]);

        let outcome = jobs.await_gate("R1").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        assert_eq!(outcome.outcome, BatchOutcome::Partial);
        assert_eq!(outcome.clips.len(), 1);
        assert_eq!(outcome.clips[0].key, "R1_broll");
        assert_eq!(outcome.unresolved, vec!["R1_intro", "R1_outro"]);
        assert!(!jobs.is_polling("R1"));

        let registry = store.load_job_registry("R1").await.unwrap().unwrap();
        assert_eq!(registry.get("R1_intro").unwrap().status, JobStatus::Pending);
        assert_eq!(registry.get("R1_broll").unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refire_skips_live_keys_and_retries_failed() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .succeed_after("R1_intro", Duration::from_secs(5), "intro.mp4")
                .fail_after("R1_outro", Duration::from_secs(5), "render crashed"),
        );
        let store = Arc::new(InMemoryStateStore::new());
        let config = OrchestratorConfig::default();
        let jobs = coordinator(Arc::clone(&backend), Arc::clone(&store), &config);

        jobs.fire("R1", &requests()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        jobs.stop("R1");

        let report = jobs.fire("R1", &requests()).await.unwrap();
        assert_eq!(report.skipped, vec!["R1_intro", "R1_broll"]);
        assert_eq!(report.submitted, vec!["R1_outro"]);
        assert_eq!(backend.submissions("R1_intro"), 1);
        assert_eq!(backend.submissions("R1_outro"), 2);
        jobs.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_and_duplicate_variants_are_dropped() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(InMemoryStateStore::new());
        let config = OrchestratorConfig::default().with_max_generation_jobs(2);
        let jobs = coordinator(backend, store, &config);

        let mut batch = requests();
        batch.insert(1, GenerationRequest::new(VariantTag::Intro, "again"));
        let report = jobs.fire("R1", &batch).await.unwrap();

        assert_eq!(report.submitted, vec!["R1_intro", "R1_broll"]);
        assert_eq!(report.dropped, vec![VariantTag::Intro, VariantTag::Outro]);
        jobs.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_submission_recorded_failed() {
        let backend = Arc::new(ScriptedBackend::new().reject("R1_outro", "unsupported prompt"));
        let store = Arc::new(InMemoryStateStore::new());
        let config = OrchestratorConfig::default();
        let jobs = coordinator(backend, Arc::clone(&store), &config);

        let report = jobs.fire("R1", &requests()).await.unwrap();
        assert_eq!(report.rejected, vec!["R1_outro"]);

        let registry = store.load_job_registry("R1").await.unwrap().unwrap();
        let outro = registry.get("R1_outro").unwrap();
        assert_eq!(outro.status, JobStatus::Failed);
        assert_eq!(outro.error.as_deref(), Some("unsupported prompt"));
        jobs.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_persisted_before_dispatch() {
        let store = Arc::new(InMemoryStateStore::new());
        let backend = Arc::new(
            ScriptedBackend::new().check_registry_on_submit(Arc::clone(&store) as Arc<dyn StateStore>, "R1"),
        );
        let config = OrchestratorConfig::default();
        let jobs = coordinator(Arc::clone(&backend), store, &config);

        jobs.fire("R1", &requests()).await.unwrap();
        assert_eq!(backend.persisted_at_submit(), 3);
        jobs.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_restarts_polling_from_registry() {
        let backend = Arc::new(
            ScriptedBackend::new().succeed_after("R1_intro", Duration::ZERO, "intro.mp4"),
        );
        let store = Arc::new(InMemoryStateStore::new());
        let mut registry = JobRegistry::new("R1");
        registry.upsert(GenerationJob::pending("R1_intro", VariantTag::Intro));
        store.save_job_registry(&registry).await.unwrap();

        let config = OrchestratorConfig::default();
        let jobs = coordinator(backend, Arc::clone(&store), &config);
        assert!(jobs.resume("R1").await.unwrap());

        let outcome = jobs.await_gate("R1").await.unwrap();
        assert_eq!(outcome.outcome, BatchOutcome::AllSucceeded);
        assert!(!jobs.resume("R1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unawaited_batch_stops_polling_at_deadline() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(InMemoryStateStore::new());
        let config = OrchestratorConfig::default()
            .with_generation_timeout_secs(60)
            .with_poll_intervals(5, 30, 6);
        let jobs = coordinator(Arc::clone(&backend), store, &config);

        jobs.fire("R1", &requests()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!jobs.is_polling("R1"));

        let polls = backend.polls();
        assert!(polls > 0);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(backend.polls(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_proceeds_while_a_poll_is_outstanding() {
        let backend = Arc::new(ScriptedBackend::new().poll_delay(Duration::from_secs(30)));
        let store = Arc::new(InMemoryStateStore::new());
        let config = OrchestratorConfig::default()
            .with_generation_timeout_secs(600)
            .with_poll_intervals(5, 30, 6);
        let jobs = coordinator(Arc::clone(&backend), Arc::clone(&store), &config);

        jobs.fire("R1", &requests()[..1]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(backend.polls(), 1);

        let start = Instant::now();
        let report = jobs.fire("R1", &requests()[..2]).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(report.submitted, vec!["R1_broll"]);

        // The slow poll lands after the second fire and must not drop its job.
        tokio::time::sleep(Duration::from_secs(30)).await;
        let registry = store.load_job_registry("R1").await.unwrap().unwrap();
        assert!(registry.get("R1_intro").is_some());
        assert_eq!(registry.get("R1_broll").unwrap().status, JobStatus::Pending);
        jobs.shutdown();
    }
}
