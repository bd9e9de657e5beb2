//! Per-run polling loop with adaptive backoff.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn, Instrument};

use super::coordinator::JobContext;
use super::JobRegistry;
use crate::config::OrchestratorConfig;
use crate::errors::StoreError;
use crate::events;

/// Computes the wait before the next poll.
///
/// Polls run on the active interval while jobs are changing. Once
/// `idle_after` consecutive polls saw no change and at least that many
/// active intervals have passed since the last change, the schedule backs
/// off to the idle interval until the next change.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    active: Duration,
    idle: Duration,
    idle_after: u32,
    last_change: Instant,
    stable_polls: u32,
}

impl PollSchedule {
    /// Creates a schedule whose last change is `now`.
    #[must_use]
    pub const fn new(active: Duration, idle: Duration, idle_after: u32, now: Instant) -> Self {
        Self {
            active,
            idle,
            idle_after,
            last_change: now,
            stable_polls: 0,
        }
    }

    /// Creates a schedule from the orchestrator configuration.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig, now: Instant) -> Self {
        Self::new(
            Duration::from_secs(config.poll_active_secs),
            Duration::from_secs(config.poll_idle_secs),
            config.poll_idle_after,
            now,
        )
    }

    /// Feeds the result of one poll.
    pub fn record_poll(&mut self, changed: bool, now: Instant) {
        if changed {
            self.last_change = now;
            self.stable_polls = 0;
        } else {
            self.stable_polls = self.stable_polls.saturating_add(1);
        }
    }

    /// Returns true once the batch has been stable long enough to back off.
    #[must_use]
    pub fn is_idle(&self, now: Instant) -> bool {
        self.stable_polls >= self.idle_after
            && now.saturating_duration_since(self.last_change) >= self.active * self.idle_after
    }

    /// Wait before the next poll.
    #[must_use]
    pub fn next_interval(&self, now: Instant) -> Duration {
        if self.is_idle(now) {
            self.idle
        } else {
            self.active
        }
    }

    /// When the status last changed.
    #[must_use]
    pub const fn last_change(&self) -> Instant {
        self.last_change
    }
}

/// Handle to a running poller.
///
/// Dropping the handle stops the loop at its next wait.
#[derive(Debug)]
pub struct PollerHandle {
    status: watch::Receiver<JobRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    deadline: Instant,
}

impl PollerHandle {
    /// Subscribes to registry snapshots published after every poll.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobRegistry> {
        self.status.clone()
    }

    /// Absolute deadline of the batch this poller tracks.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns true once the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the loop to stop. An in-flight poll completes first.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Starts a polling loop for one run. The loop exits once every job is
/// terminal, when stopped, or at `deadline`.
pub(crate) fn spawn_poller(
    ctx: Arc<JobContext>,
    initial: JobRegistry,
    schedule: PollSchedule,
    deadline: Instant,
) -> PollerHandle {
    let run_id = initial.run_id.clone();
    let (status_tx, status_rx) = watch::channel(initial);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let span = tracing::info_span!("poller", run_id = %run_id);
    let task = tokio::spawn(
        poll_loop(ctx, run_id, schedule, deadline, status_tx, shutdown_rx).instrument(span),
    );
    PollerHandle {
        status: status_rx,
        shutdown: shutdown_tx,
        task,
        deadline,
    }
}

async fn poll_loop(
    ctx: Arc<JobContext>,
    run_id: String,
    mut schedule: PollSchedule,
    deadline: Instant,
    status: watch::Sender<JobRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let wake = (Instant::now() + schedule.next_interval(Instant::now())).min(deadline);
        tokio::select! {
            () = tokio::time::sleep_until(wake) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if Instant::now() >= deadline {
            debug!("Batch deadline passed, poller exiting");
            break;
        }

        match poll_once(&ctx, &run_id).await {
            Ok((registry, changed)) => {
                schedule.record_poll(changed, Instant::now());
                let done = registry.all_terminal();
                status.send_replace(registry);
                if done {
                    debug!("All generation jobs terminal, poller exiting");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Job registry poll failed, retrying next cycle");
                schedule.record_poll(false, Instant::now());
            }
        }
    }
}

/// Polls every outstanding job once and merges the answers into the
/// registry.
///
/// Remote calls happen without the registry lock; the lock is taken only to
/// reload, merge and save, so a concurrent `fire` is never held up by a slow
/// backend.
async fn poll_once(ctx: &JobContext, run_id: &str) -> Result<(JobRegistry, bool), StoreError> {
    let Some(snapshot) = ctx.store.load_job_registry(run_id).await? else {
        return Ok((JobRegistry::new(run_id), false));
    };

    let keys = snapshot.outstanding_keys();
    let results = join_all(keys.into_iter().map(|key| async {
        let result = ctx.backend.poll(&key).await;
        (key, result)
    }))
    .await;

    let lock = ctx.locks.lock_for(run_id);
    let _guard = lock.lock().await;
    let mut registry = ctx
        .store
        .load_job_registry(run_id)
        .await?
        .unwrap_or(snapshot);

    let mut changed = false;
    for (key, result) in results {
        let Some(job) = registry.get_mut(&key) else {
            continue;
        };
        match result {
            Ok(remote) => {
                if job.observe(remote) {
                    changed = true;
                    debug!(key = %key, status = %job.status, "Generation job status changed");
                    ctx.events.try_emit(
                        events::JOB_STATUS,
                        Some(serde_json::json!({
                            "run_id": run_id,
                            "key": key,
                            "status": job.status,
                            "artifact_ref": job.artifact_ref,
                        })),
                    );
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Generation job poll failed, keeping last status"),
        }
    }

    ctx.store.save_job_registry(&registry).await?;
    Ok((registry, changed))
}
