//! Escalation handling.
//!
//! A run that needs external input is suspended in place. The handler first
//! consults the knowledge base of earlier resolutions; otherwise it asks
//! through the [`EscalationChannel`] and waits a bounded time. When nobody
//! answers, a safe default is applied and recorded as such.

mod channel;
mod knowledge;

pub use channel::PendingQuestions;
pub use knowledge::{fingerprint, parse_answer, Resolution, StoredResolution, DEFAULT_STRATEGY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::{EscalationReason, HistoryKind, Run, Stage};
use crate::errors::ClipflowError;
use crate::events::{self, EventSink};
use crate::fsm::FsmEngine;
use crate::ports::EscalationChannel;
use crate::store::StateStore;

/// A question put to a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationQuestion {
    /// Question identifier.
    pub id: String,
    /// Run identifier.
    pub run_id: String,
    /// Stage the run is suspended in.
    pub stage: Stage,
    /// Why the run was suspended.
    pub reason: EscalationReason,
    /// The item needing resolution.
    pub item: String,
    /// Text shown to the human.
    pub prompt: String,
    /// When the question was asked.
    pub asked_at: DateTime<Utc>,
}

impl EscalationQuestion {
    /// Creates a question with a fresh id and a prompt derived from the reason.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage: Stage,
        reason: EscalationReason,
        item: impl Into<String>,
    ) -> Self {
        let item = item.into();
        let prompt = match reason {
            EscalationReason::UnclassifiableInput => {
                format!("Stage {stage} cannot classify '{item}'. Reply with a handling strategy, or 'reject'.")
            }
            EscalationReason::QaExhausted => format!(
                "{} used every attempt without passing. Reply 'accept' to use the best attempt, or 'reject'.",
                stage.gate_name()
            ),
            EscalationReason::StageFailure => {
                format!("Stage {stage} failed review: {item}. Reply 'accept' to use the best attempt, or 'reject'.")
            }
            EscalationReason::ExecutionExhausted => {
                format!("Stage {stage} kept erroring: {item}. Reply 'accept' to use the best attempt, or 'reject'.")
            }
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            stage,
            reason,
            item,
            prompt,
            asked_at: Utc::now(),
        }
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Reused from the knowledge base.
    KnowledgeBase,
    /// Answered through the channel.
    Input,
    /// Safe default after the wait elapsed or the channel failed.
    Default,
}

/// A resolved escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationOutcome {
    /// The reason the run was suspended for.
    pub reason: EscalationReason,
    /// Resolution applied.
    pub resolution: Resolution,
    /// Where it came from.
    pub source: ResolutionSource,
}

/// Suspends runs, obtains a resolution and resumes them.
pub struct EscalationHandler {
    store: Arc<dyn StateStore>,
    channel: Arc<dyn EscalationChannel>,
    events: Arc<dyn EventSink>,
    wait: Duration,
}

impl std::fmt::Debug for EscalationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationHandler")
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl EscalationHandler {
    /// Creates a handler waiting at most `wait` for an answer.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        channel: Arc<dyn EscalationChannel>,
        events: Arc<dyn EventSink>,
        wait: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            events,
            wait,
        }
    }

    /// Suspends the run for `reason` and returns once it is resolved.
    ///
    /// The suspension is persisted before anything is asked. On return the
    /// run is resumed in its stage with the resolution recorded; acting on
    /// it (accepting an attempt, failing the run) is up to the caller.
    pub async fn escalate(
        &self,
        fsm: &FsmEngine,
        run: &mut Run,
        reason: EscalationReason,
        item: &str,
    ) -> Result<EscalationOutcome, ClipflowError> {
        let stage = run.current_stage;
        fsm.request_escalation(run, reason)?;
        run.record(HistoryKind::Escalation {
            stage,
            reason,
            item: item.to_string(),
        });
        self.store.save_run(run).await?;
        warn!(run_id = %run.id, %stage, %reason, item, "Run escalated");
        self.events
            .emit(
                events::RUN_ESCALATED,
                Some(serde_json::json!({
                    "run_id": run.id,
                    "stage": stage,
                    "reason": reason,
                    "item": item,
                })),
            )
            .await;

        self.settle(fsm, run, reason, item).await
    }

    /// Resolves a run found suspended on startup.
    ///
    /// Returns `None` if the run is not suspended.
    pub async fn resume(
        &self,
        fsm: &FsmEngine,
        run: &mut Run,
    ) -> Result<Option<EscalationOutcome>, ClipflowError> {
        let crate::core::EscalationState::Pending(reason) = run.escalation_state else {
            return Ok(None);
        };
        let item = run
            .history
            .iter()
            .rev()
            .find_map(|entry| match &entry.kind {
                HistoryKind::Escalation { item, .. } => Some(item.clone()),
                _ => None,
            })
            .unwrap_or_default();
        info!(run_id = %run.id, %reason, "Re-raising escalation after restart");
        self.settle(fsm, run, reason, &item).await.map(Some)
    }

    async fn settle(
        &self,
        fsm: &FsmEngine,
        run: &mut Run,
        reason: EscalationReason,
        item: &str,
    ) -> Result<EscalationOutcome, ClipflowError> {
        let stage = run.current_stage;
        let key = is_shareable(reason).then(|| fingerprint(reason, stage, item));

        let stored = match &key {
            Some(key) => self.store.find_resolution(key).await?,
            None => None,
        };
        let (resolution, source) = if let Some(stored) = stored {
            info!(run_id = %run.id, fingerprint = ?key, "Applying stored resolution");
            (stored.resolution, ResolutionSource::KnowledgeBase)
        } else if let Some(answer) = self.ask(run, stage, reason, item).await {
            if let Some(fingerprint) = key {
                self.store
                    .save_resolution(&StoredResolution {
                        fingerprint,
                        reason,
                        stage,
                        item: item.to_string(),
                        resolution: answer.clone(),
                        resolved_at: Utc::now(),
                    })
                    .await?;
            }
            (answer, ResolutionSource::Input)
        } else {
            let fallback = Resolution::safe_default(reason);
            warn!(run_id = %run.id, %reason, resolution = %fallback, "No answer, applying safe default");
            (fallback, ResolutionSource::Default)
        };

        let by_default = source == ResolutionSource::Default;
        fsm.resolve_escalation(run, by_default)?;
        run.record(HistoryKind::EscalationResolved {
            reason,
            resolution: resolution.to_string(),
            by_default,
        });
        match &resolution {
            Resolution::Value(value) => {
                run.resolutions
                    .insert(stage.as_str().to_string(), value.clone());
            }
            Resolution::AcceptBest if !by_default => {
                run.overrides.insert(stage.gate_name());
            }
            Resolution::AcceptBest | Resolution::FailRun => {}
        }
        self.store.save_run(run).await?;

        info!(run_id = %run.id, %stage, %reason, resolution = %resolution, ?source, "Escalation resolved");
        self.events
            .emit(
                events::ESCALATION_RESOLVED,
                Some(serde_json::json!({
                    "run_id": run.id,
                    "stage": stage,
                    "reason": reason,
                    "resolution": resolution,
                    "source": source,
                })),
            )
            .await;

        Ok(EscalationOutcome {
            reason,
            resolution,
            source,
        })
    }

    /// Asks the channel, bounded by the wait. `None` means no usable answer.
    async fn ask(
        &self,
        run: &Run,
        stage: Stage,
        reason: EscalationReason,
        item: &str,
    ) -> Option<Resolution> {
        let question = EscalationQuestion::new(&run.id, stage, reason, item);
        match tokio::time::timeout(self.wait, self.channel.ask(&question)).await {
            Ok(Ok(answer)) => {
                let parsed = parse_answer(&answer);
                if parsed.is_none() {
                    warn!(run_id = %run.id, "Blank escalation answer ignored");
                }
                parsed
            }
            Ok(Err(e)) => {
                warn!(run_id = %run.id, error = %e, "Escalation channel failed");
                None
            }
            Err(_) => {
                warn!(run_id = %run.id, wait_secs = self.wait.as_secs(), "Escalation wait elapsed");
                None
            }
        }
    }
}

/// Only classification answers describe the input itself and carry over to
/// other runs; exhaustion and review answers judge one run's attempts.
const fn is_shareable(reason: EscalationReason) -> bool {
    matches!(reason, EscalationReason::UnclassifiableInput)
}
