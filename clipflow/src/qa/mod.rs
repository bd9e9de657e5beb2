//! Quality-gate reflection loop.
//!
//! [`QaReflectionLoop::run_stage`] drives the run's current stage through
//! execute, evaluate and maybe-rework cycles until it advances, needs an
//! escalation or fails. Every verdict is appended to the run history and
//! persisted in the same save as the transition it causes, so a restart
//! resumes at the right attempt.

mod attempt;
mod backoff;

pub use attempt::{attempt_artifact_name, best_attempt, candidates, AttemptCandidate};
pub use backoff::{BackoffStrategy, JitterStrategy, RetryBackoff};

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::core::{
    Decision, EscalationReason, FailureClass, FsmEvent, HistoryKind, QualityVerdict, Run,
    Severity, Stage, StageArtifacts,
};
use crate::errors::{ClipflowError, ExecutorError, StoreError};
use crate::events::{self, EventSink};
use crate::fsm::FsmEngine;
use crate::observability::{stage_span, SpanTimer, StageSpanAttributes};
use crate::ports::{QualityGateEvaluator, StageExecutor, StageInput};
use crate::store::{allocate_artifact_key, commit_artifacts, is_safe_component, load_current_artifacts, Store};

/// How a stage left the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The gate passed (or the stage is ungated) and the run moved on.
    Advanced {
        /// Stage entered.
        to: Stage,
    },
    /// A best-of attempt was accepted under an override.
    Overridden {
        /// Stage entered.
        to: Stage,
        /// Attempt accepted.
        attempt: u32,
        /// Its score.
        score: f64,
    },
    /// The stage cannot proceed without external input.
    Escalate {
        /// Why.
        reason: EscalationReason,
        /// The item needing resolution.
        item: String,
    },
    /// The run was moved to `FAILED`.
    Failed {
        /// Why.
        reason: String,
    },
}

/// Runs one stage with bounded rework.
pub struct QaReflectionLoop {
    fsm: FsmEngine,
    store: Arc<dyn Store>,
    executor: Arc<dyn StageExecutor>,
    evaluator: Arc<dyn QualityGateEvaluator>,
    events: Arc<dyn EventSink>,
    stage_timeout: Duration,
    backoff: RetryBackoff,
}

impl std::fmt::Debug for QaReflectionLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QaReflectionLoop")
            .field("stage_timeout", &self.stage_timeout)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl QaReflectionLoop {
    /// Creates a loop over the given collaborators.
    #[must_use]
    pub fn new(
        fsm: FsmEngine,
        store: Arc<dyn Store>,
        executor: Arc<dyn StageExecutor>,
        evaluator: Arc<dyn QualityGateEvaluator>,
        events: Arc<dyn EventSink>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            fsm,
            store,
            executor,
            evaluator,
            events,
            stage_timeout: config.stage_timeout(),
            backoff: RetryBackoff::from_config(config),
        }
    }

    /// Replaces the retry backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The FSM engine transitions go through.
    pub const fn fsm(&self) -> &FsmEngine {
        &self.fsm
    }

    /// Runs the run's current stage until it leaves the loop.
    pub async fn run_stage(&self, run: &mut Run) -> Result<StageOutcome, ClipflowError> {
        let stage = run.current_stage;
        if stage.is_terminal() {
            return Err(ClipflowError::invalid_state(&run.id, format!("{stage} is terminal")));
        }
        if run.is_escalated() {
            return Err(ClipflowError::invalid_state(&run.id, "run is suspended on an escalation"));
        }

        loop {
            let attempt = run.attempt;
            let span = stage_span(&run.id, stage, attempt);
            let timer = SpanTimer::start();
            let attrs = StageSpanAttributes::new(stage, attempt);

            let input = self.stage_input(run).await?;
            self.events
                .emit(
                    events::STAGE_ATTEMPT,
                    Some(serde_json::json!({"run_id": run.id, "stage": stage, "attempt": attempt})),
                )
                .await;

            let produced = self.execute(&input).instrument(span.clone()).await;
            let artifacts = match produced.and_then(|a| validate_artifacts(stage, a)) {
                Ok(artifacts) => artifacts,
                Err(ExecutorError::Unclassifiable { item }) => {
                    attrs
                        .with_outcome("unclassifiable")
                        .with_duration_ms(timer.elapsed_ms())
                        .log();
                    return Ok(StageOutcome::Escalate {
                        reason: EscalationReason::UnclassifiableInput,
                        item,
                    });
                }
                Err(ExecutorError::Validation(message)) => {
                    attrs
                        .with_outcome("invalid")
                        .with_duration_ms(timer.elapsed_ms())
                        .with_error(message.as_str())
                        .log();
                    match self.invalid_attempt(run, &message).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
                Err(ExecutorError::Failed(message)) => {
                    attrs
                        .with_outcome("error")
                        .with_duration_ms(timer.elapsed_ms())
                        .with_error(message.as_str())
                        .log();
                    match self.errored_attempt(run, &message).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            };

            if !stage.is_gated() {
                commit_artifacts(&*self.store, run, &artifacts).await?;
                attrs
                    .with_outcome("complete")
                    .with_duration_ms(timer.elapsed_ms())
                    .log();
                let to = self.advance(run, FsmEvent::StageComplete).await?;
                return Ok(StageOutcome::Advanced { to });
            }

            let key = self.keep_attempt(run, &artifacts).await?;
            let verdict = match self
                .evaluator
                .evaluate(stage, attempt, &artifacts)
                .instrument(span)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    let message = format!("quality gate errored: {e}");
                    attrs
                        .with_outcome("error")
                        .with_duration_ms(timer.elapsed_ms())
                        .with_error(message.as_str())
                        .log();
                    match self.errored_attempt(run, &message).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
            };

            attrs
                .with_outcome(verdict.decision.to_string())
                .with_score(verdict.score)
                .with_duration_ms(timer.elapsed_ms())
                .log();
            run.record(HistoryKind::Verdict {
                stage,
                verdict: verdict.clone(),
                artifact_key: Some(key),
            });
            // The verdict is persisted by the save that records its
            // consequence, so a restart never sees one without the other.

            match verdict.decision {
                Decision::Pass => {
                    commit_artifacts(&*self.store, run, &artifacts).await?;
                    let to = self.advance(run, FsmEvent::QaPass).await?;
                    return Ok(StageOutcome::Advanced { to });
                }
                Decision::Rework if run.attempt < run.attempt_cap => {
                    run.pending_fixes = verdict.fixes;
                    self.fsm.apply(run, FsmEvent::QaRework)?;
                    self.store.save_run(run).await?;
                }
                Decision::Rework => {
                    return self.exhausted(run, EscalationReason::QaExhausted).await;
                }
                Decision::Fail => match verdict.failure_class {
                    FailureClass::Fatal => {
                        let reason = format!("{} rejected the stage output", stage.gate_name());
                        self.fsm.apply(run, FsmEvent::QaFail)?;
                        run.fail(reason.as_str());
                        self.store.save_run(run).await?;
                        warn!(run_id = %run.id, %stage, attempt, "Gate failed the run");
                        return Ok(StageOutcome::Failed { reason });
                    }
                    FailureClass::NeedsReview => {
                        return Ok(StageOutcome::Escalate {
                            reason: EscalationReason::StageFailure,
                            item: verdict.summary(),
                        });
                    }
                },
            }
        }
    }

    /// Accepts the best stored attempt of the current stage and advances.
    ///
    /// Returns `None` when no attempt of this revision cycle was kept.
    pub async fn accept_best(&self, run: &mut Run) -> Result<Option<StageOutcome>, ClipflowError> {
        let stage = run.current_stage;
        let Some(best) = best_attempt(run, stage) else {
            return Ok(None);
        };
        let value = self
            .store
            .read_artifact(&run.id, &best.artifact_key)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                what: "attempt artifacts",
                run_id: run.id.clone(),
                key: best.artifact_key.clone(),
            })?;
        let bundle: StageArtifacts = serde_json::from_value(value)
            .map_err(|e| StoreError::serialization(format!("attempt '{}'", best.artifact_key), e))?;

        commit_artifacts(&*self.store, run, &bundle).await?;
        run.record(HistoryKind::Override {
            gate: stage.gate_name(),
            attempt: best.attempt,
            score: best.score,
        });
        info!(run_id = %run.id, %stage, attempt = best.attempt, score = best.score, "Accepting best attempt");
        let event = if stage.is_gated() {
            FsmEvent::QaPass
        } else {
            FsmEvent::StageComplete
        };
        let to = self.advance(run, event).await?;
        Ok(Some(StageOutcome::Overridden {
            to,
            attempt: best.attempt,
            score: best.score,
        }))
    }

    async fn stage_input(&self, run: &Run) -> Result<StageInput, ClipflowError> {
        let stage = run.current_stage;
        Ok(StageInput {
            run_id: run.id.clone(),
            source_ref: run.source_ref.clone(),
            stage,
            attempt: run.attempt,
            revision: run.revision,
            fixes: run.pending_fixes.clone(),
            upstream: load_current_artifacts(&*self.store, run).await?,
            resolution: run.resolutions.get(stage.as_str()).cloned(),
        })
    }

    async fn execute(&self, input: &StageInput) -> Result<StageArtifacts, ExecutorError> {
        match tokio::time::timeout(self.stage_timeout, self.executor.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::failed(format!(
                "timed out after {}s",
                self.stage_timeout.as_secs()
            ))),
        }
    }

    async fn keep_attempt(&self, run: &Run, artifacts: &StageArtifacts) -> Result<String, StoreError> {
        let name = attempt_artifact_name(run.current_stage, run.revision, run.attempt);
        let key = allocate_artifact_key(&*self.store, &run.id, &name, 0).await?;
        let value = serde_json::to_value(artifacts)
            .map_err(|e| StoreError::serialization("attempt artifacts", e))?;
        self.store.create_artifact(&run.id, &key, &value).await?;
        Ok(key)
    }

    async fn advance(&self, run: &mut Run, event: FsmEvent) -> Result<Stage, ClipflowError> {
        let from = run.current_stage;
        run.resolutions.remove(from.as_str());
        let to = self.fsm.apply(run, event)?;
        self.store.save_run(run).await?;
        info!(run_id = %run.id, stage = %from, next = %to, "Stage passed");
        self.events
            .emit(
                events::STAGE_PASSED,
                Some(serde_json::json!({"run_id": run.id, "stage": from, "next": to})),
            )
            .await;
        Ok(to)
    }

    /// Output failed structural checks: an automatic `fail` verdict that
    /// consumes an attempt.
    async fn invalid_attempt(
        &self,
        run: &mut Run,
        message: &str,
    ) -> Result<Option<StageOutcome>, ClipflowError> {
        let stage = run.current_stage;
        let verdict = QualityVerdict::fail(stage.gate_name(), run.attempt, 0.0)
            .with_issue(Severity::High, message)
            .with_fix(format!("produce valid output: {message}"));
        run.record(HistoryKind::Verdict {
            stage,
            verdict: verdict.clone(),
            artifact_key: None,
        });
        if run.attempt < run.attempt_cap {
            run.pending_fixes = verdict.fixes;
            self.fsm.apply(run, FsmEvent::QaRework)?;
            self.store.save_run(run).await?;
            return Ok(None);
        }
        self.exhausted(run, EscalationReason::QaExhausted).await.map(Some)
    }

    /// The executor (or the gate) errored: retried after a backoff.
    async fn errored_attempt(
        &self,
        run: &mut Run,
        message: &str,
    ) -> Result<Option<StageOutcome>, ClipflowError> {
        let stage = run.current_stage;
        let attempt = run.attempt;
        run.record(HistoryKind::ExecutionError {
            stage,
            attempt,
            error: message.to_string(),
        });
        if attempt < run.attempt_cap {
            self.fsm.apply(run, FsmEvent::QaRework)?;
            self.store.save_run(run).await?;
            let delay = self.backoff.delay_after(attempt);
            warn!(run_id = %run.id, %stage, attempt, delay_ms = delay.as_millis(), error = message, "Retrying stage");
            tokio::time::sleep(delay).await;
            return Ok(None);
        }
        self.exhausted(run, EscalationReason::ExecutionExhausted).await.map(Some)
    }

    /// Leaves the final verdict unsaved when escalating; the escalation
    /// persists it.
    async fn exhausted(
        &self,
        run: &mut Run,
        reason: EscalationReason,
    ) -> Result<StageOutcome, ClipflowError> {
        let gate = run.current_stage.gate_name();
        if run.has_override(&gate) {
            if let Some(outcome) = self.accept_best(run).await? {
                return Ok(outcome);
            }
        }
        warn!(run_id = %run.id, %gate, %reason, "Attempts exhausted");
        Ok(StageOutcome::Escalate { reason, item: gate })
    }
}

fn validate_artifacts(stage: Stage, artifacts: StageArtifacts) -> Result<StageArtifacts, ExecutorError> {
    if stage.is_gated() && artifacts.is_empty() {
        return Err(ExecutorError::Validation("no artifacts produced".to_string()));
    }
    if let Some(name) = artifacts.names().find(|name| !is_safe_component(name)) {
        return Err(ExecutorError::Validation(format!(
            "artifact name '{name}' is not a valid key"
        )));
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QaStatus;
    use crate::events::CollectingEventSink;
    use crate::store::{ArtifactStore, InMemoryStateStore, StateStore};
    use crate::testing::{run_at, RecordingStore, ScriptedEvaluator, ScriptedExecutor};
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        executor: Arc<ScriptedExecutor>,
        evaluator: Arc<ScriptedEvaluator>,
        events: Arc<CollectingEventSink>,
        qa: QaReflectionLoop,
    }

    fn fixture(executor: ScriptedExecutor, evaluator: ScriptedEvaluator) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let executor = Arc::new(executor);
        let evaluator = Arc::new(evaluator);
        let events = Arc::new(CollectingEventSink::new());
        let qa = QaReflectionLoop::new(
            FsmEngine::new(),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&executor) as Arc<dyn StageExecutor>,
            Arc::clone(&evaluator) as Arc<dyn QualityGateEvaluator>,
            Arc::clone(&events) as Arc<dyn EventSink>,
            &OrchestratorConfig::default().with_stage_timeout_secs(30),
        )
        .with_backoff(RetryBackoff::immediate());
        Fixture {
            store,
            executor,
            evaluator,
            events,
            qa,
        }
    }

    fn output(tag: &str) -> StageArtifacts {
        StageArtifacts::new().with("content_package", serde_json::json!({"title": tag}))
    }

    #[tokio::test]
    async fn test_pass_commits_and_advances() {
        let f = fixture(
            ScriptedExecutor::new().produce(Stage::Content, output("first")),
            ScriptedEvaluator::new(),
        );
        let mut run = run_at("R1", Stage::Content, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(outcome, StageOutcome::Advanced { to: Stage::LayoutAnalysis });
        assert_eq!(run.current_stage, Stage::LayoutAnalysis);
        assert_eq!(run.artifacts.get("content_package").map(String::as_str), Some("content_package"));
        let stored = f.store.read_artifact("R1", "content_package").await.unwrap().unwrap();
        assert_eq!(stored["title"], "first");

        let verdict_at = run
            .history
            .iter()
            .position(|e| matches!(e.kind, HistoryKind::Verdict { .. }))
            .unwrap();
        let transition_at = run
            .history
            .iter()
            .position(|e| matches!(e.kind, HistoryKind::Transition { .. }))
            .unwrap();
        assert!(verdict_at < transition_at);

        let persisted = f.store.load_run("R1").await.unwrap().unwrap();
        assert_eq!(persisted.current_stage, Stage::LayoutAnalysis);
        assert_eq!(f.events.events_of_type("stage.passed").len(), 1);
    }

    #[tokio::test]
    async fn test_override_accepts_highest_scoring_attempt() {
        let executor = ScriptedExecutor::new().script(
            Stage::Content,
            [Ok(output("a1")), Ok(output("a2")), Ok(output("a3"))],
        );
        let f = fixture(
            executor,
            ScriptedEvaluator::new().rework_scores(Stage::Content, &[62.0, 71.0, 68.0]),
        );
        let mut run = run_at("R1", Stage::Content, 3);
        run.overrides.insert("content_gate".into());

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Overridden {
                to: Stage::LayoutAnalysis,
                attempt: 2,
                score: 71.0
            }
        );
        assert_eq!(f.executor.calls(Stage::Content), 3);
        let key = run.artifacts.get("content_package").unwrap();
        let stored = f.store.read_artifact("R1", key).await.unwrap().unwrap();
        assert_eq!(stored["title"], "a2");
        assert!(run.reason_trail().iter().any(|l| l.contains("override accepted attempt 2")));
    }

    #[tokio::test]
    async fn test_exhaustion_without_override_escalates_at_cap() {
        let f = fixture(
            ScriptedExecutor::new().produce(Stage::Content, output("x")),
            ScriptedEvaluator::new().rework_scores(Stage::Content, &[10.0, 20.0, 30.0, 40.0]),
        );
        let mut run = run_at("R1", Stage::Content, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Escalate {
                reason: EscalationReason::QaExhausted,
                item: "content_gate".into()
            }
        );
        assert_eq!(f.executor.calls(Stage::Content), 3);
        assert_eq!(run.attempt, 3);
        assert_eq!(run.current_stage, Stage::Content);
        assert_eq!(run.verdicts_for(Stage::Content).count(), 3);
    }

    #[tokio::test]
    async fn test_fixes_feed_next_attempt() {
        let f = fixture(
            ScriptedExecutor::new().produce(Stage::Encoding, output("x")),
            ScriptedEvaluator::new().verdicts(
                Stage::Encoding,
                [QualityVerdict::rework("", 0, 40.0).with_fix("crop tighter on the speaker")],
            ),
        );
        let mut run = run_at("R1", Stage::Encoding, 3);

        f.qa.run_stage(&mut run).await.unwrap();

        let inputs = f.executor.inputs(Stage::Encoding);
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].fixes.is_empty());
        assert_eq!(inputs[1].fixes, vec!["crop tighter on the speaker".to_string()]);
        assert_eq!(inputs[1].attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_errors_and_timeouts_consume_attempts() {
        let executor = ScriptedExecutor::new()
            .script(Stage::Router, [Err(ExecutorError::failed("model overloaded"))])
            .delay(Stage::Router, Duration::from_secs(60));
        let f = fixture(executor, ScriptedEvaluator::new());
        let mut run = run_at("R1", Stage::Router, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Escalate {
                reason: EscalationReason::ExecutionExhausted,
                item: "router_gate".into()
            }
        );
        assert_eq!(f.executor.calls(Stage::Router), 3);
        let trail = run.reason_trail().join("\n");
        assert!(trail.contains("timed out after 30s"));
    }

    #[tokio::test]
    async fn test_errored_attempt_retries_then_passes() {
        let executor = ScriptedExecutor::new().script(
            Stage::Transcript,
            [Err(ExecutorError::failed("whisper crashed")), Ok(output("ok"))],
        );
        let f = fixture(executor, ScriptedEvaluator::new());
        let mut run = run_at("R1", Stage::Transcript, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(outcome, StageOutcome::Advanced { to: Stage::Content });
        assert_eq!(f.executor.calls(Stage::Transcript), 2);
        assert_eq!(f.evaluator.calls(Stage::Transcript), 1);
    }

    #[tokio::test]
    async fn test_unclassifiable_does_not_consume_attempt() {
        let f = fixture(
            ScriptedExecutor::new().script(
                Stage::LayoutAnalysis,
                [Err(ExecutorError::unclassifiable("split screen with three faces"))],
            ),
            ScriptedEvaluator::new(),
        );
        let mut run = run_at("R1", Stage::LayoutAnalysis, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Escalate {
                reason: EscalationReason::UnclassifiableInput,
                item: "split screen with three faces".into()
            }
        );
        assert_eq!(run.attempt, 1);
    }

    #[tokio::test]
    async fn test_fatal_fail_moves_to_failed_with_trail() {
        let f = fixture(
            ScriptedExecutor::new().produce(Stage::Assembly, output("x")),
            ScriptedEvaluator::new().verdicts(
                Stage::Assembly,
                [QualityVerdict::fail("", 0, 5.0).with_issue(Severity::Critical, "audio missing")],
            ),
        );
        let mut run = run_at("R1", Stage::Assembly, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert!(matches!(outcome, StageOutcome::Failed { .. }));
        assert_eq!(run.current_stage, Stage::Failed);
        assert_eq!(run.qa_status, QaStatus::Failed);
        let trail = run.reason_trail().join("\n");
        assert!(trail.contains("audio missing"));
        assert!(trail.contains("failed: assembly_gate rejected the stage output"));
    }

    #[tokio::test]
    async fn test_needs_review_fail_escalates() {
        let f = fixture(
            ScriptedExecutor::new().produce(Stage::Assembly, output("x")),
            ScriptedEvaluator::new().verdicts(
                Stage::Assembly,
                [QualityVerdict::fail("", 0, 35.0).with_failure_class(FailureClass::NeedsReview)],
            ),
        );
        let mut run = run_at("R1", Stage::Assembly, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();
        assert!(matches!(
            outcome,
            StageOutcome::Escalate {
                reason: EscalationReason::StageFailure,
                ..
            }
        ));
        assert_eq!(run.current_stage, Stage::Assembly);
    }

    #[tokio::test]
    async fn test_invalid_output_consumes_attempt() {
        let executor = ScriptedExecutor::new()
            .script(Stage::Content, [Ok(StageArtifacts::new()), Ok(output("ok"))]);
        let f = fixture(executor, ScriptedEvaluator::new());
        let mut run = run_at("R1", Stage::Content, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(outcome, StageOutcome::Advanced { to: Stage::LayoutAnalysis });
        assert_eq!(f.executor.calls(Stage::Content), 2);
        assert_eq!(f.evaluator.calls(Stage::Content), 1);
        let first = run.verdicts_for(Stage::Content).next().unwrap();
        assert_eq!(first.decision, Decision::Fail);
        assert_eq!(first.score, 0.0);
    }

    #[test]
    fn test_unsafe_artifact_name_rejected() {
        let bad = StageArtifacts::new().with("../runs/R2", serde_json::json!(1));
        assert!(matches!(
            validate_artifacts(Stage::Router, bad),
            Err(ExecutorError::Validation(_))
        ));
        assert!(validate_artifacts(Stage::Router, StageArtifacts::new()).is_ok());
        assert!(validate_artifacts(Stage::Content, StageArtifacts::new()).is_err());
    }

    #[tokio::test]
    async fn test_ungated_stage_completes() {
        let f = fixture(ScriptedExecutor::new(), ScriptedEvaluator::new());
        let mut run = run_at("R1", Stage::Research, 3);

        let outcome = f.qa.run_stage(&mut run).await.unwrap();

        assert_eq!(outcome, StageOutcome::Advanced { to: Stage::Transcript });
        assert_eq!(f.evaluator.calls(Stage::Research), 0);
        assert!(run.artifacts.contains_key("research"));
    }

    #[tokio::test]
    async fn test_suspended_run_is_refused() {
        let f = fixture(ScriptedExecutor::new(), ScriptedEvaluator::new());
        let mut run = run_at("R1", Stage::Content, 3);
        f.qa
            .fsm()
            .request_escalation(&mut run, EscalationReason::QaExhausted)
            .unwrap();
        assert!(f.qa.run_stage(&mut run).await.is_err());
        assert_eq!(f.executor.calls(Stage::Content), 0);
    }

    fn qa_over(
        store: Arc<dyn Store>,
        executor: &Arc<ScriptedExecutor>,
        evaluator: &Arc<ScriptedEvaluator>,
    ) -> QaReflectionLoop {
        QaReflectionLoop::new(
            FsmEngine::new(),
            store,
            Arc::clone(executor) as Arc<dyn StageExecutor>,
            Arc::clone(evaluator) as Arc<dyn QualityGateEvaluator>,
            Arc::new(CollectingEventSink::new()) as Arc<dyn EventSink>,
            &OrchestratorConfig::default().with_stage_timeout_secs(30),
        )
        .with_backoff(RetryBackoff::immediate())
    }

    #[tokio::test]
    async fn test_no_saved_run_holds_a_verdict_for_its_pending_attempt() {
        let inner = Arc::new(InMemoryStateStore::new());
        let log = Arc::new(RecordingStore::new(Arc::clone(&inner)));
        let executor = Arc::new(
            ScriptedExecutor::new()
                .script(Stage::Content, [Ok(StageArtifacts::new())])
                .produce(Stage::Content, output("x")),
        );
        let evaluator = Arc::new(ScriptedEvaluator::new().rework_scores(Stage::Content, &[40.0]));
        let qa = qa_over(Arc::clone(&log) as Arc<dyn Store>, &executor, &evaluator);
        let mut run = run_at("R1", Stage::Content, 3);

        let outcome = qa.run_stage(&mut run).await.unwrap();

        assert_eq!(outcome, StageOutcome::Advanced { to: Stage::LayoutAnalysis });
        let saved = log.saved();
        assert_eq!(saved.len(), 3);
        for snapshot in saved.iter().filter(|r| r.current_stage == Stage::Content) {
            assert!(
                snapshot
                    .verdicts_for(Stage::Content)
                    .all(|v| v.attempt < snapshot.attempt),
                "attempt {} saved with its own verdict",
                snapshot.attempt
            );
        }
    }

    #[tokio::test]
    async fn test_restart_after_failed_save_keeps_attempts_within_cap() {
        let inner = Arc::new(InMemoryStateStore::new());
        let executor = Arc::new(ScriptedExecutor::new().produce(Stage::Content, output("x")));
        let evaluator = Arc::new(
            ScriptedEvaluator::new().rework_scores(Stage::Content, &[40.0, 50.0, 55.0]),
        );
        let mut run = run_at("R1", Stage::Content, 3);
        inner.save_run(&run).await.unwrap();

        let failing = Arc::new(RecordingStore::new(Arc::clone(&inner)).fail_save(2));
        let qa = qa_over(failing as Arc<dyn Store>, &executor, &evaluator);
        assert!(qa.run_stage(&mut run).await.is_err());

        let mut resumed = inner.load_run("R1").await.unwrap().unwrap();
        assert_eq!(resumed.attempt, 2);
        assert_eq!(resumed.verdicts_for(Stage::Content).count(), 1);

        let qa = qa_over(Arc::clone(&inner) as Arc<dyn Store>, &executor, &evaluator);
        let outcome = qa.run_stage(&mut resumed).await.unwrap();

        assert_eq!(outcome, StageOutcome::Advanced { to: Stage::LayoutAnalysis });
        let persisted = inner.load_run("R1").await.unwrap().unwrap();
        let attempts: Vec<u32> = persisted
            .verdicts_for(Stage::Content)
            .map(|v| v.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }
}
