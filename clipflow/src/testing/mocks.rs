//! Scripted collaborators for testing.
//!
//! Each mock answers from a per-stage (or per-key) script and records what
//! it was asked, so tests can assert on call counts and inputs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::{QualityVerdict, Stage, StageArtifacts};
use crate::errors::{BackendError, ChannelError, ExecutorError};
use crate::escalation::EscalationQuestion;
use crate::jobs::{GenerationRequest, JobStatus, RemoteStatus, SubmitAck};
use crate::ports::{EscalationChannel, GenerationBackend, QualityGateEvaluator, StageExecutor, StageInput};
use crate::store::StateStore;

/// Default artifacts: one entry named after the stage.
#[must_use]
pub fn default_artifacts(input: &StageInput) -> StageArtifacts {
    StageArtifacts::new().with(
        input.stage.as_str(),
        serde_json::json!({
            "attempt": input.attempt,
            "revision": input.revision,
        }),
    )
}

/// A stage executor answering from per-stage scripts.
///
/// Scripted results are consumed in order. Once a stage's script is empty
/// the stage's fixed output (or [`default_artifacts`]) is returned.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<Stage, VecDeque<Result<StageArtifacts, ExecutorError>>>>,
    outputs: Mutex<HashMap<Stage, StageArtifacts>>,
    delays: Mutex<HashMap<Stage, Duration>>,
    inputs: Mutex<Vec<StageInput>>,
}

impl ScriptedExecutor {
    /// Creates an executor producing default artifacts for every stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output returned whenever the stage's script is empty.
    #[must_use]
    pub fn produce(self, stage: Stage, artifacts: StageArtifacts) -> Self {
        self.outputs.lock().insert(stage, artifacts);
        self
    }

    /// Queues results for a stage.
    #[must_use]
    pub fn script(
        self,
        stage: Stage,
        results: impl IntoIterator<Item = Result<StageArtifacts, ExecutorError>>,
    ) -> Self {
        self.scripts
            .lock()
            .entry(stage)
            .or_default()
            .extend(results);
        self
    }

    /// Makes every execution of the stage sleep first.
    #[must_use]
    pub fn delay(self, stage: Stage, delay: Duration) -> Self {
        self.delays.lock().insert(stage, delay);
        self
    }

    /// Number of executions of a stage.
    #[must_use]
    pub fn calls(&self, stage: Stage) -> usize {
        self.inputs.lock().iter().filter(|i| i.stage == stage).count()
    }

    /// Inputs received for a stage, in call order.
    #[must_use]
    pub fn inputs(&self, stage: Stage) -> Vec<StageInput> {
        self.inputs
            .lock()
            .iter()
            .filter(|i| i.stage == stage)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, input: &StageInput) -> Result<StageArtifacts, ExecutorError> {
        self.inputs.lock().push(input.clone());
        let delay = self.delays.lock().get(&input.stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripts
            .lock()
            .get_mut(&input.stage)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(result) => result,
            None => Ok(self
                .outputs
                .lock()
                .get(&input.stage)
                .cloned()
                .unwrap_or_else(|| default_artifacts(input))),
        }
    }
}

/// A quality gate answering from per-stage verdict scripts.
///
/// Gate name and attempt of a scripted verdict are overwritten with the
/// actual values. Unscripted evaluations pass with score 90.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    scripts: Mutex<HashMap<Stage, VecDeque<Result<QualityVerdict, ExecutorError>>>>,
    seen: Mutex<Vec<(Stage, u32, StageArtifacts)>>,
}

impl ScriptedEvaluator {
    /// Creates an evaluator that passes everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues verdicts for a stage.
    #[must_use]
    pub fn verdicts(self, stage: Stage, verdicts: impl IntoIterator<Item = QualityVerdict>) -> Self {
        self.scripts
            .lock()
            .entry(stage)
            .or_default()
            .extend(verdicts.into_iter().map(Ok));
        self
    }

    /// Queues rework verdicts with the given scores.
    #[must_use]
    pub fn rework_scores(self, stage: Stage, scores: &[f64]) -> Self {
        let verdicts: Vec<QualityVerdict> = scores
            .iter()
            .map(|score| QualityVerdict::rework(stage.gate_name(), 0, *score))
            .collect();
        self.verdicts(stage, verdicts)
    }

    /// Queues an evaluator error for a stage.
    #[must_use]
    pub fn error(self, stage: Stage, message: &str) -> Self {
        self.scripts
            .lock()
            .entry(stage)
            .or_default()
            .push_back(Err(ExecutorError::failed(message)));
        self
    }

    /// Number of evaluations of a stage.
    #[must_use]
    pub fn calls(&self, stage: Stage) -> usize {
        self.seen.lock().iter().filter(|(s, _, _)| *s == stage).count()
    }

    /// Artifacts evaluated for a stage, in call order.
    #[must_use]
    pub fn evaluated(&self, stage: Stage) -> Vec<StageArtifacts> {
        self.seen
            .lock()
            .iter()
            .filter(|(s, _, _)| *s == stage)
            .map(|(_, _, a)| a.clone())
            .collect()
    }
}

#[async_trait]
impl QualityGateEvaluator for ScriptedEvaluator {
    async fn evaluate(
        &self,
        stage: Stage,
        attempt: u32,
        artifacts: &StageArtifacts,
    ) -> Result<QualityVerdict, ExecutorError> {
        self.seen.lock().push((stage, attempt, artifacts.clone()));
        let scripted = self.scripts.lock().get_mut(&stage).and_then(VecDeque::pop_front);
        match scripted {
            Some(Ok(mut verdict)) => {
                verdict.gate = stage.gate_name();
                verdict.attempt = attempt;
                Ok(verdict)
            }
            Some(Err(e)) => Err(e),
            None => Ok(QualityVerdict::pass(stage.gate_name(), attempt, 90.0)),
        }
    }
}

#[derive(Debug, Clone)]
enum JobScript {
    Succeed { after: Duration, artifact_ref: String },
    Fail { after: Duration, reason: String },
    Reject { reason: String },
}

/// A generation backend whose jobs resolve on a virtual-time schedule.
///
/// A job's clock starts at its first submission (or first poll, for jobs
/// recovered from a registry). Unscripted jobs stay pending forever.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, JobScript>>,
    started: Mutex<HashMap<String, Instant>>,
    submissions: Mutex<HashMap<String, usize>>,
    polls: Mutex<usize>,
    registry_check: Mutex<Option<(Arc<dyn StateStore>, String)>>,
    poll_delay: Mutex<Duration>,
    persisted_at_submit: Mutex<usize>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("scripts", &self.scripts.lock().len())
            .field("polls", &*self.polls.lock())
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    /// Creates a backend whose jobs never finish.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The job succeeds `after` its clock starts.
    #[must_use]
    pub fn succeed_after(self, key: &str, after: Duration, artifact_ref: &str) -> Self {
        self.scripts.lock().insert(
            key.to_string(),
            JobScript::Succeed {
                after,
                artifact_ref: artifact_ref.to_string(),
            },
        );
        self
    }

    /// The job fails `after` its clock starts.
    #[must_use]
    pub fn fail_after(self, key: &str, after: Duration, reason: &str) -> Self {
        self.scripts.lock().insert(
            key.to_string(),
            JobScript::Fail {
                after,
                reason: reason.to_string(),
            },
        );
        self
    }

    /// Submissions of the key are rejected.
    #[must_use]
    pub fn reject(self, key: &str, reason: &str) -> Self {
        self.scripts.lock().insert(
            key.to_string(),
            JobScript::Reject {
                reason: reason.to_string(),
            },
        );
        self
    }

    /// On every submission, checks that the key is already recorded as
    /// pending in the run's persisted registry.
    #[must_use]
    pub fn check_registry_on_submit(self, store: Arc<dyn StateStore>, run_id: &str) -> Self {
        *self.registry_check.lock() = Some((store, run_id.to_string()));
        self
    }

    /// Every poll takes `delay` to answer.
    #[must_use]
    pub fn poll_delay(self, delay: Duration) -> Self {
        *self.poll_delay.lock() = delay;
        self
    }

    /// Number of submissions of a key.
    #[must_use]
    pub fn submissions(&self, key: &str) -> usize {
        self.submissions.lock().get(key).copied().unwrap_or(0)
    }

    /// Total number of polls.
    #[must_use]
    pub fn polls(&self) -> usize {
        *self.polls.lock()
    }

    /// Submissions whose key was found pending in the registry.
    #[must_use]
    pub fn persisted_at_submit(&self) -> usize {
        *self.persisted_at_submit.lock()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn submit(&self, key: &str, _request: &GenerationRequest) -> Result<SubmitAck, BackendError> {
        let check = self.registry_check.lock().clone();
        if let Some((store, run_id)) = check {
            let recorded = store
                .load_job_registry(&run_id)
                .await
                .ok()
                .flatten()
                .and_then(|registry| registry.get(key).map(|job| job.status))
                == Some(JobStatus::Pending);
            if recorded {
                *self.persisted_at_submit.lock() += 1;
            }
        }

        let previous = {
            let mut submissions = self.submissions.lock();
            let count = submissions.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };
        if let Some(JobScript::Reject { reason }) = self.scripts.lock().get(key) {
            return Err(BackendError::Rejected(reason.clone()));
        }
        self.started.lock().insert(key.to_string(), Instant::now());
        Ok(if previous == 0 {
            SubmitAck::Accepted
        } else {
            SubmitAck::Duplicate
        })
    }

    async fn poll(&self, key: &str) -> Result<RemoteStatus, BackendError> {
        *self.polls.lock() += 1;
        let delay = *self.poll_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let now = Instant::now();
        let started = *self.started.lock().entry(key.to_string()).or_insert(now);
        let elapsed = now.saturating_duration_since(started);

        let status = match self.scripts.lock().get(key) {
            Some(JobScript::Succeed { after, artifact_ref }) if elapsed >= *after => {
                RemoteStatus::Succeeded {
                    artifact_ref: artifact_ref.clone(),
                }
            }
            Some(JobScript::Fail { after, reason }) if elapsed >= *after => RemoteStatus::Failed {
                reason: reason.clone(),
            },
            Some(JobScript::Succeed { .. } | JobScript::Fail { .. }) => RemoteStatus::Running,
            Some(JobScript::Reject { reason }) => RemoteStatus::Failed {
                reason: reason.clone(),
            },
            None => RemoteStatus::Pending,
        };
        Ok(status)
    }
}

/// An escalation channel replying from a queue of answers.
///
/// When the queue is empty the question is left unanswered (the future
/// never completes), which exercises the caller's timeout.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    answers: Mutex<VecDeque<Result<String, ChannelError>>>,
    asked: Mutex<Vec<EscalationQuestion>>,
}

impl ScriptedChannel {
    /// Creates a channel that never answers.
    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    /// Creates a channel answering with the given texts in order.
    #[must_use]
    pub fn answering<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channel = Self::default();
        channel
            .answers
            .lock()
            .extend(answers.into_iter().map(|a| Ok(a.into())));
        channel
    }

    /// Queues a channel error.
    #[must_use]
    pub fn with_error(self, error: ChannelError) -> Self {
        self.answers.lock().push_back(Err(error));
        self
    }

    /// Questions asked so far.
    #[must_use]
    pub fn asked(&self) -> Vec<EscalationQuestion> {
        self.asked.lock().clone()
    }
}

#[async_trait]
impl EscalationChannel for ScriptedChannel {
    async fn ask(&self, question: &EscalationQuestion) -> Result<String, ChannelError> {
        self.asked.lock().push(question.clone());
        let next = self.answers.lock().pop_front();
        match next {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }
}
