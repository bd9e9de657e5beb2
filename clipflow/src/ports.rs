//! Ports consumed by the orchestration core.
//!
//! Each trait is a narrow interface onto an external collaborator: the
//! opaque stage executors, the quality gate, the remote generation service
//! and the messaging channel used for escalations. [`Ports`] bundles them
//! for injection into the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{QualityVerdict, Stage, StageArtifacts};
use crate::errors::{BackendError, ChannelError, ExecutorError};
use crate::escalation::EscalationQuestion;
use crate::jobs::{GenerationRequest, RemoteStatus, SubmitAck};

/// Input handed to a stage executor for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    /// Run identifier.
    pub run_id: String,
    /// Source reference of the run.
    pub source_ref: String,
    /// Stage being executed.
    pub stage: Stage,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Revision cycle.
    pub revision: u32,
    /// Prescriptive fixes from the previous verdict.
    #[serde(default)]
    pub fixes: Vec<String>,
    /// Committed artifacts of earlier stages, revised ones substituted.
    #[serde(default)]
    pub upstream: StageArtifacts,
    /// Escalation resolution for this stage, if one was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// Runs the opaque unit of work behind a stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes one attempt of `input.stage`.
    async fn execute(&self, input: &StageInput) -> Result<StageArtifacts, ExecutorError>;
}

/// Scores stage artifacts.
#[async_trait]
pub trait QualityGateEvaluator: Send + Sync {
    /// Evaluates one attempt. An error counts as a failed attempt.
    async fn evaluate(
        &self,
        stage: Stage,
        attempt: u32,
        artifacts: &StageArtifacts,
    ) -> Result<QualityVerdict, ExecutorError>;
}

/// Remote service producing animated clips.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submits a job under an idempotent key.
    async fn submit(&self, key: &str, request: &GenerationRequest) -> Result<SubmitAck, BackendError>;

    /// Queries the status of a job.
    async fn poll(&self, key: &str) -> Result<RemoteStatus, BackendError>;
}

/// Messaging collaborator used to ask a human.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EscalationChannel: Send + Sync {
    /// Delivers a question and waits for the answer. Timeouts are applied by
    /// the caller.
    async fn ask(&self, question: &EscalationQuestion) -> Result<String, ChannelError>;
}

/// Bundle of collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct Ports {
    /// Stage executor gateway.
    pub executor: Arc<dyn StageExecutor>,
    /// Quality gate evaluator.
    pub evaluator: Arc<dyn QualityGateEvaluator>,
    /// Remote generation backend.
    pub backend: Arc<dyn GenerationBackend>,
    /// Escalation channel.
    pub channel: Arc<dyn EscalationChannel>,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}

impl Ports {
    /// Bundles the four collaborators.
    #[must_use]
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        evaluator: Arc<dyn QualityGateEvaluator>,
        backend: Arc<dyn GenerationBackend>,
        channel: Arc<dyn EscalationChannel>,
    ) -> Self {
        Self {
            executor,
            evaluator,
            backend,
            channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_input_serializes_without_empty_resolution() {
        let input = StageInput {
            run_id: "R1".into(),
            source_ref: "yt:abc".into(),
            stage: Stage::Content,
            attempt: 2,
            revision: 0,
            fixes: vec!["shorter title".into()],
            upstream: StageArtifacts::new(),
            resolution: None,
        };
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["stage"], "content");
        assert!(value.get("resolution").is_none());
    }
}
