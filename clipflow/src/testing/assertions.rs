//! Assertions over run records.

use crate::core::{EscalationState, Run, Stage};
use crate::fsm::FsmEngine;

/// Asserts that the run is in the expected stage.
pub fn assert_stage(run: &Run, expected: Stage) {
    assert_eq!(
        run.current_stage,
        expected,
        "Expected run {} in {expected}, got {}. Trail:\n{}",
        run.id,
        run.current_stage,
        run.reason_trail().join("\n")
    );
}

/// Asserts the escalation flag.
pub fn assert_escalation_state(run: &Run, expected: EscalationState) {
    assert_eq!(
        run.escalation_state, expected,
        "Expected escalation state {expected:?}, got {:?}",
        run.escalation_state
    );
}

/// Asserts that some line of the reason trail contains `needle`.
pub fn assert_trail_contains(run: &Run, needle: &str) {
    let trail = run.reason_trail();
    assert!(
        trail.iter().any(|line| line.contains(needle)),
        "Expected reason trail to mention '{needle}'. Trail:\n{}",
        trail.join("\n")
    );
}

/// Asserts that the current stage is reachable given the completed stages.
pub fn assert_consistent(run: &Run) {
    assert!(
        FsmEngine::new().is_consistent(run),
        "Run {} is inconsistent: stage {} with completed {:?}",
        run.id,
        run.current_stage,
        run.stages_completed
    );
}
