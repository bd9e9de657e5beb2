//! Stage finite-state machine.
//!
//! The engine owns the transition table and applies events to a [`Run`].
//! It performs no I/O: callers persist the run after every applied event.

mod table;

pub use table::{
    default_transitions, Guard, Transition, ATTEMPTS_REMAINING, ESCALATION_SETTLED, NOT_SUSPENDED,
};

use std::collections::HashMap;

use crate::core::{EscalationReason, EscalationState, FsmEvent, HistoryKind, QaStatus, Run, Stage};
use crate::errors::FsmError;

/// Computes and applies stage transitions.
#[derive(Debug, Clone)]
pub struct FsmEngine {
    table: HashMap<(Stage, FsmEvent), Transition>,
}

impl Default for FsmEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FsmEngine {
    /// Creates an engine with the default clip pipeline table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_transitions(default_transitions())
    }

    /// Creates an engine from explicit rows. Later rows replace earlier ones.
    #[must_use]
    pub fn with_transitions(rows: Vec<Transition>) -> Self {
        let table = rows
            .into_iter()
            .map(|t| ((t.from, t.event), t))
            .collect();
        Self { table }
    }

    /// Returns the row for a pair, if any.
    #[must_use]
    pub fn transition(&self, stage: Stage, event: FsmEvent) -> Option<&Transition> {
        self.table.get(&(stage, event))
    }

    /// Events with a row from `stage`.
    #[must_use]
    pub fn events_from(&self, stage: Stage) -> Vec<FsmEvent> {
        let mut events: Vec<FsmEvent> = self
            .table
            .keys()
            .filter(|(s, _)| *s == stage)
            .map(|(_, e)| *e)
            .collect();
        events.sort();
        events
    }

    /// Computes the next stage without mutating the run.
    pub fn next(&self, run: &Run, event: FsmEvent) -> Result<Stage, FsmError> {
        let stage = run.current_stage;
        let transition = self
            .table
            .get(&(stage, event))
            .ok_or(FsmError::InvalidTransition { stage, event })?;

        if let Some(guard) = transition.guard {
            if !(guard.check)(run) {
                return Err(FsmError::GuardRejected {
                    stage,
                    event,
                    guard: guard.name,
                });
            }
        }
        Ok(transition.to)
    }

    /// Applies an event to the run and records the transition.
    pub fn apply(&self, run: &mut Run, event: FsmEvent) -> Result<Stage, FsmError> {
        let from = run.current_stage;
        let to = self.next(run, event)?;

        run.record(HistoryKind::Transition { from, event, to });
        match event {
            FsmEvent::QaPass | FsmEvent::StageComplete => {
                run.qa_status = QaStatus::Passed;
                run.mark_completed(from);
                run.enter_stage(to);
            }
            FsmEvent::QaRework => {
                run.qa_status = QaStatus::Rework;
                run.attempt += 1;
            }
            FsmEvent::QaFail => {
                run.qa_status = QaStatus::Failed;
                run.current_stage = to;
            }
            FsmEvent::EscalationRequested | FsmEvent::EscalationResolved => {}
        }
        tracing::debug!(run_id = %run.id, %from, %event, %to, "FSM transition");
        Ok(to)
    }

    /// Suspends the run in place with an escalation reason.
    pub fn request_escalation(&self, run: &mut Run, reason: EscalationReason) -> Result<(), FsmError> {
        self.apply(run, FsmEvent::EscalationRequested)?;
        run.escalation_state = EscalationState::Pending(reason);
        Ok(())
    }

    /// Resumes a suspended run once its escalation has a resolution.
    ///
    /// A rejected resolution leaves the run untouched.
    pub fn resolve_escalation(&self, run: &mut Run, by_default: bool) -> Result<(), FsmError> {
        let event = FsmEvent::EscalationResolved;
        let pending = run.escalation_state;
        if !pending.is_pending() {
            return Err(FsmError::GuardRejected {
                stage: run.current_stage,
                event,
                guard: "escalation_pending",
            });
        }
        run.escalation_state = if by_default {
            EscalationState::ResolvedByDefault
        } else {
            EscalationState::Resolved
        };
        if let Err(e) = self.apply(run, event) {
            run.escalation_state = pending;
            return Err(e);
        }
        Ok(())
    }

    /// Checks that `current_stage` is reachable from the initial stage given
    /// `stages_completed`: the completed list must be exactly the happy-path
    /// prefix before the current stage (any prefix for `FAILED`).
    #[must_use]
    pub fn is_consistent(&self, run: &Run) -> bool {
        let mut expected = Stage::INITIAL;
        for completed in &run.stages_completed {
            if *completed != expected {
                return false;
            }
            match expected.successor() {
                Some(next) => expected = next,
                None => return false,
            }
        }
        run.current_stage == Stage::Failed || run.current_stage == expected
    }
}
