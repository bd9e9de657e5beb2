//! The transition table, as plain data.

use crate::core::{FsmEvent, Run, Stage};

/// A named pure predicate over the run aggregate.
#[derive(Clone, Copy)]
pub struct Guard {
    /// Name reported when the guard rejects a transition.
    pub name: &'static str,
    /// The predicate.
    pub check: fn(&Run) -> bool,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Guard").field(&self.name).finish()
    }
}

/// Rework is allowed only while attempts remain.
pub const ATTEMPTS_REMAINING: Guard = Guard {
    name: "attempts_remaining",
    check: |run| run.attempt < run.attempt_cap,
};

/// A suspended run cannot advance.
pub const NOT_SUSPENDED: Guard = Guard {
    name: "not_suspended",
    check: |run| !run.escalation_state.is_pending(),
};

/// Escalation can only be resumed once resolved.
pub const ESCALATION_SETTLED: Guard = Guard {
    name: "escalation_settled",
    check: |run| run.escalation_state.is_resolved(),
};

/// One row of the table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    /// Source stage.
    pub from: Stage,
    /// Triggering event.
    pub event: FsmEvent,
    /// Target stage.
    pub to: Stage,
    /// Optional guard, evaluated before the transition is taken.
    pub guard: Option<Guard>,
}

const fn row(from: Stage, event: FsmEvent, to: Stage, guard: Option<Guard>) -> Transition {
    Transition {
        from,
        event,
        to,
        guard,
    }
}

/// Builds the default clip pipeline table.
///
/// Gated stages advance on `qa_pass`, ungated ones on `stage_complete`.
/// Every working stage loops on `qa_rework` while attempts remain (ungated
/// stages only take it after an executor error), drops to `failed` on
/// `qa_fail` and can be suspended and resumed in place.
#[must_use]
pub fn default_transitions() -> Vec<Transition> {
    let mut rows = Vec::new();
    for stage in Stage::ALL {
        let Some(next) = stage.successor() else {
            continue;
        };
        if stage.is_gated() {
            rows.push(row(stage, FsmEvent::QaPass, next, Some(NOT_SUSPENDED)));
        } else {
            rows.push(row(stage, FsmEvent::StageComplete, next, Some(NOT_SUSPENDED)));
        }
        rows.push(row(stage, FsmEvent::QaRework, stage, Some(ATTEMPTS_REMAINING)));
        rows.push(row(stage, FsmEvent::QaFail, Stage::Failed, None));
        rows.push(row(stage, FsmEvent::EscalationRequested, stage, Some(NOT_SUSPENDED)));
        rows.push(row(stage, FsmEvent::EscalationResolved, stage, Some(ESCALATION_SETTLED)));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rows_leave_terminal_states() {
        let rows = default_transitions();
        assert!(rows.iter().all(|r| !r.from.is_terminal()));
    }

    #[test]
    fn test_pairs_are_unique() {
        let rows = default_transitions();
        let mut seen = std::collections::HashSet::new();
        for r in &rows {
            assert!(seen.insert((r.from, r.event)), "duplicate ({}, {})", r.from, r.event);
        }
    }

    #[test]
    fn test_attempts_guard() {
        let mut run = Run::new("R1", "src", 3);
        assert!((ATTEMPTS_REMAINING.check)(&run));
        run.attempt = 3;
        assert!(!(ATTEMPTS_REMAINING.check)(&run));
    }
}
