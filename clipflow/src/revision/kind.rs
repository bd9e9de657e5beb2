//! Revision kinds and their re-entry table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::moment::MomentSelection;
use crate::core::Stage;
use crate::errors::RevisionError;

/// Seconds added on each side by `extend`.
pub const EXTEND_DELTA_SECS: f64 = 5.0;
/// Seconds added on each side by `add-context`.
pub const ADD_CONTEXT_DELTA_SECS: f64 = 15.0;

/// A classified post-delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionKind {
    /// Widen the clip slightly.
    Extend,
    /// Widen the clip a lot.
    AddContext,
    /// Re-crop toward a named subject.
    Reframe,
    /// Pick another moment altogether.
    DifferentMoment,
}

impl RevisionKind {
    /// Every kind.
    pub const ALL: [Self; 4] = [Self::Extend, Self::AddContext, Self::Reframe, Self::DifferentMoment];

    /// Kebab token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Extend => "extend",
            Self::AddContext => "add-context",
            Self::Reframe => "reframe",
            Self::DifferentMoment => "different-moment",
        }
    }

    /// The table row for this kind.
    #[must_use]
    pub fn rule(self) -> &'static RevisionRule {
        // Rows are in declaration order.
        &REVISION_TABLE[self as usize]
    }

    /// Stage the pipeline re-enters at.
    #[must_use]
    pub fn resume_at(self) -> Stage {
        self.rule().resume_at
    }
}

impl fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown revision kind '{s}'"))
    }
}

/// Parameters a mutation may read.
#[derive(Debug, Clone, Copy)]
pub struct MutationContext<'a> {
    /// The request payload.
    pub params: &'a serde_json::Value,
    /// Upper bound on the clip duration.
    pub max_clip_secs: f64,
}

/// Mutation applied to the moment selection.
pub type Mutation = fn(&mut MomentSelection, MutationContext<'_>) -> Result<(), RevisionError>;

/// One row of the revision table.
#[derive(Clone, Copy)]
pub struct RevisionRule {
    /// Kind.
    pub kind: RevisionKind,
    /// Re-entry stage.
    pub resume_at: Stage,
    /// Artifact mutation.
    pub mutate: Mutation,
}

impl fmt::Debug for RevisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevisionRule")
            .field("kind", &self.kind)
            .field("resume_at", &self.resume_at)
            .finish_non_exhaustive()
    }
}

fn extend(moment: &mut MomentSelection, ctx: MutationContext<'_>) -> Result<(), RevisionError> {
    moment.widen(EXTEND_DELTA_SECS, ctx.max_clip_secs)
}

fn add_context(moment: &mut MomentSelection, ctx: MutationContext<'_>) -> Result<(), RevisionError> {
    moment.widen(ADD_CONTEXT_DELTA_SECS, ctx.max_clip_secs)
}

fn reframe(moment: &mut MomentSelection, ctx: MutationContext<'_>) -> Result<(), RevisionError> {
    let subject = ctx
        .params
        .get("subject")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RevisionError::InvalidParameters {
            kind: RevisionKind::Reframe.to_string(),
            reason: "missing 'subject'".to_string(),
        })?;
    moment.reframe_toward(subject);
    Ok(())
}

fn different_moment(moment: &mut MomentSelection, _ctx: MutationContext<'_>) -> Result<(), RevisionError> {
    moment.exclude_current();
    Ok(())
}

/// Re-entry stage and mutation per kind, in [`RevisionKind`] order.
pub static REVISION_TABLE: [RevisionRule; 4] = [
    RevisionRule {
        kind: RevisionKind::Extend,
        resume_at: Stage::Encoding,
        mutate: extend,
    },
    RevisionRule {
        kind: RevisionKind::AddContext,
        resume_at: Stage::Encoding,
        mutate: add_context,
    },
    RevisionRule {
        kind: RevisionKind::Reframe,
        resume_at: Stage::Encoding,
        mutate: reframe,
    },
    RevisionRule {
        kind: RevisionKind::DifferentMoment,
        resume_at: Stage::Transcript,
        mutate: different_moment,
    },
];

/// A revision request, consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRequest {
    /// Classified intent.
    pub kind: RevisionKind,
    /// Kind-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RevisionRequest {
    /// Creates a request without parameters.
    #[must_use]
    pub const fn new(kind: RevisionKind) -> Self {
        Self {
            kind,
            params: serde_json::Value::Null,
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Stage the request re-enters at.
    #[must_use]
    pub fn resume_at(&self) -> Stage {
        self.kind.resume_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_kind_order() {
        for kind in RevisionKind::ALL {
            assert_eq!(kind.rule().kind, kind);
        }
        assert_eq!(RevisionKind::Extend.resume_at(), Stage::Encoding);
        assert_eq!(RevisionKind::AddContext.resume_at(), Stage::Encoding);
        assert_eq!(RevisionKind::Reframe.resume_at(), Stage::Encoding);
        assert_eq!(RevisionKind::DifferentMoment.resume_at(), Stage::Transcript);
    }

    #[test]
    fn test_kind_tokens() {
        assert_eq!("add-context".parse::<RevisionKind>(), Ok(RevisionKind::AddContext));
        assert!("shorter".parse::<RevisionKind>().is_err());
        let json = serde_json::to_string(&RevisionKind::DifferentMoment).unwrap();
        assert_eq!(json, r#""different-moment""#);
    }

    #[test]
    fn test_reframe_requires_subject() {
        let mut moment = MomentSelection::new(0.0, 10.0);
        let params = serde_json::json!({});
        let ctx = MutationContext {
            params: &params,
            max_clip_secs: 90.0,
        };
        assert!(matches!(
            (RevisionKind::Reframe.rule().mutate)(&mut moment, ctx),
            Err(RevisionError::InvalidParameters { .. })
        ));

        let params = serde_json::json!({"subject": "host"});
        let ctx = MutationContext {
            params: &params,
            max_clip_secs: 90.0,
        };
        (RevisionKind::Reframe.rule().mutate)(&mut moment, ctx).unwrap();
        assert_eq!(moment.reframe.unwrap().subject, "host");
    }
}
