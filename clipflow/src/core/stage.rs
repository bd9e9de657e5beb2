//! Pipeline stages and FSM events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named unit of pipeline work, or one of the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Classifies the inbound request and picks a handling path.
    Router,
    /// Gathers source material (video, subtitles).
    Research,
    /// Scores the transcript and selects the moment to cut.
    Transcript,
    /// Generates the content package and the generation requests.
    Content,
    /// Classifies the frame layout of the selected moment.
    LayoutAnalysis,
    /// Crops and encodes the clip.
    Encoding,
    /// Combines the clip with generated artifacts.
    Assembly,
    /// Hands the finished package to the requester.
    Delivery,
    /// Terminal: the run finished successfully.
    Completed,
    /// Terminal: the run failed.
    Failed,
}

impl Stage {
    /// All stages in pipeline order, terminals last.
    pub const ALL: [Self; 10] = [
        Self::Router,
        Self::Research,
        Self::Transcript,
        Self::Content,
        Self::LayoutAnalysis,
        Self::Encoding,
        Self::Assembly,
        Self::Delivery,
        Self::Completed,
        Self::Failed,
    ];

    /// The stage every run starts in.
    pub const INITIAL: Self = Self::Router;

    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the stage output is reviewed by a quality gate.
    #[must_use]
    pub const fn is_gated(self) -> bool {
        matches!(
            self,
            Self::Transcript
                | Self::Content
                | Self::LayoutAnalysis
                | Self::Encoding
                | Self::Assembly
        )
    }

    /// The next stage on the happy path.
    #[must_use]
    pub const fn successor(self) -> Option<Self> {
        match self {
            Self::Router => Some(Self::Research),
            Self::Research => Some(Self::Transcript),
            Self::Transcript => Some(Self::Content),
            Self::Content => Some(Self::LayoutAnalysis),
            Self::LayoutAnalysis => Some(Self::Encoding),
            Self::Encoding => Some(Self::Assembly),
            Self::Assembly => Some(Self::Delivery),
            Self::Delivery => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// Position on the happy path, used to compare stages.
    #[must_use]
    pub const fn ordinal(self) -> usize {
        match self {
            Self::Router => 0,
            Self::Research => 1,
            Self::Transcript => 2,
            Self::Content => 3,
            Self::LayoutAnalysis => 4,
            Self::Encoding => 5,
            Self::Assembly => 6,
            Self::Delivery => 7,
            Self::Completed => 8,
            Self::Failed => 9,
        }
    }

    /// Lowercase snake token used in persisted records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Router => "router",
            Self::Research => "research",
            Self::Transcript => "transcript",
            Self::Content => "content",
            Self::LayoutAnalysis => "layout_analysis",
            Self::Encoding => "encoding",
            Self::Assembly => "assembly",
            Self::Delivery => "delivery",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Name of the quality gate guarding this stage.
    #[must_use]
    pub fn gate_name(self) -> String {
        format!("{}_gate", self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Inputs to the FSM engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmEvent {
    /// An ungated stage finished its work.
    StageComplete,
    /// The quality gate accepted the stage output.
    QaPass,
    /// The quality gate asked for another attempt.
    QaRework,
    /// The quality gate rejected the output outright.
    QaFail,
    /// Processing must pause for external input.
    EscalationRequested,
    /// External input (or a default) unblocked the run.
    EscalationResolved,
}

impl fmt::Display for FsmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StageComplete => "stage_complete",
            Self::QaPass => "qa_pass",
            Self::QaRework => "qa_rework",
            Self::QaFail => "qa_fail",
            Self::EscalationRequested => "escalation_requested",
            Self::EscalationResolved => "escalation_resolved",
        };
        f.write_str(s)
    }
}
