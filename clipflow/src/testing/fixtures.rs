//! Test fixtures for runs and well-known artifacts.

use crate::core::artifact::{GENERATION_REQUESTS, MOMENT_SELECTION};
use crate::core::{Stage, StageArtifacts, Run};
use crate::jobs::{GenerationRequest, VariantTag};

/// A run positioned at `stage` with every earlier stage completed.
#[must_use]
pub fn run_at(id: &str, stage: Stage, attempt_cap: u32) -> Run {
    let mut run = Run::new(id, "yt:fixture", attempt_cap);
    let mut current = Stage::INITIAL;
    while current != stage {
        run.stages_completed.push(current);
        match current.successor() {
            Some(next) => current = next,
            None => break,
        }
    }
    run.current_stage = stage;
    run
}

/// Transcript-stage output selecting `start..end` of a source.
#[must_use]
pub fn moment_artifacts(start: f64, end: f64, source_duration: f64) -> StageArtifacts {
    StageArtifacts::new().with(
        MOMENT_SELECTION,
        serde_json::json!({
            "start": start,
            "end": end,
            "source_duration": source_duration,
        }),
    )
}

/// Content-stage output requesting one generated clip per variant.
#[must_use]
pub fn content_artifacts(variants: &[VariantTag]) -> StageArtifacts {
    let requests: Vec<GenerationRequest> = variants
        .iter()
        .map(|v| GenerationRequest::new(*v, format!("{v} for the selected moment")))
        .collect();
    StageArtifacts::new()
        .with("content_package", serde_json::json!({"title": "fixture", "hashtags": ["#clip"]}))
        .with(GENERATION_REQUESTS, serde_json::json!(requests))
}
