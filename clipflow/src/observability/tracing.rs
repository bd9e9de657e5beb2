//! Span helpers for runs and stage attempts.

use std::collections::HashMap;
use std::time::Instant;
use tracing::Span;

use crate::core::{Run, Stage};

/// Span covering one run's pipeline loop.
#[must_use]
pub fn run_span(run: &Run) -> Span {
    tracing::info_span!(
        "run",
        run_id = %run.id,
        source_ref = %run.source_ref,
        revision = run.revision,
    )
}

/// Span covering one stage attempt.
#[must_use]
pub fn stage_span(run_id: &str, stage: Stage, attempt: u32) -> Span {
    tracing::info_span!("stage", run_id, stage = %stage, attempt)
}

/// Attributes reported when a stage attempt finishes.
#[derive(Debug, Clone, Default)]
pub struct StageSpanAttributes {
    /// Stage token.
    pub stage: String,
    /// Attempt number.
    pub attempt: u32,
    /// Verdict decision or executor outcome.
    pub outcome: Option<String>,
    /// Gate score.
    pub score: Option<f64>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Error text, if the attempt errored.
    pub error: Option<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for an attempt.
    #[must_use]
    pub fn new(stage: Stage, attempt: u32) -> Self {
        Self {
            stage: stage.as_str().to_string(),
            attempt,
            ..Default::default()
        }
    }

    /// Sets the outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Sets the gate score.
    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Flattens to `stage.*` attribute pairs.
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("stage.name".to_string(), self.stage.clone());
        attrs.insert("stage.attempt".to_string(), self.attempt.to_string());
        if let Some(ref v) = self.outcome {
            attrs.insert("stage.outcome".to_string(), v.clone());
        }
        if let Some(v) = self.score {
            attrs.insert("stage.score".to_string(), v.to_string());
        }
        if let Some(v) = self.duration_ms {
            attrs.insert("stage.duration_ms".to_string(), v.to_string());
        }
        if let Some(ref v) = self.error {
            attrs.insert("stage.error".to_string(), v.clone());
        }
        attrs
    }

    /// Logs the attributes at INFO (WARN when an error is set).
    pub fn log(&self) {
        let attributes = self.to_attributes();
        if let Some(ref error) = self.error {
            tracing::warn!(stage = %self.stage, attempt = self.attempt, error, ?attributes, "Stage attempt errored");
        } else {
            tracing::info!(stage = %self.stage, attempt = self.attempt, ?attributes, "Stage attempt finished");
        }
    }
}

/// Wall-clock timer for an attempt.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts timing.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_span_attributes() {
        let attrs = StageSpanAttributes::new(Stage::Content, 2)
            .with_outcome("rework")
            .with_score(71.0)
            .with_duration_ms(12.5);

        let flat = attrs.to_attributes();
        assert_eq!(flat.get("stage.name"), Some(&"content".to_string()));
        assert_eq!(flat.get("stage.attempt"), Some(&"2".to_string()));
        assert_eq!(flat.get("stage.score"), Some(&"71".to_string()));
        assert!(flat.get("stage.error").is_none());
    }

    #[test]
    fn test_span_timer_advances() {
        let timer = SpanTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5.0);
    }
}
