//! The moment-selection artifact and its mutations.

use serde::{Deserialize, Serialize};

use crate::errors::RevisionError;

const EPSILON: f64 = 1e-6;

/// A closed time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start.
    pub start: f64,
    /// End.
    pub end: f64,
}

/// Segment to re-crop toward a named subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReframeTarget {
    /// Who or what the crop should follow.
    pub subject: String,
    /// Segment the reframe applies to.
    pub segment: TimeRange,
}

/// The selected time range of the source, as written by the transcript
/// stage. Fields this crate does not interpret are carried through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentSelection {
    /// Selection start in seconds.
    pub start: f64,
    /// Selection end in seconds.
    pub end: f64,
    /// Length of the source video, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_duration: Option<f64>,
    /// Ranges the moment search must skip.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_ranges: Vec<TimeRange>,
    /// Pending reframe request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reframe: Option<ReframeTarget>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl MomentSelection {
    /// Creates a selection.
    #[must_use]
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            source_duration: None,
            excluded_ranges: Vec::new(),
            reframe: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Sets the source duration.
    #[must_use]
    pub fn with_source_duration(mut self, secs: f64) -> Self {
        self.source_duration = Some(secs);
        self
    }

    /// Selection length in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// The selected range.
    #[must_use]
    pub const fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }

    /// Widens by `delta` on each side.
    ///
    /// The result is clamped to the source and to `max_secs`, shrinking
    /// symmetrically around the current midpoint. Fails without changing
    /// anything when the clamped range equals the current one.
    pub fn widen(&mut self, delta: f64, max_secs: f64) -> Result<(), RevisionError> {
        let midpoint = (self.start + self.end) / 2.0;
        let mut start = (self.start - delta).max(0.0);
        let mut end = self.end + delta;
        if let Some(limit) = self.source_duration {
            end = end.min(limit);
        }
        if end - start > max_secs {
            let half = max_secs / 2.0;
            start = start.max(midpoint - half);
            end = end.min(midpoint + half);
        }

        // Never narrower than before.
        start = start.min(self.start);
        end = end.max(self.end);

        if (start - self.start).abs() < EPSILON && (end - self.end).abs() < EPSILON {
            return Err(RevisionError::WideningLimitReached {
                start: self.start,
                end: self.end,
                max_secs,
            });
        }
        self.start = start;
        self.end = end;
        Ok(())
    }

    /// Excludes the current range from the next moment search.
    pub fn exclude_current(&mut self) {
        let current = self.range();
        if !self.excluded_ranges.contains(&current) {
            self.excluded_ranges.push(current);
        }
        self.reframe = None;
    }

    /// Marks the current range for re-cropping toward `subject`.
    pub fn reframe_toward(&mut self, subject: impl Into<String>) {
        self.reframe = Some(ReframeTarget {
            subject: subject.into(),
            segment: self.range(),
        });
    }
}
