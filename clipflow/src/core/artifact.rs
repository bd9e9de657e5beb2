//! Named artifacts exchanged between stages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Artifact holding the selected time range of the source video.
pub const MOMENT_SELECTION: &str = "moment_selection";
/// Artifact listing the generation requests chosen by the content stage.
pub const GENERATION_REQUESTS: &str = "generation_requests";
/// Artifact carrying the await-gate outcome into assembly.
pub const GENERATED_CLIPS: &str = "generated_clips";

/// The artifacts produced by one stage attempt, keyed by logical name.
///
/// Values are opaque JSON; the orchestrator only looks inside the few
/// well-known artifacts it routes (moment selection, generation requests).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageArtifacts {
    entries: BTreeMap<String, serde_json::Value>,
}

impl StageArtifacts {
    /// Creates an empty artifact set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artifact.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.entries.insert(name.into(), value);
        self
    }

    /// Inserts or replaces an artifact.
    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(name.into(), value);
    }

    /// Returns an artifact by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries.get(name)
    }

    /// Decodes an artifact into a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<Result<T, serde_json::Error>> {
        self.entries
            .get(name)
            .map(|value| serde_json::from_value(value.clone()))
    }

    /// Iterates over artifact names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no artifact was produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges `other` into `self`, `other` winning on conflicts.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let artifacts = StageArtifacts::new().with("count", serde_json::json!(3));
        let count: u32 = artifacts.get_as("count").unwrap().unwrap();
        assert_eq!(count, 3);
        assert!(artifacts.get_as::<u32>("missing").is_none());
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let artifacts = StageArtifacts::new().with("a", serde_json::json!(1));
        assert_eq!(serde_json::to_string(&artifacts).unwrap(), r#"{"a":1}"#);
    }
}
