//! Idempotent job keys.

use super::VariantTag;

/// Builds the idempotent key for a run's generation request.
///
/// The key depends only on the run identifier and the variant tag, so a
/// restarted run re-derives the same keys and the registry suppresses
/// duplicate submissions.
#[must_use]
pub fn job_key(run_id: &str, variant: VariantTag) -> String {
    format!("{run_id}_{}", variant.as_str())
}
