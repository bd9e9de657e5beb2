//! Asynchronous generation jobs.
//!
//! The coordinator fires a bounded batch of external generation requests
//! under idempotent keys, a per-run poller tracks their status durably with
//! adaptive backoff, and the await gate blocks the consuming stage until the
//! batch resolves or times out.

mod coordinator;
mod gate;
mod key;
mod model;
mod poller;

pub use coordinator::{AsyncJobCoordinator, FireReport};
pub use gate::{await_gate, BatchOutcome, GateOutcome, GeneratedClip};
pub use key::job_key;
pub use model::{
    GenerationJob, GenerationRequest, JobRegistry, JobStatus, RemoteStatus, SubmitAck, VariantTag,
};
pub use poller::{PollSchedule, PollerHandle};
