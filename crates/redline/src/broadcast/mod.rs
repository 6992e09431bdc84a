//! Job state and its live progress stream.
//!
//! [`JobStore`] owns every job record and serialises its transitions;
//! [`ProgressBroadcaster`] turns committed transitions into ordered events.

pub mod job_progress;
pub mod job_store;

pub use job_progress::{EventKind, ProgressBroadcaster, ProgressEvent, Subscription};
pub use job_store::{JobStore, Recovery, INTERRUPTED_MESSAGE};
