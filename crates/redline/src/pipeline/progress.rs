use std::sync::Arc;

use crate::broadcast::{EventKind, JobStore, ProgressBroadcaster};

use super::stage::StageName;

/// Receives progress ticks from the pipeline runner.
pub trait ProgressSink: Send + Sync {
    fn report(&self, stage: StageName, stage_progress: u8);
}

/// No-op sink for unit tests.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _stage: StageName, _stage_progress: u8) {}
}

/// Commits each tick to the job store, then publishes the committed state.
pub struct BroadcastProgress {
    job_id: String,
    jobs: Arc<JobStore>,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl BroadcastProgress {
    pub fn new(job_id: &str, jobs: Arc<JobStore>, broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            job_id: job_id.to_string(),
            jobs,
            broadcaster,
        }
    }
}

impl ProgressSink for BroadcastProgress {
    fn report(&self, stage: StageName, stage_progress: u8) {
        match self.jobs.update_progress(&self.job_id, stage, stage_progress) {
            Ok(Some(job)) => self.broadcaster.publish_job(&job, EventKind::Progress),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                job_id = %self.job_id,
                stage = %stage,
                "Failed to record progress: {}",
                e
            ),
        }
    }
}
