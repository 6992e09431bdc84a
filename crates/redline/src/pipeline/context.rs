use crate::storage::FileRecord;

use super::progress::ProgressSink;
use super::stage::StageName;

/// What a stage sees of the job it is running for.
pub struct StageContext<'a> {
    pub job_id: &'a str,
    /// The job's input file.
    pub file: &'a FileRecord,
    stage: StageName,
    progress: &'a dyn ProgressSink,
    last_tick: u8,
}

impl<'a> StageContext<'a> {
    pub fn new(
        job_id: &'a str,
        file: &'a FileRecord,
        stage: StageName,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            job_id,
            file,
            stage,
            progress,
            last_tick: 0,
        }
    }

    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Reports progress within the current stage, clamped to 0..=100.
    ///
    /// Ticks that would move backwards or repeat the last value are dropped.
    pub fn tick(&mut self, stage_progress: u8) {
        let stage_progress = stage_progress.min(100);
        if stage_progress <= self.last_tick {
            return;
        }
        self.last_tick = stage_progress;
        self.progress.report(self.stage, stage_progress);
    }

    /// Reports `done` out of `total` steps.
    pub fn tick_fraction(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let percent = (done.min(total) * 100 / total) as u8;
        self.tick(percent);
    }
}
