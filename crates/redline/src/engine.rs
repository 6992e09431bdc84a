//! Wires the stores, broadcaster, worker pool and sweeper together and
//! exposes the job and file lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::ai::{RuleSuggester, SuggestionService};
use crate::broadcast::{JobStore, ProgressBroadcaster, Subscription};
use crate::codec::CodecRegistry;
use crate::config::{validate_config, EngineConfig};
use crate::db::Database;
use crate::error::{RedlineError, Result};
use crate::pipeline::{Pipeline, PipelineServices};
use crate::storage::{FileKind, FileRecord, FileStore};
use crate::worker::{Job, JobStatus, Sweeper, WorkerDeps, WorkerPool};

/// External collaborators plugged into the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub codecs: CodecRegistry,
    pub suggester: Arc<dyn SuggestionService>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            codecs: CodecRegistry::new(),
            suggester: Arc::new(RuleSuggester::new()),
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub files_removed: usize,
    pub jobs_purged: usize,
}

/// Deletes expired files, then terminal jobs whose input file is gone.
fn sweep_at(
    files: &FileStore,
    jobs: &JobStore,
    broadcaster: &ProgressBroadcaster,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let removed = files.sweep_expired(now)?;
    let purged = jobs.purge_orphans()?;
    for id in &purged {
        broadcaster.forget(id);
    }
    Ok(SweepReport {
        files_removed: removed.len(),
        jobs_purged: purged.len(),
    })
}

pub struct Engine {
    config: EngineConfig,
    files: Arc<FileStore>,
    jobs: Arc<JobStore>,
    broadcaster: Arc<ProgressBroadcaster>,
    pool: Option<WorkerPool>,
    sweeper: Option<Sweeper>,
}

impl Engine {
    /// Opens the engine with the built-in codecs and rule-based suggester.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::default())
    }

    /// Opens storage, recovers interrupted jobs and starts the workers.
    ///
    /// Jobs found `processing` are failed; `pending` ones are queued again in
    /// creation order.
    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        validate_config(&config)?;

        let db = Database::open(&config.database_path)?;
        let files = Arc::new(FileStore::open(
            &config.storage_root,
            db.clone(),
            config.file_ttl(),
            config.upload.clone(),
        )?);
        let jobs = Arc::new(JobStore::load(db)?);
        let recovery = jobs.recover_interrupted()?;
        if !recovery.failed.is_empty() {
            warn!(
                "Marked {} interrupted jobs as failed",
                recovery.failed.len()
            );
        }

        let broadcaster = Arc::new(ProgressBroadcaster::new(
            Arc::clone(&jobs),
            config.subscriber_buffer,
        ));
        let pipeline = Arc::new(Pipeline::new(PipelineServices {
            files: Arc::clone(&files),
            codecs: collaborators.codecs,
            suggester: collaborators.suggester,
            settings: config.pipeline.clone(),
            pricing: config.pricing.clone(),
        }));

        let pool = WorkerPool::start(
            WorkerDeps {
                jobs: Arc::clone(&jobs),
                files: Arc::clone(&files),
                broadcaster: Arc::clone(&broadcaster),
                pipeline,
            },
            config.worker_count,
        )?;
        for id in &recovery.pending {
            pool.enqueue(id)?;
        }
        if !recovery.pending.is_empty() {
            info!("Re-queued {} pending jobs", recovery.pending.len());
        }

        let sweeper = {
            let files = Arc::clone(&files);
            let jobs = Arc::clone(&jobs);
            let broadcaster = Arc::clone(&broadcaster);
            Sweeper::start(config.sweep_interval(), move || {
                sweep_at(&files, &jobs, &broadcaster, Utc::now()).map(|_| ())
            })?
        };

        Ok(Self {
            config,
            files,
            jobs,
            broadcaster,
            pool: Some(pool),
            sweeper: Some(sweeper),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and stores an uploaded document.
    pub fn upload(&self, bytes: &[u8], original_name: &str) -> Result<FileRecord> {
        self.files.put(FileKind::Upload, bytes, original_name)
    }

    pub fn file(&self, id: &str) -> Result<FileRecord> {
        self.files.get(id)
    }

    /// Reads a live file and verifies its checksum.
    pub fn read_file(&self, id: &str) -> Result<(FileRecord, Vec<u8>)> {
        self.files.read(id)
    }

    /// Creates a job for a stored file and queues it.
    pub fn submit(&self, file_id: &str) -> Result<Job> {
        self.files.get(file_id)?;
        let job = self.jobs.create(file_id)?;
        if let Some(pool) = &self.pool {
            pool.enqueue(&job.id)?;
        }
        info!("Submitted job {}", job.id);
        Ok(job)
    }

    pub fn job(&self, id: &str) -> Result<Job> {
        self.jobs.get(id)
    }

    /// Reads the corrected document of a finished job.
    ///
    /// A failed job is a `Processing` error carrying its public failure
    /// message; a job still queued or running is a `Conflict`.
    pub fn output(&self, job_id: &str) -> Result<(FileRecord, Vec<u8>)> {
        let job = self.jobs.get(job_id)?;
        match job.status {
            JobStatus::Completed => {
                let result = job.result.ok_or_else(|| {
                    RedlineError::Internal(format!("completed job {} has no result", job_id))
                })?;
                self.files.read(&result.output_file_id)
            }
            JobStatus::Failed => Err(RedlineError::Processing(
                job.error_message
                    .unwrap_or_else(|| "job failed".to_string()),
            )),
            status => Err(RedlineError::Conflict(format!(
                "job {} is still {}",
                job_id, status
            ))),
        }
    }

    /// Every known job in creation order.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.all()
    }

    pub fn subscribe(&self, job_id: &str) -> Result<Subscription> {
        self.broadcaster.subscribe(job_id)
    }

    /// Runs one sweep now.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        sweep_at(&self.files, &self.jobs, &self.broadcaster, now)
    }

    /// Stops the sweeper, lets workers finish their current job and joins
    /// every thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        if let Some(pool) = self.pool.take() {
            pool.wait();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
