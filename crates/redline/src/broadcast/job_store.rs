//! Job store with persistent database storage.
//!
//! Each job lives behind its own `Mutex`, so transitions on one job never
//! wait on another. A transition is computed on a copy, written to SQLite,
//! and only then made visible; a failed write leaves the record unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::db::{job_repo, Database};
use crate::error::{RedlineError, Result};
use crate::pipeline::stage::StageName;
use crate::worker::job::{Job, JobResult, JobStatus};

/// Message recorded on jobs found mid-flight at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Outcome of startup recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Jobs that were `processing` and are now `failed`.
    pub failed: Vec<String>,
    /// Jobs still `pending`, in creation order.
    pub pending: Vec<String>,
}

/// A cached job plus its insertion ordinal, which gives creation order
/// without relying on timestamp resolution.
#[derive(Clone)]
struct Record {
    ordinal: u64,
    job: Arc<Mutex<Job>>,
}

type Records = HashMap<String, Record>;

pub struct JobStore {
    db: Database,
    records: RwLock<Records>,
    next_ordinal: AtomicU64,
}

fn lock_job(record: &Mutex<Job>) -> MutexGuard<'_, Job> {
    match record.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Job record lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl JobStore {
    /// Creates an empty store on top of the given database.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            records: RwLock::new(HashMap::new()),
            next_ordinal: AtomicU64::new(0),
        }
    }

    /// Creates a store and loads every persisted job.
    ///
    /// Rows that cannot be decoded are logged and skipped.
    pub fn load(db: Database) -> Result<Self> {
        let store = Self::new(db);
        let rows = job_repo::list_all(&store.db)?;
        let mut loaded = 0usize;
        {
            let mut records = store.write_records();
            for row in rows {
                match Job::from_row(&row) {
                    Ok(job) => {
                        let record = store.new_record(job.clone());
                        records.insert(job.id, record);
                        loaded += 1;
                    }
                    Err(e) => log::error!("Skipping unreadable job row: {}", e),
                }
            }
        }
        log::info!("Loaded {} jobs from database", loaded);
        Ok(store)
    }

    fn new_record(&self, job: Job) -> Record {
        Record {
            ordinal: self.next_ordinal.fetch_add(1, Ordering::Relaxed),
            job: Arc::new(Mutex::new(job)),
        }
    }

    fn read_records(&self) -> RwLockReadGuard<'_, Records> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, Records> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn record(&self, id: &str) -> Result<Arc<Mutex<Job>>> {
        self.read_records()
            .get(id)
            .map(|r| Arc::clone(&r.job))
            .ok_or_else(|| RedlineError::NotFound(format!("job {}", id)))
    }

    /// Applies `change` to a copy of the job, persists it and publishes it.
    ///
    /// `change` returns `Ok(false)` to signal a no-op: nothing is written and
    /// the sequence is not bumped.
    fn mutate<F>(&self, id: &str, change: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job) -> Result<bool>,
    {
        let record = self.record(id)?;
        let mut guard = lock_job(&record);

        let mut next = guard.clone();
        if !change(&mut next)? {
            return Ok(None);
        }
        next.sequence = guard.sequence + 1;

        if !job_repo::update(&self.db, &next.to_row())? {
            return Err(RedlineError::Internal(format!(
                "job {} missing from database",
                id
            )));
        }
        *guard = next.clone();
        Ok(Some(next))
    }

    /// Creates a pending job for an input file.
    pub fn create(&self, file_id: &str) -> Result<Job> {
        let job = Job::new(file_id);
        job_repo::insert(&self.db, &job.to_row())?;
        let record = self.new_record(job.clone());
        self.write_records().insert(job.id.clone(), record);
        log::debug!("Created job {} for file {}", job.id, file_id);
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        let record = self.record(id)?;
        let job = lock_job(&record).clone();
        Ok(job)
    }

    /// Atomically moves a pending job to processing.
    ///
    /// Any other status is a `Conflict` and leaves the job untouched.
    pub fn try_claim(&self, id: &str) -> Result<Job> {
        let claimed = self.mutate(id, |job| {
            if job.status != JobStatus::Pending {
                return Err(RedlineError::Conflict(format!(
                    "job {} is {}, not pending",
                    job.id, job.status
                )));
            }
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            job.message = Some("Processing started".to_string());
            Ok(true)
        })?;
        claimed.ok_or_else(|| RedlineError::Internal(format!("claim of job {} was a no-op", id)))
    }

    /// Records a progress tick.
    ///
    /// Returns `Ok(None)` without bumping the sequence when the tick would
    /// move the job backwards.
    pub fn update_progress(
        &self,
        id: &str,
        stage: StageName,
        stage_progress: u8,
    ) -> Result<Option<Job>> {
        let stage_progress = stage_progress.min(100);
        self.mutate(id, |job| {
            if job.status != JobStatus::Processing {
                return Err(RedlineError::Conflict(format!(
                    "job {} is {}, not processing",
                    job.id, job.status
                )));
            }
            if let Some(current) = job.stage {
                if (stage, stage_progress) < (current, job.stage_progress) {
                    log::debug!(
                        "Ignoring regressing tick for job {}: {}@{} < {}@{}",
                        job.id,
                        stage,
                        stage_progress,
                        current,
                        job.stage_progress
                    );
                    return Ok(false);
                }
            }
            job.stage = Some(stage);
            job.stage_progress = stage_progress;
            job.message = Some(stage.description().to_string());
            Ok(true)
        })
    }

    /// Marks a processing job completed.
    ///
    /// Returns `Ok(None)` if the job is already terminal.
    pub fn complete(&self, id: &str, result: JobResult) -> Result<Option<Job>> {
        self.mutate(id, |job| {
            match job.status {
                JobStatus::Completed | JobStatus::Failed => return Ok(false),
                JobStatus::Pending => {
                    return Err(RedlineError::Conflict(format!(
                        "job {} cannot complete before it starts",
                        job.id
                    )))
                }
                JobStatus::Processing => {}
            }
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.message = Some("Completed".to_string());
            job.result = Some(result);
            Ok(true)
        })
    }

    /// Marks a processing job failed.
    ///
    /// Returns `Ok(None)` if the job is already terminal.
    pub fn fail(&self, id: &str, error_message: &str) -> Result<Option<Job>> {
        self.mutate(id, |job| {
            match job.status {
                JobStatus::Completed | JobStatus::Failed => return Ok(false),
                JobStatus::Pending => {
                    return Err(RedlineError::Conflict(format!(
                        "job {} cannot fail before it starts",
                        job.id
                    )))
                }
                JobStatus::Processing => {}
            }
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.message = Some("Failed".to_string());
            job.error_message = Some(error_message.to_string());
            Ok(true)
        })
    }

    /// Jobs in creation order.
    pub fn all(&self) -> Vec<Job> {
        let mut records: Vec<Record> = self.read_records().values().cloned().collect();
        records.sort_by_key(|r| r.ordinal);
        records.iter().map(|r| lock_job(&r.job).clone()).collect()
    }

    /// Fails jobs left `processing` by a previous run and lists the
    /// `pending` ones that still need to be queued.
    pub fn recover_interrupted(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();
        for job in self.all() {
            match job.status {
                JobStatus::Processing => {
                    self.fail(&job.id, INTERRUPTED_MESSAGE)?;
                    log::warn!("Job {} was interrupted by restart, marked failed", job.id);
                    recovery.failed.push(job.id);
                }
                JobStatus::Pending => recovery.pending.push(job.id),
                _ => {}
            }
        }
        Ok(recovery)
    }

    /// Deletes terminal jobs whose input file is gone. Returns their ids.
    pub fn purge_orphans(&self) -> Result<Vec<String>> {
        let purged = job_repo::delete_terminal_orphans(&self.db)?;
        if !purged.is_empty() {
            let mut records = self.write_records();
            for id in &purged {
                records.remove(id);
            }
            log::info!("Purged {} expired jobs", purged.len());
        }
        Ok(purged)
    }
}
