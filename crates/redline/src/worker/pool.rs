use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use tracing::{info_span, warn};

use crate::ai::SuggestionCategory;
use crate::broadcast::{EventKind, JobStore, ProgressBroadcaster};
use crate::error::{RedlineError, Result};
use crate::pipeline::timeout::panic_message;
use crate::pipeline::{
    BroadcastProgress, Pipeline, PipelineOutput, StageError, StageFailure, StageName,
};
use crate::storage::{FileKind, FileStore};
use crate::worker::job::{Job, JobResult};

/// Attempts made for a terminal store write before giving up.
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
/// First backoff delay between terminal write attempts; doubles each time.
const TERMINAL_RETRY_BASE_DELAY_MS: u64 = 50;

/// Message recorded when a job dies outside any stage.
const INTERNAL_FAILURE_MESSAGE: &str = "Internal error while processing the document";

/// Everything a worker needs to run a job end to end.
#[derive(Clone)]
pub struct WorkerDeps {
    pub jobs: Arc<JobStore>,
    pub files: Arc<FileStore>,
    pub broadcaster: Arc<ProgressBroadcaster>,
    pub pipeline: Arc<Pipeline>,
}

/// Fixed set of worker threads draining a FIFO queue of job ids.
pub struct WorkerPool {
    job_sender: Sender<String>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(deps: WorkerDeps, worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(RedlineError::Validation(
                "worker_count must be at least 1".to_string(),
            ));
        }
        let (job_sender, job_receiver) = unbounded::<String>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_deps = deps.clone();

            let handle = thread::Builder::new()
                .name(format!("redline-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, job_rx, shutdown_flag, worker_deps))
                .map_err(|e| {
                    shutdown.store(true, Ordering::Relaxed);
                    RedlineError::Internal(format!("failed to spawn worker {}: {}", worker_id, e))
                })?;
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);
        Ok(Self {
            job_sender,
            workers,
            shutdown,
        })
    }

    /// Queues a job id. Queuing an id twice is harmless: only the first
    /// claim succeeds.
    pub fn enqueue(&self, job_id: &str) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(RedlineError::Internal("worker pool is shut down".to_string()));
        }
        self.job_sender
            .send(job_id.to_string())
            .map_err(|_| RedlineError::Internal("worker queue is closed".to_string()))
    }

    /// Asks workers to stop after their current job.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stops the pool and joins every worker.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        drop(self.job_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<String>,
    shutdown: Arc<AtomicBool>,
    deps: WorkerDeps,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job_id) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| process_job(&deps, &job_id)));
                match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        error!("Worker {} failed job {}: {}", worker_id, job_id, e);
                        fail_job(&deps, &job_id, INTERNAL_FAILURE_MESSAGE);
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("Worker {} panicked on job {}: {}", worker_id, job_id, message);
                        fail_job(&deps, &job_id, INTERNAL_FAILURE_MESSAGE);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Runs one job from claim to terminal event.
///
/// Returns the terminal job, or `None` when the claim was refused because
/// another worker took the job or it already finished.
pub fn process_job(deps: &WorkerDeps, job_id: &str) -> Result<Option<Job>> {
    let job = match deps.jobs.try_claim(job_id) {
        Ok(job) => job,
        Err(RedlineError::Conflict(reason)) => {
            debug!("Skipping job {}: {}", job_id, reason);
            return Ok(None);
        }
        Err(RedlineError::NotFound(_)) => {
            debug!("Skipping job {}: no longer exists", job_id);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    deps.broadcaster.publish_job(&job, EventKind::Started);

    let _span = info_span!("job", job_id = %job.id).entered();
    let started = Instant::now();

    let input = match deps.files.get(&job.file_id) {
        Ok(file) => file,
        Err(e) => {
            let failure = StageFailure::new(StageName::Initializing, StageError::Storage(e));
            return finish_failed(deps, &job, &failure);
        }
    };

    let progress = BroadcastProgress::new(
        &job.id,
        Arc::clone(&deps.jobs),
        Arc::clone(&deps.broadcaster),
    );
    let output = match deps.pipeline.run(&job.id, &input, &progress) {
        Ok(output) => output,
        Err(failure) => return finish_failed(deps, &job, &failure),
    };

    let stored = match deps
        .files
        .put(FileKind::Output, &output.output_bytes, &output.output_name)
    {
        Ok(record) => record,
        Err(e) => {
            let failure = StageFailure::new(StageName::Finalizing, StageError::Storage(e));
            return finish_failed(deps, &job, &failure);
        }
    };

    let result = build_result(&output, stored.id, started.elapsed());
    let completed = with_retries("completion", &job.id, || {
        deps.jobs.complete(&job.id, result.clone())
    });
    let completed = match completed {
        Ok(completed) => completed,
        Err(e) => {
            let failure = StageFailure::new(StageName::Finalizing, StageError::Storage(e));
            return finish_failed(deps, &job, &failure);
        }
    };
    match completed {
        Some(done) => {
            tracing::info!(
                suggestions = done.result.as_ref().map_or(0, |r| r.suggestion_count),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job completed"
            );
            deps.broadcaster.publish_job(&done, EventKind::Completed);
            Ok(Some(done))
        }
        None => {
            warn!("Job was already finished, result discarded");
            Ok(None)
        }
    }
}

fn build_result(output: &PipelineOutput, output_file_id: String, elapsed: Duration) -> JobResult {
    let mut by_category: BTreeMap<SuggestionCategory, usize> = BTreeMap::new();
    for s in &output.suggestions {
        *by_category.entry(s.category).or_default() += 1;
    }
    JobResult {
        output_file_id,
        suggestion_count: output.suggestions.len(),
        suggestions_by_category: by_category,
        elapsed_ms: elapsed.as_millis() as u64,
        cost_estimate: output.cost_estimate,
        prompt_tokens: output.usage.prompt_tokens,
        completion_tokens: output.usage.completion_tokens,
    }
}

/// Runs a terminal store write, retrying database errors with backoff.
///
/// `complete` and `fail` are no-ops on a terminal job, so a retry after a
/// write that did land is harmless.
fn with_retries<T>(what: &str, job_id: &str, mut write: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match write() {
            Err(e @ RedlineError::Database(_)) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                let delay = TERMINAL_RETRY_BASE_DELAY_MS << (attempt - 1);
                warn!(
                    "Recording {} of job {} failed (attempt {}/{}), retrying in {}ms: {}",
                    what, job_id, attempt, TERMINAL_WRITE_ATTEMPTS, delay, e
                );
                thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn finish_failed(deps: &WorkerDeps, job: &Job, failure: &StageFailure) -> Result<Option<Job>> {
    error!("Job {} failed: {}", job.id, failure);
    let message = failure.public_message();
    match with_retries("failure", &job.id, || deps.jobs.fail(&job.id, &message))? {
        Some(failed) => {
            deps.broadcaster.publish_job(&failed, EventKind::Failed);
            Ok(Some(failed))
        }
        None => Ok(None),
    }
}

fn fail_job(deps: &WorkerDeps, job_id: &str, message: &str) {
    match with_retries("failure", job_id, || deps.jobs.fail(job_id, message)) {
        Ok(Some(failed)) => deps.broadcaster.publish_job(&failed, EventKind::Failed),
        Ok(None) => {}
        Err(e) => error!("Could not record failure of job {}: {}", job_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{
        AnalysisError, AnalysisResponse, RuleSuggester, SuggestionService,
    };
    use crate::codec::{CodecRegistry, TextUnit};
    use crate::config::{PipelineSettings, PricingConfig, UploadConfig};
    use crate::db::{job_repo, Database, DatabaseError};
    use crate::pipeline::PipelineServices;
    use crate::worker::job::JobStatus;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
        deps: WorkerDeps,
    }

    fn fixture_with(suggester: Arc<dyn SuggestionService>, settings: PipelineSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let files = Arc::new(
            FileStore::open(
                &dir.path().join("storage"),
                db.clone(),
                chrono::Duration::hours(1),
                UploadConfig::default(),
            )
            .unwrap(),
        );
        let jobs = Arc::new(JobStore::new(db.clone()));
        let broadcaster = Arc::new(ProgressBroadcaster::new(Arc::clone(&jobs), 256));
        let pipeline = Arc::new(Pipeline::new(PipelineServices {
            files: Arc::clone(&files),
            codecs: CodecRegistry::new(),
            suggester,
            settings,
            pricing: PricingConfig::default(),
        }));
        Fixture {
            dir,
            db,
            deps: WorkerDeps {
                jobs,
                files,
                broadcaster,
                pipeline,
            },
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(RuleSuggester::new()), PipelineSettings::default())
    }

    struct Unavailable;

    impl SuggestionService for Unavailable {
        fn analyze(
            &self,
            _units: &[TextUnit],
            _categories: &[SuggestionCategory],
        ) -> std::result::Result<AnalysisResponse, AnalysisError> {
            Err(AnalysisError::Unavailable)
        }
    }

    fn wait_until_terminal(fx: &Fixture, jobs: &[&Job]) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !jobs
            .iter()
            .all(|j| fx.deps.jobs.get(&j.id).unwrap().is_terminal())
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn submit(fx: &Fixture, body: &[u8], name: &str) -> Job {
        let file = fx.deps.files.put(FileKind::Upload, body, name).unwrap();
        fx.deps.jobs.create(&file.id).unwrap()
    }

    #[test]
    fn test_process_job_completes_and_stores_output() {
        let fx = fixture();
        let job = submit(&fx, b"Teh end.\n", "story.txt");

        let done = process_job(&fx.deps, &job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.overall_progress(), 100);

        let result = done.result.unwrap();
        assert_eq!(result.suggestion_count, 1);
        assert_eq!(
            result.suggestions_by_category.get(&SuggestionCategory::Spelling),
            Some(&1)
        );
        let (record, bytes) = fx.deps.files.read(&result.output_file_id).unwrap();
        assert_eq!(record.kind, FileKind::Output);
        assert_eq!(record.original_name, "story_corrected.txt");
        assert_eq!(bytes, b"The end.\n");
    }

    #[test]
    fn test_process_job_twice_is_a_no_op() {
        let fx = fixture();
        let job = submit(&fx, b"Fine text.", "a.txt");

        assert!(process_job(&fx.deps, &job.id).unwrap().is_some());
        let sequence = fx.deps.jobs.get(&job.id).unwrap().sequence;
        assert!(process_job(&fx.deps, &job.id).unwrap().is_none());
        assert_eq!(fx.deps.jobs.get(&job.id).unwrap().sequence, sequence);
    }

    #[test]
    fn test_unknown_job_is_skipped() {
        let fx = fixture();
        assert!(process_job(&fx.deps, "no-such-job").unwrap().is_none());
    }

    #[test]
    fn test_service_failure_fails_job_with_stage_name() {
        let fx = fixture_with(Arc::new(Unavailable), PipelineSettings::default());
        let job = submit(&fx, b"Some text.", "a.txt");

        let failed = process_job(&fx.deps, &job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("Stage 'analyzing' failed: Suggestion service unavailable")
        );
        assert!(failed.result.is_none());
        assert!(failed.overall_progress() < 100);
    }

    #[test]
    fn test_expired_input_fails_in_initializing() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let files = Arc::new(
            FileStore::open(
                &dir.path().join("storage"),
                db.clone(),
                chrono::Duration::zero(),
                UploadConfig::default(),
            )
            .unwrap(),
        );
        let fx = fixture();
        let deps = WorkerDeps {
            files: Arc::clone(&files),
            ..fx.deps.clone()
        };
        let file = files.put(FileKind::Upload, b"text", "a.txt").unwrap();
        let job = deps.jobs.create(&file.id).unwrap();

        let failed = process_job(&deps, &job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed
            .error_message
            .unwrap()
            .starts_with("Stage 'initializing' failed:"));
    }

    #[test]
    fn test_events_end_with_terminal_after_commit() {
        let fx = fixture();
        let job = submit(&fx, b"Teh end.", "a.txt");
        let mut sub = fx.deps.broadcaster.subscribe(&job.id).unwrap();

        process_job(&fx.deps, &job.id).unwrap();

        let events: Vec<_> = std::iter::from_fn(|| sub.try_next()).collect();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&EventKind::Snapshot));
        assert_eq!(kinds.get(1), Some(&EventKind::Started));
        assert_eq!(kinds.last(), Some(&EventKind::Completed));
        let last = events.last().unwrap();
        assert_eq!(last.sequence, fx.deps.jobs.get(&job.id).unwrap().sequence);
        assert!(last.result.is_some());
    }

    #[test]
    fn test_pool_runs_queued_jobs_in_order() {
        let fx = fixture();
        let first = submit(&fx, b"one", "a.txt");
        let second = submit(&fx, b"two", "b.txt");

        let pool = WorkerPool::start(fx.deps.clone(), 1).unwrap();
        pool.enqueue(&first.id).unwrap();
        pool.enqueue(&second.id).unwrap();
        pool.enqueue(&first.id).unwrap();

        wait_until_terminal(&fx, &[&first, &second]);
        pool.wait();

        let a = fx.deps.jobs.get(&first.id).unwrap();
        let b = fx.deps.jobs.get(&second.id).unwrap();
        assert_eq!(a.status, JobStatus::Completed);
        assert_eq!(b.status, JobStatus::Completed);
        assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let fx = fixture();
        assert!(matches!(
            WorkerPool::start(fx.deps.clone(), 0),
            Err(RedlineError::Validation(_))
        ));
    }

    #[test]
    fn test_enqueue_after_shutdown_is_rejected() {
        let fx = fixture();
        let pool = WorkerPool::start(fx.deps.clone(), 1).unwrap();
        pool.shutdown();
        assert!(pool.enqueue("job").is_err());
        pool.wait();
    }

    #[test]
    fn test_with_retries_recovers_from_transient_database_error() {
        let mut calls = 0;
        let value = with_retries("completion", "job-1", || {
            calls += 1;
            if calls == 1 {
                Err(RedlineError::Database(DatabaseError::LockPoisoned))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_with_retries_is_bounded_and_skips_other_errors() {
        let mut calls = 0;
        let err = with_retries("completion", "job-1", || -> Result<()> {
            calls += 1;
            Err(RedlineError::Database(DatabaseError::LockPoisoned))
        })
        .unwrap_err();
        assert!(matches!(err, RedlineError::Database(_)));
        assert_eq!(calls, TERMINAL_WRITE_ATTEMPTS);

        let mut calls = 0;
        let err = with_retries("failure", "job-1", || -> Result<()> {
            calls += 1;
            Err(RedlineError::Conflict("not processing".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, RedlineError::Conflict(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_unrecordable_completion_fails_job_and_ends_stream() {
        let fx = fixture();
        let job = submit(&fx, b"Teh end.", "a.txt");
        fx.db
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TEMP TRIGGER reject_completion BEFORE UPDATE ON jobs
                     WHEN NEW.status = 'completed'
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                )?;
                Ok(())
            })
            .unwrap();
        let mut sub = fx.deps.broadcaster.subscribe(&job.id).unwrap();

        let failed = process_job(&fx.deps, &job.id).unwrap().unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        let message = failed.error_message.unwrap();
        assert!(message.starts_with("Stage 'finalizing' failed:"), "{}", message);
        assert!(!message.contains("disk I/O"));

        let row = job_repo::find_by_id(&fx.db, &job.id).unwrap().unwrap();
        assert_eq!(row.status, "failed");

        let events: Vec<_> = std::iter::from_fn(|| sub.try_next()).collect();
        assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Failed));
        assert!(sub.is_finished());
    }

    #[test]
    fn test_duplicate_enqueues_across_workers_run_each_job_once() {
        let fx = fixture();
        let jobs: Vec<Job> = (0..3)
            .map(|i| submit(&fx, b"Teh end.", &format!("doc{}.txt", i)))
            .collect();
        let mut subs: Vec<_> = jobs
            .iter()
            .map(|j| fx.deps.broadcaster.subscribe(&j.id).unwrap())
            .collect();

        let pool = WorkerPool::start(fx.deps.clone(), 4).unwrap();
        for _ in 0..3 {
            for job in &jobs {
                pool.enqueue(&job.id).unwrap();
            }
        }
        wait_until_terminal(&fx, &jobs.iter().collect::<Vec<_>>());
        pool.wait();

        for (job, sub) in jobs.iter().zip(subs.iter_mut()) {
            assert_eq!(fx.deps.jobs.get(&job.id).unwrap().status, JobStatus::Completed);
            let kinds: Vec<EventKind> = std::iter::from_fn(|| sub.try_next()).map(|e| e.kind).collect();
            assert_eq!(kinds.iter().filter(|k| **k == EventKind::Started).count(), 1);
            assert_eq!(kinds.iter().filter(|k| **k == EventKind::Completed).count(), 1);
        }
        let outputs = std::fs::read_dir(fx.dir.path().join("storage").join("output"))
            .unwrap()
            .count();
        assert_eq!(outputs, jobs.len());
    }
}
