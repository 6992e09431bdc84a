//! Per-job progress topics for live observers.
//!
//! Every committed job transition is published as a [`ProgressEvent`]
//! carrying the job's sequence number. A [`Subscription`] starts with a
//! snapshot rebuilt from the [`JobStore`], then yields live events with
//! strictly increasing sequences. A subscriber that falls behind its buffer
//! is resynchronised with a fresh snapshot instead of replaying the gap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::job_store::JobStore;
use crate::error::{RedlineError, Result};
use crate::pipeline::stage::StageName;
use crate::worker::job::{Job, JobResult, JobStatus};

/// Why an event was emitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Rebuilt from stored state on subscribe or after an overflow.
    Snapshot,
    Started,
    Progress,
    Completed,
    Failed,
}

/// State of a job at one sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    pub stage_progress: u8,
    pub overall_progress: u8,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_job(job: &Job, kind: EventKind) -> Self {
        Self {
            job_id: job.id.clone(),
            kind,
            status: job.status,
            stage: job.stage,
            stage_progress: job.stage_progress,
            overall_progress: job.overall_progress(),
            sequence: job.sequence,
            message: job.message.clone(),
            error_message: job.error_message.clone(),
            result: job.result.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn snapshot(job: &Job) -> Self {
        Self::from_job(job, EventKind::Snapshot)
    }

    /// True once the job has reached `completed` or `failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

type Topics = HashMap<String, broadcast::Sender<ProgressEvent>>;

/// Fans committed job transitions out to subscribers.
///
/// Topics are created lazily by the first subscriber and dropped after the
/// job's terminal event. Publishing never waits on a subscriber.
pub struct ProgressBroadcaster {
    jobs: Arc<JobStore>,
    topics: Mutex<Topics>,
    capacity: usize,
}

impl ProgressBroadcaster {
    /// `capacity` is the per-subscriber buffer, in events.
    pub fn new(jobs: Arc<JobStore>, capacity: usize) -> Self {
        Self {
            jobs,
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock_topics(&self) -> MutexGuard<'_, Topics> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Progress topic lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Sends an event to the job's current subscribers.
    ///
    /// Must be called after the transition it describes has been committed
    /// to the job store. A terminal event closes the topic.
    pub fn publish(&self, event: ProgressEvent) {
        let mut topics = self.lock_topics();
        let terminal = event.is_terminal();
        let job_id = event.job_id.clone();

        if let Some(sender) = topics.get(&job_id) {
            // No receivers left is fine.
            let _ = sender.send(event);
        }
        if terminal && topics.remove(&job_id).is_some() {
            log::debug!("Closed progress topic for job {}", job_id);
        }
    }

    pub fn publish_job(&self, job: &Job, kind: EventKind) {
        self.publish(ProgressEvent::from_job(job, kind));
    }

    /// Subscribes to a job's progress.
    ///
    /// The receiver is attached before the snapshot is read, so no committed
    /// transition can fall between the two.
    pub fn subscribe(&self, job_id: &str) -> Result<Subscription> {
        self.jobs.get(job_id)?;

        let mut topics = self.lock_topics();
        let sender = topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let receiver = sender.subscribe();

        let snapshot = match self.jobs.get(job_id) {
            Ok(job) => ProgressEvent::snapshot(&job),
            Err(e) => {
                drop(receiver);
                if sender.receiver_count() == 0 {
                    topics.remove(job_id);
                }
                return Err(e);
            }
        };

        let receiver = if snapshot.is_terminal() {
            drop(receiver);
            if sender.receiver_count() == 0 {
                topics.remove(job_id);
            }
            None
        } else {
            Some(receiver)
        };

        Ok(Subscription {
            job_id: job_id.to_string(),
            jobs: Arc::clone(&self.jobs),
            receiver,
            pending: Some(snapshot),
            last_sequence: None,
            finished: false,
        })
    }

    /// Drops a job's topic, ending every subscription to it.
    pub fn forget(&self, job_id: &str) {
        self.lock_topics().remove(job_id);
    }

    pub fn topic_count(&self) -> usize {
        self.lock_topics().len()
    }
}

/// An ordered stream of one job's progress events.
///
/// Yields a snapshot first, then live events. Events at or below the last
/// delivered sequence are skipped. The stream ends after a terminal event.
pub struct Subscription {
    job_id: String,
    jobs: Arc<JobStore>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    pending: Option<ProgressEvent>,
    last_sequence: Option<u64>,
    finished: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("last_sequence", &self.last_sequence)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Sequence of the last event handed out, if any.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn accept(&mut self, event: ProgressEvent) -> Option<ProgressEvent> {
        if self.last_sequence.is_some_and(|last| event.sequence <= last) {
            return None;
        }
        self.last_sequence = Some(event.sequence);
        if event.is_terminal() {
            self.finished = true;
            self.receiver = None;
        }
        Some(event)
    }

    /// Reads a fresh snapshot from the store. Used after an overflow and
    /// when the topic closes.
    fn resync(&mut self, reattach: bool) -> Option<ProgressEvent> {
        if reattach {
            // A fresh receiver starts at the tail: the lagged backlog is gone.
            self.receiver = self.receiver.as_ref().map(|r| r.resubscribe());
        } else {
            self.receiver = None;
        }

        match self.jobs.get(&self.job_id) {
            Ok(job) => {
                let snapshot = ProgressEvent::snapshot(&job);
                let delivered = self.accept(snapshot);
                if self.receiver.is_none() && !self.finished && delivered.is_none() {
                    self.finished = true;
                }
                delivered
            }
            Err(RedlineError::NotFound(_)) => {
                self.finished = true;
                None
            }
            Err(e) => {
                log::error!("Failed to resync progress for job {}: {}", self.job_id, e);
                self.finished = true;
                None
            }
        }
    }

    /// Handles one receive outcome.
    fn step(&mut self, received: std::result::Result<ProgressEvent, RecvError>) -> Step {
        match received {
            Ok(event) => match self.accept(event) {
                Some(event) => Step::Deliver(event),
                None => Step::Continue,
            },
            Err(RecvError::Lagged(skipped)) => {
                log::debug!(
                    "Subscriber for job {} lagged by {} events, resyncing",
                    self.job_id,
                    skipped
                );
                match self.resync(true) {
                    Some(event) => Step::Deliver(event),
                    None if self.finished => Step::End,
                    None => Step::Continue,
                }
            }
            Err(RecvError::Closed) => match self.resync(false) {
                Some(event) => Step::Deliver(event),
                None => {
                    self.finished = true;
                    Step::End
                }
            },
        }
    }

    fn take_pending(&mut self) -> Option<ProgressEvent> {
        let event = self.pending.take()?;
        self.accept(event)
    }

    /// Waits for the next event. Returns `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.take_pending() {
            return Some(event);
        }
        loop {
            if self.finished {
                return None;
            }
            let received = match self.receiver.as_mut() {
                Some(receiver) => receiver.recv().await,
                None => Err(RecvError::Closed),
            };
            match self.step(received) {
                Step::Deliver(event) => return Some(event),
                Step::Continue => {}
                Step::End => return None,
            }
        }
    }

    /// Blocking variant of [`Subscription::next`] for plain threads.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.take_pending() {
            return Some(event);
        }
        loop {
            if self.finished {
                return None;
            }
            let received = match self.receiver.as_mut() {
                Some(receiver) => receiver.blocking_recv(),
                None => Err(RecvError::Closed),
            };
            match self.step(received) {
                Step::Deliver(event) => return Some(event),
                Step::Continue => {}
                Step::End => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.take_pending() {
            return Some(event);
        }
        loop {
            if self.finished {
                return None;
            }
            let received = match self.receiver.as_mut() {
                Some(receiver) => match receiver.try_recv() {
                    Ok(event) => Ok(event),
                    Err(TryRecvError::Empty) => return None,
                    Err(TryRecvError::Lagged(n)) => Err(RecvError::Lagged(n)),
                    Err(TryRecvError::Closed) => Err(RecvError::Closed),
                },
                None => Err(RecvError::Closed),
            };
            match self.step(received) {
                Step::Deliver(event) => return Some(event),
                Step::Continue => {}
                Step::End => return None,
            }
        }
    }
}

enum Step {
    Deliver(ProgressEvent),
    Continue,
    End,
}
