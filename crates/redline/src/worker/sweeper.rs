use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info};

use crate::error::{RedlineError, Result};

/// Background thread that runs a sweep every `interval` until stopped.
pub struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
    runs: Arc<AtomicUsize>,
}

impl Sweeper {
    pub fn start<F>(interval: Duration, sweep: F) -> Result<Self>
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let (stop, stop_rx) = bounded::<()>(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = thread::Builder::new()
            .name("redline-sweeper".to_string())
            .spawn(move || {
                debug!("Sweeper started, interval {:?}", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = sweep() {
                                error!("Sweep failed: {}", e);
                            }
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Sweeper stopped");
            })
            .map_err(|e| RedlineError::Internal(format!("failed to spawn sweeper: {}", e)))?;

        info!("Sweeper running every {}s", interval.as_secs());
        Ok(Self { stop, handle, runs })
    }

    /// Completed sweep passes so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }

    /// Stops the thread and waits for an in-progress sweep to finish.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("Sweeper thread panicked");
        }
    }
}
