//! Bounded calls into external collaborators.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};

use super::error::StageError;

/// Extracts the message of a caught panic.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `call` on its own thread and waits at most `timeout` for it.
///
/// On timeout the thread is left to finish on its own and its result is
/// discarded.
pub fn run_with_timeout<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T, StageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    std::thread::Builder::new()
        .name(format!("redline-{}", operation))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(call));
            // The caller may have given up already.
            let _ = tx.send(outcome);
        })
        .map_err(|e| StageError::Thread(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(StageError::Panicked(panic_message(payload.as_ref()))),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(operation, timeout_secs = timeout.as_secs(), "Call timed out");
            Err(StageError::Timeout { operation, timeout })
        }
        Err(RecvTimeoutError::Disconnected) => Err(StageError::Panicked(format!(
            "{} thread exited without a result",
            operation
        ))),
    }
}
