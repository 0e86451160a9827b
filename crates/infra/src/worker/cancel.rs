//! Per-job cancellation token
//!
//! The pool keeps the [`CancelHandle`], the running job gets the
//! [`CancelToken`]. Jobs poll the token between steps with a bounded wait.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Create a connected handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let flag = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded(1);
    (
        CancelHandle {
            flag: Arc::clone(&flag),
            tx,
        },
        CancelToken { flag, rx },
    )
}

/// Requesting side of a cancellation
#[derive(Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    tx: Sender<()>,
}

impl CancelHandle {
    /// Signal the job; idempotent
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        // A full slot means a wake-up is already pending
        let _ = self.tx.try_send(());
    }
}

/// Observing side, handed to the running job
#[derive(Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sleep for at most `timeout`, waking early on cancellation
    ///
    /// Returns `true` if the job should stop. A dropped handle counts as
    /// cancellation since nobody is left to receive the result.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_without_cancel() {
        let (_handle, token) = cancel_pair();
        assert!(!token.wait(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_wakes_waiter_early() {
        let (handle, token) = cancel_pair();
        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = token.wait(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(10));
        handle.cancel();
        handle.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_dropped_handle_counts_as_cancel() {
        let (handle, token) = cancel_pair();
        drop(handle);
        assert!(token.wait(Duration::from_secs(10)));
    }
}
