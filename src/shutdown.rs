//! Cooperative cancellation for long-running loops.
//!
//! A `StopSignal` is a cloneable, one-shot flag backed by a zero-capacity
//! channel whose only sender is dropped on `stop()`. Every clone observes the
//! disconnect, so the same primitive can be slept on (`wait_timeout`) or
//! selected on alongside data channels (`receiver`).

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    trigger: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    stopped: AtomicBool,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                trigger: Mutex::new(Some(tx)),
                rx,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless the signal fires first.
    ///
    /// Returns `true` when the signal fired (callers should unwind).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.inner.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Receiver that becomes ready (disconnected) once the signal fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }

    /// True when both handles refer to the same signal.
    pub fn same_as(&self, other: &StopSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_times_out_when_not_stopped() {
        let stop = StopSignal::new();
        let started = Instant::now();
        assert!(!stop.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn stop_wakes_waiters_on_other_threads() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        stop.stop();
        assert!(handle.join().unwrap());
        assert!(stop.is_stopped());
    }

    #[test]
    fn clones_share_identity() {
        let a = StopSignal::new();
        let b = a.clone();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&StopSignal::new()));
    }
}
