//! Shared scaffolding for the integration tests: a generic event recorder
//! services can report through, plus a short polling helper for conditions
//! that settle asynchronously across worker threads.

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A channel `Service` implementations can clone into themselves to report
/// events back to the test thread, since `Service::shutdown` et al. run on
/// a worker thread the test has no other handle into.
#[derive(Clone)]
pub struct Recorder<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }

    /// Blocks up to `timeout` for the next recorded event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Polls `predicate` until it returns `true` or `timeout` elapses. Returns
/// whether it converged.
pub fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
