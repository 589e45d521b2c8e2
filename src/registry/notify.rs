//! One-shot readiness signal for a registry key.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Signal raised when the first synced snapshot of a key arrives.
///
/// Once raised it stays raised; every waiter, current or later, returns
/// immediately.
#[derive(Debug, Default)]
pub struct DataNotify {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl DataNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.cond.notify_all();
    }

    pub fn is_notified(&self) -> bool {
        *self.ready.lock()
    }

    /// Block until notified or `timeout` elapses. Returns whether the
    /// signal was raised. A timeout past the end of time waits unbounded.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut ready = self.ready.lock();
        while !*ready {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut ready, deadline).timed_out() {
                        return *ready;
                    }
                }
                None => self.cond.wait(&mut ready),
            }
        }
        true
    }
}
