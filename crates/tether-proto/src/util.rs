//! Small internal utilities.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A process-wide, latching shutdown signal.
///
/// Triggered by an inbound shutdown frame, by local teardown, or by the
/// exit-on-disconnect policy; waiters wake once and the signal stays
/// set.
#[derive(Default)]
pub struct ShutdownSignal {
    /// Whether the signal has fired.
    fired: Mutex<bool>,
    /// Wakes blocked waiters.
    cv: Condvar,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake every waiter.
    pub fn trigger(&self) {
        let mut fired = self.fired.lock().expect("signal poisoned");
        *fired = true;
        self.cv.notify_all();
    }

    /// Return true if the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.fired.lock().expect("signal poisoned")
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let mut fired = self.fired.lock().expect("signal poisoned");
        while !*fired {
            fired = self.cv.wait(fired).expect("signal poisoned");
        }
    }

    /// Block until the signal fires or `dur` elapses; returns whether
    /// the signal has fired.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let mut fired = self.fired.lock().expect("signal poisoned");
        if !*fired {
            let (guard, _timeout) = self
                .cv
                .wait_timeout(fired, dur)
                .expect("signal poisoned");
            fired = guard;
        }
        *fired
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latches() {
        let s = ShutdownSignal::new();
        assert!(!s.is_triggered());
        assert!(!s.wait_timeout(Duration::from_millis(1)));
        s.trigger();
        assert!(s.is_triggered());
        assert!(s.wait_timeout(Duration::from_millis(1)));
        s.wait();
    }

    #[test]
    fn wakes_a_blocked_waiter() {
        let s = Arc::new(ShutdownSignal::new());
        let waiter = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || s.wait())
        };
        s.trigger();
        waiter.join().expect("waiter panicked");
    }
}
