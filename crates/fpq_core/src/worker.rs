//! Stop signalling for background threads.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A latch that background workers sleep on between ticks.
///
/// `stop` wakes every sleeper at once, so shutdown never waits out a full
/// flush period.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests every waiter to stop.
    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps for up to `period`. Returns true once a stop was requested.
    pub(crate) fn wait(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.condvar.wait_for(&mut stopped, period);
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_times_out_without_stop() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(5)));
        assert!(!signal.is_stopped());
    }

    #[test]
    fn stop_wakes_sleeper_early() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = Arc::clone(&signal);

        let started = Instant::now();
        let handle = thread::spawn(move || sleeper.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.stop();

        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn wait_after_stop_returns_immediately() {
        let signal = StopSignal::new();
        signal.stop();
        assert!(signal.wait(Duration::from_secs(30)));
    }
}
