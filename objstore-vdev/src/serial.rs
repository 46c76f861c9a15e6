//! Single-shot rendezvous for operations identified by type alone (pool
//! create, pool open, end-TXG), not by request id.

use std::sync::{Condvar, Mutex};

use crate::error::VdevError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Done,
    Faulted(String),
}

pub struct SerialLatch {
    state: Mutex<State>,
    cv: Condvar,
}

impl SerialLatch {
    pub fn new() -> Self {
        SerialLatch {
            state: Mutex::new(State::Idle),
            cv: Condvar::new(),
        }
    }

    /// Blocks until `trip` or `fault` is called, then resets to `Idle`.
    pub fn arm_and_wait(&self) -> Result<(), VdevError> {
        let mut guard = self.state.lock().unwrap();
        loop {
            match &*guard {
                State::Idle => {
                    guard = self.cv.wait(guard).unwrap();
                }
                State::Done => {
                    *guard = State::Idle;
                    return Ok(());
                }
                State::Faulted(reason) => {
                    let err = VdevError::protocol(reason.clone());
                    *guard = State::Idle;
                    return Err(err);
                }
            }
        }
    }

    /// Called by the reader on a recognized `*done` response.
    pub fn trip(&self) {
        let mut guard = self.state.lock().unwrap();
        debug_assert_eq!(*guard, State::Idle, "serial op tripped twice without a waiter");
        *guard = State::Done;
        self.cv.notify_all();
    }

    /// Called by the reader (or close) when a protocol fault occurs, so a
    /// caller blocked in `arm_and_wait` is released with an error instead of
    /// stalling forever.
    pub fn fault(&self, reason: String) {
        let mut guard = self.state.lock().unwrap();
        *guard = State::Faulted(reason);
        self.cv.notify_all();
    }
}

impl Default for SerialLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn trip_releases_a_waiter() {
        let latch = Arc::new(SerialLatch::new());
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.arm_and_wait())
        };
        thread::sleep(Duration::from_millis(20));
        latch.trip();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn fault_releases_a_waiter_with_an_error() {
        let latch = Arc::new(SerialLatch::new());
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.arm_and_wait())
        };
        thread::sleep(Duration::from_millis(20));
        latch.fault("agent disconnected".to_string());
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn resets_to_idle_after_each_wait() {
        let latch = SerialLatch::new();
        let t = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                latch.trip();
            });
            latch.arm_and_wait()
        });
        assert!(t.is_ok());
        // a second round trip should work identically
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                latch.trip();
            });
            assert!(latch.arm_and_wait().is_ok());
        });
    }
}
