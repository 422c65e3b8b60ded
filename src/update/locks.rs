//! Shard-wide update lock.
//!
//! A read-write lock used inverted: ordinary mutations take the read side
//! (many at once), while state transitions "block updates" by taking the
//! write side to carve out a quiescent window. The read side honors a
//! configurable timeout; exhaustion surfaces as a service-unavailable
//! error so callers can retry.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{NaginataError, Result};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

/// Shard-wide update lock with a millisecond timeout on the read side.
#[derive(Debug)]
pub struct UpdateLocks {
    timeout: Option<Duration>,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl UpdateLocks {
    /// Create the lock; `timeout_ms == 0` means wait indefinitely.
    pub fn new(timeout_ms: u64) -> Self {
        UpdateLocks {
            timeout: if timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(timeout_ms))
            },
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    /// Block all updates (acquire the write side). Waits indefinitely.
    pub fn block_updates(&self) {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
    }

    /// Release the write side acquired by [`Self::block_updates`].
    pub fn unblock_updates(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Acquire the read side, honoring the configured timeout.
    ///
    /// Returns a guard releasing the lock on drop, or a service-unavailable
    /// error if the timeout elapsed while updates were blocked.
    pub fn lock_for_update(&self) -> Result<UpdateGuard<'_>> {
        let mut state = self.state.lock();
        match self.timeout {
            None => {
                while state.writer || state.writers_waiting > 0 {
                    self.cond.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while state.writer || state.writers_waiting > 0 {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return Err(NaginataError::service_unavailable(format!(
                            "timed out after {}ms waiting for the update lock",
                            timeout.as_millis()
                        )));
                    }
                }
            }
        }
        state.readers += 1;
        Ok(UpdateGuard { locks: self })
    }
}

/// Read-side guard; dropping it releases the lock.
#[derive(Debug)]
pub struct UpdateGuard<'a> {
    locks: &'a UpdateLocks,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.locks.state.lock();
        state.readers -= 1;
        let wake = state.readers == 0;
        drop(state);
        if wake {
            self.locks.cond.notify_all();
        }
    }
}
