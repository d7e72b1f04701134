//! Hosted semaphore

use super::{Semaphore, TimedOut, Timeout};
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// A [`Semaphore`] built on a standard mutex and condition variable
#[derive(Debug)]
pub struct StdSemaphore {
    count: Mutex<u32>,
    available: Condvar,
    max: u32,
}

impl StdSemaphore {
    fn lock(&self) -> MutexGuard<'_, u32> {
        // A panicking waiter can't leave the count in a bad state.
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current count
    pub fn count(&self) -> u32 {
        *self.lock()
    }
}

impl Semaphore for StdSemaphore {
    fn create(initial: u32, max: u32) -> Option<Self> {
        Some(StdSemaphore {
            count: Mutex::new(initial.min(max)),
            available: Condvar::new(),
            max,
        })
    }

    fn give(&self) {
        let mut count = self.lock();
        if *count < self.max {
            *count += 1;
        }
        drop(count);
        self.available.notify_one();
    }

    fn take(&self, timeout: Timeout) -> Result<(), TimedOut> {
        let mut count = self.lock();
        match timeout {
            Timeout::NoWait => {}
            Timeout::Forever => {
                while *count == 0 {
                    count = self
                        .available
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Timeout::Millis(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms.into());
                while *count == 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    count = self
                        .available
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        if *count == 0 {
            return Err(TimedOut);
        }
        *count -= 1;
        Ok(())
    }

    fn reset(&self) {
        *self.lock() = 0;
    }
}
