//! Operating system abstraction
//!
//! The core only needs one OS primitive: a counting semaphore that a thread
//! can wait on, and that an interrupt handler can signal. Bring your own by
//! implementing [`Semaphore`] for your RTOS, or use one of the provided
//! implementations:
//!
//! - [`StdSemaphore`], with the `std` feature, for hosted targets.
//! - `WfeSemaphore`, on Cortex-M targets, which waits with `WFE` and
//!   updates its count in a critical section.

use core::fmt;

#[cfg(any(test, feature = "std"))]
mod std_impl;
#[cfg(any(test, feature = "std"))]
pub use std_impl::StdSemaphore;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod wfe;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use wfe::WfeSemaphore;

/// How long to wait for a semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Timeout {
    /// Don't wait; fail if the semaphore isn't available.
    NoWait,
    /// Wait at most this many milliseconds.
    Millis(u32),
    /// Wait until the semaphore is given.
    Forever,
}

/// The wait elapsed before the semaphore was given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out")
    }
}

/// A counting semaphore
///
/// `give()` must never block, since interrupt handlers call it. `take()`
/// may suspend the calling thread.
pub trait Semaphore: Sized {
    /// Create a semaphore with an `initial` count, saturating at `max`
    ///
    /// Returns `None` if the OS can't create the semaphore.
    fn create(initial: u32, max: u32) -> Option<Self>;

    /// Increment the count, waking one waiter
    ///
    /// The count saturates at the maximum given to [`create()`](Semaphore::create).
    fn give(&self);

    /// Decrement the count, waiting up to `timeout` for it to become non-zero
    fn take(&self, timeout: Timeout) -> Result<(), TimedOut>;

    /// Drop the count to zero
    fn reset(&self);
}
