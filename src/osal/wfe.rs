//! Bare-metal Cortex-M semaphore

use super::{Semaphore, TimedOut, Timeout};
use core::cell::Cell;
use cortex_m::interrupt::{self, Mutex};

/// A [`Semaphore`] for bare-metal Cortex-M systems
///
/// The count is updated in a critical section, so `give()` is safe to call
/// from any interrupt priority. `take()` sleeps with `WFE` when waiting
/// forever. Bounded waits busy-wait in one millisecond steps, derived from
/// the `CPU_HZ` core clock frequency, so they're only approximate.
pub struct WfeSemaphore<const CPU_HZ: u32> {
    count: Mutex<Cell<u32>>,
    max: u32,
}

impl<const CPU_HZ: u32> WfeSemaphore<CPU_HZ> {
    const CYCLES_PER_MS: u32 = CPU_HZ / 1000;

    fn try_take(&self) -> bool {
        interrupt::free(|cs| {
            let count = self.count.borrow(cs);
            let available = count.get() > 0;
            if available {
                count.set(count.get() - 1);
            }
            available
        })
    }
}

impl<const CPU_HZ: u32> Semaphore for WfeSemaphore<CPU_HZ> {
    fn create(initial: u32, max: u32) -> Option<Self> {
        Some(WfeSemaphore {
            count: Mutex::new(Cell::new(initial.min(max))),
            max,
        })
    }

    fn give(&self) {
        interrupt::free(|cs| {
            let count = self.count.borrow(cs);
            if count.get() < self.max {
                count.set(count.get() + 1);
            }
        });
        cortex_m::asm::sev();
    }

    fn take(&self, timeout: Timeout) -> Result<(), TimedOut> {
        let mut waited_ms = 0;
        loop {
            if self.try_take() {
                return Ok(());
            }
            match timeout {
                Timeout::NoWait => return Err(TimedOut),
                Timeout::Forever => cortex_m::asm::wfe(),
                Timeout::Millis(ms) if waited_ms >= ms => return Err(TimedOut),
                Timeout::Millis(_) => {
                    cortex_m::asm::delay(Self::CYCLES_PER_MS);
                    waited_ms += 1;
                }
            }
        }
    }

    fn reset(&self) {
        interrupt::free(|cs| self.count.borrow(cs).set(0));
    }
}
