//! Interrupt-masking mutex.
//!
//! A plain `spin::Mutex` is not safe for state a device IRQ handler can also
//! touch: if the handler fires on the same CPU that already holds the lock,
//! it spins forever against itself. [`IrqLock`] raises the calling CPU's
//! interrupt state to masked before taking the inner mutex and restores the
//! prior state when the guard drops, so a handler can never observe the lock
//! held by its own CPU.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn disable_interrupts() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn enable_interrupts() {}

/// A mutex that masks interrupts on the current CPU for the lifetime of the
/// guard. Used by the heap and physical frame allocator, both of which can
/// be entered from ordinary kernel context and must never be entered
/// reentrantly from an IRQ handler running on the same CPU.
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask interrupts on this CPU, then take the inner lock. Interrupts stay
    /// masked until the returned guard drops.
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let was_enabled = interrupts_enabled();
        disable_interrupts();
        IrqLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            was_enabled,
        }
    }
}

pub struct IrqLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    was_enabled: bool,
}

impl<'a, T> Deref for IrqLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for IrqLockGuard<'a, T> {
    fn drop(&mut self) {
        // Release the mutex before interrupts come back on; otherwise a
        // handler that fires the instant interrupts re-enable could spin
        // on a lock we are about to release anyway.
        // SAFETY: `guard` is never accessed again after this drop.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if self.was_enabled {
            enable_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_irq_lock_basic() {
        let lock = IrqLock::new(0u32);
        *lock.lock() = 42;
        assert_eq!(*lock.lock(), 42);
    }
}
