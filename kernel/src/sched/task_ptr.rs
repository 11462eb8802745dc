//! Safe wrapper around a raw thread pointer.

use core::ptr::NonNull;

use super::task::Thread;

/// A `NonNull<Thread>` that is `Send`/`Sync`.
///
/// Sound because every `Thread` lives for the kernel's entire lifetime
/// (leaked `Box`es, never freed) and is only ever mutated by the CPU
/// currently running it or by a remote CPU holding that CPU's ready-queue
/// lock, per the scheduler's locking discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPtr(NonNull<Thread>);

impl ThreadPtr {
    pub fn new(ptr: NonNull<Thread>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> NonNull<Thread> {
        self.0
    }

    pub fn as_raw(&self) -> *mut Thread {
        self.0.as_ptr()
    }

    /// # Safety
    /// See the type-level discussion above: callers must hold whatever lock
    /// the scheduler's discipline requires for the field being accessed.
    pub unsafe fn as_ref(&self) -> &Thread {
        self.0.as_ref()
    }
}

// SAFETY: see the struct-level discussion above.
unsafe impl Send for ThreadPtr {}
unsafe impl Sync for ThreadPtr {}

impl From<NonNull<Thread>> for ThreadPtr {
    fn from(ptr: NonNull<Thread>) -> Self {
        Self::new(ptr)
    }
}

impl From<ThreadPtr> for NonNull<Thread> {
    fn from(ptr: ThreadPtr) -> Self {
        ptr.0
    }
}
