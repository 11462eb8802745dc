//! Memory barrier primitives.
//!
//! Centralizes fence operations so call sites don't sprinkle inline asm.

/// Full memory fence -- MFENCE semantics. All reads and writes issued before
/// this barrier are globally visible before any reads or writes issued after
/// it.
#[inline(always)]
pub fn memory_fence() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Data synchronization barrier. Equivalent to [`memory_fence`] on x86_64;
/// kept as its own call site because some callers reason about "prior
/// stores visible before what follows" independently of the general fence.
#[inline(always)]
pub fn data_sync_barrier() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Instruction stream synchronization barrier. x86_64's strongly ordered
/// model and unified instruction/data view make this a no-op.
#[inline(always)]
pub fn instruction_sync_barrier() {}
