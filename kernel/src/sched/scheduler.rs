//! Flat FIFO round-robin scheduler.
//!
//! Every CPU drains its own ready queue (see [`super::queue`]): real-time
//! threads before normal threads before the idle thread, FIFO within each.
//! There is no virtual runtime, no cross-CPU load balancing, and no
//! dynamic priority decay -- [`super::task::Priority`] only decides
//! whether a (re)enqueued thread goes to the front or back of its class's
//! sub-list.

use spin::Mutex;

use crate::arch::x86_64::context::{restore_fpu_state, save_fpu_state, CpuContext};
use crate::arch::x86_64::gdt;
use crate::arch::x86_64::{apic, mmu};

use super::queue;
use super::smp::{self, MAX_CPUS};
use super::task::ThreadState;
use super::task_ptr::ThreadPtr;

/// Thread currently running on each CPU slot. `None` until that CPU's
/// idle thread is installed by [`set_current`].
static CURRENT: [Mutex<Option<ThreadPtr>>; MAX_CPUS] = [const { Mutex::new(None) }; MAX_CPUS];

/// The calling CPU's slot index.
pub fn current_cpu() -> usize {
    smp::current_cpu_id()
}

/// The thread currently running on `cpu`, if any.
pub fn current(cpu: usize) -> Option<ThreadPtr> {
    *CURRENT[cpu].lock()
}

/// Install `thread` as CPU `cpu`'s running thread without going through a
/// context switch. Used once per CPU at boot to seed its idle thread.
pub fn set_current(cpu: usize, thread: ThreadPtr) {
    // SAFETY: called once per CPU before that CPU's ready queue or
    // preemption path is live.
    unsafe {
        (*thread.as_raw()).state = ThreadState::Running;
        (*thread.as_raw()).cpu = cpu;
    }
    *CURRENT[cpu].lock() = Some(thread);
    let stack_top = unsafe { thread.as_ref().kernel_stack_top };
    gdt::set_kernel_stack(cpu, stack_top);
}

/// Mark `thread` ready and place it on CPU `cpu`'s ready queue.
pub fn enqueue(cpu: usize, thread: ThreadPtr) {
    queue::enqueue_on(cpu, thread);
}

/// Timer tick handler (vector 0x20). The timer is one-shot -- every tick is
/// the end of the current quantum, so every tick reschedules. Called by
/// [`crate::arch::x86_64::idt`] with `frame` pointing at the interrupted
/// thread's live register frame, at the top of its own kernel stack. Returns
/// the stack pointer the preemption stub should resume on.
pub fn on_timer_tick(frame: *mut CpuContext) -> u64 {
    reschedule(current_cpu(), frame)
}

/// Reschedule IPI handler (vector 0x21): an unconditional reschedule,
/// regardless of how much of the current time slice remains. Used both for
/// a remote CPU nudging another one and for [`yield_now`] nudging itself.
pub fn on_reschedule_ipi(frame: *mut CpuContext) -> u64 {
    reschedule(current_cpu(), frame)
}

/// Core switch decision: pop the next ready thread for `cpu`, if any, save
/// the outgoing thread's frame pointer and FPU state, restore the
/// incoming thread's, reload CR3 if its address space differs, rearm the
/// one-shot timer for the next quantum, and return the stack pointer to
/// resume on.
fn reschedule(cpu: usize, frame: *mut CpuContext) -> u64 {
    rearm_quantum();

    let Some(next) = queue::dequeue_on(cpu) else {
        return frame as u64;
    };

    let mut slot = CURRENT[cpu].lock();
    let outgoing_pml4 = if let Some(outgoing) = slot.replace(next) {
        // SAFETY: `outgoing` is the thread this CPU was running up to this
        // interrupt; nothing else touches it until it is (re)enqueued
        // below.
        let pml4 = unsafe {
            let t = outgoing.as_raw();
            (*t).saved_sp = frame as u64;
            save_fpu_state(&mut (*t).fpu);
            (*t).state = ThreadState::Ready;
            (*t).address_space_pml4
        };
        queue::enqueue_on(cpu, outgoing);
        Some(pml4)
    } else {
        None
    };

    // SAFETY: `next` just came off this CPU's ready queue, so it is not
    // running anywhere else.
    let (resume_sp, incoming_pml4) = unsafe {
        let t = next.as_raw();
        (*t).state = ThreadState::Running;
        (*t).cpu = cpu;
        restore_fpu_state(&(*t).fpu);
        ((*t).saved_sp, (*t).address_space_pml4)
    };

    if outgoing_pml4.map_or(true, |pml4| pml4 != incoming_pml4) {
        mmu::write_cr3(incoming_pml4);
    }

    let stack_top = unsafe { next.as_ref().kernel_stack_top };
    gdt::set_kernel_stack(cpu, stack_top);

    resume_sp
}

/// Rearm the calling CPU's one-shot Local APIC timer for one more quantum.
/// No-op if the timer was never calibrated (should not happen past boot).
fn rearm_quantum() {
    if let Some((_, ticks_per_ms)) = apic::timer_config() {
        let _ = apic::rearm_timer(ticks_per_ms * super::QUANTUM_MS);
    }
}

/// Voluntarily give up the remainder of the current time slice.
pub fn yield_now() {
    // SAFETY: 0x21 is `VECTOR_RESCHEDULE_IPI`; a synchronous `int` to it
    // drives the same unconditional reschedule path a remote CPU's IPI
    // would, with no side effects beyond the usual interrupt entry/exit.
    unsafe {
        core::arch::asm!("int 0x21", options(nomem, nostack));
    }
}
