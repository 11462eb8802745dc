//! Flat per-CPU FIFO round-robin scheduler.
//!
//! Each CPU owns a ready queue (see [`queue`]) split into three sub-lists
//! -- real-time, normal, idle -- drained in that order, FIFO within each.
//! [`task::Priority`] only decides whether a thread rejoins the front or
//! back of its sub-list; there is no virtual runtime, no priority decay,
//! and no cross-CPU load balancing beyond picking a new thread's home CPU
//! once at spawn time. Multi-CPU bring-up ([`smp`]) hands each additional
//! CPU an idle thread and the same timer configuration the BSP calibrated.

mod queue;
pub(crate) mod scheduler;
pub(crate) mod smp;
mod task;
mod task_ptr;

pub use smp::{online_cpu_count, MAX_CPUS};
pub use task::{Priority, SchedClass, Thread, ThreadId, ThreadState};

use alloc::boxed::Box;

use crate::arch::x86_64::{apic, idt};
use crate::error::KernelResult;

const THREAD_STACK_SIZE: usize = 64 * 1024;

#[repr(align(16))]
struct ThreadStack([u8; THREAD_STACK_SIZE]);

/// Length of a preemption quantum, in milliseconds. Unlike the old periodic
/// timer, this is the unit the scheduler reasons in directly: every switch
/// rearms the Local APIC for exactly one more quantum's worth of ticks.
const QUANTUM_MS: u32 = 10;

/// Divide-by-1 (the 8254-style divide configuration register encodes this
/// as `0x0B`), giving the calibration in raw bus cycles.
const TIMER_DIVIDE: u8 = 0x0B;

/// Milliseconds calibrated against the PIT in one shot. `ticks_per_ms` is
/// derived from this rather than calibrated directly, since a one-millisecond
/// PIT window is too short to count accurately.
const CALIBRATION_MS: u32 = 10;

/// Bring up scheduling: calibrate and arm the BSP's timer, install the
/// caller's own stack as CPU 0's running ("bootstrap") thread, then bring
/// up every other CPU named in the MADT.
///
/// `bsp_stack_top` must be the top of the stack the caller is currently
/// running on. Must run after [`crate::arch::x86_64::apic::init`] and
/// before interrupts are enabled.
pub fn init(bsp_stack_top: u64) -> KernelResult<()> {
    smp::init_bsp();

    let ticks = apic::calibrate_against_pit(CALIBRATION_MS, TIMER_DIVIDE)?;
    let ticks_per_ms = (ticks / CALIBRATION_MS).max(1);
    apic::set_timer_config(TIMER_DIVIDE, ticks_per_ms);
    apic::setup_timer(idt::VECTOR_TIMER_TICK, TIMER_DIVIDE, ticks_per_ms * QUANTUM_MS)?;

    let bootstrap = Thread::spawn_running(bsp_stack_top, Priority::UserNormal, SchedClass::Normal, 0);
    scheduler::set_current(0, bootstrap);

    smp::init()?;

    Ok(())
}

/// Enter the idle loop. Never returns -- from here on the CPU only runs
/// kernel code through timer ticks and reschedule IPIs.
pub fn start() -> ! {
    loop {
        crate::arch::x86_64::idle();
    }
}

/// Give up the remainder of the calling thread's time slice.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Spawn a new kernel thread on whichever online CPU currently has the
/// shortest ready queue, and return its identifier.
pub fn spawn(entry: extern "C" fn() -> !, priority: Priority, sched_class: SchedClass) -> ThreadId {
    let stack = Box::leak(Box::new(ThreadStack([0; THREAD_STACK_SIZE])));
    let stack_top = (stack as *mut ThreadStack as u64) + THREAD_STACK_SIZE as u64;

    let cpu = least_loaded_cpu();
    let thread = Thread::spawn(entry, stack_top, priority, sched_class, cpu);
    // SAFETY: the thread was just created and is not yet visible to any
    // other CPU, so reading its id before enqueueing it is exclusive.
    let id = unsafe { thread.as_ref().id };
    scheduler::enqueue(cpu, thread);
    id
}

fn least_loaded_cpu() -> usize {
    let count = smp::online_cpu_count().max(1);
    (0..count).min_by_key(|&cpu| queue::len_on(cpu)).unwrap_or(0)
}
