//! Thread representation.
//!
//! A `Thread` is the kernel's only unit of scheduling -- there is no
//! separate process object in this design; callers that need one build it
//! out of threads plus an [`crate::mm::vmm::AddressSpace`] of their own.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::context::{CpuContext, FpuArea};

use super::task_ptr::ThreadPtr;

/// Monotonically increasing thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

fn alloc_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Scheduling priority. Breaks ties within a [`SchedClass`]'s sub-list --
/// the ready queue stays flat FIFO round-robin otherwise (see
/// [`super::queue::ReadyQueue`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    RealTimeHigh,
    RealTimeLow,
    UserHigh,
    #[default]
    UserNormal,
    UserLow,
    Idle,
}

impl Priority {
    /// Whether this priority reinserts at the front of its class's
    /// sub-list rather than the back when (re)enqueued.
    pub fn is_high(self) -> bool {
        matches!(self, Priority::RealTimeHigh | Priority::UserHigh)
    }
}

/// Coarse scheduling class. Determines which of a CPU's three sub-lists a
/// thread lives in; real-time threads always run before normal threads,
/// which always run before the idle thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedClass {
    RealTime,
    #[default]
    Normal,
    Idle,
}

impl SchedClass {
    pub(super) const COUNT: usize = 3;

    pub(super) fn index(self) -> usize {
        match self {
            SchedClass::RealTime => 0,
            SchedClass::Normal => 1,
            SchedClass::Idle => 2,
        }
    }
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable, sitting in a CPU's ready queue.
    Ready,
    /// Currently executing on some CPU.
    Running,
    /// Waiting on a kernel primitive; not in any ready queue.
    Blocked,
    /// Exited; its stack and `Thread` block are not yet reclaimed.
    Dead,
}

/// A schedulable thread of execution.
///
/// Threads are allocated with `Box::leak` and never freed individually --
/// the kernel does not yet implement thread teardown (marking `Dead` stops
/// scheduling it, but the backing memory is intentionally leaked for now).
pub struct Thread {
    pub id: ThreadId,
    pub priority: Priority,
    pub sched_class: SchedClass,
    pub state: ThreadState,
    pub fpu: FpuArea,
    /// Stack pointer to resume this thread at. Points into this thread's
    /// own kernel stack, at a location shaped like a [`CpuContext`] --
    /// either one built by [`Thread::new`] for a thread that has never
    /// run, or the live interrupt frame captured by the scheduler the last
    /// time this thread was preempted. Meaningless while `state ==
    /// Running` (the CPU currently running it owns the real value).
    pub saved_sp: u64,
    /// Top of this thread's kernel stack, reloaded into the owning CPU's
    /// TSS `RSP0` on every switch into this thread.
    pub kernel_stack_top: u64,
    /// CPU this thread is currently assigned to.
    pub cpu: usize,
    /// Physical address of this thread's address space's PML4. Threads that
    /// don't own a separate [`crate::mm::vmm::AddressSpace`] share the
    /// kernel's own page tables. `reschedule` reloads CR3 only when this
    /// differs between the outgoing and incoming thread.
    pub address_space_pml4: crate::mm::PhysicalAddress,
    /// Intrusive FIFO link within whichever ready-queue sub-list currently
    /// holds this thread. `None` when not enqueued.
    pub(super) next: Option<ThreadPtr>,
}

impl Thread {
    /// Build a new thread that has never run. `entry` is called with the
    /// CPU in long mode, interrupts disabled, on a stack descending from
    /// `kernel_stack_top`.
    ///
    /// Writes a fabricated [`CpuContext`] directly into the top of the
    /// thread's own stack and points `saved_sp` at it, so the first switch
    /// into this thread runs through exactly the same pop-and-`iretq` path
    /// the preemption stubs use to resume an already-started one.
    pub fn new(
        entry: extern "C" fn() -> !,
        kernel_stack_top: u64,
        priority: Priority,
        sched_class: SchedClass,
        cpu: usize,
    ) -> Self {
        let code_selector = crate::arch::x86_64::gdt::selectors(0).code_selector.0;
        let ctx = CpuContext::new(entry, code_selector);
        let frame_addr = kernel_stack_top - core::mem::size_of::<CpuContext>() as u64;
        // SAFETY: `kernel_stack_top` is the top of a freshly allocated
        // stack at least `size_of::<CpuContext>()` bytes long, owned
        // exclusively by this not-yet-started thread.
        unsafe {
            core::ptr::write(frame_addr as *mut CpuContext, ctx);
        }
        Self {
            id: alloc_tid(),
            priority,
            sched_class,
            state: ThreadState::Ready,
            fpu: FpuArea::new(),
            saved_sp: frame_addr,
            kernel_stack_top,
            cpu,
            address_space_pml4: crate::mm::vmm::kernel_pml4(),
            next: None,
        }
    }

    /// Wrap the CPU's current execution as a `Thread` that is already
    /// `Running`, rather than one waiting to be switched into for the
    /// first time. Used for the bootstrap thread on the BSP and the idle
    /// thread each AP installs itself as, in both cases for code that is
    /// already executing on `kernel_stack_top` by the time this is called.
    pub fn spawn_running(
        kernel_stack_top: u64,
        priority: Priority,
        sched_class: SchedClass,
        cpu: usize,
    ) -> ThreadPtr {
        let thread = Self {
            id: alloc_tid(),
            priority,
            sched_class,
            state: ThreadState::Running,
            fpu: FpuArea::new(),
            saved_sp: 0,
            kernel_stack_top,
            cpu,
            address_space_pml4: crate::mm::vmm::kernel_pml4(),
            next: None,
        };
        let boxed = alloc::boxed::Box::new(thread);
        let ptr = core::ptr::NonNull::new(alloc::boxed::Box::leak(boxed) as *mut Thread)
            .expect("Box::leak never returns null");
        ThreadPtr::new(ptr)
    }

    /// Leak this thread onto the heap and return a pointer usable in a
    /// ready queue.
    pub fn spawn(
        entry: extern "C" fn() -> !,
        kernel_stack_top: u64,
        priority: Priority,
        sched_class: SchedClass,
        cpu: usize,
    ) -> ThreadPtr {
        let thread = alloc::boxed::Box::new(Self::new(entry, kernel_stack_top, priority, sched_class, cpu));
        let ptr = core::ptr::NonNull::new(alloc::boxed::Box::leak(thread) as *mut Thread)
            .expect("Box::leak never returns null");
        ThreadPtr::new(ptr)
    }
}
