//! Per-CPU ready queue.
//!
//! Flat FIFO round-robin within each of three sub-lists (real-time, normal,
//! idle); a CPU always drains real-time before normal before idle. There is
//! no further weighting, no virtual runtime, and no cross-CPU load
//! balancing -- a thread stays on the CPU it was enqueued on until
//! something (today: nothing) explicitly migrates it.

use alloc::collections::VecDeque;

use spin::Mutex;

use super::{
    smp::MAX_CPUS,
    task::{SchedClass, Thread, ThreadState},
    task_ptr::ThreadPtr,
};

/// One CPU's ready set.
pub struct ReadyQueue {
    classes: [VecDeque<ThreadPtr>; SchedClass::COUNT],
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            classes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    /// Enqueue a ready thread. Threads whose priority is "high" for their
    /// class jump to the front of that class's sub-list; everyone else goes
    /// to the back.
    pub fn enqueue(&mut self, thread: ThreadPtr) {
        // SAFETY: queue discipline guarantees exclusive access to any
        // thread while it is being (de/en)queued under this CPU's lock.
        let (class, high) = unsafe {
            let t = thread.as_ref();
            (t.sched_class, t.priority.is_high())
        };
        let list = &mut self.classes[class.index()];
        if high {
            list.push_front(thread);
        } else {
            list.push_back(thread);
        }
    }

    /// Remove and return the next thread to run, highest-priority
    /// non-empty class first.
    pub fn dequeue(&mut self) -> Option<ThreadPtr> {
        for list in &mut self.classes {
            if let Some(thread) = list.pop_front() {
                return Some(thread);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|list| list.is_empty())
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(|list| list.len()).sum()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One lock-protected ready queue per CPU slot.
pub static PER_CPU_QUEUES: [Mutex<ReadyQueue>; MAX_CPUS] =
    [const { Mutex::new(ReadyQueue::new()) }; MAX_CPUS];

/// Mark `thread` ready and place it on CPU `cpu`'s queue.
pub fn enqueue_on(cpu: usize, thread: ThreadPtr) {
    // SAFETY: the caller owns `thread` exclusively at the point of
    // enqueueing (it is not concurrently running anywhere).
    unsafe {
        (*thread.as_raw()).state = ThreadState::Ready;
        (*thread.as_raw()).cpu = cpu;
    }
    PER_CPU_QUEUES[cpu].lock().enqueue(thread);
}

/// Pop the next thread to run on CPU `cpu`, if any.
pub fn dequeue_on(cpu: usize) -> Option<ThreadPtr> {
    PER_CPU_QUEUES[cpu].lock().dequeue()
}

/// Total number of threads across every CPU's ready queue (for diagnostics
/// and tests).
pub fn total_ready() -> usize {
    PER_CPU_QUEUES.iter().map(|q| q.lock().len()).sum()
}

/// Number of threads currently waiting on CPU `cpu`'s ready queue. Used to
/// pick a home CPU for a newly spawned thread.
pub fn len_on(cpu: usize) -> usize {
    PER_CPU_QUEUES[cpu].lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Priority;

    fn leaked(priority: Priority, class: SchedClass) -> ThreadPtr {
        Thread::spawn(dummy_entry, 0, priority, class, 0)
    }

    extern "C" fn dummy_entry() -> ! {
        loop {}
    }

    #[test]
    fn fifo_within_class() {
        let mut q = ReadyQueue::new();
        let a = leaked(Priority::UserNormal, SchedClass::Normal);
        let b = leaked(Priority::UserNormal, SchedClass::Normal);
        q.enqueue(a);
        q.enqueue(b);
        assert_eq!(q.dequeue(), Some(a));
        assert_eq!(q.dequeue(), Some(b));
        assert!(q.is_empty());
    }

    #[test]
    fn real_time_drains_before_normal() {
        let mut q = ReadyQueue::new();
        let normal = leaked(Priority::UserNormal, SchedClass::Normal);
        let rt = leaked(Priority::RealTimeLow, SchedClass::RealTime);
        q.enqueue(normal);
        q.enqueue(rt);
        assert_eq!(q.dequeue(), Some(rt));
        assert_eq!(q.dequeue(), Some(normal));
    }

    #[test]
    fn high_priority_jumps_queue() {
        let mut q = ReadyQueue::new();
        let low = leaked(Priority::UserNormal, SchedClass::Normal);
        let high = leaked(Priority::UserHigh, SchedClass::Normal);
        q.enqueue(low);
        q.enqueue(high);
        assert_eq!(q.dequeue(), Some(high));
        assert_eq!(q.dequeue(), Some(low));
    }
}
