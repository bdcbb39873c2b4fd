//! Per-CPU run queues, indexed by effective priority.
//!
//! Each CPU owns one [`RunQueue`]: an array of FIFO levels, one per
//! priority value, with an occupancy bitmap for O(1) selection of the
//! strongest queued task. The registry is fixed at [`init()`] and the
//! per-CPU locks live for the lifetime of the system.
//!
//! Whenever two queues must be held at once (task migration), they are
//! locked in ascending CPU-id order via [`lock_pair`], which is the
//! only sanctioned way to take two of these locks.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::array;
use cpu::CpuId;
use spin::{Mutex, MutexGuard};
use task_struct::{TaskRef, MAX_PRIORITY};

const NUM_LEVELS: usize = MAX_PRIORITY as usize + 1;

/// The run queue of a single CPU.
pub struct RunQueue {
    cpu: CpuId,
    /// FIFO per priority level; level 0 is the strongest.
    levels: [VecDeque<TaskRef>; NUM_LEVELS],
    /// Bit `n` set iff `levels[n]` is non-empty.
    occupied: u64,
    len: usize,
}

impl RunQueue {
    pub fn new(cpu: CpuId) -> RunQueue {
        RunQueue {
            cpu,
            levels: array::from_fn(|_| VecDeque::new()),
            occupied: 0,
            len: 0,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a task at the tail of its effective-priority level.
    pub fn enqueue(&mut self, task: TaskRef) {
        let level = task.effective_priority() as usize;
        self.levels[level].push_back(task);
        self.occupied |= 1 << level;
        self.len += 1;
    }

    /// Removes and returns the strongest queued task, FIFO within one
    /// priority level.
    pub fn take_highest(&mut self) -> Option<TaskRef> {
        if self.occupied == 0 {
            return None;
        }
        let level = self.occupied.trailing_zeros() as usize;
        // The bitmap says this level is non-empty.
        let task = self.levels[level].pop_front();
        if self.levels[level].is_empty() {
            self.occupied &= !(1 << level);
        }
        self.len -= 1;
        task
    }

    /// The priority of the strongest queued task, if any.
    pub fn highest_priority(&self) -> Option<u8> {
        if self.occupied == 0 {
            None
        } else {
            Some(self.occupied.trailing_zeros() as u8)
        }
    }

    /// A reference to the strongest queued task without removing it.
    pub fn peek_highest(&self) -> Option<&TaskRef> {
        let level = self.highest_priority()? as usize;
        self.levels[level].front()
    }

    /// Removes `task` from wherever it sits in this queue. Returns
    /// whether it was present.
    pub fn remove(&mut self, task: &TaskRef) -> bool {
        // A queued task's level matches its effective priority, since
        // priority changes reposition it under this queue's lock; the
        // full scan is only a fallback.
        let expected = task.effective_priority() as usize;
        if self.remove_from_level(expected, task) {
            return true;
        }
        for level in 0..NUM_LEVELS {
            if level != expected && self.remove_from_level(level, task) {
                return true;
            }
        }
        false
    }

    fn remove_from_level(&mut self, level: usize, task: &TaskRef) -> bool {
        let queue = &mut self.levels[level];
        if let Some(pos) = queue.iter().position(|t| t == task) {
            queue.remove(pos);
            if queue.is_empty() {
                self.occupied &= !(1 << level);
            }
            self.len -= 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.levels.iter().any(|q| q.iter().any(|t| t == task))
    }

    /// Moves `task` to the level matching its (changed) effective
    /// priority. Returns whether it was present.
    pub fn reposition(&mut self, task: &TaskRef) -> bool {
        if self.remove(task) {
            self.enqueue(task.clone());
            true
        } else {
            false
        }
    }
}

static RUN_QUEUES: spin::Once<Vec<Mutex<RunQueue>>> = spin::Once::new();

/// Creates one run queue per CPU. Requires `cpu::init()`; callable
/// once.
pub fn init() -> Result<(), &'static str> {
    if !cpu::is_initialized() {
        return Err("runqueue::init() requires cpu::init() first");
    }
    let mut first = false;
    RUN_QUEUES.call_once(|| {
        first = true;
        cpu::cpus().map(|cpu| Mutex::new(RunQueue::new(cpu))).collect()
    });
    if first {
        Ok(())
    } else {
        Err("run queues were already initialized")
    }
}

pub fn is_initialized() -> bool {
    RUN_QUEUES.get().is_some()
}

fn queues() -> &'static Vec<Mutex<RunQueue>> {
    RUN_QUEUES
        .get()
        .unwrap_or_else(|| panic!("BUG: run queues used before runqueue::init()"))
}

/// Locks the run queue of one CPU.
pub fn lock(cpu: CpuId) -> MutexGuard<'static, RunQueue> {
    queues()[cpu.index()].lock()
}

/// Locks the run queues of two distinct CPUs, always acquiring the
/// lower CPU id first regardless of argument order. The returned guards
/// match the argument order.
pub fn lock_pair(
    a: CpuId,
    b: CpuId,
) -> (MutexGuard<'static, RunQueue>, MutexGuard<'static, RunQueue>) {
    if a == b {
        panic!("BUG: lock_pair() called with one CPU ({})", a);
    }
    if a < b {
        let ga = lock(a);
        let gb = lock(b);
        (ga, gb)
    } else {
        let gb = lock(b);
        let ga = lock(a);
        (ga, gb)
    }
}

/// The CPU with the fewest queued tasks, ties broken by lowest id.
pub fn least_busy_cpu() -> CpuId {
    let mut best = cpu::bootstrap_cpu();
    let mut best_len = usize::MAX;
    for cpu in cpu::cpus() {
        let len = lock(cpu).len();
        if len < best_len {
            best = cpu;
            best_len = len;
        }
    }
    best
}

/// Picks the CPU a newly runnable task should be queued on: its bound
/// CPU if it has one, otherwise the least busy CPU.
pub fn choose_cpu(task: &TaskRef) -> CpuId {
    match task.bound_cpu() {
        Some(cpu) => cpu,
        None => least_busy_cpu(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use context_switch::ContextHandle;
    use task_struct::{Task, TaskOptions};

    struct DummyHandle;
    impl ContextHandle for DummyHandle {
        fn resume(&self, _cpu: CpuId) {}
        fn suspend_once(&self) {}
    }

    fn task_with_priority(name: &'static str, priority: u8) -> TaskRef {
        Task::new(
            name,
            Box::new(DummyHandle),
            TaskOptions {
                priority,
                ..TaskOptions::default()
            },
        )
    }

    #[test]
    fn strongest_first_fifo_within_level() {
        let mut rq = RunQueue::new(CpuId::new(0));
        let weak = task_with_priority("weak", 40);
        let strong = task_with_priority("strong", 5);
        let strong2 = task_with_priority("strong2", 5);
        rq.enqueue(weak.clone());
        rq.enqueue(strong.clone());
        rq.enqueue(strong2.clone());
        assert_eq!(rq.len(), 3);
        assert_eq!(rq.highest_priority(), Some(5));
        assert_eq!(rq.take_highest(), Some(strong));
        assert_eq!(rq.take_highest(), Some(strong2));
        assert_eq!(rq.take_highest(), Some(weak));
        assert_eq!(rq.take_highest(), None);
        assert!(rq.is_empty());
    }

    #[test]
    fn reposition_follows_lent_priority() {
        let mut rq = RunQueue::new(CpuId::new(0));
        let mid = task_with_priority("mid", 20);
        let victim = task_with_priority("victim", 30);
        rq.enqueue(mid.clone());
        rq.enqueue(victim.clone());
        assert_eq!(rq.peek_highest(), Some(&mid));

        victim.inner().lent_priority = Some(5);
        assert!(rq.reposition(&victim));
        assert_eq!(rq.peek_highest(), Some(&victim));

        victim.inner().lent_priority = None;
        assert!(rq.reposition(&victim));
        assert_eq!(rq.peek_highest(), Some(&mid));
        assert_eq!(rq.len(), 2);
    }

    #[test]
    fn remove_absent_task() {
        let mut rq = RunQueue::new(CpuId::new(0));
        let task = task_with_priority("absent", 10);
        assert!(!rq.remove(&task));
        rq.enqueue(task.clone());
        assert!(rq.remove(&task));
        assert!(!rq.contains(&task));
        assert!(rq.is_empty());
    }
}
