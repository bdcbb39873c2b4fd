//! Blocking sleep and wakeup on wait channels.
//!
//! This crate provides the entry points a task uses to block itself:
//! [`block`] (no interlock), [`block_releasing`] / [`block_interlocked`]
//! (the caller's spinlock is dropped atomically with the enqueue, so a
//! wakeup between "decided to sleep" and "parked" cannot be lost), and
//! [`pause`] (timed sleep on the task's own identity, no wake channel
//! expected). Wakeups come from [`wake_one`] / [`wake_all`], from the
//! timeout registry driven by [`process_timeouts`], or from a pending
//! signal via [`interrupt`] / [`post_signal`].
//!
//! Every sleep bumps the task's sleep sequence number; timeout entries
//! carry the sequence they were registered under and are discarded on
//! expiry if it no longer matches, so a stale timeout can never wake a
//! later sleep.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate lazy_static;

use alloc::vec::Vec;
use core::cmp::Reverse;
use hashbrown::hash_map::DefaultHashBuilder;
use priority_queue::priority_queue::PriorityQueue;
use spin::Mutex;
use task_struct::{
    Channel, Location, ProcessRef, RunState, Signal, SyncPolicy, TaskRef, WakeReason,
    MAX_PRIORITY,
};

/// Why a sleep returned without a normal wakeup.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitError {
    /// The sleep's timeout expired.
    Timeout,
    /// A pending signal interrupted the sleep.
    Interrupted,
}

pub type WaitResult = Result<(), WaitError>;

/// One sleep request: the channel to wait on, wake-up ordering
/// priority, a human-readable reason, an optional timeout, and the
/// interruptibility / wakeup-protocol knobs.
#[derive(Clone, Copy, Debug)]
pub struct SleepRequest {
    pub channel: Channel,
    /// Priority boost held for the duration of the sleep; `MAX_PRIORITY`
    /// means no boost.
    pub priority: u8,
    pub reason: &'static str,
    /// In ticks; `0` means sleep until woken.
    pub timeout_ticks: u64,
    pub interruptible: bool,
    pub policy: SyncPolicy,
}

impl SleepRequest {
    pub fn new(channel: Channel, reason: &'static str) -> SleepRequest {
        SleepRequest {
            channel,
            priority: MAX_PRIORITY,
            reason,
            timeout_ticks: 0,
            interruptible: false,
            policy: SyncPolicy::Sleep,
        }
    }

    pub fn priority(mut self, priority: u8) -> SleepRequest {
        self.priority = priority;
        self
    }

    pub fn timeout_ticks(mut self, ticks: u64) -> SleepRequest {
        self.timeout_ticks = ticks;
        self
    }

    pub fn interruptible(mut self) -> SleepRequest {
        self.interruptible = true;
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> SleepRequest {
        self.policy = policy;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct TimeoutKey {
    task_id: usize,
    seq: u64,
}

lazy_static! {
    /// All pending sleep timeouts, keyed by (task, sleep sequence) and
    /// ordered by soonest deadline. A leaf lock: never held while
    /// taking a bucket or run-queue lock.
    static ref TIMEOUTS: Mutex<PriorityQueue<TimeoutKey, Reverse<u64>, DefaultHashBuilder>> =
        Mutex::new(PriorityQueue::with_default_hasher());
}

/// Blocks the current task on `req.channel` until woken, timed out, or
/// interrupted.
///
/// Tasks that may never block (interrupt-context or early-boot) return
/// `Ok(())` immediately, so callers revalidate their condition in a
/// loop as they would for any spurious wakeup.
pub fn block(curr: &TaskRef, req: &SleepRequest) -> WaitResult {
    block_common::<()>(curr, req, None)
}

/// Like [`block`], but atomically releases `guard` once the task is on
/// the sleep queue. The interlocked object's lock is *not* re-acquired.
pub fn block_releasing<T>(
    curr: &TaskRef,
    req: &SleepRequest,
    guard: spin::MutexGuard<T>,
) -> WaitResult {
    block_common(curr, req, Some(guard))
}

/// Like [`block_releasing`], but re-acquires the interlock before
/// returning, handing the caller back a fresh guard alongside the wait
/// result.
pub fn block_interlocked<'a, T>(
    curr: &TaskRef,
    req: &SleepRequest,
    lock: &'a Mutex<T>,
    guard: spin::MutexGuard<'a, T>,
) -> (WaitResult, spin::MutexGuard<'a, T>) {
    let result = block_common(curr, req, Some(guard));
    (result, lock.lock())
}

fn block_common<T>(
    curr: &TaskRef,
    req: &SleepRequest,
    interlock: Option<spin::MutexGuard<T>>,
) -> WaitResult {
    if !curr.can_sleep() {
        log::debug!(
            "sleep refused for non-sleepable {:?} (reason {:?})",
            curr,
            req.reason
        );
        return Ok(());
    }
    let seq;
    {
        let mut bucket = sleep_queue::lock_bucket(req.channel);
        {
            let mut inner = curr.inner();
            inner.sleep_seq += 1;
            seq = inner.sleep_seq;
            inner.wait_channel = Some(req.channel);
            inner.wait_reason = Some(req.reason);
            inner.wake_reason = None;
            inner.interruptible = req.interruptible;
            inner.sync_policy = req.policy;
            if req.priority < MAX_PRIORITY {
                inner.sleep_priority = Some(req.priority);
            }
        }
        curr.set_runstate(RunState::Sleeping);
        curr.set_location(Location::SleepBucket(sleep_queue::bucket_index(req.channel)));
        bucket.insert(curr.clone());

        // A pending signal aborts an interruptible sleep before it
        // blocks. Checked only now, with the task visible on the
        // bucket: a signal posted earlier is seen here, and one posted
        // later finds the task on the bucket and interrupts it there.
        // Either way it cannot be lost.
        if req.interruptible {
            if let Some(proc) = curr.process() {
                if proc.has_pending_signal() {
                    bucket.remove_task(curr);
                    curr.set_runstate(RunState::OnCpu);
                    curr.set_location(Location::OnCpu(curr.cpu()));
                    let mut inner = curr.inner();
                    inner.wait_channel = None;
                    inner.wait_reason = None;
                    inner.interruptible = false;
                    inner.sleep_priority = None;
                    inner.sync_policy = SyncPolicy::Sleep;
                    drop(inner);
                    drop(interlock);
                    return Err(WaitError::Interrupted);
                }
            }
        }

        // Only now, with the wakeup-visible state in place under the
        // bucket lock, may the caller's interlock be released.
        drop(interlock);
    }

    if req.timeout_ticks > 0 {
        let deadline = time::now_ticks() + req.timeout_ticks;
        TIMEOUTS.lock().push(
            TimeoutKey {
                task_id: curr.id(),
                seq,
            },
            Reverse(deadline),
        );
    }

    scheduler::block_current(curr);

    let result = {
        let mut inner = curr.inner();
        let reason = inner.wake_reason.take();
        inner.wait_channel = None;
        inner.wait_reason = None;
        inner.interruptible = false;
        inner.sleep_priority = None;
        inner.sync_policy = SyncPolicy::Sleep;
        match reason {
            Some(WakeReason::Timeout) => Err(WaitError::Timeout),
            Some(WakeReason::Interrupted) => Err(WaitError::Interrupted),
            // A direct runnable transition with no recorded reason is
            // treated as a wakeup; callers revalidate anyway.
            Some(WakeReason::Woken) | None => Ok(()),
        }
    };

    if req.timeout_ticks > 0 {
        TIMEOUTS.lock().remove(&TimeoutKey {
            task_id: curr.id(),
            seq,
        });
    }
    result
}

/// Timed sleep on the task's own identity: nothing is expected to wake
/// this channel, so the timeout is normally what ends it.
pub fn pause(curr: &TaskRef, reason: &'static str, ticks: u64) -> WaitResult {
    let req = SleepRequest::new(curr.channel(), reason).timeout_ticks(ticks);
    block(curr, &req)
}

/// Wakes the strongest-priority sleeper on `channel`. Returns whether
/// one was found.
pub fn wake_one(channel: Channel) -> bool {
    scheduler::wakeup_channel(channel, 1) == 1
}

/// Wakes every sleeper on `channel`; returns how many were woken.
pub fn wake_all(channel: Channel) -> usize {
    scheduler::wakeup_channel(channel, usize::MAX)
}

/// Expires due sleep timeouts. Called from the timer path after
/// `time::tick()`.
pub fn process_timeouts() {
    let now = time::now_ticks();
    // Collect due entries first: waking a task locks its bucket, which
    // must not happen under the registry lock.
    let mut due: Vec<TimeoutKey> = Vec::new();
    {
        let mut timeouts = TIMEOUTS.lock();
        loop {
            let due_now = matches!(timeouts.peek(), Some((_, Reverse(d))) if *d <= now);
            if !due_now {
                break;
            }
            if let Some((key, _)) = timeouts.pop() {
                due.push(key);
            }
        }
    }
    for key in due {
        expire_one(key);
    }
}

fn expire_one(key: TimeoutKey) {
    let task = match task_struct::task_by_id(key.task_id) {
        Some(task) => task,
        None => return,
    };
    loop {
        match task.location() {
            Location::SleepBucket(index) => {
                let mut bucket = sleep_queue::lock_bucket_at(index);
                if task.location() != Location::SleepBucket(index) {
                    continue;
                }
                {
                    let mut inner = task.inner();
                    if inner.sleep_seq != key.seq {
                        // The sleep this entry armed for is long over.
                        return;
                    }
                    inner.wake_reason = Some(WakeReason::Timeout);
                }
                bucket.remove_task(&task);
                drop(bucket);
                scheduler::make_runnable(&task);
                return;
            }
            // Already awake (or being woken); the entry is stale.
            _ => return,
        }
    }
}

/// Aborts `task`'s sleep with `Err(Interrupted)` if it is currently in
/// an interruptible ordinary sleep. Scheduler-internal waits are never
/// interrupted. Returns whether the sleep was aborted.
pub fn interrupt(task: &TaskRef) -> bool {
    loop {
        match task.location() {
            Location::SleepBucket(index) => {
                let mut bucket = sleep_queue::lock_bucket_at(index);
                if task.location() != Location::SleepBucket(index) {
                    continue;
                }
                {
                    let mut inner = task.inner();
                    if !inner.interruptible || inner.sync_policy == SyncPolicy::Sched {
                        return false;
                    }
                    inner.wake_reason = Some(WakeReason::Interrupted);
                }
                bucket.remove_task(&task);
                drop(bucket);
                scheduler::make_runnable(&task);
                return true;
            }
            _ => return false,
        }
    }
}

/// Posts an asynchronous signal to a process and interrupts any of its
/// threads in interruptible sleeps.
pub fn post_signal(proc: &ProcessRef, signal: Signal) {
    proc.record_signal(signal);
    for task in proc.threads() {
        interrupt(&task);
    }
}
