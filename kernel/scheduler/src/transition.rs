//! Runnable transitions, channel wakeups, and priority propagation.
//!
//! These paths operate on tasks that are (usually) not current on any
//! CPU, so the first step is always to pin down which container the
//! task is on: [`locked_location`] reads the task's location word,
//! locks the container it names, and re-reads to confirm the task did
//! not move in between. Everything after that happens under the lock
//! that actually protects the task's queue membership.

use cpu::CpuId;
use runqueue::RunQueue;
use sleep_queue::Bucket;
use spin::MutexGuard;
use task_struct::{
    Channel, Location, RunState, SyncPolicy, TaskInner, TaskRef, WakeReason, MAX_PRIORITY,
};

use crate::{current_task, kick, swap_in_channel};

pub(crate) enum LocGuard {
    None,
    Run(MutexGuard<'static, RunQueue>),
    Sleep(MutexGuard<'static, Bucket>),
}

/// Locks the container the task is currently on. Retries until the
/// location word is stable under the corresponding lock.
pub(crate) fn locked_location(task: &TaskRef) -> (Location, LocGuard) {
    loop {
        let loc = task.location();
        match loc {
            Location::Nowhere => return (loc, LocGuard::None),
            Location::OnCpu(c) | Location::RunQueue(c) => {
                let g = runqueue::lock(c);
                if task.location() == loc {
                    return (loc, LocGuard::Run(g));
                }
            }
            Location::SleepBucket(i) => {
                let g = sleep_queue::lock_bucket_at(i);
                if task.location() == loc {
                    return (loc, LocGuard::Sleep(g));
                }
            }
        }
    }
}

/// Kicks `cpu` if `task` outranks whatever is currently on it.
fn kick_if_outranks(task: &TaskRef, cpu: CpuId) {
    let preempt = match current_task(cpu) {
        Some(occ) if !occ.is_idle() => task.effective_priority() < occ.effective_priority(),
        Some(_idle) => true,
        None => false,
    };
    if preempt {
        kick(cpu);
    }
}

/// Makes a stopped, suspended, or sleeping task eligible to run.
///
/// Pre-work per prior state: a stopped task picks up any deferred
/// debugger signal; clearing a suspended task notifies waiters on its
/// process's suspend channel. A task still on a sleep bucket is
/// removed from it here (only legal for ordinary sleeps; spontaneously
/// unsleeping a scheduler-internal wait is a bug). A non-resident task
/// is marked runnable but left unqueued, and the swap-in service is
/// woken in its place.
pub fn make_runnable(task: &TaskRef) {
    let mut notify_suspend: Option<Channel> = None;

    {
        let (_loc, guard) = locked_location(task);
        match task.runstate() {
            RunState::Exited => {
                panic!("BUG: make_runnable() on exited {:?}", task);
            }
            RunState::Runnable | RunState::OnCpu | RunState::Idle => {
                log::warn!("make_runnable(): {:?} is already runnable", task);
                return;
            }
            RunState::Stopped => {
                if let Some(proc) = task.process() {
                    if let Some(signal) = proc.take_debug_signal() {
                        proc.record_signal(signal);
                    }
                }
            }
            RunState::Suspended => {
                notify_suspend = task.process().map(|p| p.suspend_channel());
            }
            RunState::Sleeping => {}
        }

        if let LocGuard::Sleep(mut bucket) = guard {
            if task.inner().sync_policy == SyncPolicy::Sched {
                panic!(
                    "BUG: spontaneous unsleep of scheduler-internal wait by {:?}",
                    task
                );
            }
            bucket.remove_task(task);
        }
    }

    // Mid-switch race: the task marked itself blocked but its CPU has
    // not committed the switch-away yet (its `running` flag is still
    // set, and it only clears under that CPU's run-queue lock). Flip
    // it back to OnCpu under the same lock and the in-flight dispatch
    // will keep it on its CPU.
    if task.is_running() {
        let _rq = runqueue::lock(task.cpu());
        if task.is_running() {
            task.set_runstate(RunState::OnCpu);
            task.set_location(Location::OnCpu(task.cpu()));
            return;
        }
    }

    if !task.is_resident() {
        // Runnable but swapped out: the swap-in service queues it once
        // its memory is back.
        task.set_runstate(RunState::Runnable);
        wakeup_channel(swap_in_channel(), 1);
        if let Some(chan) = notify_suspend {
            wakeup_channel(chan, usize::MAX);
        }
        return;
    }

    let dest = runqueue::choose_cpu(task);
    {
        let mut rq = runqueue::lock(dest);
        task.set_runstate(RunState::Runnable);
        task.set_cpu(dest);
        task.set_location(Location::RunQueue(dest));
        rq.enqueue(task.clone());
        kick_if_outranks(task, dest);
    }

    if let Some(chan) = notify_suspend {
        wakeup_channel(chan, usize::MAX);
    }
}

/// Wakes up to `limit` tasks sleeping on `channel`, strongest first,
/// and returns how many were woken. A no-op before the scheduler is
/// initialized, so early-boot code may signal channels unconditionally.
pub fn wakeup_channel(channel: Channel, limit: usize) -> usize {
    if !crate::is_initialized() {
        return 0;
    }
    let woken = sleep_queue::lock_bucket(channel).remove_matching(channel, limit);
    let count = woken.len();
    for task in woken {
        task.inner().wake_reason.get_or_insert(WakeReason::Woken);
        make_runnable(&task);
    }
    count
}

/// Applies a priority mutation and then fixes up whatever container
/// the task is on: requeue on its run queue, re-sort in its sleep
/// bucket, or check for preemption if it is on (or outranks) a CPU.
fn adjust_priority(task: &TaskRef, mutate: impl FnOnce(&mut TaskInner)) {
    let (loc, guard) = locked_location(task);
    {
        let mut inner = task.inner();
        mutate(&mut inner);
    }
    match (loc, guard) {
        (Location::RunQueue(c), LocGuard::Run(mut rq)) => {
            rq.reposition(task);
            kick_if_outranks(task, c);
        }
        (Location::OnCpu(c), LocGuard::Run(rq)) => {
            // The occupant may have weakened itself below a queued task.
            if let Some(best) = rq.highest_priority() {
                if best < task.effective_priority() {
                    kick(c);
                }
            }
        }
        (Location::SleepBucket(_), LocGuard::Sleep(mut bucket)) => {
            bucket.reposition(task);
        }
        _ => {}
    }
}

/// Sets the task's own scheduling priority (lower is stronger) and
/// repositions it wherever it is queued.
pub fn change_priority(task: &TaskRef, priority: u8) {
    let priority = priority.min(MAX_PRIORITY);
    adjust_priority(task, |inner| inner.base_priority = priority);
}

/// Lends (or, with `None`, revokes) a priority for priority-
/// inheritance protocols. Lending never weakens the task below its own
/// priority; revoking drops it back to base.
pub fn lend_priority(task: &TaskRef, lent: Option<u8>) {
    adjust_priority(task, |inner| inner.lent_priority = lent);
}
