//! The dispatcher: the single point where a CPU switches from one task
//! to another.
//!
//! All entry points funnel into [`reschedule`], which under the local
//! run-queue lock requeues the outgoing task (unless it blocked,
//! stopped, or exited), picks the strongest queued task or falls back
//! to the idle task, commits the occupant change, and only then drives
//! the context handles. The outgoing side suspends in a loop until its
//! `running` flag is set again, so spurious resumes are harmless.

use cpu::CpuId;
use runqueue::RunQueue;
use spin::MutexGuard;
use task_struct::{Location, RunState, TaskRef};

use crate::{cpu_sched, hooks, softint_handler};
use core::sync::atomic::Ordering;

/// Voluntarily gives up the CPU. The task stays runnable and is
/// requeued behind its priority peers. Returns whether a switch to
/// another task actually happened.
pub fn yield_now(curr: &TaskRef) -> bool {
    reschedule(curr, None, false, false)
}

/// The preemption point: switches away only if this CPU has an
/// unacknowledged reschedule request or pending soft interrupts.
/// Returns whether a switch happened.
pub fn preempt_point(curr: &TaskRef) -> bool {
    let cpu = curr.cpu();
    if !crate::resched_pending(cpu) && !crate::softints_pending(cpu) {
        return false;
    }
    reschedule(curr, None, true, false)
}

/// Switches away from a task that has already parked itself on a sleep
/// bucket (or marked itself stopped/suspended). Returns once the task
/// has been made runnable and picked up by a CPU again.
pub fn block_current(curr: &TaskRef) {
    // OnCpu is legal here: a waker that caught the task between
    // parking itself and switching away flips it back already.
    debug_assert!(matches!(
        curr.runstate(),
        RunState::Sleeping | RunState::Stopped | RunState::Suspended | RunState::OnCpu
    ));
    reschedule(curr, None, false, false);
}

/// Marks the current task stopped and switches away. It runs again
/// only after `make_runnable`.
pub fn stop_current(curr: &TaskRef) {
    curr.set_runstate(RunState::Stopped);
    curr.set_location(Location::Nowhere);
    block_current(curr);
}

/// Marks the current task suspended and switches away. Clearing the
/// suspension via `make_runnable` notifies waiters on the owning
/// process's suspend channel.
pub fn suspend_current(curr: &TaskRef) {
    curr.set_runstate(RunState::Suspended);
    curr.set_location(Location::Nowhere);
    block_current(curr);
}

/// Terminates the current task: it is unregistered, switched away
/// from, and never resumed. Does not return.
///
/// The caller's context is abandoned mid-call; on the host-thread test
/// implementation the calling thread simply runs off the end after
/// this returns control, so this function does return there.
pub fn exit_current(curr: &TaskRef) {
    curr.set_runstate(RunState::Exited);
    curr.set_location(Location::Nowhere);
    task_struct::unregister_task(curr);
    reschedule(curr, None, false, true);
}

/// Switches directly to `target`, bypassing run-queue selection: used
/// when a soft-interrupt context must return to the context it
/// interrupted. The outgoing task stays runnable and is requeued.
///
/// `target` must be runnable on the calling CPU (queued here, or off
/// every queue); anything else is a caller bug.
pub fn hand_off(curr: &TaskRef, target: &TaskRef) -> bool {
    reschedule(curr, Some(target.clone()), false, false)
}

/// Requests migration of the current task to `dest`. Takes effect at
/// its next pass through the dispatcher: the task is then enqueued on
/// `dest` under both queues' locks, held in ascending CPU-id order.
pub fn migrate(curr: &TaskRef, dest: CpuId) -> Result<(), &'static str> {
    if dest.index() >= cpu::cpu_count() {
        return Err("migration destination out of range");
    }
    if let Some(bound) = curr.bound_cpu() {
        if bound != dest {
            return Err("task is bound to another CPU");
        }
    }
    curr.set_target_cpu(Some(dest));
    Ok(())
}

/// The switch itself. Returns `true` if the CPU switched to a
/// different task.
fn reschedule(
    curr: &TaskRef,
    handoff: Option<TaskRef>,
    involuntary: bool,
    exiting: bool,
) -> bool {
    let cpu = curr.cpu();
    let sched = cpu_sched(cpu);

    let guard = preemption::hold_preemption(cpu);
    if !guard.preemption_was_enabled() {
        // Refuse nested switches. Blocking with preemption held would
        // deadlock the CPU, so that is a bug rather than a no-op.
        if exiting
            || matches!(
                curr.runstate(),
                RunState::Sleeping | RunState::Stopped | RunState::Suspended
            )
        {
            panic!("BUG: {:?} blocking on {} with preemption held", curr, cpu);
        }
        drop(guard);
        return false;
    }
    if !curr.is_running() {
        panic!("BUG: reschedule() by {:?} which is not running on {}", curr, cpu);
    }

    // Drain pending soft interrupts before selection; the handler may
    // wake tasks that then win the selection below.
    let bits = sched.pending_softints.swap(0, Ordering::SeqCst);
    if bits != 0 {
        if let Some(handler) = softint_handler() {
            handler(bits);
        }
    }

    let resched_snapshot = sched.resched_requested.load(Ordering::SeqCst);
    let now = time::now_ticks();

    // A pending migration only moves a still-runnable task.
    let migration = curr
        .target_cpu()
        .filter(|t| *t != cpu && !exiting && !curr.is_idle());
    let (mut local, mut remote): (MutexGuard<RunQueue>, Option<MutexGuard<RunQueue>>) =
        match migration {
            Some(t) => {
                let (l, r) = runqueue::lock_pair(cpu, t);
                (l, Some(r))
            }
            None => (runqueue::lock(cpu), None),
        };

    // Requeue the outgoing task. Its state is re-read under the lock:
    // a waker that caught it mid-block has already flipped it back to
    // OnCpu, and that decision must win here.
    let state = curr.runstate();
    if !exiting && state == RunState::OnCpu {
        if curr.is_idle() {
            curr.set_runstate(RunState::Idle);
            curr.set_location(Location::Nowhere);
        } else {
            curr.set_runstate(RunState::Runnable);
            curr.set_target_cpu(None);
            match &mut remote {
                Some(rq) => {
                    let dest = rq.cpu();
                    curr.set_cpu(dest);
                    curr.set_location(Location::RunQueue(dest));
                    rq.enqueue(curr.clone());
                    crate::kick(dest);
                }
                None => {
                    curr.set_location(Location::RunQueue(cpu));
                    local.enqueue(curr.clone());
                }
            }
        }
    }

    // Pick the incoming task: an explicit hand-off target, else the
    // strongest queued task, else idle.
    let next = match handoff {
        Some(target) => {
            match target.location() {
                Location::RunQueue(c) if c == cpu => {
                    local.remove(&target);
                    target.set_location(Location::Nowhere);
                }
                Location::Nowhere if target.runstate() == RunState::Runnable => {}
                other => {
                    panic!("BUG: hand-off to {:?} which is at {:?}", target, other);
                }
            }
            target
        }
        None => local.take_highest().unwrap_or_else(|| {
            sched
                .occupants
                .lock()
                .idle
                .clone()
                .unwrap_or_else(|| panic!("BUG: no idle task on {}", cpu))
        }),
    };

    if next == *curr {
        // Nothing stronger to run; `take_highest` already popped us
        // back off the queue.
        curr.set_runstate(RunState::OnCpu);
        curr.set_location(Location::OnCpu(cpu));
        sched
            .resched_acked
            .fetch_max(resched_snapshot, Ordering::SeqCst);
        drop(remote);
        drop(local);
        drop(guard);
        return false;
    }

    log::trace!("{}: switching {:?} -> {:?}", cpu, curr, next);

    // Account the outgoing task's time on CPU (skipped for idle).
    if !curr.is_idle() {
        let mut inner = curr.inner();
        inner.run_ticks += now.saturating_sub(inner.run_since);
        // The accounting pass charges on-CPU stretches too; resetting
        // here keeps the two from double-charging the same ticks.
        inner.run_since = now;
        inner.switches += 1;
        if involuntary {
            inner.involuntary_switches += 1;
        }
    }
    if !next.is_idle() {
        next.inner().run_since = now;
    }

    // Commit the occupant change. `running` flips under the run-queue
    // lock: wakers racing a block and remote CPUs picking a migrated
    // task both serialize on it.
    debug_assert!(!next.is_running());
    next.set_runstate(RunState::OnCpu);
    next.set_location(Location::OnCpu(cpu));
    next.set_cpu(cpu);
    sched.occupants.lock().current = Some(next.clone());
    curr.set_running(false);
    next.set_running(true);
    sched
        .resched_acked
        .fetch_max(resched_snapshot, Ordering::SeqCst);
    drop(remote);
    drop(local);

    let hooks = hooks();
    hooks.perfctr_save(curr);
    hooks.address_space_deactivate(curr);
    hooks.address_space_activate(&next);
    drop(guard);

    next.handle().resume(cpu);
    if exiting {
        // Never resumed; the caller's context is abandoned.
        return true;
    }

    // Park until some CPU picks this task up again. The running flag is
    // the wake condition, so spurious resumes just loop.
    while !curr.is_running() {
        curr.handle().suspend_once();
    }
    crate::hooks().perfctr_restore(curr);
    true
}
