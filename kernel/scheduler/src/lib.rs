//! The scheduler core: per-CPU dispatch state, the dispatcher itself,
//! runnable transitions, and priority propagation.
//!
//! Each CPU has exactly one current task at all times after
//! initialization (the idle task when nothing else is runnable). The
//! dispatcher ([`yield_now`], [`preempt_point`], [`block_current`],
//! [`exit_current`], [`hand_off`]) is the only code that moves a task
//! on or off a CPU; [`make_runnable`] is the only way a blocked task
//! becomes eligible again.
//!
//! Lock order, outermost first: sleep-queue bucket, run queue (two run
//! queues in ascending CPU id via `runqueue::lock_pair`), per-CPU
//! occupant record, task inner lock.

#![no_std]

extern crate alloc;

mod dispatch;
mod transition;

pub use dispatch::{
    block_current, exit_current, hand_off, migrate, preempt_point, stop_current,
    suspend_current, yield_now,
};
pub use transition::{change_priority, lend_priority, make_runnable, wakeup_channel};

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use cpu::CpuId;
use spin::{Mutex, Once};
use task_struct::{Channel, Location, RunState, TaskRef};

/// Hooks invoked around every context switch, for the consumed
/// primitives the dispatcher drives but does not implement: address
/// space activation and performance-counter state. Each is called
/// exactly once per switch direction.
pub trait SwitchHooks: Send + Sync {
    /// Outgoing side, called by the switching CPU.
    fn address_space_deactivate(&self, _prev: &TaskRef) {}
    /// Incoming side, called by the switching CPU.
    fn address_space_activate(&self, _next: &TaskRef) {}
    /// Called by a task as it switches out.
    fn perfctr_save(&self, _prev: &TaskRef) {}
    /// Called by a task as it resumes.
    fn perfctr_restore(&self, _next: &TaskRef) {}
}

struct NoOpHooks;
impl SwitchHooks for NoOpHooks {}
static NO_OP_HOOKS: NoOpHooks = NoOpHooks;
static HOOKS: Once<&'static dyn SwitchHooks> = Once::new();

pub fn register_switch_hooks(hooks: &'static dyn SwitchHooks) -> Result<(), &'static str> {
    let mut first = false;
    HOOKS.call_once(|| {
        first = true;
        hooks
    });
    if first {
        Ok(())
    } else {
        Err("switch hooks were already registered")
    }
}

pub(crate) fn hooks() -> &'static dyn SwitchHooks {
    HOOKS.get().copied().unwrap_or(&NO_OP_HOOKS)
}

static SOFTINT_HANDLER: Once<fn(u32)> = Once::new();

/// Registers the handler that drains pending soft-interrupt bits at
/// every dispatch.
pub fn register_softint_handler(handler: fn(u32)) -> Result<(), &'static str> {
    let mut first = false;
    SOFTINT_HANDLER.call_once(|| {
        first = true;
        handler
    });
    if first {
        Ok(())
    } else {
        Err("softint handler was already registered")
    }
}

pub(crate) struct Occupants {
    pub current: Option<TaskRef>,
    pub idle: Option<TaskRef>,
}

/// The per-CPU dispatch record.
pub(crate) struct CpuSched {
    pub cpu: CpuId,
    pub occupants: Mutex<Occupants>,
    /// want-resched request/ack generation counters. A kick bumps
    /// `resched_requested`; the dispatcher acknowledges by advancing
    /// `resched_acked` to the generation it observed on entry, so a
    /// kick racing the acknowledgment is never lost.
    pub resched_requested: AtomicU64,
    pub resched_acked: AtomicU64,
    /// Pending soft-interrupt levels, drained at every dispatch.
    pub pending_softints: AtomicU32,
}

static CPUS: Once<Vec<CpuSched>> = Once::new();

/// Creates the per-CPU dispatch records. Requires `cpu::init()` and
/// `runqueue::init()`; callable once.
pub fn init() -> Result<(), &'static str> {
    if !runqueue::is_initialized() {
        return Err("scheduler::init() requires runqueue::init() first");
    }
    let mut first = false;
    CPUS.call_once(|| {
        first = true;
        cpu::cpus()
            .map(|cpu| CpuSched {
                cpu,
                occupants: Mutex::new(Occupants {
                    current: None,
                    idle: None,
                }),
                resched_requested: AtomicU64::new(0),
                resched_acked: AtomicU64::new(0),
                pending_softints: AtomicU32::new(0),
            })
            .collect()
    });
    if first {
        log::info!("scheduler initialized for {} CPUs", cpu::cpu_count());
        Ok(())
    } else {
        Err("scheduler was already initialized")
    }
}

pub fn is_initialized() -> bool {
    CPUS.get().is_some()
}

pub(crate) fn cpu_sched(cpu: CpuId) -> &'static CpuSched {
    &CPUS
        .get()
        .unwrap_or_else(|| panic!("BUG: scheduler used before scheduler::init()"))[cpu.index()]
}

/// Registers `task` as the idle task of `cpu`. The task must carry the
/// `IDLE` flag and is never placed on a run queue.
pub fn set_idle_task(cpu: CpuId, task: TaskRef) -> Result<(), &'static str> {
    if !task.is_idle() {
        return Err("set_idle_task() requires a task with the IDLE flag");
    }
    task.set_cpu(cpu);
    task.set_runstate(RunState::Idle);
    let mut occ = cpu_sched(cpu).occupants.lock();
    if occ.idle.is_some() {
        return Err("CPU already has an idle task");
    }
    occ.idle = Some(task);
    Ok(())
}

/// Adopts `task` as the current task of `cpu` during bring-up, before
/// the first dispatch on that CPU.
pub fn make_current(cpu: CpuId, task: TaskRef) -> Result<(), &'static str> {
    let mut occ = cpu_sched(cpu).occupants.lock();
    if occ.current.is_some() {
        return Err("CPU already has a current task");
    }
    task.set_cpu(cpu);
    task.set_runstate(RunState::OnCpu);
    task.set_location(Location::OnCpu(cpu));
    task.inner().run_since = time::now_ticks();
    task.set_running(true);
    occ.current = Some(task);
    Ok(())
}

pub fn current_task(cpu: CpuId) -> Option<TaskRef> {
    cpu_sched(cpu).occupants.lock().current.clone()
}

pub fn idle_task(cpu: CpuId) -> Option<TaskRef> {
    cpu_sched(cpu).occupants.lock().idle.clone()
}

/// Requests a reschedule on `cpu` at its next preemption point.
pub fn kick(cpu: CpuId) {
    cpu_sched(cpu).resched_requested.fetch_add(1, Ordering::SeqCst);
}

/// Whether `cpu` has an unacknowledged reschedule request.
pub fn resched_pending(cpu: CpuId) -> bool {
    let sched = cpu_sched(cpu);
    sched.resched_requested.load(Ordering::SeqCst) > sched.resched_acked.load(Ordering::SeqCst)
}

/// Marks soft-interrupt `level` pending on `cpu`; it is drained through
/// the registered handler at that CPU's next dispatch. Valid levels are
/// `0..32`.
pub fn set_pending_softint(cpu: CpuId, level: u8) {
    if level >= 32 {
        panic!("BUG: soft-interrupt level {} out of range", level);
    }
    cpu_sched(cpu)
        .pending_softints
        .fetch_or(1 << level, Ordering::SeqCst);
}

pub(crate) fn softint_handler() -> Option<fn(u32)> {
    SOFTINT_HANDLER.get().copied()
}

/// Whether `cpu` has undrained pending soft interrupts.
pub fn softints_pending(cpu: CpuId) -> bool {
    cpu_sched(cpu).pending_softints.load(Ordering::SeqCst) != 0
}

static SWAP_IN_TOKEN: u8 = 0;

/// The channel the swap-in service waits on. A wakeup of a
/// non-resident task wakes this channel instead of queueing the task.
pub fn swap_in_channel() -> Channel {
    Channel::from_ref(&SWAP_IN_TOKEN)
}
