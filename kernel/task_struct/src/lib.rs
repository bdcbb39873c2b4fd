//! The fundamental task and process types consumed by the scheduler
//! core.
//!
//! A [`Task`] is one schedulable context. Its hot scheduling state is
//! split three ways:
//!
//! * lock-free atomics for the fields read from other CPUs on fast
//!   paths (run state, the `running` flag, the location word, CPU ids),
//! * a small per-task [`spin::Mutex`] around [`TaskInner`] for the
//!   mutable scheduling fields (priorities, wait bookkeeping, counters),
//! * immutable fields fixed at creation (id, name, flags, bound CPU).
//!
//! Lock order: a container lock (run queue or sleep bucket) is always
//! taken before a task's inner lock, never the other way around.

#![no_std]

extern crate alloc;

mod location;
mod process;

pub use location::{AtomicLocation, Location};
pub use process::{processes, process_by_id, CpuTimeLimit, Process, ProcessRef, Signal};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use context_switch::ContextHandle;
use cpu::CpuId;
use spin::{Mutex, MutexGuard};

/// The weakest (numerically largest) priority. Lower numbers are
/// stronger.
pub const MAX_PRIORITY: u8 = 63;
/// Default priority for new tasks.
pub const DEFAULT_PRIORITY: u8 = 32;

/// The life-cycle states of a task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RunState {
    /// Eligible to run; on a run queue unless mid-transition.
    Runnable = 0,
    /// Currently occupying a CPU.
    OnCpu = 1,
    /// Blocked on a wait channel.
    Sleeping = 2,
    /// Stopped (e.g. by a debugger); not on any queue.
    Stopped = 3,
    /// Administratively suspended; not on any queue.
    Suspended = 4,
    /// An idle task while not occupying its CPU.
    Idle = 5,
    /// Exited; never runs again.
    Exited = 6,
}

impl RunState {
    fn from_u8(raw: u8) -> RunState {
        match raw {
            0 => RunState::Runnable,
            1 => RunState::OnCpu,
            2 => RunState::Sleeping,
            3 => RunState::Stopped,
            4 => RunState::Suspended,
            5 => RunState::Idle,
            6 => RunState::Exited,
            _ => panic!("BUG: invalid RunState value {}", raw),
        }
    }
}

/// Atomic cell holding a [`RunState`].
pub struct AtomicRunState(AtomicU8);

impl AtomicRunState {
    pub fn new(state: RunState) -> AtomicRunState {
        AtomicRunState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: RunState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn compare_exchange(
        &self,
        current: RunState,
        new: RunState,
    ) -> Result<RunState, RunState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(RunState::from_u8)
            .map_err(RunState::from_u8)
    }
}

bitflags! {
    /// Immutable per-task attributes.
    pub struct TaskFlags: u8 {
        /// A kernel service task; exempt from timeshare priority
        /// renormalization.
        const KERNEL   = 1 << 0;
        /// The per-CPU idle task. Never on a run queue.
        const IDLE     = 1 << 1;
        /// May never block: interrupt-context or early-boot work.
        /// Sleep entry points return immediately for such tasks.
        const NO_SLEEP = 1 << 2;
    }
}

/// Which wakeup protocol applies to a sleeping task.
///
/// Ordinary sleeps may be taken off their wait channel by any wakeup or
/// by a direct state transition. Scheduler-internal waits (sleeping
/// mutexes) are only ever released by their owning primitive, so a
/// spontaneous unsleep of one is a kernel bug.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncPolicy {
    Sleep,
    Sched,
}

/// An opaque wait-channel identity, conventionally the address of the
/// object being waited on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel(usize);

impl Channel {
    pub fn from_ref<T>(r: &T) -> Channel {
        Channel(r as *const T as usize)
    }

    pub const fn from_raw(raw: usize) -> Channel {
        Channel(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Channel({:#x})", self.0)
    }
}

/// Why a sleeping task was made runnable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakeReason {
    /// A wakeup on its channel.
    Woken,
    /// Its sleep timeout expired.
    Timeout,
    /// A pending signal interrupted the sleep.
    Interrupted,
}

/// The mutable scheduling fields of a task, guarded by its inner lock.
pub struct TaskInner {
    /// Current scheduling priority (lower is stronger).
    pub base_priority: u8,
    /// The timeshare baseline that renormalization decays back toward.
    pub user_priority: u8,
    /// Priority lent by a priority-inheritance protocol, if any.
    pub lent_priority: Option<u8>,
    /// Kernel-priority boost held for the duration of a sleep.
    pub sleep_priority: Option<u8>,
    pub sync_policy: SyncPolicy,
    pub wait_channel: Option<Channel>,
    pub wait_reason: Option<&'static str>,
    pub wake_reason: Option<WakeReason>,
    pub interruptible: bool,
    /// Bumped at every sleep entry; stale timeout entries carry an old
    /// value and are discarded on expiry.
    pub sleep_seq: u64,
    /// Tick at which the task last started occupying a CPU.
    pub run_since: u64,
    /// Total ticks spent on a CPU.
    pub run_ticks: u64,
    /// `run_ticks` as of the last accounting pass.
    pub acct_run_ticks: u64,
    /// Consecutive accounting passes spent blocked.
    pub sleep_ticks: u32,
    /// Decayed CPU usage estimate (see `sched_stats`).
    pub estcpu: u32,
    /// Times this task was switched away from.
    pub switches: u64,
    /// The subset of `switches` forced by a preemption point.
    pub involuntary_switches: u64,
}

/// Creation-time options for [`Task::new`].
pub struct TaskOptions {
    pub priority: u8,
    pub flags: TaskFlags,
    pub bound_cpu: Option<CpuId>,
    pub process: Option<ProcessRef>,
    /// Whether the task's memory is resident. A wakeup of a
    /// non-resident task defers to the swap-in service.
    pub resident: bool,
}

impl Default for TaskOptions {
    fn default() -> TaskOptions {
        TaskOptions {
            priority: DEFAULT_PRIORITY,
            flags: TaskFlags::empty(),
            bound_cpu: None,
            process: None,
            resident: true,
        }
    }
}

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);
static TASK_LIST: Mutex<BTreeMap<usize, TaskRef>> = Mutex::new(BTreeMap::new());

const NO_CPU: u32 = u32::MAX;

/// One schedulable context.
pub struct Task {
    id: usize,
    name: &'static str,
    flags: TaskFlags,
    bound_cpu: Option<CpuId>,
    process: Option<ProcessRef>,
    handle: Box<dyn ContextHandle>,
    runstate: AtomicRunState,
    /// Whether the task's register state is live on a CPU. Set and
    /// cleared only by the dispatcher, under the relevant run-queue
    /// lock. Distinct from `RunState::OnCpu`: a task that has marked
    /// itself sleeping is still `running` until its CPU switches away.
    running: AtomicBool,
    resident: AtomicBool,
    location: AtomicLocation,
    /// The CPU this task last ran on (or is queued for).
    cpu: AtomicU32,
    /// Requested migration destination, applied at the next dispatch.
    target_cpu: AtomicU32,
    inner: Mutex<TaskInner>,
}

impl Task {
    /// Creates a task and registers it in the global task list.
    ///
    /// New tasks start [`Stopped`](RunState::Stopped); the spawner
    /// makes them runnable once their context is ready to execute.
    pub fn new(
        name: &'static str,
        handle: Box<dyn ContextHandle>,
        options: TaskOptions,
    ) -> TaskRef {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let task = TaskRef(Arc::new(Task {
            id,
            name,
            flags: options.flags,
            bound_cpu: options.bound_cpu,
            process: options.process,
            handle,
            runstate: AtomicRunState::new(RunState::Stopped),
            running: AtomicBool::new(false),
            resident: AtomicBool::new(options.resident),
            location: AtomicLocation::new(Location::Nowhere),
            cpu: AtomicU32::new(options.bound_cpu.map(CpuId::value).unwrap_or(0)),
            target_cpu: AtomicU32::new(NO_CPU),
            inner: Mutex::new(TaskInner {
                base_priority: options.priority,
                user_priority: options.priority,
                lent_priority: None,
                sleep_priority: None,
                sync_policy: SyncPolicy::Sleep,
                wait_channel: None,
                wait_reason: None,
                wake_reason: None,
                interruptible: false,
                sleep_seq: 0,
                run_since: 0,
                run_ticks: 0,
                acct_run_ticks: 0,
                sleep_ticks: 0,
                estcpu: 0,
                switches: 0,
                involuntary_switches: 0,
            }),
        }));
        if let Some(proc) = &task.process {
            proc.attach_thread(task.clone());
        }
        TASK_LIST.lock().insert(id, task.clone());
        task
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(TaskFlags::IDLE)
    }

    /// Whether this task is allowed to block at all.
    pub fn can_sleep(&self) -> bool {
        !self.flags.intersects(TaskFlags::NO_SLEEP | TaskFlags::IDLE)
    }

    pub fn runstate(&self) -> RunState {
        self.runstate.load()
    }

    pub fn set_runstate(&self, state: RunState) {
        self.runstate.store(state);
    }

    pub fn cas_runstate(&self, current: RunState, new: RunState) -> Result<RunState, RunState> {
        self.runstate.compare_exchange(current, new)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::SeqCst)
    }

    pub fn set_resident(&self, resident: bool) {
        self.resident.store(resident, Ordering::SeqCst);
    }

    pub fn location(&self) -> Location {
        self.location.load()
    }

    /// Only the dispatcher and the queue-transition paths may call
    /// this, while holding the lock of the container named by the old
    /// or new location.
    pub fn set_location(&self, loc: Location) {
        self.location.store(loc);
    }

    pub fn cpu(&self) -> CpuId {
        CpuId::new(self.cpu.load(Ordering::SeqCst))
    }

    pub fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu.value(), Ordering::SeqCst);
    }

    pub fn target_cpu(&self) -> Option<CpuId> {
        match self.target_cpu.load(Ordering::SeqCst) {
            NO_CPU => None,
            raw => Some(CpuId::new(raw)),
        }
    }

    pub fn set_target_cpu(&self, target: Option<CpuId>) {
        self.target_cpu.store(
            target.map(CpuId::value).unwrap_or(NO_CPU),
            Ordering::SeqCst,
        );
    }

    pub fn bound_cpu(&self) -> Option<CpuId> {
        self.bound_cpu
    }

    pub fn process(&self) -> Option<&ProcessRef> {
        self.process.as_ref()
    }

    pub fn handle(&self) -> &dyn ContextHandle {
        &*self.handle
    }

    /// Locks the mutable scheduling fields. Container lock first.
    pub fn inner(&self) -> MutexGuard<TaskInner> {
        self.inner.lock()
    }

    /// The priority this task competes with: the strongest of its base
    /// priority, any lent priority, and any sleep-time boost.
    pub fn effective_priority(&self) -> u8 {
        let inner = self.inner.lock();
        let mut pri = inner.base_priority;
        if let Some(lent) = inner.lent_priority {
            pri = pri.min(lent);
        }
        if let Some(boost) = inner.sleep_priority {
            pri = pri.min(boost);
        }
        pri
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Task{{{}, {:?}, {:?}}}",
            self.id,
            self.name,
            self.runstate()
        )
    }
}

/// A shareable reference to a [`Task`]. Equality is identity.
#[derive(Clone)]
pub struct TaskRef(Arc<Task>);

impl TaskRef {
    /// This task's own identity as a wait channel, used by `pause`.
    pub fn channel(&self) -> Channel {
        Channel::from_raw(Arc::as_ptr(&self.0) as usize)
    }
}

impl Deref for TaskRef {
    type Target = Task;
    fn deref(&self) -> &Task {
        &self.0
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &TaskRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn task_by_id(id: usize) -> Option<TaskRef> {
    TASK_LIST.lock().get(&id).cloned()
}

/// A snapshot of all registered tasks.
pub fn all_tasks() -> Vec<TaskRef> {
    TASK_LIST.lock().values().cloned().collect()
}

/// Removes an exited task from the global task list and its process's
/// thread list, folding its final run time into the process total.
pub fn unregister_task(task: &TaskRef) {
    let final_run_ticks = task.inner().run_ticks;
    if let Some(proc) = task.process() {
        proc.detach_thread(task, final_run_ticks);
    }
    TASK_LIST.lock().remove(&task.id());
}
