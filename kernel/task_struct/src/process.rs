//! Processes: thread grouping, asynchronous signals, and CPU-time
//! limits.
//!
//! Only the slice of process state the scheduler core touches lives
//! here: the thread list (walked by the periodic accounting pass),
//! pending signals (which interrupt interruptible sleeps), the deferred
//! debugger signal delivered when a stopped thread is resumed, and the
//! soft/hard CPU-time limits.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::{Channel, TaskRef};

/// Asynchronous signals the scheduler core can raise or deliver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Signal {
    /// Soft CPU-time limit exceeded; a warning the process may catch.
    CpuTimeWarning,
    /// Hard CPU-time limit exceeded; fatal.
    CpuTimeExceeded,
    /// Debugger-style trap, deferred while the target is stopped.
    Trap,
}

/// CPU-time limits in ticks. `u64::MAX` means unlimited.
#[derive(Clone, Copy, Debug)]
pub struct CpuTimeLimit {
    pub soft_ticks: u64,
    pub hard_ticks: u64,
}

impl CpuTimeLimit {
    pub const UNLIMITED: CpuTimeLimit = CpuTimeLimit {
        soft_ticks: u64::MAX,
        hard_ticks: u64::MAX,
    };
}

static NEXT_PROCESS_ID: AtomicUsize = AtomicUsize::new(1);
static PROCESS_LIST: Mutex<BTreeMap<usize, ProcessRef>> = Mutex::new(BTreeMap::new());

pub struct Process {
    id: usize,
    name: &'static str,
    threads: Mutex<Vec<TaskRef>>,
    /// Run ticks folded in from threads that have already exited.
    accumulated_run_ticks: AtomicU64,
    exiting: AtomicBool,
    pending_signals: Mutex<Vec<Signal>>,
    /// A signal held back while a thread is stopped, delivered when the
    /// thread is next made runnable.
    debug_signal: Mutex<Option<Signal>>,
    cpu_limit: Mutex<CpuTimeLimit>,
}

impl Process {
    /// Creates a process and registers it in the global process list.
    pub fn new(name: &'static str) -> ProcessRef {
        let id = NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed);
        let proc = ProcessRef(Arc::new(Process {
            id,
            name,
            threads: Mutex::new(Vec::new()),
            accumulated_run_ticks: AtomicU64::new(0),
            exiting: AtomicBool::new(false),
            pending_signals: Mutex::new(Vec::new()),
            debug_signal: Mutex::new(None),
            cpu_limit: Mutex::new(CpuTimeLimit::UNLIMITED),
        }));
        PROCESS_LIST.lock().insert(id, proc.clone());
        proc
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn attach_thread(&self, task: TaskRef) {
        self.threads.lock().push(task);
    }

    /// Removes an exiting thread and folds its final run time into the
    /// process total so CPU-limit accounting survives thread exit.
    pub fn detach_thread(&self, task: &TaskRef, final_run_ticks: u64) {
        self.threads.lock().retain(|t| t != task);
        self.accumulated_run_ticks
            .fetch_add(final_run_ticks, Ordering::Relaxed);
    }

    /// A snapshot of this process's live threads.
    pub fn threads(&self) -> Vec<TaskRef> {
        self.threads.lock().clone()
    }

    /// Total run ticks consumed by this process: exited threads'
    /// contribution plus every live thread's accumulated time.
    pub fn total_run_ticks(&self) -> u64 {
        let live: u64 = self
            .threads()
            .iter()
            .map(|t| t.inner().run_ticks)
            .sum();
        self.accumulated_run_ticks.load(Ordering::Relaxed) + live
    }

    pub fn record_signal(&self, signal: Signal) {
        self.pending_signals.lock().push(signal);
    }

    pub fn has_pending_signal(&self) -> bool {
        !self.pending_signals.lock().is_empty()
    }

    pub fn take_signal(&self) -> Option<Signal> {
        let mut pending = self.pending_signals.lock();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    /// Holds back a debugger-style signal for delivery when one of this
    /// process's stopped threads is next made runnable.
    pub fn set_debug_signal(&self, signal: Signal) {
        *self.debug_signal.lock() = Some(signal);
    }

    pub fn take_debug_signal(&self) -> Option<Signal> {
        self.debug_signal.lock().take()
    }

    /// The channel that waiters for this process's suspended threads
    /// sleep on. Derived from the process's identity, so it is stable
    /// for the process's lifetime.
    pub fn suspend_channel(&self) -> Channel {
        Channel::from_ref(&self.exiting)
    }

    pub fn cpu_limit(&self) -> CpuTimeLimit {
        *self.cpu_limit.lock()
    }

    pub fn set_cpu_limit(&self, limit: CpuTimeLimit) {
        *self.cpu_limit.lock() = limit;
    }

    /// Raises the soft CPU limit after a warning has fired, so the
    /// warning is not re-delivered on every accounting pass.
    pub fn rearm_soft_limit(&self, additional_ticks: u64) {
        let mut limit = self.cpu_limit.lock();
        limit.soft_ticks = limit.soft_ticks.saturating_add(additional_ticks);
    }

    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Removes this process from the global list.
    pub fn unregister(&self) {
        PROCESS_LIST.lock().remove(&self.id);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Process{{{}, {:?}}}", self.id, self.name)
    }
}

/// A shareable reference to a [`Process`]. Equality is identity.
#[derive(Clone)]
pub struct ProcessRef(Arc<Process>);

impl Deref for ProcessRef {
    type Target = Process;
    fn deref(&self) -> &Process {
        &self.0
    }
}

impl PartialEq for ProcessRef {
    fn eq(&self, other: &ProcessRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ProcessRef {}

impl fmt::Debug for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A snapshot of all registered processes.
pub fn processes() -> Vec<ProcessRef> {
    PROCESS_LIST.lock().values().cloned().collect()
}

pub fn process_by_id(id: usize) -> Option<ProcessRef> {
    PROCESS_LIST.lock().get(&id).cloned()
}
