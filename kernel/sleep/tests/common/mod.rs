//! Host-thread scheduling environment for the end-to-end tests.
//!
//! Each simulated CPU is an idle host thread spinning on `yield_now`;
//! each task is a host thread whose `ContextHandle` maps resume/suspend
//! onto park/unpark. The `running` flag is the wake condition
//! everywhere, so the timeout-based park below only adds latency, never
//! wrong behavior. Tests share one scheduler instance per test binary
//! and therefore run one at a time, serialized by [`serial()`].

#![allow(dead_code)]

use std::boxed::Box;
use std::sync::mpsc;
use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard, Once};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use context_switch::ContextHandle;
use cpu::CpuId;
use task_struct::{RunState, Task, TaskFlags, TaskOptions, TaskRef, MAX_PRIORITY};

pub const NUM_CPUS: usize = 2;

pub const CPU0: CpuId = CpuId::new(0);
pub const CPU1: CpuId = CpuId::new(1);

struct HostContext {
    thread: Thread,
}

impl ContextHandle for HostContext {
    fn resume(&self, _cpu: CpuId) {
        self.thread.unpark();
    }

    fn suspend_once(&self) {
        // Bounded park: a resume delivered before the park is caught by
        // the caller's re-check loop either way.
        thread::park_timeout(Duration::from_millis(1));
    }
}

static BOOT: Once = Once::new();
static SERIAL: StdMutex<()> = StdMutex::new(());

/// Brings the simulated machine up (first call) and serializes the
/// calling test against all others in this binary.
pub fn serial() -> StdMutexGuard<'static, ()> {
    BOOT.call_once(|| {
        cpu::init(NUM_CPUS).unwrap();
        runqueue::init().unwrap();
        scheduler::init().unwrap();
        for c in cpu::cpus() {
            spawn_idle(c);
        }
    });
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_idle(cpu_id: CpuId) {
    let (tx, rx) = mpsc::channel::<TaskRef>();
    let join = thread::Builder::new()
        .name(format!("idle{}", cpu_id.value()))
        .spawn(move || {
            let idle: TaskRef = rx.recv().unwrap();
            loop {
                if !scheduler::yield_now(&idle) {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        })
        .unwrap();
    let handle = HostContext {
        thread: join.thread().clone(),
    };
    let idle = Task::new(
        "idle",
        Box::new(handle),
        TaskOptions {
            priority: MAX_PRIORITY,
            flags: TaskFlags::IDLE | TaskFlags::KERNEL | TaskFlags::NO_SLEEP,
            bound_cpu: Some(cpu_id),
            ..TaskOptions::default()
        },
    );
    scheduler::set_idle_task(cpu_id, idle.clone()).unwrap();
    scheduler::make_current(cpu_id, idle.clone()).unwrap();
    tx.send(idle).unwrap();
}

/// Creates a task whose body runs on its own host thread once the task
/// is first scheduled. The task exits when the body returns. It is not
/// runnable until [`start`].
pub fn spawn_task<F>(name: &'static str, options: TaskOptions, body: F) -> TaskRef
where
    F: FnOnce(&TaskRef) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<TaskRef>();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let task: TaskRef = rx.recv().unwrap();
            while !task.is_running() {
                thread::park_timeout(Duration::from_millis(1));
            }
            body(&task);
            scheduler::exit_current(&task);
        })
        .map(|join| {
            let handle = HostContext {
                thread: join.thread().clone(),
            };
            let task = Task::new(name, Box::new(handle), options);
            tx.send(task.clone()).unwrap();
            task
        })
        .unwrap()
}

pub fn start(task: &TaskRef) {
    scheduler::make_runnable(task);
}

/// Polls `cond` until it holds, panicking after a generous deadline so
/// a broken scenario fails instead of hanging the suite.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Waits until `task` is parked on a sleep queue and fully off-CPU.
pub fn wait_until_sleeping(task: &TaskRef) {
    let t = task.clone();
    wait_until("task to park", move || {
        t.runstate() == RunState::Sleeping && !t.is_running()
    });
}

pub fn wait_until_state(task: &TaskRef, state: RunState) {
    let t = task.clone();
    wait_until("task state change", move || {
        t.runstate() == state && !t.is_running()
    });
}

pub fn wait_until_exited(task: &TaskRef) {
    let t = task.clone();
    wait_until("task exit", move || {
        t.runstate() == RunState::Exited && !t.is_running()
    });
}

/// Advances virtual time tick by tick, expiring sleep timeouts, with a
/// real-time gap so woken tasks get scheduled in between.
pub fn advance_ticks(n: u64) {
    for _ in 0..n {
        time::tick();
        sleep::process_timeouts();
        thread::sleep(Duration::from_millis(1));
    }
}

/// Receives one message, failing the test if nothing arrives in time.
pub fn recv_soon<T>(rx: &mpsc::Receiver<T>, what: &str) -> T {
    rx.recv_timeout(Duration::from_secs(10))
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}
