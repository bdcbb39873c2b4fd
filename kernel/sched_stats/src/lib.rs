//! The periodic accounting pass.
//!
//! Once per accounting interval (nominally one second, [`time::HZ`]
//! ticks) [`periodic()`] walks every process and, for each live
//! thread: folds newly consumed CPU time into a decayed usage estimate
//! (`estcpu`, retaining ~95% per pass), bumps the consecutive-blocked
//! counter, and renormalizes timeshare priorities so CPU hogs drift
//! weaker and sleepers drift back to their base. It then enforces each
//! process's CPU-time limits by posting asynchronous signals: a
//! catchable warning at the soft limit, a fatal signal at the hard
//! limit. Processes that are mid-exit are skipped; their thread lists
//! are already being torn down.

#![no_std]

extern crate alloc;

use task_struct::{ProcessRef, RunState, Signal, TaskFlags, TaskRef, MAX_PRIORITY};

/// Fraction of `estcpu` retained per accounting pass.
const DECAY_NUM: u64 = 95;
const DECAY_DEN: u64 = 100;

/// Ticks of usage per point of priority weakening.
const ESTCPU_DIVISOR: u32 = 4;

/// Cap on the usage estimate, bounding the priority penalty.
const ESTCPU_MAX: u32 = 1 << 20;

/// How much the soft CPU limit is raised after its warning fires, so
/// the warning is delivered once per crossing rather than every pass.
const SOFT_LIMIT_REARM_TICKS: u64 = 5 * time::HZ;

/// Runs one accounting pass over every process.
pub fn periodic() {
    for proc in task_struct::processes() {
        if proc.is_exiting() {
            continue;
        }
        for task in proc.threads() {
            account_task(&task);
        }
        enforce_cpu_limit(&proc);
    }
}

fn account_task(task: &TaskRef) {
    if task.is_idle() {
        return;
    }
    let blocked = matches!(
        task.runstate(),
        RunState::Sleeping | RunState::Stopped | RunState::Suspended
    );
    let (base, renormalized) = {
        let mut inner = task.inner();
        // The dispatcher only charges run time when a switch commits; a
        // task that has occupied its CPU across the whole interval has
        // an uncharged in-progress stretch. Fold it in here so CPU hogs
        // cannot sit under the accounting radar.
        if task.runstate() == RunState::OnCpu {
            let now = time::now_ticks();
            inner.run_ticks += now.saturating_sub(inner.run_since);
            inner.run_since = now;
        }
        let delta = (inner.run_ticks - inner.acct_run_ticks).min(u32::MAX as u64) as u32;
        inner.acct_run_ticks = inner.run_ticks;
        if blocked {
            inner.sleep_ticks = inner.sleep_ticks.saturating_add(1);
        } else {
            inner.sleep_ticks = 0;
        }
        let raw = inner.estcpu.saturating_add(delta).min(ESTCPU_MAX);
        inner.estcpu = ((raw as u64) * DECAY_NUM / DECAY_DEN) as u32;
        let penalty = (inner.estcpu / ESTCPU_DIVISOR).min(MAX_PRIORITY as u32) as u8;
        let renormalized = inner
            .user_priority
            .saturating_add(penalty)
            .min(MAX_PRIORITY);
        (inner.base_priority, renormalized)
    };
    // Timeshare tasks only; kernel service priorities are fixed.
    if !task.flags().contains(TaskFlags::KERNEL) && renormalized != base {
        scheduler::change_priority(task, renormalized);
    }
}

fn enforce_cpu_limit(proc: &ProcessRef) {
    let limit = proc.cpu_limit();
    if limit.soft_ticks == u64::MAX && limit.hard_ticks == u64::MAX {
        return;
    }
    let total = proc.total_run_ticks();
    if total > limit.hard_ticks {
        log::warn!("{:?} exceeded its hard CPU limit ({} ticks)", proc, total);
        sleep::post_signal(proc, Signal::CpuTimeExceeded);
    } else if total > limit.soft_ticks {
        log::info!("{:?} exceeded its soft CPU limit ({} ticks)", proc, total);
        sleep::post_signal(proc, Signal::CpuTimeWarning);
        proc.rearm_soft_limit(SOFT_LIMIT_REARM_TICKS);
    }
}
