//! Manages preemption on a per-CPU basis.
//!
//! Holding preemption prevents the dispatcher from switching tasks on
//! that CPU; the dispatcher itself takes a hold for the duration of a
//! switch, and refuses to block a task that entered it with preemption
//! already held.

#![no_std]

use core::sync::atomic::{AtomicU8, Ordering};
use cpu::{CpuId, MAX_CPUS};

#[allow(clippy::declare_interior_mutable_const)]
const ATOMIC_U8_ZERO: AtomicU8 = AtomicU8::new(0);

/// The per-CPU preemption count, indexed by `CpuId::index()`.
///
/// A count of `0` means preemption is enabled on that CPU.
static PREEMPTION_COUNT: [AtomicU8; MAX_CPUS] = [ATOMIC_U8_ZERO; MAX_CPUS];

/// Prevents preemptive task switching on `cpu` until the returned guard
/// is dropped.
///
/// `cpu` must be the CPU the caller is executing on; the guard must be
/// dropped on that same CPU.
pub fn hold_preemption(cpu: CpuId) -> PreemptionGuard {
    let prev_val = PREEMPTION_COUNT[cpu.index()].fetch_add(1, Ordering::SeqCst);
    // A previous value of 0 indicates the transition from preemption
    // being enabled to being disabled on this CPU.
    let preemption_was_enabled = prev_val == 0;
    // Create the guard immediately after incrementing, so a panic below
    // still decrements the counter on unwind.
    let guard = PreemptionGuard {
        cpu,
        preemption_was_enabled,
    };
    if prev_val == u8::MAX {
        panic!("BUG: overflow in the preemption counter for {}", cpu);
    }
    guard
}

/// A guard ensuring preemption is held on one CPU for as long as it
/// exists.
///
/// Dropping it *may* re-enable preemption, but only if no other guard
/// for the same CPU is still live further up the call stack.
pub struct PreemptionGuard {
    cpu: CpuId,
    preemption_was_enabled: bool,
}

impl PreemptionGuard {
    /// Whether this guard caused the enabled-to-disabled transition.
    ///
    /// `false` means preemption was already held on this CPU when the
    /// guard was created.
    pub fn preemption_was_enabled(&self) -> bool {
        self.preemption_was_enabled
    }

    /// The CPU this guard holds preemption on.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        let prev_val = PREEMPTION_COUNT[self.cpu.index()].fetch_sub(1, Ordering::SeqCst);
        if prev_val == 0 {
            panic!("BUG: underflow in the preemption counter for {}", self.cpu);
        }
    }
}

/// Whether preemption is currently enabled on `cpu`.
///
/// This is only a snapshot; it offers no guarantee about the state
/// immediately after returning.
pub fn preemption_enabled(cpu: CpuId) -> bool {
    PREEMPTION_COUNT[cpu.index()].load(Ordering::SeqCst) == 0
}
