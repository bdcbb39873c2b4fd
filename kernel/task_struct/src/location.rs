//! The state-tagged location word.
//!
//! A task's "current lock" is whichever container currently holds it:
//! the run queue of some CPU, a sleep-queue bucket, or no container at
//! all while it occupies a CPU. Rather than a movable lock pointer, the
//! location is a single atomic word holding a tag and an index; code
//! that needs the container lock reads the word, locks the named
//! container, and re-reads to confirm the task did not move in between.
//! The word itself only changes while the container lock it names (or
//! the one it is moving to) is held.

use core::sync::atomic::{AtomicU64, Ordering};
use cpu::CpuId;

/// Where a task currently lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    /// On no container: newly created, stopped/suspended off-queue,
    /// mid-transition, or exited.
    Nowhere,
    /// Occupying the given CPU (current task of that CPU).
    OnCpu(CpuId),
    /// On the run queue of the given CPU.
    RunQueue(CpuId),
    /// On the sleep-queue bucket with the given index.
    SleepBucket(usize),
}

const TAG_NOWHERE: u64 = 0;
const TAG_ON_CPU: u64 = 1;
const TAG_RUN_QUEUE: u64 = 2;
const TAG_SLEEP_BUCKET: u64 = 3;

fn pack(loc: Location) -> u64 {
    let (tag, value) = match loc {
        Location::Nowhere => (TAG_NOWHERE, 0),
        Location::OnCpu(cpu) => (TAG_ON_CPU, cpu.value() as u64),
        Location::RunQueue(cpu) => (TAG_RUN_QUEUE, cpu.value() as u64),
        Location::SleepBucket(idx) => (TAG_SLEEP_BUCKET, idx as u64),
    };
    (tag << 32) | value
}

fn unpack(word: u64) -> Location {
    let value = word & 0xffff_ffff;
    match word >> 32 {
        TAG_NOWHERE => Location::Nowhere,
        TAG_ON_CPU => Location::OnCpu(CpuId::new(value as u32)),
        TAG_RUN_QUEUE => Location::RunQueue(CpuId::new(value as u32)),
        TAG_SLEEP_BUCKET => Location::SleepBucket(value as usize),
        tag => panic!("BUG: invalid location tag {}", tag),
    }
}

/// Atomic cell holding a [`Location`].
pub struct AtomicLocation(AtomicU64);

impl AtomicLocation {
    pub fn new(loc: Location) -> AtomicLocation {
        AtomicLocation(AtomicU64::new(pack(loc)))
    }

    pub fn load(&self) -> Location {
        unpack(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, loc: Location) {
        self.0.store(pack(loc), Ordering::SeqCst);
    }
}
