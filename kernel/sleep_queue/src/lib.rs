//! Hash-bucketed sleep queues.
//!
//! A sleeping task is parked on the bucket its wait channel hashes to;
//! many channels share one bucket. Entries are kept in effective-
//! priority order (strongest first, FIFO among equals), so a wake-one
//! is a single priority-ordered scan for the first matching entry, and
//! waking one channel never reorders the others sharing the bucket.
//!
//! The rule that keeps sleep atomic: a task's run state is moved to
//! `Sleeping` and its location word to the bucket *while the bucket
//! lock is held*, and any interlock the sleeper carried is released
//! under that same lock. Wakers take the bucket lock before examining
//! membership, so a wakeup between "decided to sleep" and "parked" is
//! never lost.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};
use task_struct::{Channel, Location, TaskRef};

pub const BUCKET_COUNT: usize = 64;

/// One sleep-queue bucket: all sleepers whose channels hash here.
pub struct Bucket {
    /// Sorted by effective priority, strongest first.
    entries: Vec<TaskRef>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_BUCKET: Mutex<Bucket> = Mutex::new(Bucket { entries: Vec::new() });

static BUCKETS: [Mutex<Bucket>; BUCKET_COUNT] = [EMPTY_BUCKET; BUCKET_COUNT];

/// Total number of parked tasks, across all buckets.
static SLEEPER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// The bucket index a channel hashes to. Low bits are dropped first
/// since channel values are object addresses and share alignment.
pub fn bucket_index(channel: Channel) -> usize {
    (channel.raw() >> 4) % BUCKET_COUNT
}

pub fn lock_bucket(channel: Channel) -> MutexGuard<'static, Bucket> {
    lock_bucket_at(bucket_index(channel))
}

pub fn lock_bucket_at(index: usize) -> MutexGuard<'static, Bucket> {
    BUCKETS[index].lock()
}

/// How many tasks are currently parked on sleep queues.
pub fn sleeper_count() -> usize {
    SLEEPER_COUNT.load(Ordering::SeqCst)
}

impl Bucket {
    /// Inserts a task in priority position: after every entry at least
    /// as strong, so equal priorities wake in arrival order.
    ///
    /// The caller has already set the task's wait channel and must set
    /// its location word to this bucket under the same lock.
    pub fn insert(&mut self, task: TaskRef) {
        let pri = task.effective_priority();
        let pos = self
            .entries
            .iter()
            .position(|t| t.effective_priority() > pri)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, task);
        SLEEPER_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes up to `limit` tasks waiting on `channel`, strongest
    /// first. Entries on other channels keep their relative order.
    pub fn remove_matching(&mut self, channel: Channel, limit: usize) -> Vec<TaskRef> {
        let mut woken = Vec::new();
        let mut i = 0;
        while i < self.entries.len() && woken.len() < limit {
            let matches = self.entries[i].inner().wait_channel == Some(channel);
            if matches {
                let task = self.entries.remove(i);
                task.set_location(Location::Nowhere);
                SLEEPER_COUNT.fetch_sub(1, Ordering::SeqCst);
                woken.push(task);
            } else {
                i += 1;
            }
        }
        woken
    }

    /// Removes one specific task. Returns whether it was present.
    pub fn remove_task(&mut self, task: &TaskRef) -> bool {
        if let Some(pos) = self.entries.iter().position(|t| t == task) {
            self.entries.remove(pos);
            task.set_location(Location::Nowhere);
            SLEEPER_COUNT.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Re-sorts one task after its effective priority changed. Returns
    /// whether it was present.
    pub fn reposition(&mut self, task: &TaskRef) -> bool {
        if let Some(pos) = self.entries.iter().position(|t| t == task) {
            let task = self.entries.remove(pos);
            SLEEPER_COUNT.fetch_sub(1, Ordering::SeqCst);
            self.insert(task);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.entries.iter().any(|t| t == task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
