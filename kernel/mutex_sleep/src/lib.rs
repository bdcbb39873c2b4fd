//! A sleeping mutex.
//!
//! The fast path is one short spinlock acquisition; on contention the
//! caller sleeps on the mutex's wait channel, with the internal state
//! lock as the interlock, so an unlock between "saw it held" and
//! "parked" is never lost. Waiters hold a kernel-priority boost while
//! asleep and use the scheduler-internal wakeup protocol: nothing but
//! the owner's unlock may wake them, and signals never interrupt them.

#![no_std]

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use sleep::SleepRequest;
use spin::Mutex;
use task_struct::{Channel, SyncPolicy, TaskRef};

/// Priority boost held while waiting for a mutex.
const WAITER_PRIORITY: u8 = 8;

struct LockState {
    held: bool,
}

/// A mutex that puts contending tasks to sleep.
pub struct MutexSleep<T: ?Sized> {
    state: Mutex<LockState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for MutexSleep<T> {}
unsafe impl<T: ?Sized + Send> Sync for MutexSleep<T> {}

impl<T> MutexSleep<T> {
    pub const fn new(data: T) -> MutexSleep<T> {
        MutexSleep {
            state: Mutex::new(LockState { held: false }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> MutexSleep<T> {
    fn channel(&self) -> Channel {
        Channel::from_ref(&self.state)
    }

    /// Acquires the lock without blocking, if it is free.
    pub fn try_lock(&self) -> Option<MutexSleepGuard<T>> {
        let mut state = self.state.lock();
        if state.held {
            None
        } else {
            state.held = true;
            Some(MutexSleepGuard { lock: self })
        }
    }

    /// Acquires the lock, sleeping while it is held elsewhere.
    ///
    /// A non-sleepable task degenerates to polling, since its sleeps
    /// return immediately.
    pub fn lock(&self, curr: &TaskRef) -> MutexSleepGuard<T> {
        let mut state = self.state.lock();
        loop {
            if !state.held {
                state.held = true;
                drop(state);
                return MutexSleepGuard { lock: self };
            }
            let req = SleepRequest::new(self.channel(), "mutex_sleep")
                .priority(WAITER_PRIORITY)
                .policy(SyncPolicy::Sched);
            let (_res, reacquired) = sleep::block_interlocked(curr, &req, &self.state, state);
            state = reacquired;
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexSleep<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "MutexSleep {{ data: {:?} }}", &*guard),
            None => write!(f, "MutexSleep {{ <locked> }}"),
        }
    }
}

/// Grants access to the data; unlocking on drop wakes one waiter.
pub struct MutexSleepGuard<'a, T: ?Sized> {
    lock: &'a MutexSleep<T>,
}

impl<T: ?Sized> Deref for MutexSleepGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Exclusive by the held flag this guard represents.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexSleepGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexSleepGuard<'_, T> {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            state.held = false;
        }
        sleep::wake_one(self.lock.channel());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_reflects_held_state() {
        let mutex = MutexSleep::new(7u32);
        let mut guard = mutex.try_lock().unwrap();
        *guard = 8;
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert_eq!(*mutex.try_lock().unwrap(), 8);
    }
}
