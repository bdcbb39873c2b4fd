//! End-to-end sleep/wakeup scenarios on the host-thread environment.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::*;
use sleep::SleepRequest;
use task_struct::{Channel, TaskFlags, TaskOptions};

#[test]
fn wake_one_round_trip() {
    let _g = serial();
    let chan = Channel::from_raw(0x11_0010);
    let (tx, rx) = mpsc::channel();

    let sleeper = spawn_task("sleeper", TaskOptions::default(), move |curr| {
        let res = sleep::block(curr, &SleepRequest::new(chan, "round_trip"));
        tx.send(res).unwrap();
    });
    start(&sleeper);
    wait_until_sleeping(&sleeper);
    assert!(sleep_queue::sleeper_count() >= 1);

    assert!(sleep::wake_one(chan));
    assert_eq!(recv_soon(&rx, "sleeper result"), Ok(()));
    wait_until_exited(&sleeper);

    // Nobody left on the channel.
    assert!(!sleep::wake_one(chan));
}

#[test]
fn wake_all_wakes_every_sleeper() {
    let _g = serial();
    let chan = Channel::from_raw(0x11_0020);
    let (tx, rx) = mpsc::channel();

    let mut tasks = Vec::new();
    for name in ["a", "b", "c"] {
        let tx = tx.clone();
        let task = spawn_task(name, TaskOptions::default(), move |curr| {
            let res = sleep::block(curr, &SleepRequest::new(chan, "herd"));
            tx.send(res).unwrap();
        });
        start(&task);
        tasks.push(task);
    }
    for task in &tasks {
        wait_until_sleeping(task);
    }

    assert_eq!(sleep::wake_all(chan), 3);
    for _ in 0..3 {
        assert_eq!(recv_soon(&rx, "herd result"), Ok(()));
    }
    for task in &tasks {
        wait_until_exited(task);
    }
}

#[test]
fn wake_one_takes_highest_priority_sleeper_first() {
    let _g = serial();
    let chan = Channel::from_raw(0x11_0030);
    let (tx, rx) = mpsc::channel();

    for (name, pri) in [("weak", 10u8), ("strong", 5u8)] {
        let tx = tx.clone();
        let task = spawn_task(name, TaskOptions::default(), move |curr| {
            let req = SleepRequest::new(chan, "pri_order").priority(pri);
            sleep::block(curr, &req).unwrap();
            tx.send(name).unwrap();
        });
        start(&task);
        wait_until_sleeping(&task);
    }

    assert!(sleep::wake_one(chan));
    assert_eq!(recv_soon(&rx, "first wake"), "strong");
    assert!(sleep::wake_one(chan));
    assert_eq!(recv_soon(&rx, "second wake"), "weak");
}

#[test]
fn interlock_prevents_lost_wakeups() {
    let _g = serial();
    // The interlocked condition: a flag only ever set under this lock.
    let cond: &'static spin::Mutex<bool> = Box::leak(Box::new(spin::Mutex::new(false)));
    let chan = Channel::from_ref(cond);
    let (tx, rx) = mpsc::channel();

    let waiter = spawn_task("cond_waiter", TaskOptions::default(), move |curr| {
        let mut guard = cond.lock();
        while !*guard {
            let req = SleepRequest::new(chan, "cond_wait");
            let (res, reacquired) = sleep::block_interlocked(curr, &req, cond, guard);
            res.unwrap();
            guard = reacquired;
        }
        drop(guard);
        tx.send(()).unwrap();
    });
    start(&waiter);

    // Deliberately no wait for the sleeper here: whether the wakeup
    // lands before, during, or after the waiter's enqueue, the
    // interlock guarantees it is not lost.
    thread::sleep(Duration::from_millis(2));
    {
        let mut guard = cond.lock();
        *guard = true;
    }
    sleep::wake_all(chan);
    recv_soon(&rx, "condition observed");
    wait_until_exited(&waiter);
}

#[test]
fn non_sleepable_task_returns_without_blocking() {
    let _g = serial();
    let chan = Channel::from_raw(0x11_0040);
    let (tx, rx) = mpsc::channel();
    let woke = Arc::new(AtomicBool::new(false));
    let woke2 = woke.clone();

    let task = spawn_task(
        "no_sleep",
        TaskOptions {
            flags: TaskFlags::NO_SLEEP,
            ..TaskOptions::default()
        },
        move |curr| {
            // Nothing ever wakes this channel; a blocking sleep here
            // would hang forever.
            let res = sleep::block(curr, &SleepRequest::new(chan, "refused"));
            woke2.store(true, Ordering::SeqCst);
            tx.send(res).unwrap();
        },
    );
    start(&task);
    assert_eq!(recv_soon(&rx, "refused sleep"), Ok(()));
    assert!(woke.load(Ordering::SeqCst));
    wait_until_exited(&task);
}

#[test]
fn sleeping_mutex_serializes_contenders() {
    let _g = serial();
    let counter: &'static mutex_sleep::MutexSleep<u64> =
        Box::leak(Box::new(mutex_sleep::MutexSleep::new(0)));
    let (tx, rx) = mpsc::channel();

    const TASKS: u64 = 4;
    const ROUNDS: u64 = 200;
    for name in ["m0", "m1", "m2", "m3"] {
        let tx = tx.clone();
        let task = spawn_task(name, TaskOptions::default(), move |curr| {
            for _ in 0..ROUNDS {
                let mut guard = counter.lock(curr);
                *guard += 1;
                drop(guard);
                scheduler::yield_now(curr);
            }
            tx.send(()).unwrap();
        });
        start(&task);
    }
    for _ in 0..TASKS {
        recv_soon(&rx, "mutex contender done");
    }
    assert_eq!(*counter.try_lock().unwrap(), TASKS * ROUNDS);
}

#[test]
fn wakeup_of_missing_channel_is_a_no_op() {
    let _g = serial();
    let chan = Channel::from_raw(0x11_0050);
    assert!(!sleep::wake_one(chan));
    assert_eq!(sleep::wake_all(chan), 0);
}
