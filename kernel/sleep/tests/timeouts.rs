//! Sleep-timeout behavior, driven by explicit virtual ticks.

mod common;

use std::sync::mpsc;

use common::*;
use sleep::{SleepRequest, WaitError};
use task_struct::{Channel, TaskOptions};

#[test]
fn timeout_fires_at_its_deadline() {
    let _g = serial();
    let chan = Channel::from_raw(0x22_0010);
    let (tx, rx) = mpsc::channel();

    let sleeper = spawn_task("timed", TaskOptions::default(), move |curr| {
        let entered = time::now_ticks();
        let req = SleepRequest::new(chan, "timed_wait").timeout_ticks(10);
        let res = sleep::block(curr, &req);
        tx.send((entered, time::now_ticks(), res)).unwrap();
    });
    start(&sleeper);
    wait_until_sleeping(&sleeper);

    advance_ticks(9);
    assert!(rx.try_recv().is_err(), "woke before its deadline");
    advance_ticks(3);

    let (entered, returned, res) = recv_soon(&rx, "timed sleeper");
    assert_eq!(res, Err(WaitError::Timeout));
    let elapsed = returned - entered;
    assert!((10..=12).contains(&elapsed), "woke after {} ticks", elapsed);
    wait_until_exited(&sleeper);
}

#[test]
fn pause_ends_by_timeout() {
    let _g = serial();
    let (tx, rx) = mpsc::channel();

    let napper = spawn_task("napper", TaskOptions::default(), move |curr| {
        tx.send(sleep::pause(curr, "nap", 5)).unwrap();
    });
    start(&napper);
    wait_until_sleeping(&napper);
    advance_ticks(7);
    // A pause has no wake channel; the timeout is its normal ending.
    assert_eq!(recv_soon(&rx, "napper"), Err(WaitError::Timeout));
    wait_until_exited(&napper);
}

#[test]
fn normal_wakeup_cancels_the_timeout() {
    let _g = serial();
    let chan = Channel::from_raw(0x22_0020);
    let (tx, rx) = mpsc::channel();

    let sleeper = spawn_task("two_sleeps", TaskOptions::default(), move |curr| {
        // First sleep: generous timeout, woken long before it.
        let req = SleepRequest::new(chan, "first").timeout_ticks(50);
        tx.send(sleep::block(curr, &req)).unwrap();
        // Second sleep on the same channel, no timeout: the first
        // sleep's (cancelled, and in any case stale) timeout must not
        // end this one.
        tx.send(sleep::block(curr, &SleepRequest::new(chan, "second")))
            .unwrap();
    });
    start(&sleeper);
    wait_until_sleeping(&sleeper);

    assert!(sleep::wake_one(chan));
    assert_eq!(recv_soon(&rx, "first sleep"), Ok(()));

    wait_until_sleeping(&sleeper);
    advance_ticks(60);
    assert!(rx.try_recv().is_err(), "stale timeout ended the second sleep");

    assert!(sleep::wake_one(chan));
    assert_eq!(recv_soon(&rx, "second sleep"), Ok(()));
    wait_until_exited(&sleeper);
}
