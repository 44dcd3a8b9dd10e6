//! End-to-end scenarios for the toggle and wheel signaling rings.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use mutexgear::{Toggle, Wheel};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The signaler flips 100 times, the waiter pushes on 100 times; each
/// push-on returns only after its matched flip. The ack channel provides
/// the external coordination the toggle contract requires between flips.
#[test]
fn toggle_ping_pong() {
    init_logging();
    const ROUNDS: usize = 100;

    let toggle = Arc::new(Toggle::new(None).unwrap());
    let flips_done = Arc::new(AtomicUsize::new(0));
    let (ack_send, ack_recv) = mpsc::channel();

    toggle.engage().unwrap();

    let waiter = {
        let toggle = Arc::clone(&toggle);
        let flips_done = Arc::clone(&flips_done);
        thread::spawn(move || {
            for round in 1..=ROUNDS {
                toggle.push_on().unwrap();
                // The matched flip must have completed by now.
                assert!(flips_done.load(Ordering::Relaxed) >= round);
                ack_send.send(()).unwrap();
            }
        })
    };

    for round in 1..=ROUNDS {
        flips_done.store(round, Ordering::Relaxed);
        toggle.flip().unwrap();
        // Wait for the push-on before flipping again.
        ack_recv.recv().unwrap();
    }

    waiter.join().unwrap();
    toggle.disengage().unwrap();
}

/// A gripped client turns the wheel until the signaled state reaches its
/// target, one turn per advance.
#[test]
fn wheel_wait_for_state() {
    init_logging();

    let wheel = Arc::new(Wheel::new(None).unwrap());
    let state = Arc::new(AtomicUsize::new(0));
    let (gripped_send, gripped_recv) = mpsc::channel();

    wheel.engage().unwrap();

    let client = {
        let wheel = Arc::clone(&wheel);
        let state = Arc::clone(&state);
        thread::spawn(move || {
            wheel.grip_on().unwrap();
            gripped_send.send(()).unwrap();
            let mut turns = 0usize;
            while state.load(Ordering::Relaxed) != 42 {
                wheel.turn().unwrap();
                turns += 1;
            }
            wheel.release().unwrap();
            turns
        })
    };

    gripped_recv.recv().unwrap();
    state.store(1, Ordering::Relaxed);
    wheel.advance().unwrap();
    state.store(42, Ordering::Relaxed);
    wheel.advance().unwrap();

    let turns = client.join().unwrap();
    assert!(turns <= 2, "client took {turns} turns for two advances");
    wheel.disengage().unwrap();
}

/// The wheel can stand in for a toggle while no client grips it.
#[test]
fn wheel_toggle_compatibility() {
    init_logging();
    const ROUNDS: usize = 20;

    let wheel = Arc::new(Wheel::new(None).unwrap());
    let (ack_send, ack_recv) = mpsc::channel();
    wheel.engage().unwrap();

    let waiter = {
        let wheel = Arc::clone(&wheel);
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                wheel.push_on().unwrap();
                ack_send.send(()).unwrap();
            }
        })
    };

    for _ in 0..ROUNDS {
        wheel.advance().unwrap();
        ack_recv.recv().unwrap();
    }

    waiter.join().unwrap();
    wheel.disengage().unwrap();
}

/// A disengaged toggle can be re-engaged and used again; the waiter side
/// restarts in step.
#[test]
fn toggle_reengage() {
    init_logging();

    let toggle = Arc::new(Toggle::new(None).unwrap());
    for _ in 0..2 {
        toggle.engage().unwrap();
        let toggle2 = Arc::clone(&toggle);
        let waiter = thread::spawn(move || {
            toggle2.push_on().unwrap();
        });
        // Give the waiter a chance to block first.
        thread::sleep(Duration::from_millis(20));
        toggle.flip().unwrap();
        waiter.join().unwrap();
        toggle.disengage().unwrap();
    }
}
