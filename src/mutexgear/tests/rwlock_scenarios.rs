//! End-to-end scenarios for the read-write locks.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mutexgear::{LockGear, RwLock, TrdlRwLock};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// With writer priority claimed immediately, a newly arriving reader is
/// diverted behind the blocked writer even while the original readers still
/// hold their locks.
#[test]
fn writer_priority_diverts_new_readers() {
    init_logging();

    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new(None).unwrap()));
    static WRITE_RAN: AtomicBool = AtomicBool::new(false);
    static LATE_READER_RAN: AtomicBool = AtomicBool::new(false);

    let (in_send, in_recv) = mpsc::channel();
    let mut holders = Vec::new();
    let mut releases = Vec::new();
    for _ in 0..4 {
        let in_send = in_send.clone();
        let (release_send, release_recv) = mpsc::channel::<()>();
        releases.push(release_send);
        holders.push(thread::spawn(move || {
            let mut gear = LockGear::new(None).unwrap();
            lock.read(&mut gear, || {
                in_send.send(()).unwrap();
                release_recv.recv().unwrap();
            })
            .unwrap();
        }));
    }
    for _ in 0..4 {
        in_recv.recv().unwrap();
    }

    let writer = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        // `readers_till_wp == 0`: claim writer priority on entry.
        lock.write_cwp(&mut gear, 0, || {
            WRITE_RAN.store(true, Ordering::Relaxed);
        })
        .unwrap();
    });
    // Let the writer park on its channel and claim priority.
    thread::sleep(Duration::from_millis(50));

    let late_reader = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        lock.read(&mut gear, || {
            // The diverted reader is admitted only once the writer is done.
            assert!(WRITE_RAN.load(Ordering::Relaxed));
            LATE_READER_RAN.store(true, Ordering::Relaxed);
        })
        .unwrap();
    });
    thread::sleep(Duration::from_millis(50));
    assert!(!WRITE_RAN.load(Ordering::Relaxed));
    assert!(!LATE_READER_RAN.load(Ordering::Relaxed));

    for release in releases {
        release.send(()).unwrap();
    }
    for holder in holders {
        holder.join().unwrap();
    }
    writer.join().unwrap();
    late_reader.join().unwrap();
    assert!(LATE_READER_RAN.load(Ordering::Relaxed));
}

/// The try-read interaction matrix: try-write fails against a reader,
/// try-read coexists with readers, and a blocked writer turns try-reads
/// away.
#[test]
fn tryread_obeys_writer_priority() {
    init_logging();

    let lock: &'static TrdlRwLock = Box::leak(Box::new(TrdlRwLock::new(None).unwrap()));

    // Reader 1 takes and holds a normal read lock.
    let (r1_in_send, r1_in_recv) = mpsc::channel();
    let (r1_release_send, r1_release_recv) = mpsc::channel::<()>();
    let r1 = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        lock.read(&mut gear, || {
            r1_in_send.send(()).unwrap();
            r1_release_recv.recv().unwrap();
        })
        .unwrap();
    });
    r1_in_recv.recv().unwrap();

    // Writer 1: try-lock fails against the reader.
    assert_eq!(lock.try_wr_lock(), Err(mutexgear::Error::Busy));

    // Reader 2: a try-read succeeds alongside the normal reader.
    let (r2_in_send, r2_in_recv) = mpsc::channel();
    let (r2_release_send, r2_release_recv) = mpsc::channel::<()>();
    let r2 = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        let admitted = lock
            .try_read(&mut gear, || {
                r2_in_send.send(()).unwrap();
                r2_release_recv.recv().unwrap();
            })
            .unwrap();
        assert!(admitted.is_some());
    });
    r2_in_recv.recv().unwrap();

    // Writer 2 blocks waiting for both readers.
    static WRITE_RAN: AtomicBool = AtomicBool::new(false);
    let w2 = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        lock.write(&mut gear, || {
            WRITE_RAN.store(true, Ordering::Relaxed);
        })
        .unwrap();
    });
    thread::sleep(Duration::from_millis(50));
    assert!(!WRITE_RAN.load(Ordering::Relaxed));

    // Reader 3: the pending writer turns the try-read away.
    let mut gear3 = LockGear::new(None).unwrap();
    assert!(lock.try_read(&mut gear3, || ()).unwrap().is_none());

    r1_release_send.send(()).unwrap();
    r2_release_send.send(()).unwrap();
    r1.join().unwrap();
    r2.join().unwrap();
    w2.join().unwrap();
    assert!(WRITE_RAN.load(Ordering::Relaxed));
}

/// The shared/exclusive invariant holds under concurrent load across the
/// writer-priority spectrum.
#[test]
fn shared_exclusive_invariant_under_load() {
    init_logging();

    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new(None).unwrap()));
    static READERS_ACTIVE: AtomicUsize = AtomicUsize::new(0);
    static WRITERS_ACTIVE: AtomicUsize = AtomicUsize::new(0);

    let mut threads = Vec::new();
    for (index, readers_till_wp) in [(-1i32), 0, 2].into_iter().enumerate() {
        threads.push(thread::spawn(move || {
            let mut gear = LockGear::new(None).unwrap();
            for round in 0..30usize {
                lock.write_cwp(&mut gear, readers_till_wp, || {
                    assert_eq!(WRITERS_ACTIVE.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(READERS_ACTIVE.load(Ordering::SeqCst), 0);
                    if (round + index) % 4 == 0 {
                        thread::yield_now();
                    }
                    WRITERS_ACTIVE.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }));
    }
    for _ in 0..6 {
        threads.push(thread::spawn(move || {
            let mut gear = LockGear::new(None).unwrap();
            for round in 0..100 {
                lock.read(&mut gear, || {
                    READERS_ACTIVE.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(WRITERS_ACTIVE.load(Ordering::SeqCst), 0);
                    if round % 16 == 0 {
                        thread::yield_now();
                    }
                    READERS_ACTIVE.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    // Everything drained: an uncontended try-write must succeed.
    assert_eq!(lock.try_write(|| ()).unwrap(), Some(()));
}

/// Same load test over the try-read variant, with try operations mixed in.
#[test]
fn trdl_invariant_under_load() {
    init_logging();

    let lock: &'static TrdlRwLock = Box::leak(Box::new(TrdlRwLock::new(None).unwrap()));
    static READERS_ACTIVE: AtomicUsize = AtomicUsize::new(0);
    static WRITERS_ACTIVE: AtomicUsize = AtomicUsize::new(0);

    let mut threads = Vec::new();
    for _ in 0..2 {
        threads.push(thread::spawn(move || {
            let mut gear = LockGear::new(None).unwrap();
            for _ in 0..20 {
                lock.write(&mut gear, || {
                    assert_eq!(WRITERS_ACTIVE.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(READERS_ACTIVE.load(Ordering::SeqCst), 0);
                    WRITERS_ACTIVE.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }));
    }
    for _ in 0..4 {
        threads.push(thread::spawn(move || {
            let mut gear = LockGear::new(None).unwrap();
            for round in 0..60 {
                let body = || {
                    READERS_ACTIVE.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(WRITERS_ACTIVE.load(Ordering::SeqCst), 0);
                    READERS_ACTIVE.fetch_sub(1, Ordering::SeqCst);
                };
                if round % 3 == 0 {
                    // Refusals are expected while writers queue up.
                    let _ = lock.try_read(&mut gear, body).unwrap();
                } else {
                    lock.read(&mut gear, body).unwrap();
                }
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(lock.try_write(|| ()).unwrap(), Some(()));
}

/// Boundary behavior: an uncontended try-write succeeds, and exactly one
/// held reader makes it refuse.
#[test]
fn try_write_boundaries() {
    init_logging();

    let lock = RwLock::new(None).unwrap();
    let mut gear = LockGear::new(None).unwrap();

    assert_eq!(lock.try_write(|| 1).unwrap(), Some(1));
    lock.read(&mut gear, || {
        assert_eq!(lock.try_write(|| 1).unwrap(), None);
    })
    .unwrap();
    assert_eq!(lock.try_write(|| 2).unwrap(), Some(2));
}

/// In reader-friendly mode (`readers_till_wp < 0`) a waiting writer never
/// claims priority, so a late reader is admitted ahead of it.
#[test]
fn reader_friendly_mode_admits_new_readers() {
    init_logging();

    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new(None).unwrap()));
    static WRITE_RAN: AtomicBool = AtomicBool::new(false);

    let (in_send, in_recv) = mpsc::channel();
    let (release_send, release_recv) = mpsc::channel::<()>();
    let holder = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        lock.read(&mut gear, || {
            in_send.send(()).unwrap();
            release_recv.recv().unwrap();
        })
        .unwrap();
    });
    in_recv.recv().unwrap();

    let writer = thread::spawn(move || {
        let mut gear = LockGear::new(None).unwrap();
        lock.write_cwp(&mut gear, -1, || {
            WRITE_RAN.store(true, Ordering::Relaxed);
        })
        .unwrap();
    });
    thread::sleep(Duration::from_millis(50));

    // The late reader shares the lock with the holder instead of being
    // diverted behind the writer.
    let mut gear = LockGear::new(None).unwrap();
    lock.read(&mut gear, || {
        assert!(!WRITE_RAN.load(Ordering::Relaxed));
    })
    .unwrap();
    assert!(!WRITE_RAN.load(Ordering::Relaxed));

    release_send.send(()).unwrap();
    holder.join().unwrap();
    writer.join().unwrap();
    assert!(WRITE_RAN.load(Ordering::Relaxed));
}

/// The explicit item-passing layer: thread-local worker/waiter/item objects
/// live on the stack for exactly the lock-to-unlock span.
#[test]
fn raw_item_api_round_trip() {
    use mutexgear::{CompletionItem, CompletionWaiter, CompletionWorker};

    init_logging();

    let lock: &'static RwLock = Box::leak(Box::new(RwLock::new(None).unwrap()));
    static READER_DONE: AtomicBool = AtomicBool::new(false);

    let (in_send, in_recv) = mpsc::channel();
    let reader = thread::spawn(move || {
        let worker = CompletionWorker::new(None).unwrap();
        worker.lock().unwrap();
        let waiter = CompletionWaiter::new(None).unwrap();
        let item = CompletionItem::new(None).unwrap();

        unsafe { lock.rd_lock(&worker, &waiter, &item) }.unwrap();
        in_send.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        READER_DONE.store(true, Ordering::Relaxed);
        unsafe { lock.rd_unlock(&worker, &item) }.unwrap();
        worker.unlock().unwrap();
    });

    in_recv.recv().unwrap();
    let worker = CompletionWorker::new(None).unwrap();
    worker.lock().unwrap();
    let waiter = CompletionWaiter::new(None).unwrap();
    let item = CompletionItem::new(None).unwrap();

    unsafe { lock.wr_lock(&worker, &waiter, &item) }.unwrap();
    assert!(READER_DONE.load(Ordering::Relaxed));
    lock.wr_unlock().unwrap();

    lock.try_wr_lock().unwrap();
    lock.wr_unlock().unwrap();

    worker.unlock().unwrap();
    reader.join().unwrap();
}
