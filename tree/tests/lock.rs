// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! Ordering guarantees of the priority lock under real thread contention.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use mktree::{Priority, PriorityRwLock};

const ENQUEUE_DELAY: Duration = Duration::from_millis(100);

fn new_lock() -> Arc<PriorityRwLock> {
    Arc::new(PriorityRwLock::new("lock-test", Duration::from_secs(30)))
}

/// Spawn a writer that records its tag once granted.
fn spawn_writer(
    lock: &Arc<PriorityRwLock>,
    order: &Arc<Mutex<Vec<&'static str>>>,
    priority: Priority,
    tag: &'static str,
) -> thread::JoinHandle<()> {
    let lock = lock.clone();
    let order = order.clone();
    thread::spawn(move || {
        assert!(lock.acquire_write(priority, None).unwrap());
        order.lock().unwrap().push(tag);
        lock.release_write().unwrap();
    })
}

#[test]
fn writers_are_granted_by_descending_priority() {
    let lock = new_lock();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(lock.acquire_write(Priority::LOW, None).unwrap());

    let mut handles = Vec::new();
    // enqueue in the order HIGH, MEDIUM, LOW while the lock is held
    for (priority, tag) in [
        (Priority::HIGH, "high"),
        (Priority::MEDIUM, "medium"),
        (Priority::LOW, "low"),
    ] {
        handles.push(spawn_writer(&lock, &order, priority, tag));
        thread::sleep(ENQUEUE_DELAY);
    }

    lock.release_write().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["high", "medium", "low"]);
}

#[test]
fn equal_priority_writers_are_granted_lifo() {
    let lock = new_lock();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());

    let mut handles = Vec::new();
    for tag in ["t1", "t2", "t3"] {
        handles.push(spawn_writer(&lock, &order, Priority::MEDIUM, tag));
        thread::sleep(ENQUEUE_DELAY);
    }

    lock.release_write().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    // most recently arrived first
    assert_eq!(*order.lock().unwrap(), vec!["t3", "t2", "t1"]);
}

#[test]
fn priority_beats_arrival_order_across_levels() {
    let lock = new_lock();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(lock.acquire_write(Priority::HIGH, None).unwrap());

    let mut handles = Vec::new();
    // arrival order LOW, MEDIUM, LOW, HIGH; grant order must be HIGH, MEDIUM, then the LOWs LIFO
    for (priority, tag) in [
        (Priority::LOW, "low-1"),
        (Priority::MEDIUM, "medium"),
        (Priority::LOW, "low-2"),
        (Priority::HIGH, "high"),
    ] {
        handles.push(spawn_writer(&lock, &order, priority, tag));
        thread::sleep(ENQUEUE_DELAY);
    }

    lock.release_write().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["high", "medium", "low-2", "low-1"]);
}

#[test]
fn queued_writer_is_granted_before_a_higher_priority_reader() {
    let lock = new_lock();
    let order = Arc::new(Mutex::new(Vec::new()));

    assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());

    let writer = spawn_writer(&lock, &order, Priority::LOW, "writer");
    thread::sleep(ENQUEUE_DELAY);

    let reader = {
        let lock = lock.clone();
        let order = order.clone();
        thread::spawn(move || {
            assert!(lock.acquire_read(Priority::HIGH, None).unwrap());
            order.lock().unwrap().push("reader");
            lock.release_read().unwrap();
        })
    };
    thread::sleep(ENQUEUE_DELAY);

    lock.release_write().unwrap();
    writer.join().unwrap();
    reader.join().unwrap();
    // writer preference: the queued writer goes first even though the reader outranks it
    assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);
}

#[test]
fn readers_drain_concurrently_once_writers_are_done() {
    let lock = new_lock();
    assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());

    let mut handles = Vec::new();
    let concurrent = Arc::new(Mutex::new((0usize, 0usize))); // (current, max)
    for _ in 0..4 {
        let lock = lock.clone();
        let concurrent = concurrent.clone();
        handles.push(thread::spawn(move || {
            assert!(lock.acquire_read(Priority::MEDIUM, None).unwrap());
            {
                let mut state = concurrent.lock().unwrap();
                state.0 += 1;
                state.1 = state.1.max(state.0);
            }
            thread::sleep(Duration::from_millis(100));
            concurrent.lock().unwrap().0 -= 1;
            lock.release_read().unwrap();
        }));
    }
    thread::sleep(ENQUEUE_DELAY);

    lock.release_write().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    let (current, max) = *concurrent.lock().unwrap();
    assert_eq!(current, 0);
    assert!(max > 1, "readers never overlapped");
}
