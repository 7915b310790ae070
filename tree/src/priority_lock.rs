// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! A priority-based reentrant read-write lock.
//!
//! Acquisitions carry a numeric priority; among waiting writers the lock is granted to the
//! highest priority first, and within the same priority to the most recent request (LIFO).
//! Writers are preferred: while any write request waits, new shared requests (other than
//! reentrant holds) are not granted. All blocking acquires accept a timeout, and an acquisition
//! that blocked for longer than the configured unhealthy threshold is logged.

use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, MutexGuard},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use log::*;
use thiserror::Error;

const LOG_TARGET: &str = "mktree::lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock misuse: {0}")]
    Misuse(String),
    #[error("The lock state was poisoned by a panicking holder")]
    Poisoned,
}

/// Urgency of a lock acquisition. Higher levels are granted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGH: Priority = Priority(10);
    pub const LOW: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(5);

    pub const fn new(level: u8) -> Priority {
        Priority(level)
    }

    pub const fn level(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

#[derive(Debug)]
struct Waiter {
    thread: ThreadId,
    priority: Priority,
    order: u64,
    is_write: bool,
}

#[derive(Debug, Default)]
struct State {
    active_readers: usize,
    read_holds: HashMap<ThreadId, usize>,
    write_owner: Option<ThreadId>,
    write_hold_count: usize,
    waiters: Vec<Waiter>,
    next_order: u64,
}

impl State {
    fn enqueue(&mut self, thread: ThreadId, priority: Priority, is_write: bool) -> u64 {
        self.next_order += 1;
        let order = self.next_order;
        self.waiters.push(Waiter {
            thread,
            priority,
            order,
            is_write,
        });
        order
    }

    fn remove_waiter(&mut self, order: u64) {
        self.waiters.retain(|w| w.order != order);
    }

    /// The write waiter that must be granted next: highest priority, most recent arrival within
    /// a priority.
    fn best_write_waiter(&self) -> Option<u64> {
        self.waiters
            .iter()
            .filter(|w| w.is_write)
            .max_by_key(|w| (w.priority, w.order))
            .map(|w| w.order)
    }

    fn can_grant_read(&self, thread: ThreadId) -> bool {
        if self.write_owner.is_some() && self.write_owner != Some(thread) {
            return false;
        }
        // writer preference: any queued writer blocks new shared grants
        !self.waiters.iter().any(|w| w.is_write && w.thread != thread)
    }

    fn can_grant_write(&self) -> bool {
        self.write_owner.is_none() && self.active_readers == 0
    }

    fn grant_read(&mut self, thread: ThreadId) {
        self.active_readers += 1;
        *self.read_holds.entry(thread).or_insert(0) += 1;
    }

    fn grant_write(&mut self, thread: ThreadId) {
        self.write_owner = Some(thread);
        self.write_hold_count = 1;
    }
}

/// A reentrant shared/exclusive lock with priority queuing. See the module docs for the grant
/// rules.
pub struct PriorityRwLock {
    name: String,
    unhealthy_wait: Duration,
    state: Mutex<State>,
    cond: Condvar,
}

impl PriorityRwLock {
    pub fn new(name: &str, unhealthy_wait: Duration) -> Self {
        Self {
            name: name.to_string(),
            unhealthy_wait,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, LockError> {
        self.state.lock().map_err(|_| LockError::Poisoned)
    }

    /// Acquire the shared lock. Returns `Ok(false)` if `timeout` elapsed before the lock could
    /// be granted; the request leaves no trace in that case.
    pub fn acquire_read(&self, priority: Priority, timeout: Option<Duration>) -> Result<bool, LockError> {
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let mut state = self.state()?;
        // reentrant shared hold
        if state.read_holds.contains_key(&me) {
            state.grant_read(me);
            return Ok(true);
        }
        if state.can_grant_read(me) {
            state.grant_read(me);
            return Ok(true);
        }

        let order = state.enqueue(me, priority, false);
        loop {
            if state.can_grant_read(me) {
                state.remove_waiter(order);
                state.grant_read(me);
                drop(state);
                self.log_if_unhealthy("acquire_read_lock", started);
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.remove_waiter(order);
                        drop(state);
                        self.cond.notify_all();
                        return Ok(false);
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| LockError::Poisoned)?;
                    state = guard;
                },
                None => {
                    state = self.cond.wait(state).map_err(|_| LockError::Poisoned)?;
                },
            }
        }
    }

    /// Acquire the exclusive lock. A thread already holding the exclusive lock reacquires it
    /// reentrantly; a thread holding only the shared lock cannot upgrade and fails with
    /// `LockError::Misuse`. Returns `Ok(false)` on timeout.
    pub fn acquire_write(&self, priority: Priority, timeout: Option<Duration>) -> Result<bool, LockError> {
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let mut state = self.state()?;
        if state.write_owner == Some(me) {
            state.write_hold_count += 1;
            return Ok(true);
        }
        if state.read_holds.contains_key(&me) {
            return Err(LockError::Misuse(
                "shared to exclusive upgrade is not supported".to_string(),
            ));
        }

        let order = state.enqueue(me, priority, true);
        loop {
            if state.can_grant_write() && state.best_write_waiter() == Some(order) {
                state.remove_waiter(order);
                state.grant_write(me);
                drop(state);
                self.log_if_unhealthy("acquire_write_lock", started);
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.remove_waiter(order);
                        drop(state);
                        // our departure may unblock queued readers
                        self.cond.notify_all();
                        return Ok(false);
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| LockError::Poisoned)?;
                    state = guard;
                },
                None => {
                    state = self.cond.wait(state).map_err(|_| LockError::Poisoned)?;
                },
            }
        }
    }

    /// Attempt to take the exclusive lock without blocking. The queue is honoured: the attempt
    /// succeeds only if there is no holder and no request is waiting.
    pub fn try_acquire_write(&self) -> Result<bool, LockError> {
        let me = thread::current().id();
        let mut state = self.state()?;
        if state.write_owner == Some(me) {
            state.write_hold_count += 1;
            return Ok(true);
        }
        if state.can_grant_write() && state.waiters.is_empty() {
            state.grant_write(me);
            return Ok(true);
        }
        Ok(false)
    }

    /// Release one shared hold of the calling thread.
    pub fn release_read(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state()?;
        let count = state
            .read_holds
            .get_mut(&me)
            .ok_or_else(|| LockError::Misuse("current thread does not hold the read lock".to_string()))?;
        *count -= 1;
        if *count == 0 {
            state.read_holds.remove(&me);
        }
        state.active_readers -= 1;
        if state.active_readers == 0 {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Release one exclusive hold of the calling thread.
    pub fn release_write(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state()?;
        match state.write_owner {
            None => {
                return Err(LockError::Misuse(
                    "write lock is not held by any thread".to_string(),
                ))
            },
            Some(owner) if owner != me => {
                return Err(LockError::Misuse(
                    "current thread does not hold the write lock".to_string(),
                ))
            },
            Some(_) => {},
        }
        state.write_hold_count -= 1;
        if state.write_hold_count == 0 {
            state.write_owner = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Acquire the shared lock with no timeout, returning a guard that releases on drop.
    pub fn read(&self, priority: Priority) -> Result<ReadGuard<'_>, LockError> {
        self.acquire_read(priority, None)?;
        Ok(ReadGuard { lock: self })
    }

    /// Acquire the exclusive lock with no timeout, returning a guard that releases on drop.
    pub fn write(&self, priority: Priority) -> Result<WriteGuard<'_>, LockError> {
        self.acquire_write(priority, None)?;
        Ok(WriteGuard { lock: self })
    }

    /// The number of shared holds currently outstanding, over all threads.
    pub fn read_lock_count(&self) -> usize {
        self.state().map(|s| s.active_readers).unwrap_or(0)
    }

    /// The reentrant hold count of the exclusive lock.
    pub fn write_hold_count(&self) -> usize {
        self.state().map(|s| s.write_hold_count).unwrap_or(0)
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.state().map(|s| s.write_owner == Some(me)).unwrap_or(false)
    }

    fn log_if_unhealthy(&self, op: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= self.unhealthy_wait {
            error!(
                target: LOG_TARGET,
                "({}) {} took {} ms",
                self.name,
                op,
                elapsed.as_millis()
            );
        }
    }
}

pub struct ReadGuard<'a> {
    lock: &'a PriorityRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release_read() {
            error!(target: LOG_TARGET, "({}) read guard release failed: {}", self.lock.name, e);
        }
    }
}

pub struct WriteGuard<'a> {
    lock: &'a PriorityRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release_write() {
            error!(target: LOG_TARGET, "({}) write guard release failed: {}", self.lock.name, e);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    fn new_lock() -> PriorityRwLock {
        PriorityRwLock::new("test", Duration::from_secs(5))
    }

    #[test]
    fn read_lock_is_reentrant_per_thread() {
        let lock = new_lock();
        assert!(lock.acquire_read(Priority::MEDIUM, None).unwrap());
        assert!(lock.acquire_read(Priority::LOW, None).unwrap());
        assert_eq!(lock.read_lock_count(), 2);
        lock.release_read().unwrap();
        lock.release_read().unwrap();
        assert_eq!(lock.read_lock_count(), 0);
    }

    #[test]
    fn write_lock_is_reentrant() {
        let lock = new_lock();
        assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());
        assert!(lock.acquire_write(Priority::HIGH, None).unwrap());
        assert!(lock.is_write_locked_by_current_thread());
        assert_eq!(lock.write_hold_count(), 2);
        lock.release_write().unwrap();
        assert_eq!(lock.write_hold_count(), 1);
        lock.release_write().unwrap();
        assert!(!lock.is_write_locked_by_current_thread());
    }

    #[test]
    fn release_without_hold_is_misuse() {
        let lock = new_lock();
        assert!(matches!(lock.release_read(), Err(LockError::Misuse(_))));
        assert!(matches!(lock.release_write(), Err(LockError::Misuse(_))));
    }

    #[test]
    fn release_write_from_other_thread_is_misuse() {
        let lock = Arc::new(new_lock());
        assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());
        let other = lock.clone();
        let res = thread::spawn(move || other.release_write()).join().unwrap();
        assert!(matches!(res, Err(LockError::Misuse(_))));
        lock.release_write().unwrap();
    }

    #[test]
    fn upgrade_is_rejected() {
        let lock = new_lock();
        assert!(lock.acquire_read(Priority::MEDIUM, None).unwrap());
        assert!(matches!(
            lock.acquire_write(Priority::HIGH, Some(Duration::from_millis(10))),
            Err(LockError::Misuse(_))
        ));
        lock.release_read().unwrap();
    }

    #[test]
    fn write_holder_may_take_read_reentrantly() {
        let lock = new_lock();
        assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());
        assert!(lock.acquire_read(Priority::MEDIUM, None).unwrap());
        lock.release_read().unwrap();
        lock.release_write().unwrap();
    }

    #[test]
    fn write_acquire_times_out_without_side_effects() {
        let lock = Arc::new(new_lock());
        assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());

        let contender = lock.clone();
        let acquired = thread::spawn(move || {
            contender
                .acquire_write(Priority::HIGH, Some(Duration::from_millis(50)))
                .unwrap()
        })
        .join()
        .unwrap();
        assert!(!acquired);

        // the timed-out request left the queue; a fresh reader proceeds once the writer is gone
        lock.release_write().unwrap();
        assert!(lock.acquire_read(Priority::LOW, Some(Duration::from_millis(50))).unwrap());
        lock.release_read().unwrap();
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let lock = Arc::new(new_lock());
        assert!(lock.acquire_write(Priority::LOW, None).unwrap());

        let writer = lock.clone();
        let handle = thread::spawn(move || {
            assert!(writer.acquire_write(Priority::LOW, None).unwrap());
            writer.release_write().unwrap();
        });
        // give the queued writer time to enqueue
        thread::sleep(Duration::from_millis(50));

        let reader = lock.clone();
        let read_denied = thread::spawn(move || {
            !reader
                .acquire_read(Priority::HIGH, Some(Duration::from_millis(50)))
                .unwrap()
        })
        .join()
        .unwrap();
        assert!(read_denied);

        lock.release_write().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn try_acquire_write_fails_against_any_holder() {
        let lock = Arc::new(new_lock());
        assert!(lock.try_acquire_write().unwrap());
        // reentrant try succeeds
        assert!(lock.try_acquire_write().unwrap());
        lock.release_write().unwrap();
        lock.release_write().unwrap();

        assert!(lock.acquire_read(Priority::MEDIUM, None).unwrap());
        let other = lock.clone();
        assert!(!thread::spawn(move || other.try_acquire_write().unwrap()).join().unwrap());
        lock.release_read().unwrap();

        assert!(lock.acquire_write(Priority::MEDIUM, None).unwrap());
        let other = lock.clone();
        assert!(!thread::spawn(move || other.try_acquire_write().unwrap()).join().unwrap());
        lock.release_write().unwrap();
    }

    #[test]
    fn try_acquire_write_is_denied_while_the_queue_is_populated() {
        // white-box: a free lock with a queued write request must refuse a best-effort grab
        let lock = new_lock();
        {
            let mut state = lock.state().unwrap();
            state.enqueue(thread::current().id(), Priority::LOW, true);
        }
        assert!(!lock.try_acquire_write().unwrap());
        {
            let mut state = lock.state().unwrap();
            state.waiters.clear();
        }
        assert!(lock.try_acquire_write().unwrap());
        lock.release_write().unwrap();
    }

    #[test]
    fn multiple_readers_share_the_lock() {
        let lock = Arc::new(new_lock());
        assert!(lock.acquire_read(Priority::MEDIUM, None).unwrap());
        let other = lock.clone();
        let acquired = thread::spawn(move || {
            let ok = other.acquire_read(Priority::MEDIUM, Some(Duration::from_millis(100))).unwrap();
            if ok {
                other.release_read().unwrap();
            }
            ok
        })
        .join()
        .unwrap();
        assert!(acquired);
        lock.release_read().unwrap();
    }
}
