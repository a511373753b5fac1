// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded buffer between log-emitting threads and the indexer loop.
//!
//! Any number of producers push with [`BoundedEventQueue::enqueue`], which is synchronous and,
//! under [`OverflowPolicy::DropOldest`], never waits: when the queue is full the
//! longest-resident entry is evicted so the new one always wins. A single consumer pulls with
//! the async [`BoundedEventQueue::receive`], which waits at most the given timeout.
//!
//! Closing the queue turns `enqueue` into a silent no-op while still letting the consumer
//! drain whatever is buffered.

use crate::config::OverflowPolicy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
pub struct BoundedEventQueue<T> {
    entries: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Wakes the consumer when an entry is pushed or the queue is closed.
    available: Notify,
    /// Wakes producers parked under [`OverflowPolicy::BlockWithTimeout`].
    space: Condvar,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> BoundedEventQueue<T> {
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            available: Notify::new(),
            space: Condvar::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes an entry. Returns `true` when it was accepted without evicting anything,
    /// `false` when an older entry had to make room or the queue is closed.
    pub fn enqueue(&self, entry: T) -> bool {
        if self.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            if let OverflowPolicy::BlockWithTimeout(timeout) = self.policy {
                entries = self.wait_for_space(entries, timeout);
            }
        }

        let mut accepted_cleanly = true;
        if self.is_closed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        while entries.len() >= self.capacity {
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            accepted_cleanly = false;
        }
        entries.push_back(entry);
        drop(entries);

        self.available.notify_one();
        accepted_cleanly
    }

    fn wait_for_space<'a>(
        &'a self,
        entries: MutexGuard<'a, VecDeque<T>>,
        timeout: Duration,
    ) -> MutexGuard<'a, VecDeque<T>> {
        match self.space.wait_timeout_while(entries, timeout, |queue| {
            queue.len() >= self.capacity && !self.closed.load(Ordering::Acquire)
        }) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Waits up to `timeout` for an entry. Returns `None` on timeout, or immediately once
    /// the queue is closed and empty.
    pub async fn receive(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_receive() {
                return Some(entry);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn try_receive(&self) -> Option<T> {
        let entry = self.lock().pop_front();
        if entry.is_some() {
            self.space.notify_one();
        }
        entry
    }

    /// Stops accepting entries and wakes every waiter. Buffered entries stay receivable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.notify_all();
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted on overflow or refused after close.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding this lock can't leave the deque in a broken state.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
