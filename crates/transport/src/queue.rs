//! SampleQueue - bounded drop-oldest queue with async waiting
//!
//! Used on both ends of a connection: an outlet keeps one per consumer
//! session, an inlet keeps one receive buffer. Producers never block; when
//! the queue is full the oldest entry is discarded and counted.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a queue stopped accepting data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local teardown
    Shutdown,
    /// Remote end went away
    Lost(String),
    /// Protocol corruption
    Internal(String),
}

/// Result of waiting on a queue
#[derive(Debug, PartialEq)]
pub enum Pop<T> {
    Item(T),
    /// Nothing arrived within the window
    Empty,
    /// Drained and closed
    Closed(CloseReason),
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: Option<CloseReason>,
    dropped: u64,
}

pub struct SampleQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> SampleQueue<T> {
    /// Queue holding at most `capacity` entries (storage grows lazily)
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                closed: None,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append entries, discarding the oldest on overflow.
    ///
    /// Returns how many entries were discarded. A closed queue discards
    /// everything it is given.
    pub fn extend(&self, entries: impl IntoIterator<Item = T>) -> u64 {
        let mut dropped = 0;
        {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return entries.into_iter().count() as u64;
            }
            for entry in entries {
                if inner.items.len() >= inner.capacity {
                    inner.items.pop_front();
                    dropped += 1;
                }
                inner.items.push_back(entry);
            }
            inner.dropped += dropped;
        }
        self.notify.notify_waiters();
        dropped
    }

    pub fn push(&self, entry: T) -> u64 {
        self.extend(std::iter::once(entry))
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    /// Stop accepting entries; buffered entries stay readable.
    ///
    /// The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason);
            }
        }
        self.notify.notify_waiters();
    }

    /// Drop buffered entries and accept new ones again
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.closed = None;
    }

    /// Discard buffered entries only
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// Pop one entry, waiting up to `timeout`
    pub async fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Pop::Item(item);
                }
                if let Some(reason) = &inner.closed {
                    return Pop::Closed(reason.clone());
                }
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || tokio::time::timeout_at(deadline, notified).await.is_err()
                    {
                        return Pop::Empty;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wait until entries are available, then take up to `max` of them.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv_batch(&self, max: usize) -> Option<Vec<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if !inner.items.is_empty() {
                    let n = inner.items.len().min(max.max(1));
                    return Some(inner.items.drain(..n).collect());
                }
                if inner.closed.is_some() {
                    return None;
                }
            }

            notified.await;
        }
    }
}
