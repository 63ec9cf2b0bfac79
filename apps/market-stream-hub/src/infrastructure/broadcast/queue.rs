//! Bounded per-session outbound queue with drop-oldest backpressure.
//!
//! Producers never wait: a push into a full queue evicts exactly one
//! oldest message first. The consumer (the transport) awaits [`SessionQueue::pop`].

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::streaming::SharedMessage;

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Message appended with room to spare.
    Enqueued,
    /// Queue was full; the oldest message was evicted to make room.
    EvictedOldest,
}

/// Push into a queue that has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session queue is closed")]
pub struct QueueClosed;

#[derive(Debug)]
struct QueueState {
    items: VecDeque<SharedMessage>,
    closed: bool,
    evicted: u64,
}

/// Outbound queue of one session.
#[derive(Debug)]
pub struct SessionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SessionQueue {
    /// Create an open queue. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                evicted: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Append `message`, evicting the oldest item when full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] once the queue has been released.
    pub fn push(&self, message: SharedMessage) -> Result<PushOutcome, QueueClosed> {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            let outcome = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.evicted += 1;
                PushOutcome::EvictedOldest
            } else {
                PushOutcome::Enqueued
            };
            state.items.push_back(message);
            outcome
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Take the oldest message without waiting.
    pub fn try_pop(&self) -> Option<SharedMessage> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<SharedMessage> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Close the queue and discard everything buffered.
    ///
    /// Returns the number of discarded messages. Idempotent.
    pub fn close_and_drain(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained = state.items.len();
            state.items.clear();
            drained
        };
        self.notify.notify_waiters();
        drained
    }

    /// Whether the queue has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Buffered message count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Maximum buffered message count.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted by backpressure over the queue's lifetime.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }
}
