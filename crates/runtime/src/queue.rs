//! Bounded handoff queue between the transport reader and event consumers.
//!
//! The reader must never block on a slow consumer, so pushes are
//! non-blocking: when the queue is full the oldest entry is discarded and a
//! drop counter incremented. Designed for a single consumer per queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

/// Default queue capacity.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Drop-oldest bounded queue of event payloads.
pub struct EventQueue {
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
    capacity: usize,
    drops: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            drops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking push; evicts the oldest entry when full.
    pub fn push(&self, value: Value) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                self.drops.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(value);
        }
        self.notify.notify_one();
    }

    /// Awaits the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Value> {
        loop {
            if let Some(value) = self.items.lock().pop_front() {
                return Some(value);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between the check above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Events evicted because the queue was full.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Closes the queue; pending and future `pop` calls drain then end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
