//! Coalescing keyed work queue.
//!
//! At most one value per key is ever pending. Adding a value for a key that
//! is already pending replaces the stored value but keeps the key's original
//! position, so consumers always see the freshest value in first-insertion
//! order.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<K, V> {
    order: VecDeque<K>,
    values: HashMap<K, V>,
}

/// Keyed queue with at-most-one-pending-value-per-key semantics.
///
/// `add` never blocks and never fails. `remove` suspends until a value is
/// available. The queue is unbounded in the number of distinct keys.
pub struct KeyedQueue<K, V> {
    inner: Mutex<Inner<K, V>>,
    notify: Notify,
}

impl<K, V> KeyedQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                values: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Adds `value` under `key`, replacing any pending value for that key.
    pub fn add(&self, key: K, value: V) {
        {
            let mut inner = self.inner.lock();
            if inner.values.insert(key.clone(), value).is_none() {
                inner.order.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Removes and returns the oldest pending value, if any.
    pub fn try_remove(&self) -> Option<V> {
        let mut inner = self.inner.lock();
        while let Some(key) = inner.order.pop_front() {
            if let Some(value) = inner.values.remove(&key) {
                return Some(value);
            }
        }
        None
    }

    /// Waits for a pending value, then removes and returns the oldest one.
    pub async fn remove(&self) -> V {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.try_remove() {
                // Pass the wakeup on if more work remains for other consumers.
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return value;
            }
            notified.await;
        }
    }

    /// Returns the number of pending keys.
    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for KeyedQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
