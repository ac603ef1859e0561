//! Thread-safe FIFO with blocking pop. Producers never block; a bounded queue drops instead.

use std::collections::VecDeque;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{EdgeError, Result};

/// What a full queue discards.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum DropPolicy {
    /// Keep what is queued; discard the item being pushed.
    #[default]
    New,
    /// Discard the oldest queued item to make room.
    Old,
}

/// Bound and drop policy. `max_len == 0` means unbounded.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct QueueLimit {
    pub max_len: usize,
    pub policy: DropPolicy,
}

impl FromStr for QueueLimit {
    type Err = EdgeError;

    /// `N`, `N:NEW` or `N:OLD` (case-insensitive).
    fn from_str(s: &str) -> Result<Self> {
        let (len, policy) = match s.split_once(':') {
            Some((len, policy)) => (len, Some(policy)),
            None => (s, None),
        };
        let max_len = len
            .trim()
            .parse::<usize>()
            .map_err(|_| EdgeError::invalid(format!("bad queue size {s:?}")))?;
        let policy = match policy.map(|p| p.trim().to_ascii_uppercase()) {
            None => DropPolicy::New,
            Some(p) if p == "NEW" => DropPolicy::New,
            Some(p) if p == "OLD" => DropPolicy::Old,
            Some(_) => return Err(EdgeError::invalid(format!("bad queue policy {s:?}"))),
        };
        Ok(QueueLimit { max_len, policy })
    }
}

impl std::fmt::Display for QueueLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let policy = match self.policy {
            DropPolicy::New => "NEW",
            DropPolicy::Old => "OLD",
        };
        write!(f, "{}:{}", self.max_len, policy)
    }
}

pub struct EdgeQueue<T> {
    items: Mutex<VecDeque<T>>,
    limit: Mutex<QueueLimit>,
    ready: Condvar,
}

impl<T> Default for EdgeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EdgeQueue<T> {
    pub fn new() -> Self {
        Self::with_limit(QueueLimit::default())
    }

    pub fn with_limit(limit: QueueLimit) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            limit: Mutex::new(limit),
            ready: Condvar::new(),
        }
    }

    pub fn set_limit(&self, limit: QueueLimit) {
        *self.limit.lock() = limit;
    }

    pub fn limit(&self) -> QueueLimit {
        *self.limit.lock()
    }

    /// Enqueue without blocking. Returns false when the item was dropped by the limit.
    pub fn push(&self, item: T) -> bool {
        let limit = self.limit();
        let mut items = self.items.lock();
        if limit.max_len > 0 && items.len() >= limit.max_len {
            match limit.policy {
                DropPolicy::New => {
                    debug!(max_len = limit.max_len, "queue full, dropping new item");
                    return false;
                }
                DropPolicy::Old => {
                    debug!(max_len = limit.max_len, "queue full, dropping oldest item");
                    items.pop_front();
                }
            }
        }
        items.push_back(item);
        drop(items);
        self.ready.notify_one();
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Block until an item arrives or `timeout` elapses. `Duration::ZERO` waits forever.
    pub fn wait_pop(&self, timeout: Duration) -> Result<T> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Ok(item);
            }
            match deadline {
                None => self.ready.wait(&mut items),
                Some(deadline) => {
                    if self.ready.wait_until(&mut items, deadline).timed_out() {
                        return items.pop_front().ok_or(EdgeError::TimedOut);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = EdgeQueue::new();
        q.push("A");
        q.push("B");
        q.push("C");
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some("A"));
        assert_eq!(q.pop(), Some("B"));
        assert_eq!(q.pop(), Some("C"));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn wait_pop_zero_timeout_returns_queued_item() {
        let q = EdgeQueue::new();
        q.push(1);
        let start = Instant::now();
        assert_eq!(q.wait_pop(Duration::ZERO).unwrap(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_pop_times_out_after_deadline() {
        let q: EdgeQueue<u32> = EdgeQueue::new();
        let timeout = Duration::from_millis(50);
        let start = Instant::now();
        assert!(matches!(q.wait_pop(timeout), Err(EdgeError::TimedOut)));
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn wait_pop_wakes_on_push() {
        let q = Arc::new(EdgeQueue::new());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(7u32);
            })
        };
        assert_eq!(q.wait_pop(Duration::ZERO).unwrap(), 7);
        producer.join().unwrap();
    }

    #[test]
    fn bounded_drop_new() {
        let q = EdgeQueue::with_limit("2".parse().unwrap());
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn bounded_drop_old() {
        let q = EdgeQueue::with_limit("2:old".parse().unwrap());
        q.push(1);
        q.push(2);
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn limit_parsing() {
        assert_eq!(
            "8:OLD".parse::<QueueLimit>().unwrap(),
            QueueLimit {
                max_len: 8,
                policy: DropPolicy::Old
            }
        );
        assert_eq!("8".parse::<QueueLimit>().unwrap().to_string(), "8:NEW");
        assert!("x".parse::<QueueLimit>().is_err());
        assert!("8:MID".parse::<QueueLimit>().is_err());
    }

    #[test]
    fn remaining_items_dropped_with_queue() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicUsize::new(0));
        let q = EdgeQueue::new();
        q.push(Counted(dropped.clone()));
        q.push(Counted(dropped.clone()));
        drop(q);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }
}
