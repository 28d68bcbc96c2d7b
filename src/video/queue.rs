//! Bounded frame queue with drop-oldest-on-full semantics.
//!
//! The decoder produces at the source cadence, which may exceed the encoder's
//! output cadence; recency is preserved, not history. `put` never blocks the
//! producer: a full queue is emptied, the dropped counter advances by the
//! number of evicted entries, and the new item is admitted.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

pub struct BackpressureQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    default_timeout: Duration,
    dropped: AtomicU64,
    notify: Arc<Notify>,
}

impl<T> BackpressureQueue<T> {
    pub fn new(capacity: usize, timeout_ms: u64) -> Self {
        BackpressureQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            default_timeout: Duration::from_millis(timeout_ms),
            dropped: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Admit `item` without ever blocking the caller. If the queue is full,
    /// every enqueued entry is evicted first and counted as dropped.
    pub fn put(&self, item: T) {
        let evicted = {
            let mut queue = self.inner.lock();
            let evicted = if queue.len() >= self.capacity {
                let n = queue.len();
                queue.clear();
                n
            } else {
                0
            };
            queue.push_back(item);
            evicted
        };

        if evicted > 0 {
            let before = self.dropped.fetch_add(evicted as u64, Ordering::Relaxed);
            let after = before + evicted as u64;
            if after / 1000 > before / 1000 {
                warn!(total_dropped = after, "Backpressure queue dropping frames");
            }
        }
        self.notify.notify_one();
    }

    /// Wait up to `timeout` for an item. `None` means the queue stayed empty.
    pub async fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.inner.lock().pop_front() {
                return Some(item);
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last check: a put may have raced the timeout
                return self.inner.lock().pop_front();
            }
        }
    }

    /// Wait the queue's configured default timeout
    pub async fn get_default(&self) -> Option<T> {
        self.get(self.default_timeout).await
    }

    /// Non-blocking pop, for synchronous consumers and tests
    pub fn try_get(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_admits_newest() {
        let queue = BackpressureQueue::new(3, 500);
        for i in 1..=5 {
            queue.put(i);
        }

        // 1,2,3 filled the queue; the 4th put evicted all three, the 5th put
        // evicted the 4th.
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.dropped_count(), 4);
        assert_eq!(queue.try_get(), Some(5));
    }

    #[test]
    fn put_get_conservation() {
        let queue = BackpressureQueue::new(4, 500);
        let mut gets = 0u64;
        let total_puts = 50u64;

        for i in 0..total_puts {
            queue.put(i);
            assert!(queue.size() <= queue.capacity());
            if i % 3 == 0 && queue.try_get().is_some() {
                gets += 1;
            }
        }

        assert_eq!(
            total_puts,
            gets + queue.size() as u64 + queue.dropped_count()
        );
    }

    #[test]
    fn full_queue_get_returns_older_item_not_the_new_put() {
        let queue = BackpressureQueue::new(3, 500);
        queue.put(1);
        queue.put(2);
        queue.put(3);
        queue.put(4); // evicts 1..3, admits 4

        let next = queue.try_get().unwrap();
        assert_eq!(next, 4);

        // With capacity > 1 and room left, the head is always strictly older
        // than the latest put.
        queue.put(5);
        queue.put(6);
        assert_eq!(queue.try_get(), Some(5));
    }

    #[tokio::test]
    async fn timed_get_returns_none_when_empty() {
        let queue: BackpressureQueue<u8> = BackpressureQueue::new(2, 10);
        let got = queue.get(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn timed_get_wakes_on_put() {
        let queue = Arc::new(BackpressureQueue::new(2, 500));
        let q = Arc::clone(&queue);

        let getter = tokio::spawn(async move { q.get(Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(7u8);

        assert_eq!(getter.await.unwrap(), Some(7));
    }
}
