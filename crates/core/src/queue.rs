//! Bounded producer/consumer queue with grow/shrink hysteresis
//!
//! Producers may add items while the queue is *growing*. Reaching
//! `max_grow` switches it to *shrinking*, which blocks producers until
//! consumers have drained it down to `min_shrink`. The band between the two
//! limits keeps producers from blocking and waking on every single item.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    growing: bool,
    closed: bool,
}

impl<T> Inner<T> {
    /// Apply the grow/shrink transition for the current length.
    /// Returns true if the queue just switched back to growing.
    fn evaluate(&mut self, min_shrink: usize, max_grow: usize) -> bool {
        let len = self.items.len();
        if self.growing && len >= max_grow {
            self.growing = false;
            false
        } else if !self.growing && len <= min_shrink {
            self.growing = true;
            true
        } else {
            false
        }
    }
}

/// Queue with hysteresis backpressure; see the module docs
#[derive(Debug)]
pub struct OscillatingQueue<T> {
    min_shrink: usize,
    max_grow: usize,
    inner: Mutex<Inner<T>>,
    item_available: Notify,
    growth_resumed: Notify,
}

impl<T> OscillatingQueue<T> {
    /// Create a queue; `max_grow` is raised above `min_shrink` if needed
    #[must_use]
    pub fn new(min_shrink: usize, max_grow: usize) -> Self {
        Self {
            min_shrink,
            max_grow: max_grow.max(min_shrink + 1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                growing: true,
                closed: false,
            }),
            item_available: Notify::new(),
            growth_resumed: Notify::new(),
        }
    }

    /// Add an item, waiting while the queue is shrinking.
    ///
    /// Returns false (dropping the item) if the queue was closed.
    pub async fn put(&self, item: T) -> bool {
        loop {
            let resumed = self.growth_resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return false;
                }
                if inner.evaluate(self.min_shrink, self.max_grow) {
                    self.growth_resumed.notify_waiters();
                }
                if inner.growing {
                    inner.items.push_back(item);
                    drop(inner);
                    self.item_available.notify_one();
                    return true;
                }
            }

            resumed.await;
        }
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let available = self.item_available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if inner.evaluate(self.min_shrink, self.max_grow) {
                    self.growth_resumed.notify_waiters();
                }
                if let Some(item) = inner.items.pop_front() {
                    if inner.evaluate(self.min_shrink, self.max_grow) {
                        self.growth_resumed.notify_waiters();
                    }
                    return Some(item);
                }
            }

            if tokio::time::timeout_at(deadline, available).await.is_err() {
                return None;
            }
        }
    }

    /// Drop all items and release every waiting producer and consumer
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.items.clear();
        }
        self.growth_resumed.notify_waiters();
        self.item_available.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// False while producers are held back
    #[must_use]
    pub fn is_growing(&self) -> bool {
        self.inner.lock().growing
    }
}

impl<T: PartialEq> OscillatingQueue<T> {
    /// Non-blocking membership test
    #[must_use]
    pub fn contains(&self, item: &T) -> bool {
        self.inner.lock().items.contains(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(50);

    async fn is_blocked<F: std::future::Future>(fut: F) -> bool {
        tokio::time::timeout(SHORT, fut).await.is_err()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OscillatingQueue::new(1, 10);
        for i in 0..3 {
            assert!(queue.put(i).await);
        }
        assert_eq!(queue.poll(SHORT).await, Some(0));
        assert_eq!(queue.poll(SHORT).await, Some(1));
        assert_eq!(queue.poll(SHORT).await, Some(2));
    }

    #[tokio::test]
    async fn test_poll_times_out_when_empty() {
        let queue: OscillatingQueue<u32> = OscillatingQueue::new(1, 4);
        assert_eq!(queue.poll(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_put() {
        let queue = Arc::new(OscillatingQueue::new(1, 4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.poll(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.put(7u32).await);
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_hysteresis_requires_drain_to_min() {
        let queue = Arc::new(OscillatingQueue::new(5, 20));
        for i in 0..20 {
            assert!(queue.put(i).await);
        }
        assert_eq!(queue.len(), 20);

        // Full: the next put flips to shrinking and blocks
        assert!(is_blocked(queue.put(100)).await);
        assert!(!queue.is_growing());

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(200).await })
        };

        // Draining below max is not enough
        for _ in 0..14 {
            assert!(queue.poll(SHORT).await.is_some());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 6);
        assert!(!queue.is_growing());
        assert!(!producer.is_finished());

        // Reaching min flips back to growing and releases the producer
        assert!(queue.poll(SHORT).await.is_some());
        let accepted = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert!(accepted);
        assert!(queue.is_growing());
        assert_eq!(queue.len(), 6);
        assert!(queue.contains(&200));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_producer() {
        let queue = Arc::new(OscillatingQueue::new(0, 1));
        assert!(queue.put(1).await);

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.put(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(!producer.await.unwrap());
        assert_eq!(queue.poll(SHORT).await, None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_contains() {
        let queue = OscillatingQueue::new(1, 4);
        queue.put("a").await;
        assert!(queue.contains(&"a"));
        assert!(!queue.contains(&"b"));
    }
}
