//! Bounded blocking FIFO connecting pipeline stages.
//!
//! One producer and one consumer per queue. Blocking waits re-check their cancellation
//! predicate at least every [`WAIT_TICK`], so shutdown and seek flags are observed promptly
//! even if a wakeup is missed.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Upper bound on any single blocking wait
pub const WAIT_TICK: Duration = Duration::from_millis(10);

/// A thread-safe FIFO with a fixed capacity.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Signaled when an item is pushed
    not_empty: Condvar,
    /// Signaled when an item is removed
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Appends `item` if there is room, handing it back otherwise.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends `item`, waiting for room.
    ///
    /// Gives the item back as soon as `cancelled` returns true; the caller discards it.
    pub fn enqueue(&self, item: T, cancelled: impl Fn() -> bool) -> Result<(), T> {
        let mut items = self.items.lock();
        loop {
            if cancelled() {
                return Err(item);
            }
            if items.len() < self.capacity {
                items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            self.not_full.wait_for(&mut items, WAIT_TICK);
        }
    }

    /// Removes the head item, waiting until one is available or `cancelled` returns true.
    pub fn dequeue(&self, cancelled: impl Fn() -> bool) -> Option<T> {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if cancelled() {
                return None;
            }
            self.not_empty.wait_for(&mut items, WAIT_TICK);
        }
    }

    /// Removes the head item without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Inspects the head item without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    /// Removes the head item only if `predicate` accepts it.
    pub fn pop_front_if(&self, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut items = self.items.lock();
        if !items.front().is_some_and(predicate) {
            return None;
        }
        let item = items.pop_front();
        self.not_full.notify_one();
        item
    }

    /// Drops every queued item and returns how many were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = {
            let mut items = self.items.lock();
            items.drain(..).collect()
        };
        self.not_full.notify_all();
        // contents are released outside the lock
        drained.len()
    }

    /// Wakes every blocked producer and consumer so they re-check their predicates.
    pub fn wake_all(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_capacity_is_never_exceeded() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            assert!(queue.try_enqueue(i).is_ok());
        }
        assert_eq!(queue.try_enqueue(99), Err(99));
        assert_eq!(queue.len(), 3);
        assert!(queue.is_full());
    }

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.try_enqueue(i).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_blocked_producer_resumes_after_dequeue() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.try_enqueue(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(2, || false))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_dequeue(), Some(1));

        assert!(producer.join().unwrap().is_ok());
        assert_eq!(queue.try_dequeue(), Some(2));
    }

    #[test]
    fn test_cancelled_enqueue_returns_item_promptly() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.try_enqueue(0).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || queue.enqueue(7, || cancel.load(Ordering::SeqCst)))
        };
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        cancel.store(true, Ordering::SeqCst);
        queue.wake_all();

        assert_eq!(producer.join().unwrap(), Err(7));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dequeue_cancel_and_wakeup() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        let cancel = Arc::new(AtomicBool::new(false));
        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || queue.dequeue(|| cancel.load(Ordering::SeqCst)))
        };
        thread::sleep(Duration::from_millis(20));
        cancel.store(true, Ordering::SeqCst);
        queue.wake_all();
        assert_eq!(consumer.join().unwrap(), None);

        queue.try_enqueue(5).unwrap();
        assert_eq!(queue.dequeue(|| true), Some(5));
    }

    #[test]
    fn test_clear_releases_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(2));
        queue.try_enqueue("a".to_string()).unwrap();
        queue.try_enqueue("b".to_string()).unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue("c".to_string(), || false))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.clear(), 2);
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(queue.try_dequeue().as_deref(), Some("c"));
    }

    #[test]
    fn test_peek_and_conditional_pop() {
        let queue = BoundedQueue::new(3);
        queue.try_enqueue(10).unwrap();
        queue.try_enqueue(20).unwrap();
        assert_eq!(queue.peek_with(|v| *v), Some(10));
        assert_eq!(queue.pop_front_if(|v| *v > 10), None);
        assert_eq!(queue.pop_front_if(|v| *v == 10), Some(10));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.capacity(), 3);
    }
}
