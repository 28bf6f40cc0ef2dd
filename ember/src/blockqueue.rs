//! Bounded MPSC-ish deque: producers block while full, consumers while
//! empty, and `close` wakes everyone for a clean shutdown.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    deq: VecDeque<T>,
    closed: bool,
}

pub struct BlockQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    cond_producer: Condvar,
    cond_consumer: Condvar,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                deq: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            cond_producer: Condvar::new(),
            cond_consumer: Condvar::new(),
        }
    }

    /// Appends an item, blocking while the queue is full.
    /// Returns false if the queue was closed.
    pub fn push_back(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= self.capacity {
            if inner.closed {
                return false;
            }
            inner = self.cond_producer.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.deq.push_back(item);
        self.cond_consumer.notify_one();
        true
    }

    /// Prepends an item, blocking while the queue is full.
    /// Returns false if the queue was closed.
    pub fn push_front(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= self.capacity {
            if inner.closed {
                return false;
            }
            inner = self.cond_producer.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.deq.push_front(item);
        self.cond_consumer.notify_one();
        true
    }

    /// Removes the front item, blocking while the queue is empty.
    /// `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                self.cond_producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.cond_consumer.wait(inner).unwrap();
        }
    }

    /// Like `pop`, but gives up after `timeout` without removing anything.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.deq.pop_front() {
                self.cond_producer.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let (guard, result) = self.cond_consumer.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deq.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().deq.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().deq.len() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// One consumer wakeup, so a lagging drain thread gets nudged.
    pub fn flush(&self) {
        self.cond_consumer.notify_one();
    }

    /// Clears the queue, marks it closed and wakes every blocked thread.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.deq.clear();
            inner.closed = true;
        }
        self.cond_producer.notify_all();
        self.cond_consumer.notify_all();
    }
}

impl<T: Clone> BlockQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.inner.lock().unwrap().deq.front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.inner.lock().unwrap().deq.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_with_push_front() {
        let q = BlockQueue::new(8);
        q.push_back(2);
        q.push_back(3);
        q.push_front(1);
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.back(), Some(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn never_exceeds_capacity() {
        let q = Arc::new(BlockQueue::new(2));
        q.push_back(1);
        q.push_back(2);
        assert!(q.is_full());

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push_back(3))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_timeout_expires_without_removing() {
        let q: BlockQueue<u32> = BlockQueue::new(4);
        assert_eq!(q.pop_timeout(Duration::from_millis(30)), None);
        assert!(q.is_empty());
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let q: Arc<BlockQueue<u32>> = Arc::new(BlockQueue::new(4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(30));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn close_clears_and_rejects_pushes() {
        let q = BlockQueue::new(4);
        q.push_back(7);
        q.close();
        assert!(q.is_empty());
        assert!(!q.push_back(8));
        assert_eq!(q.pop(), None);
    }
}
