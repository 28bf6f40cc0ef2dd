//! Min-heap of per-connection deadlines with an id → slot index so that
//! refreshing or deleting an arbitrary entry stays O(log n).

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    cb: Option<TimeoutCallback>,
}

pub struct HeapTimer {
    heap: Vec<TimerNode>,
    index: HashMap<RawFd, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: RawFd) -> bool {
        self.index.contains_key(&id)
    }

    /// Registers a deadline `timeout_ms` from now. An existing entry for the
    /// same id is refreshed and its callback replaced, so a reused descriptor
    /// retires the stale closure.
    pub fn add(&mut self, id: RawFd, timeout_ms: u64, cb: TimeoutCallback) {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        match self.index.get(&id).copied() {
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = Some(cb);
                if !self.sift_down(i) {
                    self.sift_up(i);
                }
            }
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Some(cb),
                });
                self.sift_up(i);
            }
        }
    }

    /// Pushes an existing deadline to `timeout_ms` from now. Deadlines only
    /// ever extend in practice, but a shortened one is restored just as well.
    pub fn adjust(&mut self, id: RawFd, timeout_ms: u64) {
        let Some(i) = self.index.get(&id).copied() else {
            return;
        };
        self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    /// Fires the callback for `id` immediately and removes its entry.
    pub fn do_work(&mut self, id: RawFd) {
        let Some(i) = self.index.get(&id).copied() else {
            return;
        };
        let cb = self.heap[i].cb.take();
        self.remove_at(i);
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Fires and removes every expired entry.
    pub fn tick(&mut self) {
        let now = Instant::now();
        loop {
            let expired = match self.heap.first() {
                Some(root) => root.expires <= now,
                None => break,
            };
            if !expired {
                break;
            }
            let cb = self.heap[0].cb.take();
            self.remove_at(0);
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.remove_at(0);
        }
    }

    /// Milliseconds until the nearest deadline, clamped at zero; -1 when no
    /// deadline is pending. Feeds the poller's wait timeout directly.
    pub fn next_tick_ms(&self) -> i64 {
        match self.heap.first() {
            None => -1,
            Some(node) => {
                let now = Instant::now();
                if node.expires <= now {
                    0
                } else {
                    (node.expires - now).as_millis() as i64
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn remove_at(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        self.swap_nodes(i, last);
        let node = self.heap.pop().expect("heap node");
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let start = i;
        let n = self.heap.len();
        loop {
            let left = i * 2 + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.heap[right].expires < self.heap[left].expires {
                child = right;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(self.heap[parent].expires <= self.heap[i].expires);
        }
        assert_eq!(self.index.len(), self.heap.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
        }
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        Self::new()
    }
}
