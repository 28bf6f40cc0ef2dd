//! Fixed pool of OS worker threads consuming boxed jobs from a bounded
//! queue. `submit` applies backpressure by blocking while the queue is full.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::blockqueue::BlockQueue;

type Task = Box<dyn FnOnce() + Send + 'static>;

const TASK_QUEUE_CAPACITY: usize = 1024;

pub struct WorkerPool {
    queue: Arc<BlockQueue<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers; zero means one per CPU core.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        let queue: Arc<BlockQueue<Task>> = Arc::new(BlockQueue::new(TASK_QUEUE_CAPACITY));

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        task();
                    }
                })
                .expect("spawn worker thread");
            handles.push(handle);
        }

        Self { queue, handles }
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Enqueues a job, blocking while the queue is full. Jobs submitted
    /// after shutdown are dropped.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.queue.push_back(Box::new(task));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
