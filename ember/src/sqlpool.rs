//! Fixed-size pool of database handles guarded by a counting semaphore.
//!
//! The pool always registers exactly `size` slots; a handle that failed to
//! connect occupies its slot as `None`, so `acquire` can hand out an empty
//! guard and callers must tolerate it. The scoped guard returns the slot on
//! every exit path.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use ember_pg::{PgConfig, PgConnection};

use crate::error::{EmberError, EmberResult};

struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    fn post(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cond.notify_one();
    }
}

pub struct DbPool<T> {
    free: Mutex<VecDeque<Option<T>>>,
    sem: Semaphore,
    size: usize,
}

impl<T> DbPool<T> {
    /// Builds a pool of exactly `size` slots; each slot holds whatever the
    /// connector produced (`None` for a failed connect).
    pub fn init(size: usize, mut connector: impl FnMut() -> Option<T>) -> Self {
        let mut free = VecDeque::with_capacity(size);
        for _ in 0..size {
            free.push_back(connector());
        }
        Self {
            free: Mutex::new(free),
            sem: Semaphore::new(size),
            size,
        }
    }

    /// Blocks until a slot is available and leases it. A zero-size pool
    /// yields an empty, unleased guard immediately.
    pub fn acquire(&self) -> PoolGuard<'_, T> {
        if self.size == 0 {
            return PoolGuard {
                pool: self,
                handle: None,
                leased: false,
            };
        }
        self.sem.wait();
        let handle = self
            .free
            .lock()
            .unwrap()
            .pop_front()
            .expect("semaphore guarantees a free slot");
        PoolGuard {
            pool: self,
            handle,
            leased: true,
        }
    }

    fn release(&self, handle: Option<T>) {
        self.free.lock().unwrap().push_back(handle);
        self.sem.post();
    }

    /// Drains and drops every free handle. Outstanding guards return their
    /// slots as usual; the pool simply stops holding live connections.
    pub fn close_all(&self) {
        let mut free = self.free.lock().unwrap();
        for slot in free.iter_mut() {
            *slot = None;
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// Scoped lease on one pool slot.
pub struct PoolGuard<'a, T> {
    pool: &'a DbPool<T>,
    handle: Option<T>,
    leased: bool,
}

impl<T> PoolGuard<'_, T> {
    /// The leased handle, or `None` when the slot never connected.
    pub fn get(&mut self) -> Option<&mut T> {
        self.handle.as_mut()
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if self.leased {
            self.pool.release(self.handle.take());
        }
    }
}

/// What the server needs from a database handle: run SQL, get rows of
/// stringly-typed columns.
pub trait DbConn: Send {
    fn query(&mut self, sql: &str) -> EmberResult<Vec<Vec<Option<String>>>>;
    fn execute(&mut self, sql: &str) -> EmberResult<u64>;
}

impl DbConn for PgConnection {
    fn query(&mut self, sql: &str) -> EmberResult<Vec<Vec<Option<String>>>> {
        let rows = PgConnection::query(self, sql).map_err(EmberError::from)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cols = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                cols.push(row.get_str(i).map_err(EmberError::from)?.map(str::to_string));
            }
            out.push(cols);
        }
        Ok(out)
    }

    fn execute(&mut self, sql: &str) -> EmberResult<u64> {
        PgConnection::execute(self, sql).map_err(EmberError::from)
    }
}

pub type SqlPool = DbPool<Box<dyn DbConn>>;

impl SqlPool {
    /// A pool with no backing database; every acquire yields an empty guard.
    pub fn empty() -> SqlPool {
        DbPool::init(0, || None)
    }
}

/// Establishes `size` connections against `config`, logging every failure.
/// Failed slots stay registered so the pool size is what was asked for.
pub fn connect_pool(config: &PgConfig, size: usize) -> SqlPool {
    DbPool::init(size, || match PgConnection::connect(config) {
        Ok(conn) => Some(Box::new(conn) as Box<dyn DbConn>),
        Err(e) => {
            log::error!(
                "database connect to {}:{} failed: {}",
                config.host,
                config.port,
                e
            );
            None
        }
    })
}
