//! Growable byte buffer with read/write cursors and scatter-read support.
//!
//! Layout: `[0, read_pos)` is reclaimable, `[read_pos, write_pos)` is the
//! readable span, `[write_pos, capacity)` is the writable tail.

use std::io;
use std::os::fd::RawFd;

use crate::syscalls;

const INITIAL_SIZE: usize = 1024;

/// Size of the stack-side overflow region used by `read_fd`. A single readv
/// can always drain at least this much beyond the writable tail, which keeps
/// edge-triggered reads to one syscall per ready batch.
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: vec![0; cap],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    /// The readable span.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// The writable tail. Pair with `advance_write` after copying into it.
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    /// Marks `n` tail bytes as written.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.writable());
        self.write_pos += n;
    }

    /// Marks `n` readable bytes as consumed.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable());
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Returns the readable span as a string and resets the buffer.
    pub fn take_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    /// Makes room for at least `n` writable bytes: compacts when the space
    /// before the readable span suffices, otherwise grows the backing store.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable() >= n {
            return;
        }
        if self.prependable() + self.writable() >= n {
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            self.buf.resize(self.write_pos + n + 1, 0);
        }
    }

    /// Scatter read: one readv into the writable tail plus a stack overflow
    /// region, so an arbitrarily large ready batch is drained in one call.
    /// `Ok(0)` means EOF; `WouldBlock` means nothing is ready.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable();

        let n = syscalls::readv2(fd, self.begin_write(), &mut extra)?;

        if n <= writable {
            self.advance_write(n);
        } else {
            self.advance_write(writable);
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable span to `fd` and consumes what was sent.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write_fd(fd, self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        assert!(self.read_pos <= self.write_pos);
        assert!(self.write_pos <= self.buf.len());
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}
