//! Wrapper over the kernel readiness facility (epoll).
//!
//! Registration and re-arming take `&self`: `epoll_ctl` is serialised by the
//! kernel, so the instance is shared via `Arc` and worker threads re-arm
//! descriptors directly after finishing a job.

use std::io;
use std::os::fd::RawFd;

use libc::c_int;

use crate::error::EmberResult;

pub const EV_READ: u32 = libc::EPOLLIN as u32;
pub const EV_WRITE: u32 = libc::EPOLLOUT as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;

/// One ready event as surfaced by `wait`.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EpollEvent(libc::epoll_event);

impl EpollEvent {
    pub fn zeroed() -> Self {
        EpollEvent(libc::epoll_event { events: 0, u64: 0 })
    }

    pub fn fd(&self) -> RawFd {
        self.0.u64 as RawFd
    }

    pub fn mask(&self) -> u32 {
        self.0.events
    }
}

pub struct Epoller {
    epoll_fd: RawFd,
}

impl Epoller {
    pub fn new() -> EmberResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { epoll_fd: fd })
        }
    }

    pub fn add(&self, fd: RawFd, mask: u32) -> EmberResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    pub fn modify(&self, fd: RawFd, mask: u32) -> EmberResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    /// Deregister `fd`. Tolerates descriptors the kernel already dropped.
    pub fn remove(&self, fd: RawFd) -> EmberResult<()> {
        unsafe {
            if libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if !matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Blocks up to `timeout_ms` (negative = indefinitely, zero = poll) and
    /// fills `events` with what is ready. EINTR surfaces as zero events.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: i32) -> EmberResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr() as *mut libc::epoll_event,
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, mask: u32) -> EmberResult<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
