//! Thin safe wrappers over the raw syscalls the server relies on: listener
//! setup, accept, scatter/gather I/O, file stat/mmap, and the wakeup pipe.
//! All `unsafe` lives here (and in the mapped-file view built on it).

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

/// Create a TCP listener on 0.0.0.0:port with SO_REUSEADDR, an optional
/// lingering close, and a short backlog. The fd is left blocking; the caller
/// flips it with `set_nonblocking` before registering it.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        if linger {
            // Finish sending what is queued, up to one second, before close.
            let lin = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &lin as *const _ as *const c_void,
                mem::size_of_val(&lin) as socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, 6) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection, returning its fd and peer address.
/// `Ok(None)` when the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(Some((fd, SocketAddr::V4(SocketAddrV4::new(ip, port)))))
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// A raw `write(2)` on the readable slice.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let n = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Scatter read into two regions with a single syscall.
pub fn readv2(fd: RawFd, first: &mut [u8], second: &mut [u8]) -> io::Result<usize> {
    let iov = [
        libc::iovec {
            iov_base: first.as_mut_ptr() as *mut c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr() as *mut c_void,
            iov_len: second.len(),
        },
    ];
    unsafe {
        let n = libc::readv(fd, iov.as_ptr(), 2);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Gather write of two regions with a single syscall. Empty regions are
/// skipped so the kernel sees only populated vectors.
pub fn writev2(fd: RawFd, first: &[u8], second: &[u8]) -> io::Result<usize> {
    let mut iov = [libc::iovec {
        iov_base: ptr::null_mut(),
        iov_len: 0,
    }; 2];
    let mut cnt = 0;
    for part in [first, second] {
        if !part.is_empty() {
            iov[cnt] = libc::iovec {
                iov_base: part.as_ptr() as *mut c_void,
                iov_len: part.len(),
            };
            cnt += 1;
        }
    }
    if cnt == 0 {
        return Ok(0);
    }
    unsafe {
        let n = libc::writev(fd, iov.as_ptr(), cnt as c_int);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Create a Unix pipe with a non-blocking read end. Returns (read, write).
pub fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Err(e) = set_nonblocking(fds[0]) {
        close_fd(fds[0]);
        close_fd(fds[1]);
        return Err(e);
    }
    Ok((fds[0], fds[1]))
}

/// The local port a socket is bound to; resolves port-0 binds.
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

/// A peer that resets mid-write must surface as an errno, not a signal.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// `stat(2)` on a filesystem path.
pub fn stat_path(path: &Path) -> io::Result<libc::stat> {
    let cpath = path_cstring(path)?;
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::stat(cpath.as_ptr(), &mut st) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st)
    }
}

/// Open a file read-only, returning the raw fd.
pub fn open_read(path: &Path) -> io::Result<RawFd> {
    let cpath = path_cstring(path)?;
    unsafe {
        let fd = libc::open(cpath.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

/// Map `len` bytes of `fd` read-only and private.
pub fn map_file(fd: RawFd, len: usize) -> io::Result<*mut u8> {
    unsafe {
        let ptr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as *mut u8)
    }
}

pub fn unmap_file(ptr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(ptr as *mut c_void, len);
    }
}
