// src/syscalls.rs
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{c_int, c_void};

use crate::error::EtudeResult;

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

/// Interest set for a client socket waiting for request bytes.
pub const READ_INTEREST: i32 = EPOLLIN | EPOLLRDHUP | EPOLLONESHOT;
/// Interest set for a client socket with a response pending.
pub const WRITE_INTEREST: i32 = EPOLLOUT | EPOLLRDHUP | EPOLLONESHOT;
/// Any of these means the peer is gone.
pub const HANGUP_MASK: u32 = (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32;

// ---- Epoll Operations ----

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd`. Level-triggered unless `interests` carries
    /// `EPOLLONESHOT`, in which case delivery stops after one event until
    /// [`Epoll::rearm`] is called.
    pub fn add(&self, fd: RawFd, token: u64, interests: i32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    /// Re-enable a one-shot registration, possibly with a new interest set.
    pub fn rearm(&self, fd: RawFd, token: u64, interests: i32) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    pub fn delete(&self, fd: RawFd) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for readiness. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
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

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, interests: i32) -> EtudeResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Pipes ----

/// A unidirectional pipe whose read end never blocks.
pub struct Pipe {
    pub rx: OwnedFd,
    pub tx: OwnedFd,
}

impl Pipe {
    pub fn new() -> EtudeResult<Self> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let rx = OwnedFd::from_raw_fd(fds[0]);
            let tx = OwnedFd::from_raw_fd(fds[1]);
            set_nonblocking(rx.as_raw_fd())?;
            Ok(Self { rx, tx })
        }
    }
}

/// Read whatever is available without blocking. `Ok(0)` means nothing was
/// pending (or the write end is closed).
pub fn read_available(fd: RawFd, buf: &mut [u8]) -> EtudeResult<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err.into()),
            }
        } else {
            Ok(res as usize)
        }
    }
}

/// Write all of `buf`. Writes of up to `PIPE_BUF` bytes to a pipe are
/// atomic, so concurrent writers never interleave within one message.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> EtudeResult<()> {
    while !buf.is_empty() {
        let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        buf = &buf[res as usize..];
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> EtudeResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

// ---- Signals ----

/// Broken pipes surface as `EPIPE` from `writev` instead of killing us.
pub fn ignore_sigpipe() -> EtudeResult<()> {
    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Install `handler` for `sig` with every other signal blocked while it runs.
pub fn install_handler(sig: c_int, handler: extern "C" fn(c_int)) -> EtudeResult<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Schedule a single `SIGALRM` after `after`. Calling again replaces the
/// pending alarm.
pub fn arm_alarm(after: Duration) -> EtudeResult<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: after.as_secs() as libc::time_t,
            tv_usec: after.subsec_micros() as libc::suseconds_t,
        },
    };
    unsafe {
        if libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}
