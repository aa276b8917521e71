//! Self-pipe signal delivery.
//!
//! OS signal handlers only push one byte into a pipe. The dispatcher watches
//! the read end like any other socket and does the real work on its own
//! thread once `epoll_wait` returns.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use libc::c_int;

use crate::error::EtudeResult;
use crate::syscalls::{self, Pipe};

const TICK: u8 = b'T';
const QUIT: u8 = b'Q';

/// Write end used by the raw `SIGALRM` handler.
static ALARM_TX: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_alarm(_sig: c_int) {
    unsafe {
        let errno = *libc::__errno_location();
        let fd = ALARM_TX.load(Ordering::Relaxed);
        if fd >= 0 {
            libc::write(fd, &TICK as *const u8 as *const libc::c_void, 1);
        }
        *libc::__errno_location() = errno;
    }
}

/// Signals drained from the pipe since the last call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub tick: bool,
    pub shutdown: bool,
}

pub struct SignalPipe {
    rx: OwnedFd,
    tx: Arc<OwnedFd>,
}

impl SignalPipe {
    pub fn new() -> EtudeResult<Self> {
        let pipe = Pipe::new()?;
        // A full pipe already holds a pending wakeup; handlers must never block.
        syscalls::set_nonblocking(pipe.tx.as_raw_fd())?;
        Ok(Self {
            rx: pipe.rx,
            tx: Arc::new(pipe.tx),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.tx),
        }
    }

    /// Route process signals into this pipe: `SIGALRM` becomes a tick,
    /// `SIGINT`/`SIGTERM`/`SIGHUP` become a shutdown request and `SIGPIPE`
    /// is ignored. Arms the first alarm `tick_every` from now.
    ///
    /// Process-wide; only one pipe can own the signals at a time.
    pub fn install(&self, tick_every: Duration) -> EtudeResult<()> {
        syscalls::ignore_sigpipe()?;

        ALARM_TX.store(self.tx.as_raw_fd(), Ordering::Release);
        syscalls::install_handler(libc::SIGALRM, on_alarm)?;

        let tx = Arc::clone(&self.tx);
        ctrlc::set_handler(move || {
            let _ = syscalls::write_all(tx.as_raw_fd(), &[QUIT]);
        })?;

        syscalls::arm_alarm(tick_every)
    }

    /// Drain every pending byte.
    pub fn drain(&self) -> EtudeResult<Pending> {
        let mut pending = Pending::default();
        let mut buf = [0u8; 64];
        loop {
            let n = syscalls::read_available(self.rx.as_raw_fd(), &mut buf)?;
            if n == 0 {
                break;
            }
            for byte in &buf[..n] {
                match *byte {
                    TICK => pending.tick = true,
                    QUIT => pending.shutdown = true,
                    _ => {}
                }
            }
        }
        Ok(pending)
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let fd = self.tx.as_raw_fd();
        let _ = ALARM_TX.compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Relaxed);
    }
}

/// Asks a running server to stop, exactly as a termination signal would.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = syscalls::write_all(self.tx.as_raw_fd(), &[QUIT]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_handle_shows_up_in_drain() {
        let pipe = SignalPipe::new().unwrap();
        assert_eq!(pipe.drain().unwrap(), Pending::default());

        pipe.shutdown_handle().shutdown();
        let pending = pipe.drain().unwrap();
        assert!(pending.shutdown);
        assert!(!pending.tick);

        assert_eq!(pipe.drain().unwrap(), Pending::default());
    }

    #[test]
    fn alarm_handler_writes_tick() {
        let pipe = SignalPipe::new().unwrap();
        ALARM_TX.store(pipe.tx.as_raw_fd(), Ordering::Release);
        on_alarm(libc::SIGALRM);
        ALARM_TX.store(-1, Ordering::Release);
        assert!(pipe.drain().unwrap().tick);
    }
}
