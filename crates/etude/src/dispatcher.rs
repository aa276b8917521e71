// src/dispatcher.rs
//! The single-threaded readiness loop.
//!
//! Owns the epoll instance, the connection table and the idle timers.
//! Client sockets are registered one-shot: after an event is delivered the
//! socket stays silent until this thread re-arms it, so a connection is
//! never drained, processed and flushed concurrently. Workers report back
//! through the completion pipe and all re-arming happens here.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::conn::{Connection, Drain, Flush, Next};
use crate::error::EtudeResult;
use crate::http::BUSY_RESPONSE;
use crate::metrics::ServerContext;
use crate::pool::WorkerPool;
use crate::signal::SignalPipe;
use crate::slab::{ConnectionSlab, Token};
use crate::syscalls::{
    self, EPOLLIN, EPOLLOUT, Epoll, HANGUP_MASK, Pipe, READ_INTEREST, WRITE_INTEREST, epoll_event,
};
use crate::timer::{Evict, TimerList, Verdict};

const LISTENER: u64 = u64::MAX;
const SIGNALS: u64 = u64::MAX - 1;
const COMPLETIONS: u64 = u64::MAX - 2;

const MAX_EVENTS: usize = 10_000;

/// A connection handed to the worker pool.
pub struct Task {
    token: Token,
    conn: Arc<Mutex<Connection>>,
}

/// What drives the periodic timer sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    /// `SIGALRM` arriving through the signal pipe.
    Alarm,
    /// The `epoll_wait` timeout, computed from the next sweep deadline.
    Deadline,
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
    ctx: Arc<ServerContext>,
    epoll: Epoll,
    listener: TcpListener,
    signals: SignalPipe,
    completions: OwnedFd,
    carry: Vec<u8>,
    table: ConnectionSlab<Connection>,
    timers: TimerList<Token>,
    pool: WorkerPool<Task>,
    tick_source: TickSource,
    next_tick: Instant,
    tick_due: bool,
    running: bool,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<ServerContext>,
        listener: TcpListener,
        signals: SignalPipe,
        tick_source: TickSource,
    ) -> EtudeResult<Self> {
        listener.set_nonblocking(true)?;

        let epoll = Epoll::new()?;
        epoll.add(listener.as_raw_fd(), LISTENER, EPOLLIN)?;
        epoll.add(signals.read_fd(), SIGNALS, EPOLLIN)?;

        let Pipe { rx, tx } = Pipe::new()?;
        epoll.add(rx.as_raw_fd(), COMPLETIONS, EPOLLIN)?;

        let config = &ctx.config;
        let pool = WorkerPool::new(
            config.threads,
            config.max_queue,
            config.pin_workers,
            move |task: Task| {
                let processed = panic::catch_unwind(AssertUnwindSafe(|| {
                    lock(&task.conn).process();
                }));
                if processed.is_err() {
                    error!(token = ?task.token, "request processing panicked");
                    lock(&task.conn).abandon();
                }
                let raw = task.token.to_u64().to_ne_bytes();
                if let Err(e) = syscalls::write_all(tx.as_raw_fd(), &raw) {
                    error!(error = %e, "failed to report completion");
                }
            },
        )?;

        let table = ConnectionSlab::new(config.max_connections);
        let timers = TimerList::with_capacity(config.max_connections.min(4096));
        let next_tick = Instant::now() + config.timeout_unit;

        Ok(Self {
            ctx,
            epoll,
            listener,
            signals,
            completions: rx,
            carry: Vec::with_capacity(64),
            table,
            timers,
            pool,
            tick_source,
            next_tick,
            tick_due: false,
            running: true,
        })
    }

    /// Live client connections.
    pub fn live(&self) -> usize {
        self.table.len()
    }

    /// Run until a shutdown signal arrives or `epoll_wait` fails.
    pub fn run(&mut self) -> EtudeResult<()> {
        info!(
            addr = ?self.listener.local_addr().ok(),
            threads = self.pool.threads(),
            "dispatcher running"
        );

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let result = 'events: loop {
            if !self.running {
                break Ok(());
            }

            let n = match self.epoll.wait(&mut events, self.wait_timeout()) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll failure");
                    break Err(e);
                }
            };

            for ev in &events[..n] {
                let (token, flags) = (ev.u64, ev.events);
                match token {
                    LISTENER => self.accept_all(),
                    SIGNALS => {
                        if let Err(e) = self.handle_signals() {
                            break 'events Err(e);
                        }
                    }
                    COMPLETIONS => {
                        if let Err(e) = self.handle_completions() {
                            break 'events Err(e);
                        }
                    }
                    raw => self.handle_client(Token::from_u64(raw), flags),
                }
            }

            if self.tick_source == TickSource::Deadline && Instant::now() >= self.next_tick {
                self.tick_due = true;
            }
            if self.tick_due {
                if let Err(e) = self.tick() {
                    break Err(e);
                }
            }
        };

        self.shutdown();
        result
    }

    fn wait_timeout(&self) -> i32 {
        match self.tick_source {
            TickSource::Alarm => -1,
            TickSource::Deadline => {
                let left = self.next_tick.saturating_duration_since(Instant::now());
                left.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.table.len() >= self.ctx.config.max_connections || self.table.is_full() {
            reject(stream, peer);
            self.ctx.metrics.inc_rejected();
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(%peer, error = %e, "could not make socket non-blocking");
            return;
        }

        let fd = stream.as_raw_fd();
        let ctx = Arc::clone(&self.ctx);
        let Some(token) = self.table.allocate(|| Connection::new(ctx)) else {
            reject(stream, peer);
            self.ctx.metrics.inc_rejected();
            return;
        };
        let Some(slot) = self.table.get_mut(token) else {
            return;
        };
        lock(slot.conn()).init(stream, peer);

        if let Err(e) = self.epoll.add(fd, token.to_u64(), READ_INTEREST) {
            warn!(%peer, error = %e, "epoll registration failed");
            lock(slot.conn()).close();
            self.table.free(token);
            return;
        }

        let expire = Instant::now() + self.ctx.config.idle_timeout();
        slot.timer = Some(self.timers.add(expire, token));
        self.ctx.metrics.inc_conn();
        debug!(%peer, live = self.table.len(), "connection accepted");
    }

    fn handle_client(&mut self, token: Token, flags: u32) {
        let Some(slot) = self.table.get(token) else {
            return;
        };
        let conn = Arc::clone(slot.conn());

        if flags & HANGUP_MASK != 0 {
            self.close(token);
        } else if flags & EPOLLIN as u32 != 0 {
            let drained = lock(&conn).drain();
            match drained {
                Ok(Drain::Ready) => self.dispatch(token, conn),
                Ok(Drain::PeerClosed) => self.close(token),
                Err(e) => {
                    debug!(error = %e, "read failed");
                    self.close(token);
                }
            }
        } else if flags & EPOLLOUT as u32 != 0 {
            let flushed = lock(&conn).flush();
            match flushed {
                Ok(Flush::Partial) => {
                    self.rearm(token, WRITE_INTEREST);
                    self.touch(token);
                }
                Ok(Flush::KeepAlive) => {
                    self.rearm(token, READ_INTEREST);
                    self.touch(token);
                }
                Ok(Flush::Close) => self.close(token),
                Err(e) => {
                    debug!(error = %e, "write failed");
                    self.close(token);
                }
            }
        }
    }

    /// Hand a drained connection to the pool. A full queue drops the work;
    /// the connection stays disarmed until its timer evicts it.
    fn dispatch(&mut self, token: Token, conn: Arc<Mutex<Connection>>) {
        if self.pool.append(Task { token, conn }).is_err() {
            self.ctx.metrics.inc_dropped();
            warn!(?token, "task queue full, request dropped");
            return;
        }
        if let Some(slot) = self.table.get_mut(token) {
            slot.checked_out = true;
        }
        self.touch(token);
    }

    fn handle_completions(&mut self) -> EtudeResult<()> {
        let mut buf = [0u8; 8 * 256];
        loop {
            let n = syscalls::read_available(self.completions.as_raw_fd(), &mut buf)?;
            if n == 0 {
                break;
            }
            self.carry.extend_from_slice(&buf[..n]);
        }

        let whole = self.carry.len() / 8 * 8;
        let tokens: Vec<Token> = self.carry[..whole]
            .chunks_exact(8)
            .map(|raw| {
                let mut word = [0u8; 8];
                word.copy_from_slice(raw);
                Token::from_u64(u64::from_ne_bytes(word))
            })
            .collect();
        self.carry.drain(..whole);

        for token in tokens {
            let Some(slot) = self.table.get_mut(token) else {
                continue;
            };
            slot.checked_out = false;
            let next = lock(slot.conn()).next();
            match next {
                Next::Read => self.rearm(token, READ_INTEREST),
                Next::Write => self.rearm(token, WRITE_INTEREST),
                Next::Close => self.close(token),
            }
        }
        Ok(())
    }

    fn handle_signals(&mut self) -> EtudeResult<()> {
        let pending = self.signals.drain()?;
        if pending.tick {
            self.tick_due = true;
        }
        if pending.shutdown {
            info!("shutdown requested");
            self.running = false;
        }
        Ok(())
    }

    /// Sweep expired timers, then schedule the next sweep.
    fn tick(&mut self) -> EtudeResult<()> {
        let now = Instant::now();
        let mut reaper = Reaper {
            table: &mut self.table,
            epoll: &self.epoll,
            ctx: &*self.ctx,
            now,
            idle: self.ctx.config.idle_timeout(),
        };
        let evicted = self.timers.tick(now, &mut reaper);
        trace!(evicted, live = self.table.len(), "timer tick");

        self.tick_due = false;
        match self.tick_source {
            TickSource::Alarm => syscalls::arm_alarm(self.ctx.config.timeout_unit)?,
            TickSource::Deadline => self.next_tick = now + self.ctx.config.timeout_unit,
        }
        Ok(())
    }

    /// Activity: push the idle deadline out.
    fn touch(&mut self, token: Token) {
        let expire = Instant::now() + self.ctx.config.idle_timeout();
        if let Some(timer) = self.table.get(token).and_then(|slot| slot.timer) {
            self.timers.adjust(timer, expire);
        }
    }

    fn rearm(&mut self, token: Token, interests: i32) {
        let fd = match self.table.get(token) {
            Some(slot) => lock(slot.conn()).raw_fd(),
            None => return,
        };
        let Some(fd) = fd else {
            self.close(token);
            return;
        };
        if let Err(e) = self.epoll.rearm(fd, token.to_u64(), interests) {
            debug!(error = %e, "re-arm failed");
            self.close(token);
        }
    }

    /// Full teardown: timer, registration, socket, slot.
    fn close(&mut self, token: Token) {
        if let Some(timer) = self.table.get_mut(token).and_then(|slot| slot.timer.take()) {
            self.timers.remove(timer);
        }
        teardown(&mut self.table, &self.epoll, &self.ctx, token);
    }

    fn shutdown(&mut self) {
        // Workers may be blocked reporting completions nobody will act on.
        let completions = self.completions.as_raw_fd();
        let mut scratch = [0u8; 8 * 256];
        self.pool.shutdown_with(|| {
            while let Ok(1..) = syscalls::read_available(completions, &mut scratch) {}
        });
        self.carry.clear();
        for token in self.table.tokens() {
            self.close(token);
        }
        self.timers.drain();
        let stats = self.ctx.metrics.snapshot();
        info!(
            requests = stats.requests,
            bytes_sent = stats.bytes_sent,
            evictions = stats.evictions,
            dropped = stats.dropped_tasks,
            rejected = stats.rejected,
            "dispatcher stopped"
        );
    }
}

/// Close the socket, drop its registration and free the slot. Leaves the
/// slot's timer alone.
fn teardown(
    table: &mut ConnectionSlab<Connection>,
    epoll: &Epoll,
    ctx: &ServerContext,
    token: Token,
) {
    let Some(slot) = table.get(token) else {
        return;
    };
    ctx.metrics.dec_conn();
    let peer = {
        let mut conn = lock(slot.conn());
        if let Some(fd) = conn.raw_fd() {
            let _ = epoll.delete(fd);
        }
        let peer = conn.peer();
        conn.close();
        peer
    };
    table.free(token);
    debug!(?peer, live = table.len(), "connection closed");
}

/// Send the canned busy response and drop the socket.
fn reject(mut stream: TcpStream, peer: SocketAddr) {
    warn!(%peer, "connection table full, rejecting");
    let _ = stream.set_nonblocking(true);
    let _ = stream.write(BUSY_RESPONSE);
}

/// Evicts idle connections on behalf of the timer list.
struct Reaper<'a> {
    table: &'a mut ConnectionSlab<Connection>,
    epoll: &'a Epoll,
    ctx: &'a ServerContext,
    now: Instant,
    idle: Duration,
}

impl Evict<Token> for Reaper<'_> {
    fn evict(&mut self, token: Token) -> Verdict {
        let Some(slot) = self.table.get_mut(token) else {
            return Verdict::Evicted;
        };
        if slot.checked_out {
            // A worker holds it; only its completion may end the connection.
            return Verdict::Postpone(self.now + self.idle);
        }
        slot.timer = None;
        self.ctx.metrics.inc_eviction();
        teardown(self.table, self.epoll, self.ctx, token);
        Verdict::Evicted
    }
}
