// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Config;

/// Process-wide counters.
///
/// `live_conns`, `evictions` and `rejected` are written by the dispatcher
/// thread only; the others may be bumped from any worker.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct Metrics {
    pub live_conns: AtomicUsize,
    pub requests: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub evictions: AtomicUsize,
    pub dropped_tasks: AtomicUsize,
    pub rejected: AtomicUsize,
}

/// A plain copy of [`Metrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub live_conns: usize,
    pub requests: usize,
    pub bytes_sent: usize,
    pub evictions: usize,
    pub dropped_tasks: usize,
    pub rejected: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Relaxed)
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.dropped_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_conns: self.live_conns.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dropped_tasks: self.dropped_tasks.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Everything the dispatcher and the workers share: built once at startup
/// and handed around behind an `Arc`.
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
    pub metrics: Metrics,
}

impl ServerContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            metrics: Metrics::new(),
        }
    }
}
