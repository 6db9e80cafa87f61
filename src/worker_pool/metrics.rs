// ABOUTME: Metrics and observability for the worker pool
//
// Tracks:
// - Requests: total sent, queued waiting for a worker, expired in the queue
// - Workers: connected count, restarts, spawn failures

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Pool-level counters, updated by the pool thread and read from anywhere
#[derive(Debug, Default)]
pub struct PoolMetrics {
    requests_total: AtomicU64,
    requests_queued: AtomicU32,
    requests_expired: AtomicU64,
    workers_connected: AtomicU32,
    worker_restarts: AtomicU64,
    spawn_failures: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests handed to the pool
    pub requests_total: u64,
    /// Requests waiting for a connected worker right now
    pub requests_queued: u32,
    /// Requests failed because no worker connected in time
    pub requests_expired: u64,
    /// Workers currently connected
    pub workers_connected: u32,
    /// Worker respawns after an unexpected exit
    pub worker_restarts: u64,
    /// Workers that could not be started at all
    pub spawn_failures: u64,
}

impl PoolMetrics {
    /// All counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request handed to the pool
    pub fn request_sent(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `count` requests dropped from the queue after the dispatch timeout
    pub fn requests_expired(&self, count: u64) {
        self.requests_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Current dispatch queue length
    pub fn set_queued(&self, count: usize) {
        self.requests_queued
            .store(u32::try_from(count).unwrap_or(u32::MAX), Ordering::Relaxed);
    }

    /// Current number of connected workers
    pub fn set_connected(&self, count: usize) {
        self.workers_connected
            .store(u32::try_from(count).unwrap_or(u32::MAX), Ordering::Relaxed);
    }

    /// Count one respawn
    pub fn worker_restarted(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one worker that could not be spawned
    pub fn spawn_failed(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_expired: self.requests_expired.load(Ordering::Relaxed),
            workers_connected: self.workers_connected.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = PoolMetrics::new();
        metrics.request_sent();
        metrics.request_sent();
        metrics.requests_expired(1);
        metrics.set_queued(3);
        metrics.set_connected(2);
        metrics.worker_restarted();
        metrics.spawn_failed();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                requests_total: 2,
                requests_queued: 3,
                requests_expired: 1,
                workers_connected: 2,
                worker_restarts: 1,
                spawn_failures: 1,
            }
        );
    }
}
