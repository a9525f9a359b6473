use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters for dispatch and recovery
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    claimed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    lost_races: AtomicU64,
    stale_recovered: AtomicU64,
    tasks_requeued: AtomicU64,
    tasks_dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub lost_races: u64,
    pub stale_recovered: u64,
    pub tasks_requeued: u64,
    pub tasks_dead_lettered: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_claimed(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_lost_races(&self) {
        self.lost_races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stale_recovered(&self, n: u64) {
        self.stale_recovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tasks_requeued(&self, n: u64) {
        self.tasks_requeued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tasks_dead_lettered(&self, n: u64) {
        self.tasks_dead_lettered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            stale_recovered: self.stale_recovered.load(Ordering::Relaxed),
            tasks_requeued: self.tasks_requeued.load(Ordering::Relaxed),
            tasks_dead_lettered: self.tasks_dead_lettered.load(Ordering::Relaxed),
        }
    }
}
