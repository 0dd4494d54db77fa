//! Monotonic server counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Stats {
    pub forward_count: AtomicU64,
    pub stub_forward_count: AtomicU64,
    pub cache_hit: AtomicU64,
    pub cache_miss: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forward_count: self.forward_count.load(Ordering::Relaxed),
            stub_forward_count: self.stub_forward_count.load(Ordering::Relaxed),
            cache_hit: self.cache_hit.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub forward_count: u64,
    pub stub_forward_count: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
}
