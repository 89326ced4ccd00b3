use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::safe_converter::SafeCast;

#[derive(Default, Debug)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dropped_chunks: AtomicU64,
    dropped_messages: AtomicU64,
    resent_chunks: AtomicU64,
    pool_rebuilds: AtomicU64,
}

#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub dropped_chunks: u64,
    pub dropped_messages: u64,
    pub resent_chunks: u64,
    pub pool_rebuilds: u64,
}

impl TransportStats {
    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub fn inc_dropped_chunks(&self) {
        self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_messages(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_resent_chunks(&self, n: usize) {
        self.resent_chunks.fetch_add(n.safe_cast(), Ordering::Relaxed);
    }

    pub fn inc_pool_rebuilds(&self) {
        self.pool_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            dropped_chunks: self.dropped_chunks.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            resent_chunks: self.resent_chunks.load(Ordering::Relaxed),
            pool_rebuilds: self.pool_rebuilds.load(Ordering::Relaxed),
        }
    }
}
