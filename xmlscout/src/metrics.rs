use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Tracks transfer and pool activity for one run
#[derive(Debug, Clone)]
pub struct TransferMetrics {
    // Transfer metrics
    bytes_read: Arc<AtomicU64>,
    chunks_read: Arc<AtomicU64>,
    files_opened: Arc<AtomicU64>,

    // Pool metrics
    connections_opened: Arc<AtomicU64>,
    connect_failures: Arc<AtomicU64>,
    stale_sessions: Arc<AtomicU64>,
    invalidations: Arc<AtomicU64>,
    acquire_waits: Arc<AtomicU64>,
    acquire_timeouts: Arc<AtomicU64>,
}

impl TransferMetrics {
    /// Creates a new TransferMetrics instance
    pub fn new() -> Self {
        Self {
            bytes_read: Arc::new(AtomicU64::new(0)),
            chunks_read: Arc::new(AtomicU64::new(0)),
            files_opened: Arc::new(AtomicU64::new(0)),
            connections_opened: Arc::new(AtomicU64::new(0)),
            connect_failures: Arc::new(AtomicU64::new(0)),
            stale_sessions: Arc::new(AtomicU64::new(0)),
            invalidations: Arc::new(AtomicU64::new(0)),
            acquire_waits: Arc::new(AtomicU64::new(0)),
            acquire_timeouts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records one chunk worth of fresh bytes
    pub fn record_chunk(&self, fresh_bytes: u64) {
        let total = self.bytes_read.fetch_add(fresh_bytes, Ordering::Relaxed) + fresh_bytes;
        self.chunks_read.fetch_add(1, Ordering::Relaxed);
        debug!("Chunk read: {} bytes, total: {} bytes", fresh_bytes, total);
    }

    pub fn record_file_opened(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of one connection attempt
    pub fn record_connect(&self, success: bool) {
        if success {
            self.connections_opened.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connect_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A pooled session failed its liveness check
    pub fn record_stale_session(&self) {
        self.stale_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker had to wait for a session to come back
    pub fn record_acquire_wait(&self) {
        self.acquire_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets current statistics
    pub fn get_stats(&self) -> TransferStats {
        TransferStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            stale_sessions: self.stale_sessions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            acquire_waits: self.acquire_waits.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Logs current statistics
    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Transfer stats:\n\
             Bytes read: {} in {} chunks from {} files\n\
             Connections opened/failed: {}/{}\n\
             Stale sessions replaced: {}\n\
             Sessions invalidated: {}\n\
             Acquire waits/timeouts: {}/{}",
            stats.bytes_read,
            stats.chunks_read,
            stats.files_opened,
            stats.connections_opened,
            stats.connect_failures,
            stats.stale_sessions,
            stats.invalidations,
            stats.acquire_waits,
            stats.acquire_timeouts
        );
    }
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transfer and pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub bytes_read: u64,
    pub chunks_read: u64,
    pub files_opened: u64,
    pub connections_opened: u64,
    pub connect_failures: u64,
    pub stale_sessions: u64,
    pub invalidations: u64,
    pub acquire_waits: u64,
    pub acquire_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_tracking() {
        let metrics = TransferMetrics::new();

        metrics.record_chunk(1000);
        metrics.record_chunk(500);
        let stats = metrics.get_stats();
        assert_eq!(stats.bytes_read, 1500);
        assert_eq!(stats.chunks_read, 2);
    }

    #[test]
    fn test_connect_tracking() {
        let metrics = TransferMetrics::new();

        metrics.record_connect(true);
        metrics.record_connect(false);
        metrics.record_connect(true);
        let stats = metrics.get_stats();
        assert_eq!(stats.connections_opened, 2);
        assert_eq!(stats.connect_failures, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = TransferMetrics::new();
        let clone = metrics.clone();

        clone.record_invalidation();
        clone.record_acquire_wait();
        clone.record_acquire_timeout();
        let stats = metrics.get_stats();
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.acquire_waits, 1);
        assert_eq!(stats.acquire_timeouts, 1);
    }
}
