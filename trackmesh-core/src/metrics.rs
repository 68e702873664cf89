//! Node counters for monitoring
//!
//! Thread-safe counters using atomic types, rendered as Prometheus text.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared by one node's components
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Local catalog
    tracks_added: AtomicU64,

    // get_track outcomes
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    remote_fetches: AtomicU64,
    remote_failures: AtomicU64,
    integrity_failures: AtomicU64,
    fetches_cancelled: AtomicU64,

    // Gossip
    gossip_rounds: AtomicU64,
    handshake_failures: AtomicU64,
    peers_evicted: AtomicU64,

    // Byte transfer
    bytes_served: AtomicU64,
    bytes_fetched: AtomicU64,

    start_time: Instant,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub tracks_added: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    pub remote_fetches: u64,
    pub remote_failures: u64,
    pub integrity_failures: u64,
    pub fetches_cancelled: u64,
    pub gossip_rounds: u64,
    pub handshake_failures: u64,
    pub peers_evicted: u64,
    pub bytes_served: u64,
    pub bytes_fetched: u64,
    pub uptime_seconds: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                tracks_added: AtomicU64::new(0),
                local_hits: AtomicU64::new(0),
                local_misses: AtomicU64::new(0),
                remote_fetches: AtomicU64::new(0),
                remote_failures: AtomicU64::new(0),
                integrity_failures: AtomicU64::new(0),
                fetches_cancelled: AtomicU64::new(0),
                gossip_rounds: AtomicU64::new(0),
                handshake_failures: AtomicU64::new(0),
                peers_evicted: AtomicU64::new(0),
                bytes_served: AtomicU64::new(0),
                bytes_fetched: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn track_added(&self) {
        self.inner.tracks_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_hit(&self) {
        self.inner.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_miss(&self) {
        self.inner.local_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_fetched(&self, size: usize) {
        self.inner.remote_fetches.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_fetched
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn remote_failed(&self) {
        self.inner.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn integrity_failed(&self) {
        self.inner.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_cancelled(&self) {
        self.inner.fetches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gossip_round(&self) {
        self.inner.gossip_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.inner.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_evicted(&self) {
        self.inner.peers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn content_served(&self, size: usize) {
        self.inner
            .bytes_served
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn fetches_cancelled(&self) -> u64 {
        self.inner.fetches_cancelled.load(Ordering::Relaxed)
    }

    pub fn remote_fetches(&self) -> u64 {
        self.inner.remote_fetches.load(Ordering::Relaxed)
    }

    pub fn local_hits(&self) -> u64 {
        self.inner.local_hits.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;

        MetricsSnapshot {
            tracks_added: load(&inner.tracks_added),
            local_hits: load(&inner.local_hits),
            local_misses: load(&inner.local_misses),
            remote_fetches: load(&inner.remote_fetches),
            remote_failures: load(&inner.remote_failures),
            integrity_failures: load(&inner.integrity_failures),
            fetches_cancelled: load(&inner.fetches_cancelled),
            gossip_rounds: load(&inner.gossip_rounds),
            handshake_failures: load(&inner.handshake_failures),
            peers_evicted: load(&inner.peers_evicted),
            bytes_served: load(&inner.bytes_served),
            bytes_fetched: load(&inner.bytes_fetched),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Generate Prometheus-formatted metrics text
    pub fn to_prometheus(&self, track_count: usize, peer_count: usize, stored_bytes: u64) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let mut push = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP trackmesh_{name} {help}\n# TYPE trackmesh_{name} {kind}\ntrackmesh_{name} {value}\n\n"
            ));
        };

        push("tracks", "gauge", "Tracks in the local catalog", track_count as u64);
        push("peers", "gauge", "Registered peers", peer_count as u64);
        push("stored_bytes", "gauge", "Bytes of content stored locally", stored_bytes);
        push("uptime_seconds", "counter", "Time since node started in seconds", s.uptime_seconds);
        push("tracks_added_total", "counter", "Tracks added through this node", s.tracks_added);
        push("local_hits_total", "counter", "Track lookups served from the local store", s.local_hits);
        push("local_misses_total", "counter", "Track lookups that missed the local store", s.local_misses);
        push("remote_fetches_total", "counter", "Tracks fetched from peers", s.remote_fetches);
        push("remote_failures_total", "counter", "Failed fetch attempts against peers", s.remote_failures);
        push("integrity_failures_total", "counter", "Content that failed hash verification", s.integrity_failures);
        push("fetches_cancelled_total", "counter", "Fetch attempts cancelled after another peer won", s.fetches_cancelled);
        push("gossip_rounds_total", "counter", "Completed gossip rounds", s.gossip_rounds);
        push("handshake_failures_total", "counter", "Failed discover handshakes", s.handshake_failures);
        push("peers_evicted_total", "counter", "Peers evicted after repeated failures", s.peers_evicted);
        push("bytes_served_total", "counter", "Content bytes served to peers", s.bytes_served);
        push("bytes_fetched_total", "counter", "Content bytes fetched from peers", s.bytes_fetched);

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_counters() {
        let metrics = Metrics::new();

        metrics.local_hit();
        metrics.local_hit();
        metrics.local_miss();
        metrics.remote_fetched(100);
        metrics.remote_fetched(50);
        metrics.remote_failed();

        let s = metrics.snapshot();
        assert_eq!(s.local_hits, 2);
        assert_eq!(s.local_misses, 1);
        assert_eq!(s.remote_fetches, 2);
        assert_eq!(s.bytes_fetched, 150);
        assert_eq!(s.remote_failures, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let other = metrics.clone();

        other.fetch_cancelled();
        other.peer_evicted();

        assert_eq!(metrics.fetches_cancelled(), 1);
        assert_eq!(metrics.snapshot().peers_evicted, 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.track_added();
        metrics.content_served(512);

        let output = metrics.to_prometheus(42, 3, 1024);

        assert!(output.contains("trackmesh_tracks 42"));
        assert!(output.contains("trackmesh_peers 3"));
        assert!(output.contains("trackmesh_stored_bytes 1024"));
        assert!(output.contains("trackmesh_tracks_added_total 1"));
        assert!(output.contains("trackmesh_bytes_served_total 512"));
        assert!(output.contains("# TYPE trackmesh_gossip_rounds_total counter"));
    }
}
