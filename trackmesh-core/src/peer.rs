//! Remote peers and the local peer directory
//!
//! A [`Peer`] is this node's best-known view of one remote node. The
//! [`PeerDirectory`] holds every registered peer plus addresses that have
//! been learned (seeds, manual adds, transitive discovery) but not yet
//! handshaken.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content_hash::ContentHash;
use crate::messages::PeerAddr;
use crate::track::unix_now;

/// One remote node's address, liveness and advertised content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: Uuid,
    pub host: String,
    pub port: u16,
    /// Unix seconds of the last successful exchange
    pub last_seen: u64,
    #[serde(default)]
    pub known_hashes: BTreeSet<ContentHash>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Peer {
    pub fn new(peer_id: Uuid, addr: PeerAddr) -> Self {
        Self {
            peer_id,
            host: addr.host,
            port: addr.port,
            last_seen: unix_now(),
            known_hashes: BTreeSet::new(),
            consecutive_failures: 0,
        }
    }

    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }

    pub fn mark_seen(&mut self) {
        self.last_seen = unix_now();
        self.consecutive_failures = 0;
    }

    pub fn mark_failed(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// True when nothing has been heard from this peer for longer than `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.is_stale_at(unix_now(), timeout)
    }

    fn is_stale_at(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_seen) > timeout.as_secs()
    }

    /// Whether this peer claims to hold `hash`; `false` is only a hint
    pub fn has_track(&self, hash: &ContentHash) -> bool {
        self.known_hashes.contains(hash)
    }

    pub fn replace_known_hashes(&mut self, hashes: impl IntoIterator<Item = ContentHash>) {
        self.known_hashes = hashes.into_iter().collect();
    }
}

/// Result of recording a failed exchange with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted, peer kept
    Demoted(u32),
    /// Threshold reached, peer removed from the directory
    Evicted,
    /// Peer was not in the directory
    Unknown,
}

/// Registered peers keyed by id, plus addresses awaiting a handshake
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: HashMap<Uuid, Peer>,
    pending: BTreeSet<PeerAddr>,
    local_addr: Option<PeerAddr>,
}

impl PeerDirectory {
    pub fn new(local_addr: PeerAddr) -> Self {
        Self {
            peers: HashMap::new(),
            pending: BTreeSet::new(),
            local_addr: Some(local_addr),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, peer_id: &Uuid) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn find_by_addr(&self, addr: &PeerAddr) -> Option<&Peer> {
        self.peers
            .values()
            .find(|p| p.host == addr.host && p.port == addr.port)
    }

    fn is_local(&self, addr: &PeerAddr) -> bool {
        self.local_addr.as_ref() == Some(addr)
    }

    /// Register or refresh a peer after a successful handshake
    ///
    /// The peer's advertised hash set replaces whatever was known before. A
    /// different id already registered at the same address is dropped, since
    /// the remote process has restarted.
    pub fn upsert_handshake(
        &mut self,
        peer_id: Uuid,
        addr: PeerAddr,
        known_hashes: impl IntoIterator<Item = ContentHash>,
    ) -> &Peer {
        let replaced: Vec<Uuid> = self
            .peers
            .values()
            .filter(|p| p.peer_id != peer_id && p.host == addr.host && p.port == addr.port)
            .map(|p| p.peer_id)
            .collect();
        for old in replaced {
            info!(old = %old, new = %peer_id, addr = %addr, "Peer re-registered under a new id");
            self.peers.remove(&old);
        }

        self.pending.remove(&addr);

        let peer = self.peers.entry(peer_id).or_insert_with(|| {
            info!(peer = %peer_id, addr = %addr, "Registered new peer");
            Peer::new(peer_id, addr.clone())
        });
        peer.host = addr.host;
        peer.port = addr.port;
        peer.replace_known_hashes(known_hashes);
        peer.mark_seen();
        peer
    }

    /// Insert a peer as-is, e.g. when restoring persisted state
    pub fn restore(&mut self, peer: Peer) {
        let addr = peer.addr();
        self.pending.remove(&addr);
        self.peers.insert(peer.peer_id, peer);
    }

    /// Queue an address for a handshake in the next gossip round
    ///
    /// Returns false for the local address and for already-registered ones.
    pub fn add_pending(&mut self, addr: PeerAddr) -> bool {
        if self.is_local(&addr) || self.find_by_addr(&addr).is_some() {
            return false;
        }
        let added = self.pending.insert(addr.clone());
        if added {
            debug!(addr = %addr, "Queued address for discovery");
        }
        added
    }

    pub fn pending(&self) -> Vec<PeerAddr> {
        self.pending.iter().cloned().collect()
    }

    /// Drain the pending set for a gossip round
    pub fn take_pending(&mut self) -> Vec<PeerAddr> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Refresh a peer after any successful exchange
    pub fn mark_seen(&mut self, peer_id: &Uuid) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.mark_seen();
                true
            }
            None => false,
        }
    }

    /// Drop one hash from a peer's advertised set after it answered "not found"
    pub fn forget_hash(&mut self, peer_id: &Uuid, hash: &ContentHash) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.known_hashes.remove(hash);
            peer.mark_seen();
        }
    }

    /// Count a failed exchange; evict once `threshold` consecutive failures are reached
    pub fn record_failure(&mut self, peer_id: &Uuid, threshold: u32) -> FailureOutcome {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return FailureOutcome::Unknown;
        };

        peer.mark_failed();
        let failures = peer.consecutive_failures;
        if failures >= threshold {
            warn!(peer = %peer_id, addr = %peer.addr(), failures, "Evicting unresponsive peer");
            self.peers.remove(peer_id);
            FailureOutcome::Evicted
        } else {
            debug!(peer = %peer_id, failures, "Peer failure recorded");
            FailureOutcome::Demoted(failures)
        }
    }

    /// Peers believed to hold `hash`, best candidates first
    ///
    /// Order: fresh before stale, then fewest consecutive failures, then most
    /// recently seen.
    pub fn candidates_for(&self, hash: &ContentHash, stale_after: Duration) -> Vec<Peer> {
        let now = unix_now();
        let mut candidates: Vec<Peer> = self
            .peers
            .values()
            .filter(|p| p.has_track(hash))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            a.is_stale_at(now, stale_after)
                .cmp(&b.is_stale_at(now, stale_after))
                .then(a.consecutive_failures.cmp(&b.consecutive_failures))
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.peer_id.cmp(&b.peer_id))
        });
        candidates
    }

    /// Peers to contact this round: everyone if the directory is small,
    /// otherwise a random subset of `fanout`
    pub fn gossip_targets(&self, fanout: usize) -> Vec<Peer> {
        let mut targets: Vec<Peer> = self.peers.values().cloned().collect();
        if targets.len() > fanout {
            targets.shuffle(&mut rand::thread_rng());
            targets.truncate(fanout);
        }
        targets
    }

    /// Addresses of every registered peer, optionally excluding one
    pub fn addresses(&self, exclude: Option<&PeerAddr>) -> Vec<PeerAddr> {
        let mut addrs: Vec<PeerAddr> = self
            .peers
            .values()
            .map(Peer::addr)
            .filter(|a| Some(a) != exclude)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        addrs.sort();
        addrs
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.addr().cmp(&b.addr()).then(a.peer_id.cmp(&b.peer_id)));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerAddr {
        PeerAddr::new("127.0.0.1", port)
    }

    fn hash(n: u8) -> ContentHash {
        ContentHash::of(&[n])
    }

    fn directory() -> PeerDirectory {
        PeerDirectory::new(addr(7000))
    }

    #[test]
    fn test_mark_seen_resets_failures() {
        let mut peer = Peer::new(Uuid::new_v4(), addr(7001));
        peer.mark_failed();
        peer.mark_failed();
        assert_eq!(peer.consecutive_failures, 2);

        peer.last_seen = 0;
        peer.mark_seen();
        assert_eq!(peer.consecutive_failures, 0);
        assert!(peer.last_seen > 0);
    }

    #[test]
    fn test_is_stale() {
        let mut peer = Peer::new(Uuid::new_v4(), addr(7001));
        assert!(!peer.is_stale(Duration::from_secs(60)));

        peer.last_seen = unix_now() - 120;
        assert!(peer.is_stale(Duration::from_secs(60)));
        assert!(!peer.is_stale(Duration::from_secs(600)));
    }

    #[test]
    fn test_has_track_and_replace() {
        let mut peer = Peer::new(Uuid::new_v4(), addr(7001));
        peer.replace_known_hashes([hash(1), hash(2)]);
        assert!(peer.has_track(&hash(1)));

        peer.replace_known_hashes([hash(3)]);
        assert!(!peer.has_track(&hash(1)));
        assert!(peer.has_track(&hash(3)));
    }

    #[test]
    fn test_upsert_handshake_is_idempotent() {
        let mut dir = directory();
        let id = Uuid::new_v4();

        dir.upsert_handshake(id, addr(7001), [hash(1)]);
        let first: Vec<_> = dir.snapshot().into_iter().map(|p| (p.peer_id, p.addr(), p.known_hashes)).collect();

        dir.upsert_handshake(id, addr(7001), [hash(1)]);
        let second: Vec<_> = dir.snapshot().into_iter().map(|p| (p.peer_id, p.addr(), p.known_hashes)).collect();

        assert_eq!(first, second);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_restarted_peer() {
        let mut dir = directory();
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();

        dir.upsert_handshake(old, addr(7001), [hash(1)]);
        dir.upsert_handshake(new, addr(7001), [hash(2)]);

        assert_eq!(dir.len(), 1);
        assert!(dir.get(&old).is_none());
        assert!(dir.get(&new).unwrap().has_track(&hash(2)));
    }

    #[test]
    fn test_pending_skips_local_and_registered() {
        let mut dir = directory();
        assert!(!dir.add_pending(addr(7000)));

        assert!(dir.add_pending(addr(7001)));
        assert!(!dir.add_pending(addr(7001)));
        assert_eq!(dir.pending(), vec![addr(7001)]);

        dir.upsert_handshake(Uuid::new_v4(), addr(7001), []);
        assert!(dir.pending().is_empty());
        assert!(!dir.add_pending(addr(7001)));
    }

    #[test]
    fn test_take_pending_drains() {
        let mut dir = directory();
        dir.add_pending(addr(7002));
        dir.add_pending(addr(7001));

        assert_eq!(dir.take_pending(), vec![addr(7001), addr(7002)]);
        assert!(dir.pending().is_empty());
    }

    #[test]
    fn test_eviction_after_threshold() {
        let mut dir = directory();
        let id = Uuid::new_v4();
        dir.upsert_handshake(id, addr(7001), []);

        for i in 1..5 {
            assert_eq!(dir.record_failure(&id, 5), FailureOutcome::Demoted(i));
        }
        assert_eq!(dir.record_failure(&id, 5), FailureOutcome::Evicted);
        assert!(dir.get(&id).is_none());
        assert_eq!(dir.record_failure(&id, 5), FailureOutcome::Unknown);
    }

    #[test]
    fn test_forget_hash_corrects_belief() {
        let mut dir = directory();
        let id = Uuid::new_v4();
        dir.upsert_handshake(id, addr(7001), [hash(1), hash(2)]);
        dir.record_failure(&id, 5);

        dir.forget_hash(&id, &hash(1));

        let peer = dir.get(&id).unwrap();
        assert!(!peer.has_track(&hash(1)));
        assert!(peer.has_track(&hash(2)));
        assert_eq!(peer.consecutive_failures, 0);
        assert!(dir.candidates_for(&hash(1), Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn test_candidate_ordering() {
        let mut dir = directory();
        let target = hash(9);
        let now = unix_now();

        let mut stale = Peer::new(Uuid::new_v4(), addr(7001));
        stale.known_hashes.insert(target);
        stale.last_seen = now - 3600;

        let mut flaky = Peer::new(Uuid::new_v4(), addr(7002));
        flaky.known_hashes.insert(target);
        flaky.consecutive_failures = 2;
        flaky.last_seen = now;

        let mut older = Peer::new(Uuid::new_v4(), addr(7003));
        older.known_hashes.insert(target);
        older.last_seen = now - 30;

        let mut best = Peer::new(Uuid::new_v4(), addr(7004));
        best.known_hashes.insert(target);
        best.last_seen = now;

        let mut unrelated = Peer::new(Uuid::new_v4(), addr(7005));
        unrelated.known_hashes.insert(hash(1));

        for p in [stale.clone(), flaky.clone(), older.clone(), best.clone(), unrelated] {
            dir.restore(p);
        }

        let order: Vec<u16> = dir
            .candidates_for(&target, Duration::from_secs(600))
            .iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(order, vec![7004, 7003, 7002, 7001]);
    }

    #[test]
    fn test_gossip_targets_bounded() {
        let mut dir = directory();
        for port in 7001..7011 {
            dir.upsert_handshake(Uuid::new_v4(), addr(port), []);
        }

        assert_eq!(dir.gossip_targets(20).len(), 10);
        assert_eq!(dir.gossip_targets(4).len(), 4);
    }

    #[test]
    fn test_addresses_exclude() {
        let mut dir = directory();
        dir.upsert_handshake(Uuid::new_v4(), addr(7001), []);
        dir.upsert_handshake(Uuid::new_v4(), addr(7002), []);

        assert_eq!(dir.addresses(None), vec![addr(7001), addr(7002)]);
        assert_eq!(dir.addresses(Some(&addr(7001))), vec![addr(7002)]);
    }
}
