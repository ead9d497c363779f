//! The XOR-metric routing table: 160 distance-partitioned buckets of peer
//! descriptors, each capped at K, with least-recently-seen replacement.

use crate::identity::{bucket_index, distance, Id};
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;

pub const NUM_BUCKETS: usize = 160;
pub const DEFAULT_K: usize = 8;
pub const MAX_K: usize = 100;
pub const MAX_CLOSEST: usize = 1000;

/// An immutable (ID, IPv4, port) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: Id,
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(id: Id, addr: Ipv4Addr, port: u16) -> Result<Peer, RoutingError> {
        if port == 0 {
            return Err(RoutingError::BadPort(port));
        }
        Ok(Peer { id, addr, port })
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from((self.addr, self.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    SelfInsert,
    BadPort(u16),
    BadCount(usize),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::SelfInsert => write!(f, "refusing to store the local id in the routing table"),
            RoutingError::BadPort(p) => write!(f, "port must be in 1..65535, got {p}"),
            RoutingError::BadCount(c) => write!(f, "count must be in 1..={MAX_CLOSEST}, got {c}"),
        }
    }
}

impl std::error::Error for RoutingError {}

/// One K-bucket: least-recently-seen at the head, most-recently-seen at the tail.
#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<Peer>,
}

/// The Kademlia-style routing table owned by a single query engine.
pub struct RoutingTable {
    local_id: Id,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: Id, k: usize) -> RoutingTable {
        let k = k.clamp(1, MAX_K);
        RoutingTable {
            local_id,
            k,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// `true` if newly added, `false` if already known (promoted to tail) or
    /// the bucket is full. Errors if `peer.id` is the local id.
    pub fn insert(&mut self, peer: Peer) -> Result<bool, RoutingError> {
        if peer.id == self.local_id {
            return Err(RoutingError::SelfInsert);
        }
        let index = bucket_index(&self.local_id, &peer.id).expect("checked above");
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.entries.iter().position(|p| *p == peer) {
            bucket.entries.remove(pos);
            bucket.entries.push_back(peer);
            return Ok(false);
        }

        if bucket.entries.len() >= self.k {
            return Ok(false);
        }

        bucket.entries.push_back(peer);
        Ok(true)
    }

    /// `true` if removed, `false` if the peer was not present.
    pub fn remove(&mut self, peer: &Peer) -> bool {
        let Ok(index) = bucket_index(&self.local_id, &peer.id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.entries.iter().position(|p| p == peer) {
            bucket.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Up to `count` peers sorted by ascending distance to `target`.
    pub fn closest(&self, target: &Id, count: usize) -> Result<Vec<Peer>, RoutingError> {
        if count == 0 || count > MAX_CLOSEST {
            return Err(RoutingError::BadCount(count));
        }
        let mut all: Vec<Peer> = self.snapshot();
        // `sort_by_key` is stable, so peers that tie on distance keep their
        // relative (insertion) order, as required.
        all.sort_by_key(|p| distance(&p.id, target));
        all.truncate(count);
        Ok(all)
    }

    /// A flat copy of every stored descriptor.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` peers chosen uniformly at random, for the passive
    /// observer's keep-alive probing.
    pub fn sample(&self, count: usize) -> Vec<Peer> {
        use rand::seq::SliceRandom;
        let mut all = self.snapshot();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(count);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> Peer {
        let mut id = [0u8; 20];
        id[19] = byte;
        Peer::new(Id::new(id), Ipv4Addr::new(127, 0, 0, 1), 6881).unwrap()
    }

    #[test]
    fn insert_rejects_local_id() {
        let local = Id::new([0u8; 20]);
        let mut table = RoutingTable::new(local, DEFAULT_K);
        let me = Peer::new(local, Ipv4Addr::LOCALHOST, 1).unwrap();
        assert_eq!(table.insert(me), Err(RoutingError::SelfInsert));
    }

    #[test]
    fn replacement_policy_literal_scenario() {
        // spec.md section 8 scenario 5: local id 0x00*20, K=2, inserting
        // peers at distances 4, 5, 6 (all land in bucket 2): first two
        // succeed, the third is refused as "full".
        let local = Id::new([0u8; 20]);
        let mut table = RoutingTable::new(local, 2);

        let p4 = peer(4);
        let p5 = peer(5);
        let p6 = peer(6);

        assert_eq!(table.insert(p4).unwrap(), true);
        assert_eq!(table.insert(p5).unwrap(), true);
        assert_eq!(table.insert(p6).unwrap(), false);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn reinsert_known_peer_promotes_to_tail() {
        let local = Id::new([0u8; 20]);
        let mut table = RoutingTable::new(local, 8);
        let p1 = peer(1);
        let p2 = peer(2);

        table.insert(p1).unwrap();
        table.insert(p2).unwrap();
        assert_eq!(table.insert(p1).unwrap(), false);

        let snapshot = table.snapshot();
        // p1 was promoted, so among same-bucket members ordering by
        // insertion/promotion places p2 before p1 now.
        assert!(snapshot.contains(&p1));
        assert!(snapshot.contains(&p2));
    }

    #[test]
    fn remove_then_remove_again() {
        let local = Id::new([0u8; 20]);
        let mut table = RoutingTable::new(local, 8);
        let p1 = peer(1);
        table.insert(p1).unwrap();
        assert!(table.remove(&p1));
        assert!(!table.remove(&p1));
    }

    #[test]
    fn closest_is_sorted_ascending_and_capped() {
        let local = Id::new([0u8; 20]);
        let mut table = RoutingTable::new(local, DEFAULT_K);
        for b in 1..=20u8 {
            table.insert(peer(b)).unwrap();
        }
        let target = Id::new([0u8; 20]);
        let closest = table.closest(&target, 5).unwrap();
        assert_eq!(closest.len(), 5);
        let mut prev = distance(&closest[0].id, &target);
        for p in &closest[1..] {
            let d = distance(&p.id, &target);
            assert!(d >= prev);
            prev = d;
        }
    }

    #[test]
    fn closest_rejects_bad_count() {
        let table = RoutingTable::new(Id::new([0u8; 20]), DEFAULT_K);
        assert!(table.closest(&Id::random(), 0).is_err());
        assert!(table.closest(&Id::random(), MAX_CLOSEST + 1).is_err());
    }

    #[test]
    fn no_bucket_ever_exceeds_k() {
        let local = Id::new([0u8; 20]);
        let mut table = RoutingTable::new(local, 3);
        for b in 1..=255u8 {
            let _ = table.insert(peer(b));
        }
        for bucket in &table.buckets {
            assert!(bucket.entries.len() <= 3);
        }
    }

    #[test]
    fn peer_rejects_zero_port() {
        assert_eq!(
            Peer::new(Id::random(), Ipv4Addr::LOCALHOST, 0),
            Err(RoutingError::BadPort(0))
        );
    }
}
