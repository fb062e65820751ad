//! Per-info-hash peer sets with TTL (spec §4.7).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
    time::{
        Duration,
        Instant,
        SystemTime,
        UNIX_EPOCH,
    },
};

use krpc_encoding::NodeID;

const PEER_TTL: Duration = Duration::from_secs(30 * 60);
const CAPACITY_PER_INFO_HASH: usize = 1_024;

struct PeerRecord {
    endpoint: SocketAddr,
    announced_at: Instant,
}

#[derive(Default)]
struct Swarm {
    peers: Vec<PeerRecord>,
}

impl Swarm {
    fn prune_expired(&mut self) {
        self.peers
            .retain(|peer| peer.announced_at.elapsed() < PEER_TTL);
    }

    fn upsert(&mut self, endpoint: SocketAddr) {
        self.prune_expired();

        if let Some(existing) = self.peers.iter_mut().find(|p| p.endpoint == endpoint) {
            existing.announced_at = Instant::now();
            return;
        }

        if self.peers.len() >= CAPACITY_PER_INFO_HASH {
            // Oldest by announce time is evicted to make room.
            if let Some((idx, _)) = self
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.announced_at)
            {
                self.peers.remove(idx);
            }
        }

        self.peers.push(PeerRecord {
            endpoint,
            announced_at: Instant::now(),
        });
    }
}

/// Peer swarms discovered via `get_peers`/`announce_peer`, keyed by
/// info-hash. Internally synchronized so the RPC dispatcher (serving
/// inbound `announce_peer`) and the iterative lookup engine (merging
/// `get_peers` responses) can share one store without an `await` ever
/// happening while the lock is held.
#[derive(Default)]
pub struct PeerStore {
    swarms: Mutex<HashMap<NodeID, Swarm>>,
}

impl PeerStore {
    pub fn new() -> PeerStore {
        PeerStore::default()
    }

    pub fn add(&self, info_hash: NodeID, endpoint: SocketAddr) {
        let mut swarms = self.swarms.lock().unwrap();
        swarms.entry(info_hash).or_default().upsert(endpoint);
    }

    /// Up to `max` peers for `info_hash`, most-recently-announced first.
    pub fn get(&self, info_hash: &NodeID, max: usize) -> Vec<SocketAddr> {
        let mut swarms = self.swarms.lock().unwrap();
        let Some(swarm) = swarms.get_mut(info_hash) else {
            return Vec::new();
        };
        swarm.prune_expired();

        let mut peers: Vec<&PeerRecord> = swarm.peers.iter().collect();
        peers.sort_by(|a, b| b.announced_at.cmp(&a.announced_at));
        peers.into_iter().take(max).map(|p| p.endpoint).collect()
    }

    pub fn has_peers(&self, info_hash: &NodeID) -> bool {
        let mut swarms = self.swarms.lock().unwrap();
        match swarms.get_mut(info_hash) {
            Some(swarm) => {
                swarm.prune_expired();
                !swarm.peers.is_empty()
            }
            None => false,
        }
    }

    /// Eagerly removes expired peers across every swarm, called on a
    /// 60 s tick by the crawler (spec §4.7).
    pub fn sweep(&self) {
        let mut swarms = self.swarms.lock().unwrap();
        for swarm in swarms.values_mut() {
            swarm.prune_expired();
        }
        swarms.retain(|_, swarm| !swarm.peers.is_empty());
    }

    pub fn info_hash_count(&self) -> usize {
        self.swarms.lock().unwrap().len()
    }

    /// Converts every live peer record to a wall-clock timestamp for
    /// `peer_storage.dat` (spec §4.8). `announced_at_unix_ms` is derived
    /// from the monotonic clock at the snapshot boundary.
    pub fn snapshot(&self) -> Vec<(NodeID, Vec<(SocketAddr, u64)>)> {
        let now_unix_ms = unix_millis_now();
        let mut swarms = self.swarms.lock().unwrap();
        swarms
            .iter_mut()
            .map(|(info_hash, swarm)| {
                swarm.prune_expired();
                let peers = swarm
                    .peers
                    .iter()
                    .map(|p| {
                        let elapsed_ms = p.announced_at.elapsed().as_millis() as u64;
                        (p.endpoint, now_unix_ms.saturating_sub(elapsed_ms))
                    })
                    .collect();
                (*info_hash, peers)
            })
            .collect()
    }

    /// Replaces the store's contents from a `peer_storage.dat` load,
    /// reconstructing monotonic timestamps from the wall-clock values
    /// recorded at save time. Entries already past the TTL are dropped.
    pub fn restore(&self, entries: Vec<(NodeID, Vec<(SocketAddr, u64)>)>) {
        let now_unix_ms = unix_millis_now();
        let mut swarms = self.swarms.lock().unwrap();
        swarms.clear();

        for (info_hash, peers) in entries {
            let mut swarm = Swarm::default();
            for (endpoint, announced_at_unix_ms) in peers {
                let elapsed_ms = now_unix_ms.saturating_sub(announced_at_unix_ms);
                let elapsed = Duration::from_millis(elapsed_ms);
                if elapsed >= PEER_TTL {
                    continue;
                }
                let announced_at = Instant::now()
                    .checked_sub(elapsed)
                    .unwrap_or_else(Instant::now);
                swarm.peers.push(PeerRecord {
                    endpoint,
                    announced_at,
                });
            }
            if !swarm.peers.is_empty() {
                swarms.insert(info_hash, swarm);
            }
        }
    }
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{
        Ipv4Addr,
        SocketAddrV4,
    };

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn stores_and_retrieves_peers() {
        let store = PeerStore::new();
        let info_hash = NodeID::random();
        store.add(info_hash, endpoint(1));
        store.add(info_hash, endpoint(2));

        let peers = store.get(&info_hash, 10);
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn unknown_info_hash_returns_empty() {
        let store = PeerStore::new();
        assert!(store.get(&NodeID::random(), 10).is_empty());
    }

    #[test]
    fn capacity_overflow_evicts_oldest() {
        let store = PeerStore::new();
        let info_hash = NodeID::random();

        for port in 0..(CAPACITY_PER_INFO_HASH as u16 + 1) {
            store.add(info_hash, endpoint(port));
        }

        let peers = store.get(&info_hash, CAPACITY_PER_INFO_HASH + 10);
        assert_eq!(peers.len(), CAPACITY_PER_INFO_HASH);
        assert!(!peers.contains(&endpoint(0)), "oldest entry should be evicted");
    }

    #[test]
    fn repeated_add_refreshes_rather_than_duplicates() {
        let store = PeerStore::new();
        let info_hash = NodeID::random();
        store.add(info_hash, endpoint(1));
        store.add(info_hash, endpoint(1));
        assert_eq!(store.get(&info_hash, 10).len(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let store = PeerStore::new();
        let info_hash = NodeID::random();
        store.add(info_hash, endpoint(1));
        store.add(info_hash, endpoint(2));

        let snapshot = store.snapshot();

        let restored = PeerStore::new();
        restored.restore(snapshot);

        assert_eq!(restored.get(&info_hash, 10).len(), 2);
    }

    #[test]
    fn restore_drops_entries_already_past_ttl() {
        let store = PeerStore::new();
        let info_hash = NodeID::random();
        let stale_unix_ms = unix_millis_now().saturating_sub(PEER_TTL.as_millis() as u64 + 1_000);
        store.restore(vec![(info_hash, vec![(endpoint(1), stale_unix_ms)])]);
        assert!(store.get(&info_hash, 10).is_empty());
    }
}
