use std::{
    cmp,
    net::SocketAddr,
    sync::RwLock,
};

use krpc_encoding::NodeID;

use crate::{
    bucket::{
        AddOutcome as BucketOutcome,
        Bucket,
    },
    node::Node,
};

/// Outcome of [`RoutingTable::add_node`] (spec §4.2 contract).
#[derive(Debug, Clone)]
pub enum AddOutcome {
    Added,
    Updated,
    Rejected,
    /// The bucket admitting `candidate` was full of `Good`/`Questionable`
    /// nodes; §4.2 step 4c requires probing `probe` (the bucket's oldest
    /// `Questionable` node) before a final decision can be made. The
    /// routing table itself never performs network I/O (spec §4.2
    /// "Concurrency"), so the caller must `ping` `probe` out-of-band and
    /// report the result via [`RoutingTable::resolve_probe`].
    PendingProbe { probe: NodeID, candidate: Node },
}

/// Kademlia routing table: an ordered, prefix-partitioned list of
/// k-buckets plus the local node id (spec §3/§4.2).
///
/// All public operations take `&self`/`&mut self` through an internal
/// `RwLock` so they are safe under concurrent callers with a
/// single-writer/many-reader discipline; no lock is ever held across
/// network I/O.
pub struct RoutingTable {
    id: NodeID,
    buckets: RwLock<Vec<Bucket>>,
    on_split: Box<dyn Fn(u32) + Send + Sync>,
}

impl RoutingTable {
    pub fn new(id: NodeID) -> RoutingTable {
        RoutingTable::with_split_hook(id, |_prefix_len| {})
    }

    /// Like [`RoutingTable::new`], but `on_split` is invoked with the new
    /// prefix length every time a bucket splits (spec §6 `BucketSplit`).
    /// Kept decoupled from any concrete event type so this crate never
    /// depends on a caller's event bus.
    pub fn with_split_hook(id: NodeID, on_split: impl Fn(u32) + Send + Sync + 'static) -> RoutingTable {
        RoutingTable {
            id,
            buckets: RwLock::new(vec![Bucket::initial_bucket()]),
            on_split: Box::new(on_split),
        }
    }

    pub fn local_id(&self) -> NodeID {
        self.id
    }

    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap()
            .iter()
            .map(Bucket::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_idx(buckets: &[Bucket], id: &NodeID) -> usize {
        buckets
            .binary_search_by(|bucket| {
                if bucket.could_hold_node(id) {
                    cmp::Ordering::Equal
                } else {
                    bucket.start.cmp(id)
                }
            })
            .expect("bucket prefixes partition the full id space")
    }

    pub fn add_node(&self, node: Node) -> AddOutcome {
        if node.id.is_unspecified() || node.id == self.id {
            return AddOutcome::Rejected;
        }

        let mut buckets = self.buckets.write().unwrap();
        self.add_node_locked(&mut buckets, node)
    }

    fn add_node_locked(&self, buckets: &mut Vec<Bucket>, node: Node) -> AddOutcome {
        loop {
            let idx = Self::bucket_idx(buckets, &node.id);
            let is_home = buckets[idx].could_hold_node(&self.id);

            match buckets[idx].admit(node.clone(), is_home) {
                BucketOutcome::Added => return AddOutcome::Added,
                BucketOutcome::Updated => return AddOutcome::Updated,
                BucketOutcome::Rejected => {
                    if let Some(probe) = buckets[idx].oldest_questionable().map(|n| n.id) {
                        return AddOutcome::PendingProbe {
                            probe,
                            candidate: node,
                        };
                    }
                    return AddOutcome::Rejected;
                }
                BucketOutcome::NeedsSplit => {
                    let upper = buckets[idx].split();
                    let prefix_len = buckets[idx].prefix_len;
                    buckets.insert(idx + 1, upper);
                    (self.on_split)(prefix_len);
                    // Retry from the top; the now-split bucket may still
                    // be full, so this can split again if it is the home
                    // bucket at progressively deeper prefixes.
                    continue;
                }
            }
        }
    }

    /// Completes admission after the caller has pinged the node named in
    /// a [`AddOutcome::PendingProbe`] (spec §4.2 step 4c).
    pub fn resolve_probe(&self, probe: NodeID, candidate: Node, probe_succeeded: bool) -> AddOutcome {
        let mut buckets = self.buckets.write().unwrap();
        let idx = Self::bucket_idx(&buckets, &candidate.id);

        if probe_succeeded {
            if let Some(node) = buckets[idx].get_mut(&probe) {
                node.mark_responded(None);
            }
            return AddOutcome::Rejected;
        }

        if buckets[idx].evict_and_admit(&probe, candidate) {
            AddOutcome::Added
        } else {
            AddOutcome::Rejected
        }
    }

    pub fn remove(&self, id: &NodeID) -> bool {
        let mut buckets = self.buckets.write().unwrap();
        let idx = Self::bucket_idx(&buckets, id);
        buckets[idx].remove(id).is_some()
    }

    pub fn get(&self, id: &NodeID) -> Option<Node> {
        let buckets = self.buckets.read().unwrap();
        let idx = Self::bucket_idx(&buckets, id);
        buckets[idx].get(id).cloned()
    }

    /// Up to `k` Good/Questionable nodes closest to `target`, Good ranked
    /// before Questionable at equal distance; Bad nodes excluded (spec
    /// §4.2 contract).
    pub fn find_closest(&self, target: &NodeID, k: usize) -> Vec<Node> {
        let buckets = self.buckets.read().unwrap();
        let mut candidates: Vec<&Node> = buckets
            .iter()
            .flat_map(Bucket::good_and_questionable)
            .collect();

        candidates.sort_by(|a, b| {
            let distance_order = target.xor(&a.id).cmp(&target.xor(&b.id));
            distance_order.then_with(|| {
                // Good ranks ahead of Questionable at equal distance.
                a.is_good().cmp(&b.is_good()).reverse()
            })
        });

        candidates.into_iter().take(k).cloned().collect()
    }

    /// O(n) read-only snapshot of `(id, endpoint)` pairs, for the
    /// persistence manager (spec §4.2 "Persistence hook").
    pub fn snapshot(&self) -> Vec<(NodeID, SocketAddr)> {
        let buckets = self.buckets.read().unwrap();
        buckets
            .iter()
            .flat_map(Bucket::iter)
            .map(|node| (node.id, node.endpoint))
            .collect()
    }

    /// Bucket prefixes that have not admitted or updated a node in more
    /// than `idle_for`, used by the crawler's refresh policy (spec §4.6).
    pub fn stale_bucket_prefixes(
        &self,
        idle_for: std::time::Duration,
    ) -> Vec<(NodeID, u32)> {
        let buckets = self.buckets.read().unwrap();
        buckets
            .iter()
            .filter(|bucket| {
                bucket
                    .iter()
                    .map(Node::last_seen)
                    .max()
                    .map(|latest| latest.elapsed() > idle_for)
                    .unwrap_or(true)
            })
            .map(|bucket| (bucket.start, bucket.prefix_len))
            .collect()
    }
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

    fn id_with_top_bit(top_bit_one: bool, salt: u8) -> NodeID {
        let mut bytes = [0u8; krpc_encoding::ID_LEN];
        bytes[0] = if top_bit_one { 0x80 } else { 0x00 };
        bytes[19] = salt;
        NodeID(bytes)
    }

    #[test]
    fn home_bucket_splits_on_overflow() {
        let table = RoutingTable::new(NodeID::ZERO);

        for i in 0..17u8 {
            let outcome = table.add_node(Node::new(id_with_top_bit(false, i + 1), endpoint(6881)));
            assert!(matches!(
                outcome,
                AddOutcome::Added | AddOutcome::Updated | AddOutcome::PendingProbe { .. }
            ));
        }

        let buckets = table.buckets.read().unwrap();
        assert!(buckets.len() > 1, "home bucket should have split");
        assert!(buckets.iter().any(|b| b.prefix_len >= 1));
    }

    #[test]
    fn distinct_ids_never_collide() {
        let table = RoutingTable::new(NodeID::ZERO);
        for i in 0..40u8 {
            table.add_node(Node::new(id_with_top_bit(i % 2 == 0, i), endpoint(6881 + i as u16)));
        }

        let mut seen = std::collections::HashSet::new();
        for (id, _) in table.snapshot() {
            assert!(seen.insert(id), "duplicate id in routing table");
        }
    }

    #[test]
    fn find_closest_is_distance_ordered() {
        let table = RoutingTable::new(NodeID::ZERO);
        let mut near = NodeID::ZERO;
        near.0[19] = 0x01;
        let mut mid = NodeID::ZERO;
        mid.0[19] = 0x02;
        let far = id_with_top_bit(true, 0);

        table.add_node(Node::new(far, endpoint(1)));
        table.add_node(Node::new(mid, endpoint(2)));
        table.add_node(Node::new(near, endpoint(3)));

        let closest = table.find_closest(&NodeID::ZERO, 3);
        let ids: Vec<_> = closest.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![near, mid, far]);
    }

    #[test]
    fn zero_id_is_never_admitted() {
        let table = RoutingTable::new(NodeID::random());
        let outcome = table.add_node(Node::new(NodeID::ZERO, endpoint(6881)));
        assert!(matches!(outcome, AddOutcome::Rejected));
        assert_eq!(table.len(), 0);
    }
}
