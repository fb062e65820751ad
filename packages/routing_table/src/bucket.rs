use krpc_encoding::NodeID;

use crate::node::{
    Node,
    Quality,
};

/// Maximum nodes held by a single bucket.
pub const K: usize = 16;

/// A k-bucket covering the id range `[start, start + 2^(160 - prefix_len))`.
///
/// `nodes` is ordered oldest-first (the eviction end) to
/// most-recently-seen-last, per spec §3.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub start: NodeID,
    pub prefix_len: u32,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Updated,
    Rejected,
    /// The bucket was full but is the home bucket and can split; the
    /// caller should split and retry admission.
    NeedsSplit,
}

impl Bucket {
    /// The single bucket spanning the entire 160-bit space, before any
    /// splits have occurred.
    pub fn initial_bucket() -> Bucket {
        Bucket {
            start: NodeID::ZERO,
            prefix_len: 0,
            nodes: Vec::with_capacity(K),
        }
    }

    pub fn could_hold_node(&self, id: &NodeID) -> bool {
        self.start.common_prefix_len(id) >= self.prefix_len
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &NodeID) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    pub fn get_mut(&mut self, id: &NodeID) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| &node.id == id)
    }

    pub fn remove(&mut self, id: &NodeID) -> Option<Node> {
        let idx = self.nodes.iter().position(|node| &node.id == id)?;
        Some(self.nodes.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn good_and_questionable(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.quality() != Quality::Bad)
    }

    /// Attempts admission of `node` (spec §4.2 admission algorithm, steps
    /// 2-3 and 4b-4d; step 4a "split" is handled by the caller, which owns
    /// the decision of whether this bucket is the home bucket).
    pub fn admit(&mut self, node: Node, is_home: bool) -> AddOutcome {
        if let Some(existing) = self.get_mut(&node.id) {
            existing.mark_responded(Some(node.endpoint));
            return AddOutcome::Updated;
        }

        if !self.is_full() {
            self.nodes.push(node);
            return AddOutcome::Added;
        }

        if is_home && self.prefix_len < 160 {
            return AddOutcome::NeedsSplit;
        }

        if let Some(idx) = self.nodes.iter().position(|n| n.is_bad()) {
            self.nodes.remove(idx);
            self.nodes.push(node);
            return AddOutcome::Added;
        }

        AddOutcome::Rejected
    }

    /// Oldest `Questionable` node, if any — the one §4.2 step 4c says to
    /// probe before rejecting an admission outright.
    pub fn oldest_questionable(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.quality() == Quality::Questionable)
            .min_by_key(|n| n.last_seen())
    }

    pub fn evict_and_admit(&mut self, id_to_evict: &NodeID, node: Node) -> bool {
        match self.remove(id_to_evict) {
            Some(_) => {
                self.nodes.push(node);
                true
            }
            None => false,
        }
    }

    /// Splits the bucket at `prefix_len`, returning the upper half
    /// (`start` with bit `prefix_len` set). `self` keeps the lower half.
    pub fn split(&mut self) -> Bucket {
        let new_prefix_len = self.prefix_len + 1;
        let bit_index = self.prefix_len;

        let (lower, upper): (Vec<Node>, Vec<Node>) =
            self.nodes.drain(..).partition(|node| !node.id.bit(bit_index));

        self.nodes = lower;
        self.prefix_len = new_prefix_len;

        Bucket {
            start: self.start.with_bit(bit_index, true),
            prefix_len: new_prefix_len,
            nodes: upper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{
        Ipv4Addr,
        SocketAddr,
        SocketAddrV4,
    };

    fn endpoint() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881))
    }

    #[test]
    fn split_partitions_by_next_bit() {
        let mut bucket = Bucket::initial_bucket();
        let mut low = NodeID::ZERO;
        low.0[0] = 0b0000_0001;
        let mut high = NodeID::ZERO;
        high.0[0] = 0b1000_0000;

        bucket.nodes.push(Node::new(low, endpoint()));
        bucket.nodes.push(Node::new(high, endpoint()));

        let upper = bucket.split();
        assert_eq!(bucket.prefix_len, 1);
        assert_eq!(upper.prefix_len, 1);
        assert_eq!(bucket.len(), 1);
        assert_eq!(upper.len(), 1);
        assert!(bucket.could_hold_node(&low));
        assert!(upper.could_hold_node(&high));
        assert!(!upper.could_hold_node(&low));
    }
}
