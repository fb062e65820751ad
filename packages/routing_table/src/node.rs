use std::{
    net::SocketAddr,
    time::{
        Duration,
        Instant,
    },
};

use krpc_encoding::NodeID;

/// How long a node stays `Good` after its `last_seen` timestamp without a
/// fresh response (spec §3 Node).
pub const GOOD_DURATION: Duration = Duration::from_secs(15 * 60);

/// Liveness state of a routing-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quality {
    /// Best state; ranked ahead of `Questionable` at equal distance.
    Good,
    Questionable,
    Bad,
}

/// A peer known to the routing table.
///
/// Nodes are small and are copied by value rather than shared behind a
/// `Arc`/`shared_ptr` (spec §9): the routing table owns its nodes
/// outright, and callers that need one past the lock's lifetime clone it.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeID,
    pub endpoint: SocketAddr,
    last_seen: Instant,
    consecutive_failures: u8,
    explicit_bad: bool,
}

impl Node {
    pub fn new(id: NodeID, endpoint: SocketAddr) -> Node {
        Node {
            id,
            endpoint,
            last_seen: Instant::now(),
            consecutive_failures: 0,
            explicit_bad: false,
        }
    }

    #[cfg(test)]
    pub fn with_last_seen(id: NodeID, endpoint: SocketAddr, last_seen: Instant) -> Node {
        Node {
            id,
            endpoint,
            last_seen,
            consecutive_failures: 0,
            explicit_bad: false,
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Called on any fresh response from this node: refreshes `last_seen`,
    /// clears failure tracking, and optionally updates the endpoint a
    /// response was observed from.
    pub fn mark_responded(&mut self, from: Option<SocketAddr>) {
        self.last_seen = Instant::now();
        self.consecutive_failures = 0;
        self.explicit_bad = false;
        if let Some(from) = from {
            self.endpoint = from;
        }
    }

    /// Called when a query to this node failed (timed out or returned a
    /// KRPC error). Only accumulates towards `Bad` while the node is
    /// already `Questionable` (spec §3).
    pub fn mark_failed(&mut self) {
        if self.quality() == Quality::Questionable {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= 2 {
                self.explicit_bad = true;
            }
        }
    }

    pub fn quality(&self) -> Quality {
        if self.explicit_bad {
            Quality::Bad
        } else if self.last_seen.elapsed() < GOOD_DURATION {
            Quality::Good
        } else {
            Quality::Questionable
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality() == Quality::Good
    }

    pub fn is_bad(&self) -> bool {
        self.quality() == Quality::Bad
    }
}

impl From<&Node> for krpc_encoding::NodeInfo {
    fn from(node: &Node) -> Self {
        krpc_encoding::NodeInfo::new(node.id, krpc_encoding::Addr(node.endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{
        Ipv4Addr,
        SocketAddrV4,
    };

    fn endpoint() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881))
    }

    #[test]
    fn fresh_node_is_good() {
        let node = Node::new(NodeID::random(), endpoint());
        assert_eq!(node.quality(), Quality::Good);
    }

    #[test]
    fn ages_into_questionable() {
        let old = Instant::now() - GOOD_DURATION - Duration::from_secs(1);
        let node = Node::with_last_seen(NodeID::random(), endpoint(), old);
        assert_eq!(node.quality(), Quality::Questionable);
    }

    #[test]
    fn two_failures_while_questionable_marks_bad() {
        let old = Instant::now() - GOOD_DURATION - Duration::from_secs(1);
        let mut node = Node::with_last_seen(NodeID::random(), endpoint(), old);
        node.mark_failed();
        assert_eq!(node.quality(), Quality::Questionable);
        node.mark_failed();
        assert_eq!(node.quality(), Quality::Bad);
    }

    #[test]
    fn failure_while_good_does_not_count() {
        let mut node = Node::new(NodeID::random(), endpoint());
        node.mark_failed();
        node.mark_failed();
        assert_eq!(node.quality(), Quality::Good);
    }

    #[test]
    fn fresh_response_resets_bad() {
        let old = Instant::now() - GOOD_DURATION - Duration::from_secs(1);
        let mut node = Node::with_last_seen(NodeID::random(), endpoint(), old);
        node.mark_failed();
        node.mark_failed();
        assert_eq!(node.quality(), Quality::Bad);
        node.mark_responded(None);
        assert_eq!(node.quality(), Quality::Good);
    }
}
