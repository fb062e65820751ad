//! Iterative Lookup Engine (spec §4.5): α-parallel `find_node`/
//! `get_peers` convergence over the Kademlia routing table.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use krpc_encoding::{
    NodeID,
    Query,
};
use routing_table::{
    Node,
    RoutingTable,
};
use tokio::task::JoinSet;
use tracing::{
    debug,
    instrument,
};

use crate::{
    events::{
        Event,
        EventBus,
    },
    transport::{
        TransactionManager,
        DEFAULT_RETRIES,
        DEFAULT_TIMEOUT,
    },
};

/// Concurrency parameter α (spec §4.5, GLOSSARY).
pub const DEFAULT_ALPHA: usize = 3;

/// Routing-table bucket size K, reused here as the lookup's convergence
/// target (spec §4.5 "FindNode returns the K closest Nodes").
pub const K: usize = routing_table::K;

const SHORTLIST_CAP: usize = if K * 3 > 32 { K * 3 } else { 32 };
const LOOKUP_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    FindNode,
    GetPeers,
}

#[derive(Debug, Default)]
pub struct LookupResult {
    /// The `K` closest successfully-queried nodes, in non-decreasing
    /// distance order from `target` (spec §4.5 "Result assembly").
    pub nodes: Vec<Node>,
    /// Only populated for [`LookupMode::GetPeers`].
    pub peers: Vec<SocketAddr>,
    /// Set if any query in this lookup failed with
    /// [`crate::errors::QueryError::ResourceExhausted`], the crawler's
    /// back-pressure signal (spec §4.6 "Back-pressure").
    pub resource_exhausted: bool,
}

struct Candidate {
    node: Node,
    distance: krpc_encoding::Distance,
}

/// Runs a single iterative lookup to convergence (spec §4.5 state
/// machine). Not `Clone`/reusable: construct one per `lookup()` call.
pub struct Lookup {
    target: NodeID,
    mode: LookupMode,
    alpha: usize,
    routing_table: Arc<RoutingTable>,
    transactions: Arc<TransactionManager>,
    events: EventBus,
    shortlist: Vec<Candidate>,
    queried: HashSet<NodeID>,
    pending: HashSet<NodeID>,
    collected_peers: Vec<SocketAddr>,
    resource_exhausted: bool,
}

impl Lookup {
    pub fn new(
        target: NodeID,
        mode: LookupMode,
        alpha: usize,
        routing_table: Arc<RoutingTable>,
        transactions: Arc<TransactionManager>,
        events: EventBus,
    ) -> Lookup {
        let mut lookup = Lookup {
            target,
            mode,
            alpha,
            routing_table,
            transactions,
            events,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            pending: HashSet::new(),
            collected_peers: Vec::new(),
            resource_exhausted: false,
        };
        lookup.seed();
        lookup
    }

    fn seed(&mut self) {
        for node in self.routing_table.find_closest(&self.target, K) {
            self.insert_candidate(node);
        }
    }

    fn insert_candidate(&mut self, node: Node) {
        if node.id == self.routing_table.local_id() {
            return;
        }
        let distance = self.target.xor(&node.id);

        if let Some(existing) = self.shortlist.iter_mut().find(|c| c.node.id == node.id) {
            // Prefer the fresher entry when endpoints disagree (spec
            // §4.5 step 3 "Merge").
            existing.node = node;
            return;
        }

        self.shortlist.push(Candidate { node, distance });
        self.shortlist.sort_by(|a, b| a.distance.cmp(&b.distance));
        self.shortlist.truncate(SHORTLIST_CAP);
    }

    fn selectable(&self) -> Vec<Node> {
        self.shortlist
            .iter()
            .filter(|c| !self.queried.contains(&c.node.id) && !self.pending.contains(&c.node.id))
            .take(self.alpha.saturating_sub(self.pending.len()))
            .map(|c| c.node.clone())
            .collect()
    }

    fn closest_distance(&self) -> Option<krpc_encoding::Distance> {
        self.shortlist.first().map(|c| c.distance)
    }

    #[instrument(skip(self), fields(target = %self.target))]
    pub async fn run(mut self) -> LookupResult {
        let deadline = Instant::now() + LOOKUP_DEADLINE;
        let mut in_flight: JoinSet<(NodeID, SocketAddr, Result<krpc_encoding::ResponseValues, crate::errors::QueryError>)> =
            JoinSet::new();
        let mut best_distance_last_round = self.closest_distance();
        let mut queries_completed_this_round = 0usize;

        loop {
            if Instant::now() >= deadline {
                debug!("lookup deadline elapsed");
                break;
            }

            for node in self.selectable() {
                self.pending.insert(node.id);
                let transactions = self.transactions.clone();
                let target = self.target;
                let mode = self.mode;
                let endpoint = node.endpoint;
                let node_id = node.id;

                in_flight.spawn(async move {
                    let query = match mode {
                        LookupMode::FindNode => Query::FindNode {
                            id: transactions.local_id(),
                            target,
                        },
                        LookupMode::GetPeers => Query::GetPeers {
                            id: transactions.local_id(),
                            info_hash: target,
                        },
                    };
                    let result = transactions
                        .send_query(endpoint, query, DEFAULT_TIMEOUT, DEFAULT_RETRIES)
                        .await;
                    (node_id, endpoint, result)
                });
            }

            if in_flight.is_empty() {
                // No outstanding queries and nothing left to select:
                // either converged or exhausted the shortlist (spec
                // §4.5 termination (c)).
                break;
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (node_id, endpoint, result) = joined.expect("lookup subtask panicked");
            self.pending.remove(&node_id);
            self.queried.insert(node_id);
            queries_completed_this_round += 1;

            match result {
                Ok(response) => {
                    self.routing_table.add_node(Node::new(node_id, endpoint));
                    self.events.publish(Event::NodeAdded {
                        id: node_id,
                        endpoint,
                    });

                    if let Some(nodes) = &response.nodes {
                        for info in nodes {
                            self.insert_candidate(Node::new(info.id, info.address.0));
                        }
                    }

                    if self.mode == LookupMode::GetPeers {
                        if let Some(peers) = &response.peers {
                            for addr in peers {
                                let endpoint: SocketAddr = addr.0;
                                if !self.collected_peers.contains(&endpoint) {
                                    self.collected_peers.push(endpoint);
                                    self.events.publish(Event::PeerDiscovered {
                                        info_hash: self.target,
                                        endpoint,
                                    });
                                }
                            }
                        }
                    }
                }
                Err(crate::errors::QueryError::ResourceExhausted) => {
                    self.resource_exhausted = true;
                }
                Err(_) => {
                    // Transport-level retries already happened; a
                    // lookup never retries a failed node itself (spec
                    // §4.5 step 4).
                }
            }

            // Termination (a): the K closest in the shortlist have all
            // been queried successfully.
            let k_closest_all_queried = self
                .shortlist
                .iter()
                .take(K)
                .all(|c| self.queried.contains(&c.node.id));
            if k_closest_all_queried {
                break;
            }

            // Termination (b): no progress after at least K completed
            // queries this round.
            if queries_completed_this_round >= K {
                let current = self.closest_distance();
                if current >= best_distance_last_round {
                    debug!("lookup made no progress this round, stopping");
                    break;
                }
                best_distance_last_round = current;
                queries_completed_this_round = 0;
            }
        }

        in_flight.abort_all();

        let nodes: Vec<Node> = self
            .shortlist
            .into_iter()
            .filter(|c| self.queried.contains(&c.node.id))
            .take(K)
            .map(|c| c.node)
            .collect();

        self.events.publish(Event::LookupCompleted {
            target: self.target,
            nodes_found: nodes.len(),
            peers_found: self.collected_peers.len(),
        });

        LookupResult {
            nodes,
            peers: self.collected_peers,
            resource_exhausted: self.resource_exhausted,
        }
    }
}

/// Convenience entry point mirroring spec §4.5's `lookup(target, mode)`
/// contract.
pub async fn lookup(
    target: NodeID,
    mode: LookupMode,
    alpha: usize,
    routing_table: Arc<RoutingTable>,
    transactions: Arc<TransactionManager>,
    events: EventBus,
) -> LookupResult {
    Lookup::new(target, mode, alpha, routing_table, transactions, events)
        .run()
        .await
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

    #[tokio::test]
    async fn empty_routing_table_converges_immediately() {
        let routing_table = Arc::new(RoutingTable::new(NodeID::random()));
        let socket = Arc::new(tokio_krpc::KrpcSocket::bind(endpoint(0)).await.unwrap());
        let transactions = TransactionManager::new(
            routing_table.local_id(),
            socket,
            Arc::new(tokio_krpc::RateLimiter::default_dht()),
            Arc::new(tokio_krpc::ConnectionThrottler::default_dht()),
            1_000,
        );

        let result = lookup(
            NodeID::random(),
            LookupMode::FindNode,
            DEFAULT_ALPHA,
            routing_table,
            transactions,
            EventBus::new(),
        )
        .await;

        assert!(result.nodes.is_empty());
        assert!(result.peers.is_empty());
    }

    #[tokio::test]
    async fn insert_candidate_deduplicates_by_id() {
        let local = NodeID::random();
        let routing_table = Arc::new(RoutingTable::new(local));
        let socket = Arc::new(tokio_krpc::KrpcSocket::bind(endpoint(0)).await.unwrap());
        let transactions = TransactionManager::new(
            local,
            socket,
            Arc::new(tokio_krpc::RateLimiter::default_dht()),
            Arc::new(tokio_krpc::ConnectionThrottler::default_dht()),
            1_000,
        );

        let mut lookup = Lookup {
            target: NodeID::random(),
            mode: LookupMode::FindNode,
            alpha: DEFAULT_ALPHA,
            routing_table,
            transactions,
            events: EventBus::new(),
            shortlist: Vec::new(),
            queried: HashSet::new(),
            pending: HashSet::new(),
            collected_peers: Vec::new(),
            resource_exhausted: false,
        };

        let id = NodeID::random();
        lookup.insert_candidate(Node::new(id, endpoint(1)));
        lookup.insert_candidate(Node::new(id, endpoint(2)));

        assert_eq!(lookup.shortlist.len(), 1);
        assert_eq!(lookup.shortlist[0].node.endpoint, endpoint(2));
    }
}
