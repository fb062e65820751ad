//! RPC Dispatcher (spec §4.4): answers inbound queries from the
//! routing table, peer store, and announce-token collaborator.

use std::{
    net::SocketAddr,
    sync::Arc,
};

use krpc_encoding::{
    Body,
    KRPCError,
    Message,
    NodeInfo,
    Query,
    ResponseValues,
};
use routing_table::{
    Node,
    RoutingTable,
};
use tracing::warn;

use crate::{
    events::{
        Event,
        EventBus,
    },
    peer_store::PeerStore,
    token::TokenManager,
};

/// Closest-node count served in `find_node`/`get_peers` responses (spec
/// §4.4: "up to 8 closest nodes").
const SERVED_CLOSEST_NODES: usize = 8;

/// Maximum peers returned by `get_peers` (spec §4.4).
const SERVED_PEERS: usize = 100;

/// Implemented by whatever serves inbound queries; kept as a trait so
/// [`crate::transport::TransactionManager`] does not depend on the
/// concrete `Dispatcher` type.
pub trait QueryHandler: Send + Sync {
    /// Returns the reply to send back, or `None` if the query was
    /// malformed and should simply be dropped (spec §7: "a bad inbound
    /// datagram is logged at Warning and dropped").
    fn handle_query(&self, message: &Message, source: SocketAddr) -> Option<Message>;
}

pub struct Dispatcher {
    local_id: krpc_encoding::NodeID,
    routing_table: Arc<RoutingTable>,
    peer_store: Arc<PeerStore>,
    tokens: Arc<TokenManager>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        local_id: krpc_encoding::NodeID,
        routing_table: Arc<RoutingTable>,
        peer_store: Arc<PeerStore>,
        tokens: Arc<TokenManager>,
        events: EventBus,
    ) -> Dispatcher {
        Dispatcher {
            local_id,
            routing_table,
            peer_store,
            tokens,
            events,
        }
    }

    fn admit_sender(&self, sender_id: krpc_encoding::NodeID, source: SocketAddr) {
        // Self-id protection (spec §4.4): a peer claiming our own id is
        // answered for interoperability but never admitted.
        if sender_id == self.local_id {
            return;
        }

        self.events.publish(Event::NodeDiscovered {
            id: sender_id,
            endpoint: source,
        });

        match self.routing_table.add_node(Node::new(sender_id, source)) {
            routing_table::AddOutcome::Added => {
                self.events.publish(Event::NodeAdded {
                    id: sender_id,
                    endpoint: source,
                });
            }
            routing_table::AddOutcome::PendingProbe { .. } => {
                // A probe ping would require an async round trip; the
                // dispatcher's query path is synchronous, so we simply
                // decline the admission rather than block the reply.
                // The crawler's own discovery cycle will re-encounter
                // this id and can resolve it there if it responds.
            }
            routing_table::AddOutcome::Updated | routing_table::AddOutcome::Rejected => {}
        }
    }

    fn closest_nodes(&self, target: &krpc_encoding::NodeID) -> Vec<NodeInfo> {
        self.routing_table
            .find_closest(target, SERVED_CLOSEST_NODES)
            .iter()
            .map(NodeInfo::from)
            .collect()
    }
}

impl QueryHandler for Dispatcher {
    fn handle_query(&self, message: &Message, source: SocketAddr) -> Option<Message> {
        let txid = message.transaction_id.clone();
        let query = match message.clone().into_body() {
            Ok(Body::Query(query)) => query,
            Ok(_) => return None,
            Err(cause) => {
                warn!(?source, %cause, "dropping malformed inbound query");
                self.events.publish(Event::SystemError {
                    message: format!("malformed inbound query from {source}: {cause}"),
                    code: None,
                });
                return None;
            }
        };

        self.admit_sender(query.id(), source);

        let reply = match &query {
            Query::Ping { .. } => ResponseValues::only_id(self.local_id),
            Query::FindNode { target, .. } => {
                ResponseValues::next_hop(self.local_id, None, self.closest_nodes(target))
            }
            Query::GetPeers { info_hash, .. } => {
                let token = self.tokens.issue(source);
                if self.peer_store.has_peers(info_hash) {
                    let peers = self
                        .peer_store
                        .get(info_hash, SERVED_PEERS)
                        .into_iter()
                        .map(krpc_encoding::Addr)
                        .collect();
                    ResponseValues::get_peers(self.local_id, token, peers)
                } else {
                    ResponseValues::next_hop(self.local_id, Some(token), self.closest_nodes(info_hash))
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                if !self.tokens.verify(source, token) {
                    warn!(?source, "rejected announce_peer with bad token");
                    self.events.publish(Event::SystemError {
                        message: format!("rejected announce_peer from {source}: bad token"),
                        code: None,
                    });
                    return Some(Message::error(txid, KRPCError::bad_token()));
                }

                let announced_port = if *implied_port {
                    source.port()
                } else {
                    port.unwrap_or(source.port())
                };
                let mut endpoint = source;
                endpoint.set_port(announced_port);

                self.peer_store.add(*info_hash, endpoint);
                self.events.publish(Event::PeerDiscovered {
                    info_hash: *info_hash,
                    endpoint,
                });
                ResponseValues::only_id(self.local_id)
            }
            Query::SampleInfoHashes { target, .. } => {
                // BEP-51 wire compatibility only (SPEC_FULL §4.1
                // supplement): we do not maintain a sample set, so we
                // answer with an empty sample list plus our own
                // closest nodes.
                ResponseValues {
                    samples: Some(Vec::new()),
                    ..ResponseValues::next_hop(self.local_id, None, self.closest_nodes(target))
                }
            }
        };

        if let Query::GetPeers { info_hash, .. } = &query {
            self.events.publish(Event::InfoHashDiscovered {
                info_hash: *info_hash,
            });
        }

        Some(Message::response(txid, reply))
    }
}
