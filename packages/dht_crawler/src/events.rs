//! Domain observation stream (spec §6, §9 Open Question 3): a strictly
//! typed pub/sub decoupled from logging. `tracing` carries diagnostics;
//! this carries facts a collaborator outside the crate might act on.

use std::net::SocketAddr;

use krpc_encoding::NodeID;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    NodeDiscovered { id: NodeID, endpoint: SocketAddr },
    NodeAdded { id: NodeID, endpoint: SocketAddr },
    BucketSplit { prefix_len: u32 },
    PeerDiscovered { info_hash: NodeID, endpoint: SocketAddr },
    InfoHashDiscovered { info_hash: NodeID },
    LookupCompleted {
        target: NodeID,
        nodes_found: usize,
        peers_found: usize,
    },
    SystemError { message: String, code: Option<u32> },
}

/// In-process pub/sub fan-out (spec §2 "Event Bus"). Cloning an
/// [`EventBus`] shares the same underlying channel; every clone can
/// publish, and every `subscribe()` call gets an independent receiver
/// that only sees events published after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event. A lagging or absent subscriber never blocks
    /// the publisher; `broadcast::Sender::send` only fails when there
    /// are no receivers at all, which is not an error here.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{
        Ipv4Addr,
        SocketAddrV4,
    };

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::BucketSplit { prefix_len: 3 });

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::BucketSplit { prefix_len: 3 }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::InfoHashDiscovered {
            info_hash: NodeID::ZERO,
        });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_the_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let endpoint = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881));
        bus.publish(Event::NodeDiscovered {
            id: NodeID::ZERO,
            endpoint,
        });

        assert!(matches!(a.recv().await.unwrap(), Event::NodeDiscovered { .. }));
        assert!(matches!(b.recv().await.unwrap(), Event::NodeDiscovered { .. }));
    }
}
