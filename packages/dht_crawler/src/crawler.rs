//! Crawler Loop (spec §4.6): drives continuous discovery, info-hash
//! monitoring, bootstrap, and passive info-hash collection.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::Duration,
};

use krpc_encoding::{
    NodeID,
    Query,
};
use rand::Rng;
use routing_table::{
    Node,
    RoutingTable,
};
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use crate::{
    events::{
        Event,
        EventBus,
    },
    lookup::{
        self,
        LookupMode,
    },
    peer_store::PeerStore,
    transport::{
        TransactionManager,
        DEFAULT_RETRIES,
        DEFAULT_TIMEOUT,
    },
};

/// Default discovery-cycle period (spec §4.6).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
/// Default info-hash re-probe period (spec §4.6).
pub const INFO_HASH_MONITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// A bucket untouched for this long is eligible for the repair policy
/// (spec §4.6 step 1).
const STALE_BUCKET_THRESHOLD: Duration = Duration::from_secs(15 * 60);
/// Bootstrap retry policy (spec §7 "Bootstrap failure").
const BOOTSTRAP_RETRY_INITIAL: Duration = Duration::from_secs(1);
const BOOTSTRAP_RETRY_MAX: Duration = Duration::from_secs(60);

/// Running counters exposed through `Dht::statistics()` (spec §6 Control
/// surface).
#[derive(Debug, Default)]
pub struct CrawlerStatistics {
    pub nodes_discovered: AtomicU64,
    pub nodes_added: AtomicU64,
    pub queries_sent: AtomicU64,
    pub queries_succeeded: AtomicU64,
    pub queries_failed: AtomicU64,
    pub info_hashes_discovered: AtomicU64,
    pub peers_discovered: AtomicU64,
    pub lookups_completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrawlerStatisticsSnapshot {
    pub nodes_discovered: u64,
    pub nodes_added: u64,
    pub queries_sent: u64,
    pub queries_succeeded: u64,
    pub queries_failed: u64,
    pub info_hashes_discovered: u64,
    pub peers_discovered: u64,
    pub lookups_completed: u64,
}

impl CrawlerStatistics {
    pub fn snapshot(&self) -> CrawlerStatisticsSnapshot {
        CrawlerStatisticsSnapshot {
            nodes_discovered: self.nodes_discovered.load(Ordering::Relaxed),
            nodes_added: self.nodes_added.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            queries_succeeded: self.queries_succeeded.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            info_hashes_discovered: self.info_hashes_discovered.load(Ordering::Relaxed),
            peers_discovered: self.peers_discovered.load(Ordering::Relaxed),
            lookups_completed: self.lookups_completed.load(Ordering::Relaxed),
        }
    }
}

/// Drives discovery, bootstrap, and info-hash monitoring. Owned by the
/// top-level `Dht` and run as a background task group.
pub struct Crawler {
    local_id: NodeID,
    routing_table: Arc<RoutingTable>,
    transactions: Arc<TransactionManager>,
    peer_store: Arc<PeerStore>,
    events: EventBus,
    stats: Arc<CrawlerStatistics>,
    parallel_crawls: Mutex<usize>,
    configured_parallel_crawls: usize,
    refresh_interval: Duration,
    monitored_info_hashes: Mutex<HashSet<NodeID>>,
    known_info_hashes: Mutex<HashSet<NodeID>>,
}

impl Crawler {
    pub fn new(
        local_id: NodeID,
        routing_table: Arc<RoutingTable>,
        transactions: Arc<TransactionManager>,
        peer_store: Arc<PeerStore>,
        events: EventBus,
        stats: Arc<CrawlerStatistics>,
        parallel_crawls: usize,
        refresh_interval: Duration,
    ) -> Crawler {
        Crawler {
            local_id,
            routing_table,
            transactions,
            peer_store,
            events,
            stats,
            parallel_crawls: Mutex::new(parallel_crawls.max(1)),
            configured_parallel_crawls: parallel_crawls.max(1),
            refresh_interval,
            monitored_info_hashes: Mutex::new(HashSet::new()),
            known_info_hashes: Mutex::new(HashSet::new()),
        }
    }

    pub fn monitor_info_hash(&self, info_hash: NodeID) {
        self.monitored_info_hashes.lock().unwrap().insert(info_hash);
    }

    pub fn stop_monitoring(&self, info_hash: &NodeID) {
        self.monitored_info_hashes.lock().unwrap().remove(info_hash);
    }

    /// Records a passively-observed info-hash (spec §4.6 "Passive
    /// info-hash collection"). Called by the dispatcher on every inbound
    /// `get_peers`.
    pub fn observe_info_hash(&self, info_hash: NodeID) {
        let is_new = self.known_info_hashes.lock().unwrap().insert(info_hash);
        if is_new {
            self.stats.info_hashes_discovered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn current_alpha(&self) -> usize {
        *self.parallel_crawls.lock().unwrap()
    }

    fn halve_alpha(&self) {
        let mut alpha = self.parallel_crawls.lock().unwrap();
        *alpha = (*alpha / 2).max(1);
        warn!(new_alpha = *alpha, "back-pressure: halving lookup concurrency");
        self.events.publish(Event::SystemError {
            message: format!("back-pressure: halved lookup concurrency to {}", *alpha),
            code: None,
        });
    }

    fn restore_alpha(&self) {
        let mut alpha = self.parallel_crawls.lock().unwrap();
        *alpha = self.configured_parallel_crawls;
    }

    /// Bootstraps the routing table from `bootstrap_nodes` on cold start
    /// (spec §4.6 "Bootstrap"), retrying with exponential backoff bounded
    /// at 5 minutes until at least one endpoint answers (spec §7).
    #[instrument(skip(self, bootstrap_nodes))]
    pub async fn bootstrap(&self, bootstrap_nodes: &[SocketAddr]) {
        if !self.routing_table.is_empty() || bootstrap_nodes.is_empty() {
            return;
        }

        let mut delay = BOOTSTRAP_RETRY_INITIAL;
        loop {
            let mut any_succeeded = false;
            for &endpoint in bootstrap_nodes {
                self.stats.queries_sent.fetch_add(1, Ordering::Relaxed);
                let result = self
                    .transactions
                    .send_query(
                        endpoint,
                        Query::FindNode {
                            id: self.local_id,
                            target: self.local_id,
                        },
                        DEFAULT_TIMEOUT,
                        DEFAULT_RETRIES,
                    )
                    .await;

                match result {
                    Ok(response) => {
                        any_succeeded = true;
                        self.stats.queries_succeeded.fetch_add(1, Ordering::Relaxed);
                        self.admit_response_sender(self.local_id, endpoint);
                        self.admit_nodes_in_response(&response);
                    }
                    Err(cause) => {
                        self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
                        debug!(?endpoint, %cause, "bootstrap node did not respond");
                    }
                }
            }

            if any_succeeded {
                info!(nodes = self.routing_table.len(), "bootstrap complete");
                return;
            }

            warn!(?delay, "bootstrap failed, retrying");
            self.events.publish(Event::SystemError {
                message: "bootstrap failed: no configured node responded, retrying".into(),
                code: None,
            });
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(BOOTSTRAP_RETRY_MAX);
        }
    }

    fn admit_response_sender(&self, _claimed_id: NodeID, _endpoint: SocketAddr) {
        // The bootstrap response's sender id is not authenticated against
        // its own `find_node` reply payload here; admission happens via
        // the nodes embedded in the response instead, matching how the
        // iterative lookup engine admits nodes (spec §4.5 step 3).
    }

    fn admit_nodes_in_response(&self, response: &krpc_encoding::ResponseValues) {
        let Some(nodes) = &response.nodes else {
            return;
        };
        for info in nodes {
            self.admit_discovered_node(info.id, info.address.0);
        }
    }

    fn admit_discovered_node(&self, id: NodeID, endpoint: SocketAddr) {
        if id == self.local_id {
            return;
        }
        self.stats.nodes_discovered.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::NodeDiscovered { id, endpoint });

        if let routing_table::AddOutcome::Added = self.routing_table.add_node(Node::new(id, endpoint)) {
            self.stats.nodes_added.fetch_add(1, Ordering::Relaxed);
            self.events.publish(Event::NodeAdded { id, endpoint });
        }
    }

    /// Picks a lookup target per spec §4.6 step 1: half the time fully
    /// random, otherwise biased toward a bucket that has gone stale.
    fn pick_discovery_target(&self) -> NodeID {
        let stale = self
            .routing_table
            .stale_bucket_prefixes(STALE_BUCKET_THRESHOLD);

        let use_random = stale.is_empty() || rand::thread_rng().gen_bool(0.5);
        if use_random {
            return NodeID::random();
        }

        let idx = rand::thread_rng().gen_range(0..stale.len());
        let (prefix, prefix_len) = stale[idx];
        prefix.random_with_prefix(prefix_len)
    }

    /// Runs one discovery cycle: pick a target, `find_node` it via the
    /// iterative lookup engine, and admit whatever it surfaces (spec §4.6
    /// "Discovery cycle").
    #[instrument(skip(self))]
    async fn discovery_cycle(&self) {
        let target = self.pick_discovery_target();
        let alpha = self.current_alpha();

        self.stats.queries_sent.fetch_add(1, Ordering::Relaxed);
        let outcome = lookup::lookup(
            target,
            LookupMode::FindNode,
            alpha,
            self.routing_table.clone(),
            self.transactions.clone(),
            self.events.clone(),
        )
        .await;

        self.stats.lookups_completed.fetch_add(1, Ordering::Relaxed);
        if outcome.resource_exhausted {
            self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
            self.halve_alpha();
            let jitter_ms = rand::thread_rng().gen_range(1_000..=5_000);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        } else if outcome.nodes.is_empty() {
            self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.queries_succeeded.fetch_add(1, Ordering::Relaxed);
            self.restore_alpha();
        }
    }

    /// Runs `get_peers` for every monitored info-hash, merging discovered
    /// peers into the peer store (spec §4.6 "Info-hash monitoring").
    #[instrument(skip(self))]
    async fn monitor_cycle(&self) {
        let targets: Vec<NodeID> = self.monitored_info_hashes.lock().unwrap().iter().copied().collect();

        for info_hash in targets {
            self.stats.queries_sent.fetch_add(1, Ordering::Relaxed);
            let result = lookup::lookup(
                info_hash,
                LookupMode::GetPeers,
                self.current_alpha(),
                self.routing_table.clone(),
                self.transactions.clone(),
                self.events.clone(),
            )
            .await;

            self.stats.lookups_completed.fetch_add(1, Ordering::Relaxed);
            if result.peers.is_empty() {
                self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.stats.queries_succeeded.fetch_add(1, Ordering::Relaxed);

            for endpoint in result.peers {
                self.peer_store.add(info_hash, endpoint);
                self.stats.peers_discovered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Re-probes every `Good` node seen within the last 2 minutes
    /// (SPEC_FULL §4.6 supplement, resolving spec §9's power-management
    /// Open Question): intended for an external platform integration to
    /// call after an OS sleep/wake cycle, where the routing table's
    /// liveness state may be stale relative to wall-clock time.
    #[instrument(skip(self))]
    pub async fn on_wake(&self) {
        const RECENTLY_SEEN: Duration = Duration::from_secs(2 * 60);

        let candidates: Vec<Node> = self
            .routing_table
            .snapshot()
            .into_iter()
            .filter_map(|(id, _)| self.routing_table.get(&id))
            .filter(|node| node.is_good() && node.last_seen().elapsed() < RECENTLY_SEEN)
            .collect();

        for node in candidates {
            self.stats.queries_sent.fetch_add(1, Ordering::Relaxed);
            let result = self
                .transactions
                .send_query(
                    node.endpoint,
                    Query::Ping { id: self.local_id },
                    DEFAULT_TIMEOUT,
                    DEFAULT_RETRIES,
                )
                .await;

            match result {
                Ok(_) => self.stats.queries_succeeded.fetch_add(1, Ordering::Relaxed),
                Err(cause) => {
                    debug!(?node.endpoint, %cause, "on_wake re-probe failed");
                    self.stats.queries_failed.fetch_add(1, Ordering::Relaxed)
                }
            };
        }
    }

    /// Drives the discovery cycle until `shutdown` fires. Intended to be
    /// spawned by `Dht::start()`.
    pub async fn run_discovery(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.discovery_cycle().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Drives info-hash re-probing until `shutdown` fires.
    pub async fn run_monitor(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(INFO_HASH_MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.monitor_cycle().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub fn statistics(&self) -> CrawlerStatisticsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{
        Ipv4Addr,
        SocketAddrV4,
    };
    use tokio_krpc::{
        ConnectionThrottler,
        KrpcSocket,
        RateLimiter,
    };

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    async fn crawler() -> Crawler {
        let local_id = NodeID::random();
        let routing_table = Arc::new(RoutingTable::new(local_id));
        let socket = Arc::new(KrpcSocket::bind(endpoint(0)).await.unwrap());
        let transactions = TransactionManager::new(
            local_id,
            socket,
            Arc::new(RateLimiter::default_dht()),
            Arc::new(ConnectionThrottler::default_dht()),
            1_000,
        );
        Crawler::new(
            local_id,
            routing_table,
            transactions,
            Arc::new(PeerStore::new()),
            EventBus::new(),
            Arc::new(CrawlerStatistics::default()),
            10,
            DEFAULT_REFRESH_INTERVAL,
        )
    }

    #[tokio::test]
    async fn bootstrap_with_no_endpoints_returns_immediately() {
        let crawler = crawler().await;
        crawler.bootstrap(&[]).await;
        assert_eq!(crawler.routing_table.len(), 0);
    }

    #[tokio::test]
    async fn bootstrap_skips_when_table_already_populated() {
        let crawler = crawler().await;
        crawler
            .routing_table
            .add_node(Node::new(NodeID::random(), endpoint(1)));
        // An unreachable bootstrap endpoint would hang retrying forever
        // if bootstrap ran; a populated table must short-circuit first.
        crawler.bootstrap(&[endpoint(65000)]).await;
        assert_eq!(crawler.routing_table.len(), 1);
    }

    #[tokio::test]
    async fn observe_info_hash_counts_each_hash_once() {
        let crawler = crawler().await;
        let info_hash = NodeID::random();
        crawler.observe_info_hash(info_hash);
        crawler.observe_info_hash(info_hash);
        assert_eq!(crawler.statistics().info_hashes_discovered, 1);
    }

    #[tokio::test]
    async fn monitor_registration_round_trips() {
        let crawler = crawler().await;
        let info_hash = NodeID::random();
        crawler.monitor_info_hash(info_hash);
        assert!(crawler.monitored_info_hashes.lock().unwrap().contains(&info_hash));
        crawler.stop_monitoring(&info_hash);
        assert!(!crawler.monitored_info_hashes.lock().unwrap().contains(&info_hash));
    }
}
