//! Top-level `Dht` (spec §6): wires the routing table, transport,
//! dispatcher, lookup engine, crawler, peer store, and persistence
//! manager into the control surface external collaborators use.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use krpc_encoding::NodeID;
use tokio::sync::watch;
use tokio_krpc::{
    ConnectionThrottler,
    KrpcSocket,
    RateLimiter,
};
use tracing::{
    info,
    instrument,
    warn,
};

use crate::{
    config::DhtConfig,
    crawler::{
        Crawler,
        CrawlerStatistics,
        CrawlerStatisticsSnapshot,
    },
    dispatcher::Dispatcher,
    errors::{
        DhtError,
        Result,
    },
    events::{
        Event,
        EventBus,
    },
    metadata::MetadataStore,
    peer_store::PeerStore,
    persistence::{
        PersistenceManager,
        DEFAULT_INTERVAL,
    },
    token::TokenManager,
    transport::{
        max_outstanding_for,
        TransactionManager,
    },
};

/// Conservative fallback when the host's available memory cannot be
/// determined, sized to land `max_outstanding_for` at its floor (spec
/// §4.3 "Memory bound").
const FALLBACK_AVAILABLE_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

fn available_memory_bytes() -> u64 {
    // No portable stdlib way to query available memory; the crate that
    // would normally own this (sysinfo et al.) is deliberately not
    // pulled in for a single startup heuristic (spec §4.3 leaves the
    // probe itself up to the caller). A fixed, conservative estimate
    // keeps `max_outstanding_for` inside its documented clamp.
    FALLBACK_AVAILABLE_MEMORY_BYTES
}

/// Owns every long-lived component and exposes the control surface named
/// in spec §6.
pub struct Dht {
    local_id: NodeID,
    config: DhtConfig,
    routing_table: Arc<routing_table::RoutingTable>,
    transactions: Arc<TransactionManager>,
    dispatcher: Arc<Dispatcher>,
    crawler: Arc<Crawler>,
    peer_store: Arc<PeerStore>,
    metadata: Arc<MetadataStore>,
    persistence: Arc<PersistenceManager>,
    events: EventBus,
    paused: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    socket: Arc<KrpcSocket>,
}

impl Dht {
    pub async fn bind(config: DhtConfig) -> Result<Dht> {
        let local_id = NodeID::random();
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let socket = Arc::new(
            KrpcSocket::bind(bind_addr)
                .await
                .map_err(|cause| DhtError::Bind(bind_addr, io_error_from(cause)))?,
        );

        let events = EventBus::new();
        let routing_table = {
            let events = events.clone();
            Arc::new(routing_table::RoutingTable::with_split_hook(
                local_id,
                move |prefix_len| events.publish(Event::BucketSplit { prefix_len }),
            ))
        };
        let peer_store = Arc::new(PeerStore::new());
        let metadata = Arc::new(MetadataStore::new());
        let tokens = Arc::new(TokenManager::new());

        let transactions = TransactionManager::new(
            local_id,
            socket.clone(),
            Arc::new(RateLimiter::default_dht()),
            Arc::new(ConnectionThrottler::default_dht()),
            max_outstanding_for(available_memory_bytes()),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            local_id,
            routing_table.clone(),
            peer_store.clone(),
            tokens,
            events.clone(),
        ));

        let stats = Arc::new(CrawlerStatistics::default());
        let crawler = Arc::new(Crawler::new(
            local_id,
            routing_table.clone(),
            transactions.clone(),
            peer_store.clone(),
            events.clone(),
            stats,
            config.parallel_crawls,
            std::time::Duration::from_secs(config.refresh_interval_secs),
        ));

        let persistence = Arc::new(PersistenceManager::new(
            config.config_dir.clone(),
            routing_table.clone(),
            peer_store.clone(),
            metadata.clone(),
            events.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Dht {
            local_id,
            config,
            routing_table,
            transactions,
            dispatcher,
            crawler,
            peer_store,
            metadata,
            persistence,
            events,
            paused: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            socket,
        })
    }

    pub fn local_id(&self) -> NodeID {
        self.local_id
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Loads persisted state, then spawns the inbound-receive loop,
    /// discovery cycle, info-hash monitor, and periodic persistence as
    /// background tasks. Returns once bootstrap has either succeeded or
    /// been skipped (empty bootstrap list) — it does not block forever
    /// waiting on an unreachable network.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.persistence.load().await?;

        {
            let socket = self.socket.clone();
            let transactions = self.transactions.clone();
            let dispatcher = self.dispatcher.clone();
            let crawler = self.crawler.clone();
            let events = self.events.clone();
            let mut shutdown = self.shutdown_rx.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        inbound = socket.recv() => {
                            match inbound {
                                Ok((message, source)) => {
                                    if let krpc_encoding::MessageKind::Query = message.message_kind {
                                        if let Ok(krpc_encoding::Body::Query(
                                            krpc_encoding::Query::GetPeers { info_hash, .. },
                                        )) = message.clone().into_body()
                                        {
                                            crawler.observe_info_hash(info_hash);
                                        }
                                    }
                                    transactions.on_inbound(message, source, dispatcher.as_ref()).await;
                                }
                                Err(cause) => {
                                    warn!(%cause, "dropping malformed inbound datagram");
                                    events.publish(Event::SystemError {
                                        message: cause.to_string(),
                                        code: None,
                                    });
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        let bootstrap_endpoints =
            resolve_bootstrap_endpoints(&self.config.bootstrap_nodes, &self.events).await;
        self.crawler.bootstrap(&bootstrap_endpoints).await;

        {
            let crawler = self.crawler.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move { crawler.run_discovery(shutdown).await });
        }
        {
            let crawler = self.crawler.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move { crawler.run_monitor(shutdown).await });
        }
        {
            let persistence = self.persistence.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move { persistence.run_periodic(DEFAULT_INTERVAL, shutdown).await });
        }

        info!(local_id = %self.local_id, port = self.config.port, "dht started");
        Ok(())
    }

    /// Signals every background task to stop, cancels outstanding
    /// transactions, and flushes a final snapshot to disk (spec §5
    /// "Cancellation semantics").
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.transactions.shutdown();
        self.persistence.save_now().await?;
        info!("dht stopped");
        Ok(())
    }

    /// Pausing does not tear anything down; it is observed by callers
    /// via `is_paused()` (the crawler itself has no internal notion of
    /// pause — higher-level policy, e.g. whether to keep scheduling new
    /// lookups, lives with the collaborator driving `Dht`).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn monitor_info_hash(&self, info_hash: NodeID) {
        self.crawler.monitor_info_hash(info_hash);
    }

    pub fn stop_monitoring(&self, info_hash: &NodeID) {
        self.crawler.stop_monitoring(info_hash);
    }

    pub fn statistics(&self) -> CrawlerStatisticsSnapshot {
        self.crawler.statistics()
    }

    /// Re-probes recently-seen `Good` nodes (SPEC_FULL §4.6 supplement).
    /// Wired to nothing by default; an external platform integration
    /// calls this after an OS sleep/wake cycle.
    pub async fn on_wake(&self) {
        self.crawler.on_wake().await;
    }

    pub fn peer_store(&self) -> &Arc<PeerStore> {
        &self.peer_store
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn routing_table(&self) -> &Arc<routing_table::RoutingTable> {
        &self.routing_table
    }
}

fn io_error_from(cause: tokio_krpc::SocketError) -> std::io::Error {
    match cause {
        tokio_krpc::SocketError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    }
}

/// Resolves configured bootstrap hostnames to endpoints, skipping any
/// that fail DNS resolution rather than failing startup over a single
/// bad entry.
async fn resolve_bootstrap_endpoints(bootstrap_nodes: &[String], events: &EventBus) -> Vec<SocketAddr> {
    let mut endpoints = Vec::new();
    for host in bootstrap_nodes {
        match tokio::net::lookup_host(host).await {
            Ok(resolved) => endpoints.extend(resolved),
            Err(cause) => {
                warn!(%host, %cause, "failed to resolve bootstrap node");
                events.publish(Event::SystemError {
                    message: format!("failed to resolve bootstrap node {host}: {cause}"),
                    code: None,
                });
            }
        }
    }
    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DhtConfig {
        DhtConfig {
            port: 0,
            bootstrap_nodes: Vec::new(),
            parallel_crawls: 10,
            refresh_interval_secs: 15,
            max_nodes: 0,
            max_info_hashes: 0,
            auto_start: true,
            user_agent: "test".into(),
            config_dir: std::env::temp_dir()
                .join(format!("dht_crawler_test_{}", NodeID::random()))
                .to_string_lossy()
                .into_owned(),
        }
    }

    #[tokio::test]
    async fn binds_and_reports_a_local_id() {
        let dht = Dht::bind(test_config()).await.unwrap();
        assert!(!dht.local_id().is_unspecified());
    }

    #[tokio::test]
    async fn start_with_no_bootstrap_nodes_completes_without_blocking() {
        let dht = Dht::bind(test_config()).await.unwrap();
        dht.start().await.unwrap();
        dht.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let dht = Dht::bind(test_config()).await.unwrap();
        assert!(!dht.is_paused());
        dht.pause();
        assert!(dht.is_paused());
        dht.resume();
        assert!(!dht.is_paused());
    }
}
