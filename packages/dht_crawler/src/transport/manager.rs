use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};

use krpc_encoding::{
    KRPCError,
    Message,
    MessageKind,
    Query,
    ResponseValues,
};
use lru::LruCache;
use rand::Rng;
use tokio::sync::oneshot;
use tokio_krpc::{
    ConnectionThrottler,
    KrpcSocket,
    RateLimiter,
};
use tracing::{
    debug,
    trace,
    warn,
};

use crate::{
    dispatcher::QueryHandler,
    errors::QueryError,
    transport::transaction::{
        txid_bytes,
        txid_from_bytes,
        Transaction,
        TxId,
    },
};

const DUP_CACHE_CAPACITY: usize = 1000;
const DUP_CACHE_WINDOW: Duration = Duration::from_secs(60);

/// Default query timeout and retry count (spec §5 "Timeouts").
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES: u32 = 2;

/// Correlates outgoing KRPC queries with their responses (spec §4.3).
/// Owns the UDP socket exclusively: all sends and the single inbound
/// receive loop go through this type.
pub struct TransactionManager {
    local_id: krpc_encoding::NodeID,
    socket: Arc<KrpcSocket>,
    rate_limiter: Arc<RateLimiter>,
    throttle: Arc<ConnectionThrottler>,
    outstanding: Mutex<HashMap<(SocketAddr, TxId), Transaction>>,
    completed: Mutex<LruCache<(SocketAddr, TxId), Instant>>,
    max_outstanding: usize,
    shutting_down: AtomicBool,
    pub stale_responses: AtomicU64,
    pub duplicate_responses: AtomicU64,
}

/// Bound from spec §4.3 "Memory bound":
/// `clamp(⌊0.25 × available_memory / 350 bytes⌋, 1 000, 1 000 000)`.
/// `available_memory_bytes` is supplied by the caller (startup code
/// queries the OS) rather than probed here, so the manager stays
/// testable without a real memory source.
pub fn max_outstanding_for(available_memory_bytes: u64) -> usize {
    let computed = (available_memory_bytes as f64 * 0.25 / 350.0) as usize;
    computed.clamp(1_000, 1_000_000)
}

impl TransactionManager {
    pub fn new(
        local_id: krpc_encoding::NodeID,
        socket: Arc<KrpcSocket>,
        rate_limiter: Arc<RateLimiter>,
        throttle: Arc<ConnectionThrottler>,
        max_outstanding: usize,
    ) -> Arc<TransactionManager> {
        Arc::new(TransactionManager {
            local_id,
            socket,
            rate_limiter,
            throttle,
            outstanding: Mutex::new(HashMap::new()),
            completed: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(DUP_CACHE_CAPACITY).unwrap(),
            )),
            max_outstanding,
            shutting_down: AtomicBool::new(false),
            stale_responses: AtomicU64::new(0),
            duplicate_responses: AtomicU64::new(0),
        })
    }

    /// Sends `query` to `endpoint` and resolves once a response, error,
    /// or timeout arrives (spec §4.3 contract).
    pub async fn send_query(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        query: Query,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<ResponseValues, QueryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueryError::Canceled);
        }

        if !self.throttle.try_acquire(endpoint) {
            return Err(QueryError::ResourceExhausted);
        }

        let txid = match self.allocate_txid(endpoint) {
            Ok(txid) => txid,
            Err(cause) => {
                self.throttle.release(endpoint);
                return Err(cause);
            }
        };
        let message = Message::query(txid_bytes(txid), query);

        let (tx, rx) = oneshot::channel();
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            if outstanding.len() >= self.max_outstanding {
                self.throttle.release(endpoint);
                return Err(QueryError::ResourceExhausted);
            }
            outstanding.insert(
                (endpoint, txid),
                Transaction {
                    endpoint,
                    responder: Some(tx),
                },
            );
        }

        let result = self
            .run_with_retries(endpoint, &message, rx, timeout, max_retries)
            .await;

        self.outstanding.lock().unwrap().remove(&(endpoint, txid));
        self.throttle.release(endpoint);
        result
    }

    async fn run_with_retries(
        &self,
        endpoint: SocketAddr,
        message: &Message,
        mut rx: oneshot::Receiver<Result<ResponseValues, QueryError>>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<ResponseValues, QueryError> {
        let mut retries_remaining = max_retries;
        let txid = message.transaction_id.clone();

        loop {
            let encoded = message.encode().map_err(QueryError::Encode)?;
            self.rate_limiter
                .acquire(encoded.len())
                .await
                .map_err(|_| QueryError::Backpressure)?;
            self.socket
                .send(message, endpoint)
                .await
                .map_err(|cause| {
                    QueryError::NetworkUnreachable(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        cause.to_string(),
                    ))
                })?;
            trace!(?endpoint, txid = ?txid, "sent query");

            tokio::select! {
                response = &mut rx => {
                    return response.unwrap_or(Err(QueryError::Canceled));
                }
                _ = tokio::time::sleep(timeout) => {
                    if retries_remaining == 0 {
                        debug!(?endpoint, txid = ?txid, "query timed out");
                        return Err(QueryError::Timeout(endpoint));
                    }
                    retries_remaining -= 1;
                    continue;
                }
            }
        }
    }

    fn allocate_txid(&self, endpoint: SocketAddr) -> Result<TxId, QueryError> {
        let outstanding = self.outstanding.lock().unwrap();
        let mut rng = rand::thread_rng();

        for _ in 0..u16::MAX {
            let candidate: TxId = rng.gen::<u16>().to_be_bytes();
            if !outstanding.contains_key(&(endpoint, candidate)) {
                return Ok(candidate);
            }
        }

        Err(QueryError::ResourceExhausted)
    }

    /// Dispatches an inbound message (spec §4.3 step 4). Queries are
    /// forwarded to `handler`; responses/errors resolve the matching
    /// outstanding transaction.
    pub async fn on_inbound(
        self: &Arc<Self>,
        message: Message,
        source: SocketAddr,
        handler: &dyn QueryHandler,
    ) {
        match message.message_kind {
            MessageKind::Query => {
                let Some(reply) = handler.handle_query(&message, source) else {
                    return;
                };
                if let Ok(bytes) = reply.encode() {
                    if let Err(cause) = self.rate_limiter.acquire(bytes.len()).await {
                        warn!(%source, %cause, "dropping reply under egress backpressure");
                        return;
                    }
                    let _ = self.socket.send(&reply, source).await;
                }
            }
            MessageKind::Response | MessageKind::Error => {
                let Some(txid) = txid_from_bytes(&message.transaction_id) else {
                    return;
                };
                self.resolve(source, txid, message);
            }
        }
    }

    fn resolve(&self, source: SocketAddr, txid: TxId, message: Message) {
        let responder = {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding
                .get_mut(&(source, txid))
                .and_then(|tx| tx.responder.take())
        };

        let Some(responder) = responder else {
            if self.is_duplicate(source, txid) {
                self.duplicate_responses.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stale_responses.fetch_add(1, Ordering::Relaxed);
            }
            return;
        };

        self.completed
            .lock()
            .unwrap()
            .put((source, txid), Instant::now());

        let result = match message.into_body() {
            Ok(krpc_encoding::Body::Response(values)) => Ok(values),
            Ok(krpc_encoding::Body::Error(KRPCError(code, text))) => {
                Err(QueryError::PeerError { code, message: text })
            }
            Ok(krpc_encoding::Body::Query(_)) => return,
            Err(cause) => Err(QueryError::Decode(cause)),
        };

        let _ = responder.send(result);
    }

    fn is_duplicate(&self, source: SocketAddr, txid: TxId) -> bool {
        match self.completed.lock().unwrap().peek(&(source, txid)) {
            Some(seen_at) => seen_at.elapsed() < DUP_CACHE_WINDOW,
            None => false,
        }
    }

    pub fn local_id(&self) -> krpc_encoding::NodeID {
        self.local_id
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }

    /// Cancels every outstanding transaction with [`QueryError::Canceled`]
    /// (spec §4.3 `shutdown`).
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut outstanding = self.outstanding.lock().unwrap();
        for (_, tx) in outstanding.drain() {
            if let Some(responder) = tx.responder {
                let _ = responder.send(Err(QueryError::Canceled));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_encoding::NodeID;
    use std::net::{
        Ipv4Addr,
        SocketAddrV4,
    };

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    async fn manager_with_capacity(max_outstanding: usize) -> Arc<TransactionManager> {
        let socket = Arc::new(KrpcSocket::bind(endpoint(0)).await.unwrap());
        TransactionManager::new(
            NodeID::random(),
            socket,
            Arc::new(RateLimiter::default_dht()),
            Arc::new(ConnectionThrottler::default_dht()),
            max_outstanding,
        )
    }

    #[tokio::test]
    async fn resolves_matching_response() {
        let manager = manager_with_capacity(1_000).await;
        let peer = Arc::new(KrpcSocket::bind(endpoint(0)).await.unwrap());
        let peer_addr = peer.local_addr().unwrap();

        let manager_clone = manager.clone();
        let query_task = tokio::spawn(async move {
            manager_clone
                .send_query(
                    peer_addr,
                    Query::Ping { id: NodeID::random() },
                    Duration::from_millis(500),
                    2,
                )
                .await
        });

        let (inbound, source) = peer.recv().await.unwrap();
        let reply = Message::response(
            inbound.transaction_id.clone(),
            ResponseValues::only_id(NodeID::random()),
        );
        peer.send(&reply, source).await.unwrap();

        let result = query_task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unmatched_response_is_counted_stale() {
        let manager = manager_with_capacity(1_000).await;
        let socket_addr = {
            // Re-derive the manager's bound address by binding a fresh
            // socket and letting the manager's own dispatch run against
            // a stray datagram addressed to it.
            endpoint(0)
        };
        let _ = socket_addr;

        let stray = Message::response(vec![9, 9], ResponseValues::only_id(NodeID::random()));

        struct NoopHandler;
        impl QueryHandler for NoopHandler {
            fn handle_query(&self, _message: &Message, _source: SocketAddr) -> Option<Message> {
                None
            }
        }

        manager
            .on_inbound(stray, endpoint(1), &NoopHandler)
            .await;

        assert_eq!(manager.stale_responses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resource_exhaustion_is_reported() {
        let manager = manager_with_capacity(0).await;
        let result = manager
            .send_query(
                endpoint(1),
                Query::Ping { id: NodeID::random() },
                Duration::from_millis(50),
                0,
            )
            .await;
        assert!(matches!(result, Err(QueryError::ResourceExhausted)));
    }
}
