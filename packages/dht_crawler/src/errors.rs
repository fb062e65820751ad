use std::net::SocketAddr;

use krpc_encoding::CodecError;

/// Failure modes of [`crate::transport::TransactionManager::send_query`]
/// (spec §4.3).
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query to {0} timed out")]
    Timeout(SocketAddr),

    #[error("peer returned error {code}: {message}")]
    PeerError { code: u32, message: String },

    #[error("query was canceled")]
    Canceled,

    #[error("transaction table is full")]
    ResourceExhausted,

    #[error("egress queue exceeded its bounded length")]
    Backpressure,

    #[error("failed to encode outbound query")]
    Encode(#[source] CodecError),

    #[error("failed to decode inbound response")]
    Decode(#[source] CodecError),

    #[error("network unreachable")]
    NetworkUnreachable(#[source] std::io::Error),
}

/// Failure modes of the persistence manager (spec §4.8, supplemented per
/// SPEC_FULL §4.8 with a typed `Corrupt` variant distinguished from
/// plain I/O failure).
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("i/o error on {path:?}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("corrupt record in {path:?}: {reason}")]
    Corrupt {
        path: std::path::PathBuf,
        reason: String,
    },
}

/// Top-level error taxonomy (spec §7). Only [`DhtError::Config`] and
/// [`DhtError::Bind`] are fatal; everything else is handled locally by
/// the component that produced it and surfaced through the observation
/// stream rather than propagated to the caller of `start()`.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("failed to bind UDP socket on {0}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, DhtError>;
