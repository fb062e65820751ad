use std::net::SocketAddr;

use krpc_encoding::ResponseValues;
use tokio::sync::oneshot;

use crate::errors::QueryError;

/// A transaction id is a 2-byte value, unique among the transactions
/// currently outstanding to a given endpoint (spec §3/§4.3).
pub type TxId = [u8; 2];

pub fn txid_bytes(id: TxId) -> Vec<u8> {
    id.to_vec()
}

pub fn txid_from_bytes(bytes: &[u8]) -> Option<TxId> {
    <[u8; 2]>::try_from(bytes).ok()
}

/// An outstanding transaction (spec §3): the message is kept so a
/// timeout can resend an identical datagram (the txid is reused across
/// retries, per §7 "Retries and backoff").
pub(crate) struct Transaction {
    #[allow(dead_code)]
    pub endpoint: SocketAddr,
    pub responder: Option<oneshot::Sender<Result<ResponseValues, QueryError>>>,
}
