//! Outgoing query tracking (spec §4.3): transaction ids, timeouts,
//! retries, duplicate detection, and the UDP socket they share with
//! inbound query dispatch.

pub mod manager;
pub mod transaction;

pub use manager::{
    max_outstanding_for,
    TransactionManager,
    DEFAULT_RETRIES,
    DEFAULT_TIMEOUT,
};
pub use transaction::TxId;
