//! Kademlia k-bucket routing table (spec §4.2): XOR-distance ranked
//! lookups, bucket splitting, and Good/Questionable/Bad node liveness
//! tracking.

pub mod bucket;
pub mod node;
pub mod table;

pub use bucket::K;
pub use node::{
    Node,
    Quality,
    GOOD_DURATION,
};
pub use table::{
    AddOutcome,
    RoutingTable,
};
