//! Bencoded KRPC message codec for the BitTorrent Mainline DHT (BEP-5),
//! plus compact node/peer encodings (BEP-5) and the BEP-51
//! `sample_infohashes` extension wire shape.

pub mod addr;
pub mod bencode;
pub mod booleans;
pub mod errors;
pub mod messages;
pub mod node_id;
pub mod node_info;

pub use addr::Addr;
pub use errors::{
    CodecError,
    Result,
};
pub use messages::{
    Body,
    KRPCError,
    Message,
    MessageKind,
    Query,
    QueryArgs,
    ResponseValues,
};
pub use node_id::{
    Distance,
    NodeID,
    ID_LEN,
};
pub use node_info::NodeInfo;
