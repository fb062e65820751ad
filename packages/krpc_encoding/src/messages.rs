use serde_bytes::ByteBuf;
use serde_derive::{
    Deserialize,
    Serialize,
};
use std::fmt;

use crate::{
    addr::Addr,
    bencode,
    booleans,
    errors::CodecError,
    node_id::NodeID,
    node_info::{
        self,
        NodeInfo,
    },
};

/// Envelope holding information common to every KRPC message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Arguments, present only on queries.
    #[serde(rename = "a", skip_serializing_if = "Option::is_none", default)]
    pub args: Option<QueryArgs>,

    /// Error `[code, message]`, present only on error messages.
    #[serde(rename = "e", skip_serializing_if = "Option::is_none", default)]
    pub error: Option<KRPCError>,

    /// Public IP address of the requester, sent by peers supporting
    /// [BEP-0042].
    ///
    /// [BEP-0042]: http://www.bittorrent.org/beps/bep_0042.html
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<Addr>,

    /// Query method name, present only on queries.
    #[serde(rename = "q", skip_serializing_if = "Option::is_none", default)]
    pub query_method: Option<String>,

    /// Response values, present only on responses.
    #[serde(rename = "r", skip_serializing_if = "Option::is_none", default)]
    pub response: Option<ResponseValues>,

    /// Transaction id generated by the querying node and echoed in the
    /// response.
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    /// Client version string.
    #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
    pub version: Option<ByteBuf>,

    /// `"q"`, `"r"`, or `"e"`.
    #[serde(rename = "y")]
    pub message_kind: MessageKind,

    /// Sent by read-only DHT nodes, [BEP-0043].
    ///
    /// [BEP-0043]: http://www.bittorrent.org/beps/bep_0043.html
    #[serde(
        rename = "ro",
        default,
        skip_serializing_if = "booleans::is_false",
        with = "booleans"
    )]
    pub read_only: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    #[serde(rename = "q")]
    Query,
    #[serde(rename = "r")]
    Response,
    #[serde(rename = "e")]
    Error,
}

/// A decoded KRPC message in the shape the rest of the crate actually
/// reasons about. `Message` is the wire envelope; `Body` is its typed
/// interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query(Query),
    Response(ResponseValues),
    Error(KRPCError),
}

impl Message {
    pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
        // Bencode is self-delimiting; use the generic scanner purely to
        // measure how much of `bytes` the top-level value occupies and
        // reject anything left over, then hand the same bytes to the
        // typed decoder.
        bencode::decode(bytes)?;
        serde_bencode::from_bytes(bytes).map_err(CodecError::InvalidBencode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_bencode::to_bytes(self).map_err(CodecError::EncodeError)
    }

    pub fn query(transaction_id: Vec<u8>, query: Query) -> Message {
        Message {
            args: Some(query.to_args()),
            error: None,
            ip: None,
            query_method: Some(query.method_name().to_string()),
            response: None,
            transaction_id,
            version: None,
            message_kind: MessageKind::Query,
            read_only: false,
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: ResponseValues) -> Message {
        Message {
            args: None,
            error: None,
            ip: None,
            query_method: None,
            response: Some(response),
            transaction_id,
            version: None,
            message_kind: MessageKind::Response,
            read_only: false,
        }
    }

    pub fn error(transaction_id: Vec<u8>, error: KRPCError) -> Message {
        Message {
            args: None,
            error: Some(error),
            ip: None,
            query_method: None,
            response: None,
            transaction_id,
            version: None,
            message_kind: MessageKind::Error,
            read_only: false,
        }
    }

    /// Reinterprets the envelope as a typed [`Body`], validating that it
    /// is internally consistent (e.g. a query actually carries `a` and
    /// `q`, a response actually carries `r`).
    pub fn into_body(self) -> Result<Body, CodecError> {
        match self.message_kind {
            MessageKind::Query => {
                let method = self
                    .query_method
                    .ok_or_else(|| CodecError::InvalidKRPC("query missing `q`".into()))?;
                let args = self
                    .args
                    .ok_or_else(|| CodecError::InvalidKRPC("query missing `a`".into()))?;
                Ok(Body::Query(Query::from_parts(&method, args)?))
            }
            MessageKind::Response => {
                let response = self
                    .response
                    .ok_or_else(|| CodecError::InvalidKRPC("response missing `r`".into()))?;
                Ok(Body::Response(response))
            }
            MessageKind::Error => {
                let error = self
                    .error
                    .ok_or_else(|| CodecError::InvalidKRPC("error message missing `e`".into()))?;
                Ok(Body::Error(error))
            }
        }
    }
}

/// Error sent when a query cannot be fulfilled. `KRPCError(203, "Bad
/// Token")` is returned by `announce_peer` on token mismatch (spec §4.4).
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct KRPCError(pub u32, pub String);

impl KRPCError {
    pub const GENERIC: u32 = 201;
    pub const SERVER_ERROR: u32 = 202;
    pub const PROTOCOL_ERROR: u32 = 203;
    pub const METHOD_UNKNOWN: u32 = 204;

    pub fn new(code: u32, message: impl Into<String>) -> KRPCError {
        KRPCError(code, message.into())
    }

    pub fn bad_token() -> KRPCError {
        KRPCError::new(Self::PROTOCOL_ERROR, "Bad Token")
    }

    pub fn code(&self) -> u32 {
        self.0
    }

    pub fn message(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for KRPCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.0, self.1)
    }
}

/// Union of every query's argument dict, so a single optional `a` field
/// can represent all five methods without nesting a nested tagged enum
/// inside the envelope's own `y`/`q` tagging.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Default, Clone)]
pub struct QueryArgs {
    pub id: NodeID,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<NodeID>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info_hash: Option<NodeID>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub implied_port: Option<ImpliedPort>,

    #[serde(
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub token: Option<Vec<u8>>,
}

/// Wraps the `implied_port` integer so it round-trips through the
/// bencode-boolean convention without every call site having to know
/// about it.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ImpliedPort(pub bool);

impl serde::Serialize for ImpliedPort {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        booleans::serialize(&self.0, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ImpliedPort {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        booleans::deserialize(deserializer).map(ImpliedPort)
    }
}

/// Decoded, strongly-typed form of a query.
///
/// The appropriate response to [`Query::Ping`] and [`Query::AnnouncePeer`]
/// is [`ResponseValues::only_id`]. [`Query::FindNode`] is answered with
/// [`ResponseValues::next_hop`]. [`Query::GetPeers`] is answered with
/// [`ResponseValues::get_peers`] if the queried node has peers for the
/// info-hash, or [`ResponseValues::next_hop`] otherwise; either way a
/// token is included, required for a future [`Query::AnnouncePeer`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Query {
    Ping {
        id: NodeID,
    },
    FindNode {
        id: NodeID,
        target: NodeID,
    },
    GetPeers {
        id: NodeID,
        info_hash: NodeID,
    },
    AnnouncePeer {
        id: NodeID,
        info_hash: NodeID,
        port: Option<u16>,
        implied_port: bool,
        token: Vec<u8>,
    },
    /// `sample_infohashes` query from [BEP-0051].
    ///
    /// [BEP-0051]: http://www.bittorrent.org/beps/bep_0051.html
    SampleInfoHashes {
        id: NodeID,
        target: NodeID,
    },
}

impl Query {
    pub fn method_name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::SampleInfoHashes { .. } => "sample_infohashes",
        }
    }

    pub fn id(&self) -> NodeID {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::SampleInfoHashes { id, .. } => *id,
        }
    }

    fn to_args(&self) -> QueryArgs {
        match self.clone() {
            Query::Ping { id } => QueryArgs {
                id,
                ..Default::default()
            },
            Query::FindNode { id, target } => QueryArgs {
                id,
                target: Some(target),
                ..Default::default()
            },
            Query::GetPeers { id, info_hash } => QueryArgs {
                id,
                info_hash: Some(info_hash),
                ..Default::default()
            },
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                implied_port,
                token,
            } => QueryArgs {
                id,
                info_hash: Some(info_hash),
                port,
                implied_port: Some(ImpliedPort(implied_port)),
                token: Some(token),
                ..Default::default()
            },
            Query::SampleInfoHashes { id, target } => QueryArgs {
                id,
                target: Some(target),
                ..Default::default()
            },
        }
    }

    fn from_parts(method: &str, args: QueryArgs) -> Result<Query, CodecError> {
        let missing = |field: &str| {
            CodecError::InvalidKRPC(format!("{method} query missing required argument {field}"))
        };

        match method {
            "ping" => Ok(Query::Ping { id: args.id }),
            "find_node" => Ok(Query::FindNode {
                id: args.id,
                target: args.target.ok_or_else(|| missing("target"))?,
            }),
            "get_peers" => Ok(Query::GetPeers {
                id: args.id,
                info_hash: args.info_hash.ok_or_else(|| missing("info_hash"))?,
            }),
            "announce_peer" => Ok(Query::AnnouncePeer {
                id: args.id,
                info_hash: args.info_hash.ok_or_else(|| missing("info_hash"))?,
                port: args.port,
                implied_port: args.implied_port.map(|p| p.0).unwrap_or(false),
                token: args.token.ok_or_else(|| missing("token"))?,
            }),
            "sample_infohashes" => Ok(Query::SampleInfoHashes {
                id: args.id,
                target: args.target.ok_or_else(|| missing("target"))?,
            }),
            other => Err(CodecError::UnknownMethod(other.to_string())),
        }
    }
}

/// Union of every response's value dict (spec §4.1 "Response values by
/// method"). Every field besides `id` is optional, so one struct serves
/// `ping`/`announce_peer` (`id` only), `find_node` (`id`, `nodes`),
/// `get_peers` (`id`, `token`, `values` and/or `nodes`), and
/// `sample_infohashes`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Default, Clone)]
pub struct ResponseValues {
    pub id: NodeID,

    #[serde(
        with = "serde_bytes",
        rename = "token",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub token: Option<Vec<u8>>,

    #[serde(rename = "values", skip_serializing_if = "Option::is_none", default)]
    pub peers: Option<Vec<Addr>>,

    #[serde(
        with = "node_info::option",
        rename = "nodes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub nodes: Option<Vec<NodeInfo>>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub interval: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub num: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub samples: Option<Vec<NodeID>>,
}

impl ResponseValues {
    pub fn only_id(id: NodeID) -> ResponseValues {
        ResponseValues {
            id,
            ..Default::default()
        }
    }

    pub fn next_hop(id: NodeID, token: Option<Vec<u8>>, nodes: Vec<NodeInfo>) -> ResponseValues {
        ResponseValues {
            id,
            token,
            nodes: Some(nodes),
            ..Default::default()
        }
    }

    pub fn get_peers(id: NodeID, token: Vec<u8>, peers: Vec<Addr>) -> ResponseValues {
        ResponseValues {
            id,
            token: Some(token),
            peers: Some(peers),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(byte: u8) -> NodeID {
        let mut bytes = [0u8; crate::node_id::ID_LEN];
        bytes[crate::node_id::ID_LEN - 1] = byte;
        NodeID(bytes)
    }

    #[test]
    fn ping_query_round_trips_with_canonical_key_order() {
        let message = Message::query(vec![0xaa, 0xaa], Query::Ping { id: id(0x01) });
        let bytes = message.encode().unwrap();

        // `a` precedes `q`, `q` precedes `t`, `t` precedes `y`.
        let a_pos = find_key(&bytes, b"1:a");
        let q_pos = find_key(&bytes, b"1:q");
        let t_pos = find_key(&bytes, b"1:t");
        let y_pos = find_key(&bytes, b"1:y");
        assert!(a_pos < q_pos);
        assert!(q_pos < t_pos);
        assert!(t_pos < y_pos);

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    fn find_key(bytes: &[u8], key: &[u8]) -> usize {
        bytes.windows(key.len()).position(|w| w == key).unwrap()
    }

    #[test]
    fn decode_rejects_lone_d() {
        assert!(Message::decode(b"d").is_err());
    }

    #[test]
    fn get_peers_response_round_trips_with_both_values_and_nodes() {
        let addr = Addr::v4(Ipv4Addr::LOCALHOST, 6881);
        let node = NodeInfo::new(id(0x02), addr);
        let mut response = ResponseValues::get_peers(id(0x01), b"tok".to_vec(), vec![addr]);
        response.nodes = Some(vec![node]);

        let message = Message::response(vec![1, 2], response);
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn bad_token_error_has_expected_code() {
        let err = KRPCError::bad_token();
        assert_eq!(err.code(), 203);
        assert_eq!(err.message(), "Bad Token");
    }

    #[test]
    fn query_round_trip_preserves_body() {
        let message = Message::query(
            vec![1, 1],
            Query::AnnouncePeer {
                id: id(0x01),
                info_hash: id(0x02),
                port: Some(6881),
                implied_port: false,
                token: b"abc".to_vec(),
            },
        );
        let bytes = message.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        match decoded.into_body().unwrap() {
            Body::Query(Query::AnnouncePeer { port, token, .. }) => {
                assert_eq!(port, Some(6881));
                assert_eq!(token, b"abc".to_vec());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
