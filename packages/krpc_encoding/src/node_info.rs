use std::fmt;

use serde::{
    de::{
        self,
        Visitor,
    },
    ser,
    Deserializer,
    Serializer,
};

use crate::{
    addr::{
        Addr,
        COMPACT_LEN as ADDR_LEN,
    },
    node_id::{
        NodeID,
        ID_LEN,
    },
};

/// `(NodeID, Endpoint)` pair as carried in `find_node`/`get_peers`
/// responses. Not to be confused with `routing_table::Node`, which also
/// tracks liveness; this is the wire-level shape only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeID,
    pub address: Addr,
}

const COMPACT_NODE_LEN: usize = ID_LEN + ADDR_LEN;

impl NodeInfo {
    pub fn new(id: NodeID, address: Addr) -> NodeInfo {
        NodeInfo { id, address }
    }
}

/// `serde(with = "node_info")` helper serializing `Vec<NodeInfo>` as a
/// single concatenated byte string of 26-byte compact records, per the
/// BEP-5 wire format (as opposed to a bencoded list of byte strings).
pub fn serialize<S>(nodes: &[NodeInfo], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(node.id.as_bytes());
        let v4 = node
            .address
            .as_v4()
            .ok_or_else(|| ser::Error::custom("compact node list requires IPv4 endpoints"))?;
        out.extend_from_slice(&v4.ip().octets());
        out.extend_from_slice(&v4.port().to_be_bytes());
    }
    serializer.serialize_bytes(&out)
}

struct NodesVisitor;

impl<'de> Visitor<'de> for NodesVisitor {
    type Value = Vec<NodeInfo>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a byte string whose length is a multiple of {COMPACT_NODE_LEN}"
        )
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() % COMPACT_NODE_LEN != 0 {
            return Err(E::invalid_length(v.len(), &self));
        }

        let mut nodes = Vec::with_capacity(v.len() / COMPACT_NODE_LEN);
        for chunk in v.chunks_exact(COMPACT_NODE_LEN) {
            let id = NodeID::try_from(&chunk[..ID_LEN]).expect("chunk is ID_LEN bytes");
            let ip_bytes = &chunk[ID_LEN..ID_LEN + 4];
            let port = u16::from_be_bytes([chunk[ID_LEN + 4], chunk[ID_LEN + 5]]);
            let address = Addr::v4(
                std::net::Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]),
                port,
            );
            nodes.push(NodeInfo::new(id, address));
        }
        Ok(nodes)
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<NodeInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_bytes(NodesVisitor)
}

/// `serde(with = "node_info::option")` helper for `Option<Vec<NodeInfo>>`,
/// used where the `nodes` key may be entirely absent (e.g. a `get_peers`
/// response that only returns `values`).
pub mod option {
    use super::{
        NodeInfo,
        NodesVisitor,
    };
    use serde::{
        Deserializer,
        Serializer,
    };

    pub fn serialize<S>(nodes: &Option<Vec<NodeInfo>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match nodes {
            Some(nodes) => super::serialize(nodes, serializer),
            None => unreachable!("skip_serializing_if handles the None case"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<NodeInfo>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(NodesVisitor).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{
        Deserialize,
        Serialize,
    };

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "crate::node_info")]
        nodes: Vec<NodeInfo>,
    }

    #[test]
    fn compact_node_list_round_trips() {
        let nodes = vec![
            NodeInfo::new(NodeID::random(), Addr::v4(std::net::Ipv4Addr::LOCALHOST, 6881)),
            NodeInfo::new(NodeID::random(), Addr::v4(std::net::Ipv4Addr::LOCALHOST, 6882)),
        ];
        let wrapper = Wrapper { nodes };

        let bytes = serde_bencode::to_bytes(&wrapper).unwrap();
        let decoded: Wrapper = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, wrapper);
    }
}
