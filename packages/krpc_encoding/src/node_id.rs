use std::{
    fmt,
    str::FromStr,
};

use rand::RngCore;
use serde::{
    de::{
        self,
        Visitor,
    },
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};

/// Length, in bytes, of a DHT node id or info-hash.
pub const ID_LEN: usize = 20;

/// 160-bit Kademlia node identifier.
///
/// Ordering is lexicographic on the underlying bytes, which coincides both
/// with unsigned-integer ordering and with the ordering `Distance` needs for
/// the XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeID(pub [u8; ID_LEN]);

/// XOR distance between two 160-bit ids, interpreted as an unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_LEN]);

impl NodeID {
    pub const ZERO: NodeID = NodeID([0u8; ID_LEN]);

    /// The all-zero id is a reserved sentinel and must never be admitted to
    /// the routing table as a peer id.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }

    pub fn random() -> NodeID {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeID(bytes)
    }

    /// Generates a random id sharing the top `prefix_bits` bits with `self`.
    pub fn random_with_prefix(&self, prefix_bits: u32) -> NodeID {
        let mut out = NodeID::random();
        let full_bytes = (prefix_bits / 8) as usize;
        out.0[..full_bytes].copy_from_slice(&self.0[..full_bytes]);

        let remaining_bits = prefix_bits % 8;
        if remaining_bits > 0 && full_bytes < ID_LEN {
            let mask = 0xFFu8 << (8 - remaining_bits);
            out.0[full_bytes] = (self.0[full_bytes] & mask) | (out.0[full_bytes] & !mask);
        }

        out
    }

    pub fn xor(&self, other: &NodeID) -> Distance {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index (0-based, from the most significant end) of the first bit at
    /// which `self` and `other` differ, or `160` if they are equal.
    pub fn common_prefix_len(&self, other: &NodeID) -> u32 {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return (byte_idx as u32) * 8 + diff.leading_zeros();
            }
        }
        (ID_LEN as u32) * 8
    }

    /// Value of bit `idx` (0 = most significant bit of byte 0).
    pub fn bit(&self, idx: u32) -> bool {
        let byte = (idx / 8) as usize;
        let shift = 7 - (idx % 8);
        (self.0[byte] >> shift) & 1 == 1
    }

    /// Returns `self` with bit `idx` forced to `value`.
    pub fn with_bit(mut self, idx: u32, value: bool) -> NodeID {
        let byte = (idx / 8) as usize;
        let shift = 7 - (idx % 8);
        if value {
            self.0[byte] |= 1 << shift;
        } else {
            self.0[byte] &= !(1 << shift);
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl Distance {
    pub const MAX: Distance = Distance([0xFFu8; ID_LEN]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }
}

impl From<[u8; ID_LEN]> for NodeID {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        NodeID(bytes)
    }
}

impl TryFrom<&[u8]> for NodeID {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != ID_LEN {
            return Err(InvalidLength(bytes.len()));
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(bytes);
        Ok(NodeID(out))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected a {ID_LEN}-byte node id, got {0} bytes")]
pub struct InvalidLength(pub usize);

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({self})")
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({self})")
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for NodeID {
    type Err = ParseHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN * 2 {
            return Err(ParseHexError);
        }
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ParseHexError)?;
        }
        Ok(NodeID(out))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected a {} character hex string", ID_LEN * 2)]
pub struct ParseHexError;

impl Serialize for NodeID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

struct NodeIDVisitor;

impl<'de> Visitor<'de> for NodeIDVisitor {
    type Value = NodeID;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a {ID_LEN}-byte string")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        NodeID::try_from(v).map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }
}

impl<'de> Deserialize<'de> for NodeID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(NodeIDVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_distance_is_a_metric() {
        let a = NodeID::ZERO;
        let b = NodeID([0xffu8; ID_LEN]);

        assert_eq!(a.xor(&a).is_zero(), true);
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&b), Distance::MAX);
    }

    #[test]
    fn distance_ranks_closest_first() {
        let target = NodeID::ZERO;
        let mut near = NodeID::ZERO;
        near.0[19] = 0x01;
        let mut mid = NodeID::ZERO;
        mid.0[19] = 0x02;
        let mut far = NodeID::ZERO;
        far.0[0] = 0x80;

        let mut ids = vec![far, mid, near];
        ids.sort_by_key(|id| target.xor(id));

        assert_eq!(ids, vec![near, mid, far]);
    }

    #[test]
    fn common_prefix_len_matches_bit_inspection() {
        let a = NodeID::ZERO;
        let mut b = NodeID::ZERO;
        b.0[0] = 0b0000_0001;

        assert_eq!(a.common_prefix_len(&b), 7);
    }

    #[test]
    fn unspecified_sentinel_is_all_zero() {
        assert!(NodeID::ZERO.is_unspecified());
        assert!(!NodeID([0x01; ID_LEN]).is_unspecified());
    }
}
