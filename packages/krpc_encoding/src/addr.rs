use std::{
    fmt,
    net::{
        Ipv4Addr,
        SocketAddr,
        SocketAddrV4,
    },
};

use serde::{
    de::{
        self,
        Visitor,
    },
    ser,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};

/// Compact 6-byte IPv4 endpoint: 4-byte address followed by a 2-byte
/// big-endian port, as used for `values` in a `get_peers` response.
///
/// IPv4 is mandatory (spec Endpoint); IPv6 endpoints can be carried in
/// memory (`Addr` wraps a full `SocketAddr`) but fail to compact-encode
/// rather than silently truncating to an IPv4-shaped value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr(pub SocketAddr);

pub const COMPACT_LEN: usize = 6;

impl Addr {
    pub fn v4(ip: Ipv4Addr, port: u16) -> Addr {
        Addr(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    pub fn as_v4(&self) -> Option<SocketAddrV4> {
        match self.0 {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        }
    }

    fn to_compact(self) -> Result<[u8; COMPACT_LEN], NotIpv4> {
        let v4 = self.as_v4().ok_or(NotIpv4)?;
        let mut out = [0u8; COMPACT_LEN];
        out[..4].copy_from_slice(&v4.ip().octets());
        out[4..].copy_from_slice(&v4.port().to_be_bytes());
        Ok(out)
    }

    fn from_compact(bytes: &[u8]) -> Result<Addr, BadCompactAddr> {
        if bytes.len() != COMPACT_LEN {
            return Err(BadCompactAddr(bytes.len()));
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Ok(Addr::v4(ip, port))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("endpoint is not IPv4; cannot compact-encode")]
pub struct NotIpv4;

#[derive(Debug, thiserror::Error)]
#[error("expected a {COMPACT_LEN}-byte compact peer, got {0} bytes")]
pub struct BadCompactAddr(pub usize);

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Self {
        Addr(addr)
    }
}

impl From<Addr> for SocketAddr {
    fn from(addr: Addr) -> Self {
        addr.0
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let compact = self.to_compact().map_err(ser::Error::custom)?;
        serializer.serialize_bytes(&compact)
    }
}

struct AddrVisitor;

impl<'de> Visitor<'de> for AddrVisitor {
    type Value = Addr;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a {COMPACT_LEN}-byte compact peer endpoint")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Addr::from_compact(v).map_err(|e| E::custom(e))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(&v)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(AddrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        let addr = Addr::v4(Ipv4Addr::new(192, 168, 1, 5), 6881);
        let compact = addr.to_compact().unwrap();
        assert_eq!(compact, [192, 168, 1, 5, 0x1a, 0xe1]);
        assert_eq!(Addr::from_compact(&compact).unwrap(), addr);
    }

    #[test]
    fn v6_does_not_compact_encode() {
        let addr = Addr("[::1]:6881".parse().unwrap());
        assert!(addr.to_compact().is_err());
    }
}
