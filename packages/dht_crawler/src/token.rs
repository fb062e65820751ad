//! Announce tokens (spec §3/§4.4): an opaque value bound to the
//! requesting endpoint and a 5-minute rotation epoch by a keyed hash,
//! so a node can verify a later `announce_peer` without keeping
//! per-endpoint state.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{
        Hash,
        Hasher,
    },
    net::SocketAddr,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use rand::RngCore;

const ROTATION_SECS: u64 = 5 * 60;

pub struct TokenManager {
    secret: [u8; 32],
}

impl TokenManager {
    pub fn new() -> TokenManager {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        TokenManager { secret }
    }

    pub fn issue(&self, endpoint: SocketAddr) -> Vec<u8> {
        self.token_for_epoch(endpoint, current_epoch())
    }

    /// Accepts a token minted for the current epoch or the one before
    /// it (spec §3 "previous epoch accepted for one additional
    /// rotation").
    pub fn verify(&self, endpoint: SocketAddr, token: &[u8]) -> bool {
        let epoch = current_epoch();
        token == self.token_for_epoch(endpoint, epoch).as_slice()
            || (epoch > 0 && token == self.token_for_epoch(endpoint, epoch - 1).as_slice())
    }

    fn token_for_epoch(&self, endpoint: SocketAddr, epoch: u64) -> Vec<u8> {
        let mut hasher = DefaultHasher::new();
        self.secret.hash(&mut hasher);
        endpoint.hash(&mut hasher);
        epoch.hash(&mut hasher);
        hasher.finish().to_be_bytes().to_vec()
    }
}

impl Default for TokenManager {
    fn default() -> TokenManager {
        TokenManager::new()
    }
}

fn current_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / ROTATION_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{
        Ipv4Addr,
        SocketAddrV4,
    };

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn issued_token_verifies() {
        let manager = TokenManager::new();
        let ep = endpoint(6881);
        let token = manager.issue(ep);
        assert!(manager.verify(ep, &token));
    }

    #[test]
    fn token_is_bound_to_endpoint() {
        let manager = TokenManager::new();
        let token = manager.issue(endpoint(1));
        assert!(!manager.verify(endpoint(2), &token));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let manager = TokenManager::new();
        assert!(!manager.verify(endpoint(1), b"not-a-real-token"));
    }
}
