use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
    time::{
        Duration,
        Instant,
    },
};

/// Default outstanding-transaction cap per endpoint (spec §9 Open
/// Question 2, resolved against the original implementation's
/// `ConnectionThrottler`: a per-endpoint count with a timeout that
/// expires stale entries rather than a global rate).
const DEFAULT_MAX_PER_ENDPOINT: usize = 10;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Caps the number of outstanding transactions to a single remote
/// endpoint, so one slow or malicious peer cannot consume the whole
/// transaction table. Entries older than the timeout are dropped lazily
/// on the next `try_acquire`/`release` for that endpoint.
pub struct ConnectionThrottler {
    max_per_endpoint: usize,
    timeout: Duration,
    connections: Mutex<HashMap<SocketAddr, Vec<Instant>>>,
}

impl ConnectionThrottler {
    pub fn new(max_per_endpoint: usize, timeout: Duration) -> ConnectionThrottler {
        ConnectionThrottler {
            max_per_endpoint,
            timeout,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_dht() -> ConnectionThrottler {
        ConnectionThrottler::new(DEFAULT_MAX_PER_ENDPOINT, DEFAULT_TIMEOUT)
    }

    /// Attempts to reserve a slot for `endpoint`. Returns `false` if the
    /// endpoint already has `max_per_endpoint` unexpired slots.
    pub fn try_acquire(&self, endpoint: SocketAddr) -> bool {
        let mut connections = self.connections.lock().unwrap();
        let entry = connections.entry(endpoint).or_default();
        Self::remove_expired(entry, self.timeout);

        if entry.len() >= self.max_per_endpoint {
            return false;
        }

        entry.push(Instant::now());
        true
    }

    /// Releases one slot for `endpoint`, ahead of its timeout (called
    /// once a transaction to that endpoint completes or is abandoned).
    pub fn release(&self, endpoint: SocketAddr) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(entry) = connections.get_mut(&endpoint) {
            entry.pop();
            if entry.is_empty() {
                connections.remove(&endpoint);
            }
        }
    }

    pub fn active_connections(&self, endpoint: SocketAddr) -> usize {
        let mut connections = self.connections.lock().unwrap();
        match connections.get_mut(&endpoint) {
            Some(entry) => {
                Self::remove_expired(entry, self.timeout);
                entry.len()
            }
            None => 0,
        }
    }

    pub fn total_active_connections(&self) -> usize {
        let mut connections = self.connections.lock().unwrap();
        connections
            .values_mut()
            .map(|entry| {
                Self::remove_expired(entry, self.timeout);
                entry.len()
            })
            .sum()
    }

    pub fn clear(&self) {
        self.connections.lock().unwrap().clear();
    }

    fn remove_expired(entry: &mut Vec<Instant>, timeout: Duration) {
        entry.retain(|timestamp| timestamp.elapsed() < timeout);
    }
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
    fn caps_connections_per_endpoint() {
        let throttler = ConnectionThrottler::new(2, Duration::from_secs(60));
        let ep = endpoint(6881);

        assert!(throttler.try_acquire(ep));
        assert!(throttler.try_acquire(ep));
        assert!(!throttler.try_acquire(ep));
        assert_eq!(throttler.active_connections(ep), 2);
    }

    #[test]
    fn release_frees_a_slot() {
        let throttler = ConnectionThrottler::new(1, Duration::from_secs(60));
        let ep = endpoint(6881);

        assert!(throttler.try_acquire(ep));
        assert!(!throttler.try_acquire(ep));
        throttler.release(ep);
        assert!(throttler.try_acquire(ep));
    }

    #[test]
    fn endpoints_are_independent() {
        let throttler = ConnectionThrottler::new(1, Duration::from_secs(60));
        assert!(throttler.try_acquire(endpoint(1)));
        assert!(throttler.try_acquire(endpoint(2)));
        assert_eq!(throttler.total_active_connections(), 2);
    }

    #[test]
    fn expired_entries_do_not_count() {
        let throttler = ConnectionThrottler::new(1, Duration::from_millis(10));
        let ep = endpoint(6881);
        assert!(throttler.try_acquire(ep));
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttler.try_acquire(ep));
    }
}
