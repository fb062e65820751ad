//! Persistence Manager (spec §4.8): crash-safe snapshot/restore of the
//! routing table, peer store, and info-hash metadata.

use std::{
    io::{
        self,
        Cursor,
        Read,
    },
    net::{
        IpAddr,
        Ipv4Addr,
        Ipv6Addr,
        SocketAddr,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};

use krpc_encoding::{
    NodeID,
    ID_LEN,
};
use tracing::{
    error,
    info,
    warn,
};

use crate::{
    errors::PersistenceError,
    events::{
        Event,
        EventBus,
    },
    metadata::{
        FileEntry,
        InfoHashMetadata,
        MetadataStore,
    },
    peer_store::PeerStore,
};

/// Default interval between automatic snapshots (spec §5 "Timeouts").
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

const ROUTING_TABLE_FILE: &str = "routing_table.dat";
const PEER_STORAGE_FILE: &str = "peer_storage.dat";
const METADATA_FILE: &str = "metadata.dat";

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

fn write_endpoint(buf: &mut Vec<u8>, endpoint: SocketAddr) {
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            buf.push(FAMILY_V4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(FAMILY_V6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&endpoint.port().to_le_bytes());
}

fn read_endpoint(cursor: &mut Cursor<&[u8]>) -> io::Result<SocketAddr> {
    let mut family = [0u8; 1];
    cursor.read_exact(&mut family)?;
    let ip = match family[0] {
        FAMILY_V4 => {
            let mut octets = [0u8; 4];
            cursor.read_exact(&mut octets)?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            cursor.read_exact(&mut octets)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address family tag {other}"),
            ))
        }
    };
    let mut port = [0u8; 2];
    cursor.read_exact(&mut port)?;
    Ok(SocketAddr::new(ip, u16::from_le_bytes(port)))
}

fn read_node_id(cursor: &mut Cursor<&[u8]>) -> io::Result<NodeID> {
    let mut bytes = [0u8; ID_LEN];
    cursor.read_exact(&mut bytes)?;
    Ok(NodeID(bytes))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    cursor.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    cursor.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: u32) -> io::Result<String> {
    let mut bytes = vec![0u8; len as usize];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|cause| io::Error::new(io::ErrorKind::InvalidData, cause))
}

/// Wraps a payload with a trailing CRC32 and a leading entry count, then
/// strips/validates them on load (spec §4.8 "Load").
mod framing {
    use super::*;

    pub fn frame(mut payload: Vec<u8>) -> Vec<u8> {
        let checksum = crc32fast::hash(&payload);
        payload.extend_from_slice(&checksum.to_le_bytes());
        payload
    }

    /// Validates and strips the trailing CRC32, returning the payload.
    pub fn unframe<'a>(path: &Path, bytes: &'a [u8]) -> Result<&'a [u8], PersistenceError> {
        if bytes.len() < 4 {
            return Err(PersistenceError::Corrupt {
                path: path.to_path_buf(),
                reason: "file shorter than trailing checksum".into(),
            });
        }
        let (payload, checksum_bytes) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(PersistenceError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("checksum mismatch: expected {expected}, got {actual}"),
            });
        }
        Ok(payload)
    }
}

fn encode_routing_table(entries: &[(NodeID, SocketAddr)]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (id, endpoint) in entries {
        payload.extend_from_slice(&id.0);
        write_endpoint(&mut payload, *endpoint);
    }
    framing::frame(payload)
}

fn decode_routing_table(path: &Path, bytes: &[u8]) -> Result<Vec<(NodeID, SocketAddr)>, PersistenceError> {
    let payload = framing::unframe(path, bytes)?;
    let corrupt = |cause: io::Error| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: cause.to_string(),
    };

    let mut cursor = Cursor::new(payload);
    let count = read_u32(&mut cursor).map_err(corrupt)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = read_node_id(&mut cursor).map_err(corrupt)?;
        let endpoint = read_endpoint(&mut cursor).map_err(corrupt)?;
        entries.push((id, endpoint));
    }
    Ok(entries)
}

fn encode_peer_storage(entries: &[(NodeID, Vec<(SocketAddr, u64)>)]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (info_hash, peers) in entries {
        payload.extend_from_slice(&info_hash.0);
        payload.extend_from_slice(&(peers.len() as u32).to_le_bytes());
        for (endpoint, announced_at_unix_ms) in peers {
            write_endpoint(&mut payload, *endpoint);
            payload.extend_from_slice(&announced_at_unix_ms.to_le_bytes());
        }
    }
    framing::frame(payload)
}

fn decode_peer_storage(
    path: &Path,
    bytes: &[u8],
) -> Result<Vec<(NodeID, Vec<(SocketAddr, u64)>)>, PersistenceError> {
    let payload = framing::unframe(path, bytes)?;
    let corrupt = |cause: io::Error| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: cause.to_string(),
    };

    let mut cursor = Cursor::new(payload);
    let swarm_count = read_u32(&mut cursor).map_err(corrupt)?;
    let mut swarms = Vec::with_capacity(swarm_count as usize);
    for _ in 0..swarm_count {
        let info_hash = read_node_id(&mut cursor).map_err(corrupt)?;
        let peer_count = read_u32(&mut cursor).map_err(corrupt)?;
        let mut peers = Vec::with_capacity(peer_count as usize);
        for _ in 0..peer_count {
            let endpoint = read_endpoint(&mut cursor).map_err(corrupt)?;
            let announced_at_unix_ms = read_u64(&mut cursor).map_err(corrupt)?;
            peers.push((endpoint, announced_at_unix_ms));
        }
        swarms.push((info_hash, peers));
    }
    Ok(swarms)
}

fn encode_metadata(entries: &[InfoHashMetadata]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        payload.extend_from_slice(&entry.info_hash.0);
        let name = entry.display_name.as_deref().unwrap_or("");
        payload.extend_from_slice(&(name.len() as u32).to_le_bytes());
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(&(entry.files.len() as u32).to_le_bytes());
        for file in &entry.files {
            payload.extend_from_slice(&(file.path.len() as u32).to_le_bytes());
            payload.extend_from_slice(file.path.as_bytes());
            payload.extend_from_slice(&file.size_bytes.to_le_bytes());
        }
    }
    framing::frame(payload)
}

fn decode_metadata(path: &Path, bytes: &[u8]) -> Result<Vec<InfoHashMetadata>, PersistenceError> {
    let payload = framing::unframe(path, bytes)?;
    let corrupt = |cause: io::Error| PersistenceError::Corrupt {
        path: path.to_path_buf(),
        reason: cause.to_string(),
    };

    let mut cursor = Cursor::new(payload);
    let count = read_u32(&mut cursor).map_err(corrupt)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let info_hash = read_node_id(&mut cursor).map_err(corrupt)?;
        let name_len = read_u32(&mut cursor).map_err(corrupt)?;
        let name = read_string(&mut cursor, name_len).map_err(corrupt)?;
        let display_name = if name.is_empty() { None } else { Some(name) };
        let file_count = read_u32(&mut cursor).map_err(corrupt)?;
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let path_len = read_u32(&mut cursor).map_err(corrupt)?;
            let path_str = read_string(&mut cursor, path_len).map_err(corrupt)?;
            let size_bytes = read_u64(&mut cursor).map_err(corrupt)?;
            files.push(FileEntry {
                path: path_str,
                size_bytes,
            });
        }
        entries.push(InfoHashMetadata {
            info_hash,
            display_name,
            files,
        });
    }
    Ok(entries)
}

/// Reads `path` if it exists, quarantining it on corruption rather than
/// failing startup (spec §4.8 "Load", §7 "Corrupt persistence file").
fn load_quarantining<T>(
    path: &Path,
    decode: impl FnOnce(&Path, &[u8]) -> Result<T, PersistenceError>,
    default: impl FnOnce() -> T,
    events: &EventBus,
) -> T {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(cause) if cause.kind() == io::ErrorKind::NotFound => return default(),
        Err(cause) => {
            error!(?path, %cause, "failed to read persistence file, starting empty");
            events.publish(Event::SystemError {
                message: format!("failed to read persistence file {path:?}: {cause}"),
                code: None,
            });
            return default();
        }
    };

    match decode(path, &bytes) {
        Ok(value) => value,
        Err(PersistenceError::Corrupt { reason, .. }) => {
            quarantine(path, &reason, events);
            default()
        }
        Err(other) => {
            error!(?path, %other, "failed to load persistence file, starting empty");
            events.publish(Event::SystemError {
                message: format!("failed to load persistence file {path:?}: {other}"),
                code: None,
            });
            default()
        }
    }
}

fn quarantine(path: &Path, reason: &str, events: &EventBus) {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let quarantined = path.with_extension(format!("corrupt.{timestamp}"));
    warn!(?path, ?quarantined, reason, "quarantining corrupt persistence file");
    events.publish(Event::SystemError {
        message: format!("quarantined corrupt persistence file {path:?}: {reason}"),
        code: None,
    });
    if let Err(cause) = std::fs::rename(path, &quarantined) {
        error!(?path, %cause, "failed to quarantine corrupt persistence file");
    }
}

/// Writes `payload` to `<dir>/<name>.tmp` then atomically renames it into
/// place, so a crash mid-write never clobbers a good snapshot (spec §4.8
/// "Atomicity").
fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), PersistenceError> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, payload).map_err(|cause| PersistenceError::Io {
        path: tmp_path.clone(),
        cause,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|cause| PersistenceError::Io {
        path: path.to_path_buf(),
        cause,
    })
}

/// Periodic and on-demand snapshotting of domain state to `config_dir`
/// (spec §4.8). Holds no domain locks across I/O: every write is handed a
/// read-only snapshot already taken by the caller.
pub struct PersistenceManager {
    config_dir: PathBuf,
    routing_table: Arc<routing_table::RoutingTable>,
    peer_store: Arc<PeerStore>,
    metadata: Arc<MetadataStore>,
    events: EventBus,
}

impl PersistenceManager {
    pub fn new(
        config_dir: impl Into<PathBuf>,
        routing_table: Arc<routing_table::RoutingTable>,
        peer_store: Arc<PeerStore>,
        metadata: Arc<MetadataStore>,
        events: EventBus,
    ) -> PersistenceManager {
        PersistenceManager {
            config_dir: config_dir.into(),
            routing_table,
            peer_store,
            metadata,
            events,
        }
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.config_dir.join(file_name)
    }

    /// Loads all three artifacts, restoring routing table/peer
    /// store/metadata in place. Call once at startup, before the crawler
    /// loop begins issuing queries.
    pub async fn load(&self) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.config_dir).map_err(|cause| PersistenceError::Io {
            path: self.config_dir.clone(),
            cause,
        })?;

        let routing_table_path = self.path(ROUTING_TABLE_FILE);
        let peer_storage_path = self.path(PEER_STORAGE_FILE);
        let metadata_path = self.path(METADATA_FILE);

        let routing_table = self.routing_table.clone();
        let peer_store = self.peer_store.clone();
        let metadata_store = self.metadata.clone();
        let events = self.events.clone();

        let (nodes, swarms, entries) = tokio::task::spawn_blocking(move || {
            let nodes = load_quarantining(&routing_table_path, decode_routing_table, Vec::new, &events);
            let swarms = load_quarantining(&peer_storage_path, decode_peer_storage, Vec::new, &events);
            let entries = load_quarantining(&metadata_path, decode_metadata, Vec::new, &events);
            (nodes, swarms, entries)
        })
        .await
        .expect("persistence load task panicked");

        for (id, endpoint) in nodes {
            routing_table.add_node(routing_table::Node::new(id, endpoint));
        }
        peer_store.restore(swarms);
        metadata_store.restore(entries);

        info!(
            nodes = routing_table.len(),
            info_hashes = peer_store.info_hash_count(),
            metadata_entries = metadata_store.len(),
            "loaded persisted state"
        );
        Ok(())
    }

    /// Snapshots all three artifacts and writes them now, off the async
    /// runtime's worker threads (spec §5 "Suspension points").
    pub async fn save_now(&self) -> Result<(), PersistenceError> {
        let routing_table_path = self.path(ROUTING_TABLE_FILE);
        let peer_storage_path = self.path(PEER_STORAGE_FILE);
        let metadata_path = self.path(METADATA_FILE);

        let nodes = self.routing_table.snapshot();
        let swarms = self.peer_store.snapshot();
        let entries = self.metadata.snapshot();

        tokio::task::spawn_blocking(move || -> Result<(), PersistenceError> {
            write_atomic(&routing_table_path, &encode_routing_table(&nodes))?;
            write_atomic(&peer_storage_path, &encode_peer_storage(&swarms))?;
            write_atomic(&metadata_path, &encode_metadata(&entries))?;
            Ok(())
        })
        .await
        .expect("persistence save task panicked")
    }

    /// Runs `save_now` every `interval` until `shutdown` resolves. Intended
    /// to be spawned as a background task by the top-level `Dht`.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(cause) = self.save_now().await {
                        error!(%cause, "periodic persistence save failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
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
    fn routing_table_round_trips() {
        let entries = vec![(NodeID::random(), endpoint(1)), (NodeID::random(), endpoint(2))];
        let encoded = encode_routing_table(&entries);
        let decoded = decode_routing_table(Path::new("routing_table.dat"), &encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn peer_storage_round_trips() {
        let entries = vec![(NodeID::random(), vec![(endpoint(1), 1_700_000_000_000)])];
        let encoded = encode_peer_storage(&entries);
        let decoded = decode_peer_storage(Path::new("peer_storage.dat"), &encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn metadata_round_trips() {
        let entries = vec![InfoHashMetadata {
            info_hash: NodeID::random(),
            display_name: Some("ubuntu.iso".into()),
            files: vec![FileEntry {
                path: "ubuntu.iso".into(),
                size_bytes: 4_096,
            }],
        }];
        let encoded = encode_metadata(&entries);
        let decoded = decode_metadata(Path::new("metadata.dat"), &encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let entries = vec![(NodeID::random(), endpoint(1))];
        let mut encoded = encode_routing_table(&entries);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let result = decode_routing_table(Path::new("routing_table.dat"), &encoded);
        assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn missing_files_load_as_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(
            dir.path(),
            Arc::new(routing_table::RoutingTable::new(NodeID::random())),
            Arc::new(PeerStore::new()),
            Arc::new(MetadataStore::new()),
            EventBus::new(),
        );
        manager.load().await.unwrap();
        assert_eq!(manager.routing_table.len(), 0);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_routing_table() {
        let dir = tempfile::tempdir().unwrap();
        let local_id = NodeID::random();
        let routing_table = Arc::new(routing_table::RoutingTable::new(local_id));
        let remote_id = NodeID::random();
        routing_table.add_node(routing_table::Node::new(remote_id, endpoint(4000)));

        let manager = PersistenceManager::new(
            dir.path(),
            routing_table,
            Arc::new(PeerStore::new()),
            Arc::new(MetadataStore::new()),
            EventBus::new(),
        );
        manager.save_now().await.unwrap();

        let reloaded_table = Arc::new(routing_table::RoutingTable::new(local_id));
        let reload_manager = PersistenceManager::new(
            dir.path(),
            reloaded_table,
            Arc::new(PeerStore::new()),
            Arc::new(MetadataStore::new()),
            EventBus::new(),
        );
        reload_manager.load().await.unwrap();
        assert!(reload_manager.routing_table.get(&remote_id).is_some());
    }

    #[tokio::test]
    async fn quarantines_corrupt_file_instead_of_failing_load() {
        let dir = tempfile::tempdir().unwrap();
        let routing_table_path = dir.path().join(ROUTING_TABLE_FILE);
        std::fs::write(&routing_table_path, b"not a valid snapshot").unwrap();

        let manager = PersistenceManager::new(
            dir.path(),
            Arc::new(routing_table::RoutingTable::new(NodeID::random())),
            Arc::new(PeerStore::new()),
            Arc::new(MetadataStore::new()),
            EventBus::new(),
        );
        manager.load().await.unwrap();

        assert_eq!(manager.routing_table.len(), 0);
        assert!(!routing_table_path.exists());
    }
}
