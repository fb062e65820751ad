//! `InfoHashMetadata` (spec §3): populated externally by the metadata
//! acquisition subsystem (BEP-9, out of scope here); the core only
//! stores and persists it.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use krpc_encoding::NodeID;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoHashMetadata {
    pub info_hash: NodeID,
    pub display_name: Option<String>,
    pub files: Vec<FileEntry>,
}

/// In-memory table of metadata the core has been handed by an external
/// collaborator, mirrored to `metadata.dat` by the persistence manager.
#[derive(Default)]
pub struct MetadataStore {
    entries: Mutex<HashMap<NodeID, InfoHashMetadata>>,
}

impl MetadataStore {
    pub fn new() -> MetadataStore {
        MetadataStore::default()
    }

    pub fn insert(&self, metadata: InfoHashMetadata) {
        self.entries
            .lock()
            .unwrap()
            .insert(metadata.info_hash, metadata);
    }

    pub fn get(&self, info_hash: &NodeID) -> Option<InfoHashMetadata> {
        self.entries.lock().unwrap().get(info_hash).cloned()
    }

    pub fn snapshot(&self) -> Vec<InfoHashMetadata> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    pub fn restore(&self, entries: Vec<InfoHashMetadata>) {
        let mut guard = self.entries.lock().unwrap();
        guard.clear();
        for entry in entries {
            guard.insert(entry.info_hash, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_by_info_hash() {
        let store = MetadataStore::new();
        let info_hash = NodeID::random();
        store.insert(InfoHashMetadata {
            info_hash,
            display_name: Some("ubuntu.iso".into()),
            files: vec![FileEntry {
                path: "ubuntu.iso".into(),
                size_bytes: 123,
            }],
        });

        let found = store.get(&info_hash).unwrap();
        assert_eq!(found.display_name.as_deref(), Some("ubuntu.iso"));
    }

    #[test]
    fn restore_replaces_existing_entries() {
        let store = MetadataStore::new();
        store.insert(InfoHashMetadata {
            info_hash: NodeID::random(),
            display_name: None,
            files: Vec::new(),
        });
        store.restore(Vec::new());
        assert!(store.is_empty());
    }
}
