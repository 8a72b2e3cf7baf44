//! Storage backends for the peer store.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use crate::{Peer, StoreError};

/// File name of the embedded database inside the output directory.
const DB_FILE_NAME: &str = "peerstore.db";

/// Location of the embedded backend for a given output directory.
pub fn default_db_path(output_path: &Path) -> PathBuf {
    output_path.join(DB_FILE_NAME)
}

/// Raw key-value contract shared by the storage backends.
///
/// Implementations only move whole [`Peer`] records; all semantic
/// bookkeeping lives in [`crate::PeerStore`].
pub trait PeerStorage: Send + Sync {
    /// Unconditionally writes the record under its peer id.
    fn store(&self, peer: &Peer) -> Result<(), StoreError>;

    /// Reads the record for `peer_id`, if present.
    fn load(&self, peer_id: &str) -> Result<Option<Peer>, StoreError>;

    /// Visits every record present when the snapshot was taken.
    ///
    /// The callback returns `false` to stop early. Records stored while a
    /// visit is in progress may or may not be observed by that pass, and
    /// the callback may itself call back into the backend.
    fn range(&self, visit: &mut dyn FnMut(&str, Peer) -> bool) -> Result<(), StoreError>;

    /// Number of records currently stored.
    fn len(&self) -> usize;
}

/// Volatile in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    peers: RwLock<HashMap<String, Peer>>,
}

impl MemoryStore {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStorage for MemoryStore {
    fn store(&self, peer: &Peer) -> Result<(), StoreError> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.peer_id.clone(), peer.clone());
        Ok(())
    }

    fn load(&self, peer_id: &str) -> Result<Option<Peer>, StoreError> {
        Ok(self.peers.read().unwrap_or_else(|e| e.into_inner()).get(peer_id).cloned())
    }

    fn range(&self, visit: &mut dyn FnMut(&str, Peer) -> bool) -> Result<(), StoreError> {
        // Snapshot first so the callback can write back into the store
        // without holding the map lock.
        let snapshot: Vec<(String, Peer)> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (id, peer) in snapshot {
            if !visit(&id, peer) {
                break;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Embedded [`sled`] backend for resumable runs.
///
/// Records are stored as serde-encoded values in a single tree, keyed by
/// peer id.
pub struct SledStore {
    tree: sled::Tree,
    // Held so the database is flushed when the store is dropped.
    _db: sled::Db,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").field("len", &self.tree.len()).finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("peers")?;
        info!(target: "peerdb", path = %path.display(), peers = tree.len(), "opened peerstore");
        Ok(Self { tree, _db: db })
    }
}

impl PeerStorage for SledStore {
    fn store(&self, peer: &Peer) -> Result<(), StoreError> {
        let value = serde_json::to_vec(peer)
            .map_err(|source| StoreError::Encode { id: peer.peer_id.clone(), source })?;
        self.tree.insert(peer.peer_id.as_bytes(), value)?;
        Ok(())
    }

    fn load(&self, peer_id: &str) -> Result<Option<Peer>, StoreError> {
        let Some(value) = self.tree.get(peer_id.as_bytes())? else {
            return Ok(None);
        };
        let peer = serde_json::from_slice(&value)
            .map_err(|source| StoreError::Decode { id: peer_id.to_string(), source })?;
        Ok(Some(peer))
    }

    fn range(&self, visit: &mut dyn FnMut(&str, Peer) -> bool) -> Result<(), StoreError> {
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let id = String::from_utf8_lossy(&key).into_owned();
            let peer = match serde_json::from_slice(&value) {
                Ok(peer) => peer,
                Err(err) => {
                    warn!(target: "peerdb", id, %err, "skipping undecodable peer record");
                    continue;
                }
            };
            if !visit(&id, peer) {
                break;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let peer = Peer::new("p1");
        store.store(&peer).unwrap();
        assert_eq!(store.load("p1").unwrap().unwrap().peer_id, "p1");
        assert!(store.load("missing").unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_range_allows_write_back() {
        let store = MemoryStore::new();
        store.store(&Peer::new("p1")).unwrap();
        store.store(&Peer::new("p2")).unwrap();

        store
            .range(&mut |_, mut peer| {
                peer.attempts += 1;
                store.store(&peer).unwrap();
                true
            })
            .unwrap();

        assert_eq!(store.load("p1").unwrap().unwrap().attempts, 1);
        assert_eq!(store.load("p2").unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(&default_db_path(dir.path())).unwrap();

        let mut peer = Peer::new("p1");
        peer.user_agent = "teku/v23.1.0".into();
        peer.addresses = vec!["/ip4/10.0.0.1/tcp/9000".parse().unwrap()];
        store.store(&peer).unwrap();

        let loaded = store.load("p1").unwrap().unwrap();
        assert_eq!(loaded, peer);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_db_path(dir.path());
        {
            let store = SledStore::open(&path).unwrap();
            store.store(&Peer::new("p1")).unwrap();
        }
        let store = SledStore::open(&path).unwrap();
        assert!(store.load("p1").unwrap().is_some());
    }
}
