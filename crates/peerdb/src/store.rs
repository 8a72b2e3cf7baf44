//! The [`PeerStore`]: single source of truth for observed peer state.

use std::{collections::BTreeMap, path::Path, sync::Mutex};

use chrono::Utc;

use crate::{
    Direction, ErrorKind, MemoryStore, Peer, PeerStorage, PruneDecision, PrunePolicy, SledStore,
    StoreError, default_db_path,
};

/// Which storage backend a store runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Volatile in-memory map.
    Memory,
    /// Embedded key-value file, resumable across runs.
    #[default]
    Sled,
}

impl BackendKind {
    /// Parses a configuration string.
    ///
    /// Anything that is not `memory` selects the file backend; unknown
    /// names therefore fall back to a resumable store rather than
    /// silently losing data.
    pub fn parse(s: &str) -> Self {
        match s {
            "memory" => Self::Memory,
            "sled" => Self::Sled,
            other => {
                warn!(target: "peerdb", backend = other, "unknown peerstore backend, using file backend");
                Self::Sled
            }
        }
    }
}

/// Process-wide concurrent mapping from peer id to [`Peer`].
///
/// The store is the only component that mutates peer records. Every event
/// operation is a read-modify-write cycle serialised by an internal lock,
/// so operations on the same peer are linearisable; readers may observe a
/// snapshot that predates an in-flight mutation.
pub struct PeerStore {
    backend: Box<dyn PeerStorage>,
    policy: PrunePolicy,
    // Serialises read-modify-write cycles across all event operations.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for PeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStore").field("len", &self.len()).finish()
    }
}

impl PeerStore {
    /// Opens a store on the selected backend.
    ///
    /// The file backend lives at `<output_path>/peerstore.db`.
    pub fn open(kind: BackendKind, output_path: &Path) -> Result<Self, StoreError> {
        let backend: Box<dyn PeerStorage> = match kind {
            BackendKind::Memory => Box::new(MemoryStore::new()),
            BackendKind::Sled => Box::new(SledStore::open(&default_db_path(output_path))?),
        };
        Ok(Self { backend, policy: PrunePolicy::new(), write_lock: Mutex::new(()) })
    }

    /// Opens a volatile in-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryStore::new()),
            policy: PrunePolicy::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Unconditionally writes `peer`, replacing any existing record.
    pub fn store(&self, peer: Peer) -> Result<(), StoreError> {
        self.backend.store(&peer)
    }

    /// Writes `peer` if absent, otherwise merges its observational fields
    /// into the existing record, preserving counters and event history.
    pub fn store_or_update(&self, peer: Peer) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.backend.load(&peer.peer_id)? {
            Some(mut existing) => {
                existing.fetch_from(&peer);
                self.backend.store(&existing)
            }
            None => self.backend.store(&peer),
        }
    }

    /// Reads the record for `peer_id`.
    pub fn load(&self, peer_id: &str) -> Result<Peer, StoreError> {
        self.backend.load(peer_id)?.ok_or_else(|| StoreError::NotFound(peer_id.to_string()))
    }

    /// Visits every stored peer. Visitation order is unspecified.
    pub fn range(&self, mut visit: impl FnMut(&str, Peer) -> bool) -> Result<(), StoreError> {
        self.backend.range(&mut visit)
    }

    /// Number of peers ever sighted this run (or resumed from disk).
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Whether the store holds no peers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a connection episode for `peer_id`.
    pub fn connection_event(&self, peer_id: &str, direction: Direction) -> Result<(), StoreError> {
        self.mutate(peer_id, |peer| peer.connection_event(direction, Utc::now()))
    }

    /// Closes the open connection episode for `peer_id`.
    pub fn disconnection_event(&self, peer_id: &str) -> Result<(), StoreError> {
        self.mutate(peer_id, |peer| peer.disconnection_event(Utc::now()))
    }

    /// Records a metadata exchange outcome for `peer_id`.
    pub fn metadata_event(&self, peer_id: &str, success: bool) -> Result<(), StoreError> {
        self.mutate(peer_id, |peer| {
            peer.metadata_requested = true;
            if success {
                peer.metadata_succeeded = true;
            }
        })
    }

    /// Records the outcome of a connection attempt and evaluates the prune
    /// policy over the updated record.
    ///
    /// The returned decision tells the caller whether the discovery feed
    /// should stop emitting this peer.
    pub fn connection_attempt_event(
        &self,
        peer_id: &str,
        succeed: bool,
        error: &str,
    ) -> Result<PruneDecision, StoreError> {
        let kind = if succeed { ErrorKind::None } else { ErrorKind::classify(error) };
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut peer = self
            .backend
            .load(peer_id)?
            .ok_or_else(|| StoreError::NotFound(peer_id.to_string()))?;
        peer.connection_attempt(succeed, kind, Utc::now());
        let decision =
            if succeed { PruneDecision::Retry } else { self.policy.evaluate(&peer, kind) };
        if decision == PruneDecision::Blacklist {
            peer.deprecated = true;
        }
        self.backend.store(&peer)?;
        Ok(decision)
    }

    /// Counts a gossip message from `peer_id` on `topic`.
    pub fn message_event(&self, peer_id: &str, topic: &str) -> Result<(), StoreError> {
        self.mutate(peer_id, |peer| peer.message_event(topic, Utc::now()))
    }

    /// Zeroes the dynamic metrics of every stored peer.
    ///
    /// Identity attributes survive; peers connected while the reset runs
    /// restart their open episode now, so their next reported connected
    /// time is shorter than the real connection.
    pub fn reset_dynamic_metrics(&self) -> Result<(), StoreError> {
        info!(target: "peerdb", "resetting dynamic metrics");
        let now = Utc::now();
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut result = Ok(());
        self.backend.range(&mut |_, mut peer| {
            peer.reset_dynamic_metrics(now);
            if let Err(err) = self.backend.store(&peer) {
                result = Err(err);
                return false;
            }
            true
        })?;
        result
    }

    /// Aggregates the stored error classifications over all peers.
    pub fn error_counter(&self) -> Result<BTreeMap<ErrorKind, u64>, StoreError> {
        let mut counter = BTreeMap::new();
        self.backend.range(&mut |_, peer| {
            *counter.entry(peer.last_error).or_insert(0) += 1;
            true
        })?;
        Ok(counter)
    }

    fn mutate(&self, peer_id: &str, f: impl FnOnce(&mut Peer)) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut peer = self
            .backend
            .load(peer_id)?
            .ok_or_else(|| StoreError::NotFound(peer_id.to_string()))?;
        f(&mut peer);
        self.backend.store(&peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn store_or_update_preserves_counters() {
        let store = PeerStore::in_memory();
        let mut peer = Peer::new("p1");
        peer.message_event("topic", t(0));
        peer.attempts = 2;
        store.store(peer).unwrap();

        // A fresh sighting of the same peer with zeroed counters.
        let mut sighting = Peer::new("p1");
        sighting.user_agent = "nimbus/v23".into();
        store.store_or_update(sighting).unwrap();

        let merged = store.load("p1").unwrap();
        assert_eq!(merged.user_agent, "nimbus/v23");
        assert_eq!(merged.attempts, 2);
        assert!(merged.messages["topic"].count >= 1);
    }

    #[test]
    fn load_missing_is_not_found() {
        let store = PeerStore::in_memory();
        assert!(matches!(store.load("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn attempt_event_increments_and_classifies() {
        let store = PeerStore::in_memory();
        store.store(Peer::new("p1")).unwrap();

        let decision =
            store.connection_attempt_event("p1", false, "protocol not supported").unwrap();
        assert_eq!(decision, PruneDecision::Blacklist);

        let peer = store.load("p1").unwrap();
        assert_eq!(peer.attempts, 1);
        assert!(peer.attempted);
        assert_eq!(peer.last_error, ErrorKind::ProtocolNotSupported);
        assert!(peer.deprecated);
    }

    #[test]
    fn successful_attempt_clears_error() {
        let store = PeerStore::in_memory();
        store.store(Peer::new("p1")).unwrap();
        store.connection_attempt_event("p1", false, "connection refused").unwrap();
        store.connection_attempt_event("p1", true, "").unwrap();

        let peer = store.load("p1").unwrap();
        assert_eq!(peer.attempts, 2);
        assert!(peer.succeed);
        assert_eq!(peer.last_error, ErrorKind::None);
    }

    #[test]
    fn error_counter_aggregates_kinds() {
        let store = PeerStore::in_memory();
        for (id, err) in
            [("p1", "i/o timeout"), ("p2", "i/o timeout"), ("p3", "connection refused")]
        {
            store.store(Peer::new(id)).unwrap();
            store.connection_attempt_event(id, false, err).unwrap();
        }

        let counter = store.error_counter().unwrap();
        assert_eq!(counter[&ErrorKind::DialTimeout], 2);
        assert_eq!(counter[&ErrorKind::ConnectionRefused], 1);
    }

    #[test]
    fn reset_spares_identity() {
        let store = PeerStore::in_memory();
        let mut peer = Peer::new("p6");
        peer.user_agent = "prysm/v4.0.0".into();
        store.store(peer).unwrap();
        for _ in 0..10 {
            store.connection_event("p6", Direction::Outbound).unwrap();
            store.disconnection_event("p6").unwrap();
        }
        for _ in 0..100 {
            store.message_event("p6", "beacon_block").unwrap();
        }

        store.reset_dynamic_metrics().unwrap();
        let peer = store.load("p6").unwrap();
        assert_eq!(peer.user_agent, "prysm/v4.0.0");
        assert_eq!(peer.connections, 0);
        assert_eq!(peer.total_messages(), 0);

        store.message_event("p6", "beacon_block").unwrap();
        assert_eq!(store.load("p6").unwrap().total_messages(), 1);
    }

    #[test]
    fn range_enumerates_preexisting_keys() {
        let store = PeerStore::in_memory();
        for id in ["p1", "p2", "p3"] {
            store.store(Peer::new(id)).unwrap();
        }
        let mut seen = Vec::new();
        store
            .range(|id, _| {
                seen.push(id.to_string());
                true
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, ["p1", "p2", "p3"]);
    }
}
