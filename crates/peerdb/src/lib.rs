//! # armiarma-peerdb
//!
//! Peer metadata storage for the armiarma network observatory.
//!
//! This crate owns the observational data model: the [`Peer`] record with
//! its connection-attempt history, connection episodes and per-topic
//! message counters, the [`PeerStore`] that is the single writer of those
//! records, and the CSV export service that drains the store for offline
//! analysis.
//!
//! ## Key Components
//!
//! ### PeerStore
//! The [`PeerStore`] is a process-wide mapping from peer id to [`Peer`],
//! backed either by an in-memory map or an embedded [`sled`] tree for
//! resumable runs. Every mutation of a peer record goes through one of its
//! event operations, which are serialised per store so that message counts
//! and connection events for the same peer never interleave.
//!
//! ### Error classification
//! Free-form dial errors are normalised into the fixed [`ErrorKind`]
//! taxonomy by a single pure classifier, so the prune policy and the
//! aggregate error counter always agree.
//!
//! ### Prune policy
//! [`PrunePolicy`] turns the latest error kind and the peer's attempt
//! history into a retry decision; permanently failing peers are reported
//! back to the discovery feed for blacklisting.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod peer;
pub use peer::{ConnectionEpisode, Direction, Peer, TopicCount};

mod client;
pub use client::{Client, parse_user_agent};

mod error;
pub use error::{ErrorKind, StoreError};

mod prune;
pub use prune::{PruneDecision, PrunePolicy};

mod backend;
pub use backend::{MemoryStore, PeerStorage, SledStore, default_db_path};

mod store;
pub use store::{BackendKind, PeerStore};

mod export;
pub use export::{CSV_HEADER, ExportError, ExporterService, export_csv, import_csv};
