//! The connection worker pool: dials peers from the feed and harvests
//! what they expose.

use std::{str::FromStr, sync::Arc, time::Duration};

use armiarma_peerdb::{Peer, PeerStore, PruneDecision, parse_user_agent};
use libp2p::PeerId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    feed::DiscoveryFeed,
    host::{Host, PeerInfo},
    locator::IpLocator,
};

/// Default per-attempt dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the neighbour query after a successful dial.
pub const DEFAULT_NEIGHBOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before re-requesting when a peer has nothing to dial.
const NO_ADDRESS_BACKOFF: Duration = Duration::from_secs(1);

/// A fixed set of symmetric dial workers.
///
/// Each worker loops: request an id from the feed, dial it with a bounded
/// timeout, record the outcome in the store, enrich successful peers with
/// identify and geolocation data, harvest their neighbours, and request
/// again. Peer-level failures never kill a worker; only cancellation does.
pub struct WorkerPool {
    store: Arc<PeerStore>,
    feed: Arc<DiscoveryFeed>,
    host: Arc<dyn Host>,
    locator: Arc<dyn IpLocator>,
    dial_timeout: Duration,
    neighbor_timeout: Duration,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("dial_timeout", &self.dial_timeout).finish()
    }
}

impl WorkerPool {
    /// Creates a pool over the given collaborators.
    pub fn new(
        store: Arc<PeerStore>,
        feed: Arc<DiscoveryFeed>,
        host: Arc<dyn Host>,
        locator: Arc<dyn IpLocator>,
    ) -> Self {
        Self {
            store,
            feed,
            host,
            locator,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            neighbor_timeout: DEFAULT_NEIGHBOR_TIMEOUT,
        }
    }

    /// Overrides the per-attempt dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Overrides the neighbour-query timeout.
    pub fn with_neighbor_timeout(mut self, timeout: Duration) -> Self {
        self.neighbor_timeout = timeout;
        self
    }

    /// Spawns `count` workers watching `cancel`.
    pub fn spawn(self, count: usize, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        (0..count)
            .map(|id| {
                let pool = pool.clone();
                let cancel = cancel.clone();
                tokio::spawn(pool.worker_loop(id, cancel))
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        self.feed.request().await;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.feed.next() => next,
            };
            let Some(peer_id) = next else { break };
            self.process(&peer_id).await;
            // Unconditionally ask for more work.
            self.feed.request().await;
        }
        debug!(target: "crawler::workers", worker_id, "worker exiting");
    }

    /// One dial cycle against `peer_id`.
    async fn process(&self, peer_id: &str) {
        let peer = match self.store.load(peer_id) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(target: "crawler::workers", peer_id, %err, "dropping work item");
                return;
            }
        };
        if peer.addresses.is_empty() {
            trace!(target: "crawler::workers", peer_id, "no addresses yet");
            tokio::time::sleep(NO_ADDRESS_BACKOFF).await;
            return;
        }
        let parsed = match PeerId::from_str(peer_id) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(target: "crawler::workers", peer_id, %err, "undecodable peer id");
                return;
            }
        };
        let info = PeerInfo::new(parsed, peer.addresses.clone());

        crate::inc!(DIAL_ATTEMPTS);
        match tokio::time::timeout(self.dial_timeout, self.host.connect(&info)).await {
            Err(_) => self.record_failure(peer_id, "dial timeout").await,
            Ok(Err(err)) => self.record_failure(peer_id, &err.to_string()).await,
            Ok(Ok(())) => self.record_success(&info).await,
        }
    }

    async fn record_failure(&self, peer_id: &str, error: &str) {
        debug!(target: "crawler::workers", peer_id, error, "dial failed");
        match self.store.connection_attempt_event(peer_id, false, error) {
            Ok(PruneDecision::Blacklist) => self.feed.blacklist(peer_id),
            Ok(PruneDecision::Retry) => {}
            Err(err) => {
                warn!(target: "crawler::workers", peer_id, %err, "failed to record attempt")
            }
        }
    }

    async fn record_success(&self, info: &PeerInfo) {
        let peer_id = info.peer_id.to_string();
        debug!(target: "crawler::workers", peer_id, "connection established");
        if let Err(err) = self.store.connection_attempt_event(&peer_id, true, "") {
            warn!(target: "crawler::workers", peer_id, %err, "failed to record attempt");
        }

        // Harvest identify, latency and geolocation data.
        let host_info = self.host.host_info(&info.peer_id).await;
        if let Err(err) = self.store.metadata_event(&peer_id, host_info.is_some()) {
            warn!(target: "crawler::workers", peer_id, %err, "failed to record metadata event");
        }

        let mut sighting = Peer::with_addresses(peer_id.as_str(), info.addresses.clone());
        if let Some(host_info) = host_info {
            let (client, version) = parse_user_agent(&host_info.user_agent);
            sighting.user_agent = host_info.user_agent;
            sighting.client = client;
            sighting.version = version;
            sighting.protocols = host_info.protocols;
            sighting.latency = host_info.latency;
            for addr in host_info.addresses {
                if !sighting.addresses.contains(&addr) {
                    sighting.addresses.push(addr);
                }
            }
        }
        if let Some(ip) = info.ip() {
            sighting.ip = Some(ip);
            if let Some(location) = self.locator.locate(ip).await {
                sighting.country = location.country;
                sighting.city = location.city;
            }
        }
        if let Err(err) = self.store.store_or_update(sighting) {
            warn!(target: "crawler::workers", peer_id, %err, "failed to store peer");
        }

        // Ask the peer who it knows; every neighbour becomes discoverable
        // on the next feed refresh.
        let neighbors =
            match tokio::time::timeout(self.neighbor_timeout, self.host.fetch_neighbors(info))
                .await
            {
                Err(_) => {
                    debug!(target: "crawler::workers", peer_id, "neighbor query timed out");
                    return;
                }
                Ok(Err(err)) => {
                    debug!(target: "crawler::workers", peer_id, %err, "neighbor query failed");
                    return;
                }
                Ok(Ok(neighbors)) => neighbors,
            };
        debug!(target: "crawler::workers", peer_id, count = neighbors.len(), "harvested neighbors");
        for neighbor in neighbors {
            let record =
                Peer::with_addresses(neighbor.peer_id.to_string(), neighbor.addresses.clone());
            if let Err(err) = self.store.store_or_update(record) {
                warn!(target: "crawler::workers", peer_id = %neighbor.peer_id, %err, "failed to store neighbor");
            }
        }
    }
}
