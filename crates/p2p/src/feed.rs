//! Discovery feed: the work queue of peer identities workers dial next.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use armiarma_peerdb::{Peer, PeerStore, StoreError};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::host::PeerInfo;

/// Minimum wait between refreshes that found the store empty.
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(5);

/// A work queue of peer ids fed from the peer store.
///
/// Workers call [`DiscoveryFeed::request`] and then await
/// [`DiscoveryFeed::next`]; the feeder task answers one id per request.
/// An internal cursor walks a snapshot of the store's non-blacklisted
/// ids; when the cursor runs off the end (or the snapshot is empty) the
/// snapshot is rebuilt from the store, so every stored peer is revisited
/// once per pass. Empty rebuilds back off for at least the configured
/// minimum wait so an idle crawler does not spin.
pub struct DiscoveryFeed {
    store: Arc<PeerStore>,
    blacklist: RwLock<HashSet<String>>,
    request_tx: mpsc::Sender<()>,
    next_rx: Mutex<mpsc::Receiver<String>>,
    min_wait: Duration,
}

impl std::fmt::Debug for DiscoveryFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryFeed").field("blacklisted", &self.blacklisted_count()).finish()
    }
}

impl DiscoveryFeed {
    /// Creates a feed with request/response channels sized to the worker
    /// count, so pending work never queues beyond one item per worker.
    pub fn new(store: Arc<PeerStore>, workers: usize, min_wait: Duration) -> (Arc<Self>, FeedChannels) {
        let (request_tx, request_rx) = mpsc::channel(workers.max(1));
        let (next_tx, next_rx) = mpsc::channel(workers.max(1));
        let feed = Arc::new(Self {
            store,
            blacklist: RwLock::new(HashSet::new()),
            request_tx,
            next_rx: Mutex::new(next_rx),
            min_wait,
        });
        (feed, FeedChannels { request_rx, next_tx })
    }

    /// Spawns the feeder task. The channels are closed exactly once, when
    /// the task exits.
    pub fn start(self: Arc<Self>, channels: FeedChannels, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(channels, cancel))
    }

    /// Stores a bootstrap peer and makes it discoverable on the next
    /// refresh pass.
    pub fn seed(&self, info: &PeerInfo) -> Result<(), StoreError> {
        let peer = Peer::with_addresses(info.peer_id.to_string(), info.addresses.clone());
        self.store.store_or_update(peer)
    }

    /// Asks the feeder for the next peer id. Non-blocking beyond channel
    /// capacity; pairs with a later [`DiscoveryFeed::next`].
    pub async fn request(&self) {
        // An error here means the feeder is gone; next() will observe the
        // closed channel.
        let _ = self.request_tx.send(()).await;
    }

    /// Receives the next peer id, or `None` once the feed has shut down.
    pub async fn next(&self) -> Option<String> {
        self.next_rx.lock().await.recv().await
    }

    /// Permanently skips `peer_id`. Idempotent.
    pub fn blacklist(&self, peer_id: &str) {
        let inserted =
            self.blacklist.write().unwrap_or_else(|e| e.into_inner()).insert(peer_id.to_string());
        if inserted {
            debug!(target: "crawler::feed", peer_id, "peer blacklisted");
        }
    }

    /// Whether `peer_id` has been blacklisted.
    pub fn is_blacklisted(&self, peer_id: &str) -> bool {
        self.blacklist.read().unwrap_or_else(|e| e.into_inner()).contains(peer_id)
    }

    /// Number of blacklisted peers.
    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn run(self: Arc<Self>, channels: FeedChannels, cancel: CancellationToken) {
        let FeedChannels { mut request_rx, next_tx } = channels;
        let mut snapshot: Vec<String> = Vec::new();
        let mut cursor = 0usize;

        'feeder: loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break 'feeder,
                request = request_rx.recv() => request,
            };
            if request.is_none() {
                break;
            }

            // Serve exactly one id per request; blacklisted entries are
            // skipped by retrying internally.
            loop {
                if cursor >= snapshot.len() {
                    snapshot = self.refresh();
                    cursor = 0;
                    if snapshot.is_empty() {
                        trace!(target: "crawler::feed", "store empty, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => break 'feeder,
                            _ = tokio::time::sleep(self.min_wait) => {}
                        }
                        continue;
                    }
                }

                let id = snapshot[cursor].clone();
                cursor += 1;
                if self.is_blacklisted(&id) {
                    continue;
                }
                if next_tx.send(id).await.is_err() {
                    break 'feeder;
                }
                break;
            }
        }
        info!(target: "crawler::feed", "shutting down peer feeder");
        // request_rx and next_tx drop here, closing both channels once.
    }

    /// Rebuilds the id snapshot from every non-blacklisted stored peer.
    fn refresh(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.store.len());
        let result = self.store.range(|id, _| {
            if !self.is_blacklisted(id) {
                ids.push(id.to_string());
            }
            true
        });
        if let Err(err) = result {
            warn!(target: "crawler::feed", %err, "refresh failed");
        }
        debug!(target: "crawler::feed", peers = ids.len(), "refreshed peer list");
        ids
    }
}

/// The feeder task's ends of the request/response channels.
pub struct FeedChannels {
    request_rx: mpsc::Receiver<()>,
    next_tx: mpsc::Sender<String>,
}

impl std::fmt::Debug for FeedChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedChannels").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn feed_with_peers(ids: &[&str], workers: usize) -> (Arc<DiscoveryFeed>, FeedChannels) {
        let store = Arc::new(PeerStore::in_memory());
        for id in ids {
            store.store(Peer::new(*id)).unwrap();
        }
        DiscoveryFeed::new(store, workers, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn serves_each_stored_peer_once_per_pass() {
        let (feed, channels) = feed_with_peers(&["p1", "p2", "p3"], 2);
        let cancel = CancellationToken::new();
        feed.clone().start(channels, cancel.clone());

        let mut served = Vec::new();
        for _ in 0..3 {
            feed.request().await;
            served.push(feed.next().await.unwrap());
        }
        served.sort();
        assert_eq!(served, ["p1", "p2", "p3"]);

        // The next pass revisits the same peers.
        feed.request().await;
        assert!(feed.next().await.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn blacklisted_ids_are_never_emitted() {
        let (feed, channels) = feed_with_peers(&["p1", "p2"], 2);
        let cancel = CancellationToken::new();
        feed.clone().start(channels, cancel.clone());
        feed.blacklist("p1");
        feed.blacklist("p1");
        assert!(feed.is_blacklisted("p1"));
        assert_eq!(feed.blacklisted_count(), 1);

        for _ in 0..4 {
            feed.request().await;
            assert_eq!(feed.next().await.unwrap(), "p2");
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_store_backs_off_between_refreshes() {
        let (feed, channels) = feed_with_peers(&[], 1);
        let cancel = CancellationToken::new();
        feed.clone().start(channels, cancel.clone());

        let started = Instant::now();
        feed.request().await;
        // Let a couple of empty refresh cycles elapse before seeding.
        tokio::time::sleep(Duration::from_millis(120)).await;
        feed.seed(&PeerInfo::new(libp2p::PeerId::random(), vec![])).unwrap();
        let id = feed.next().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!id.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_the_feed() {
        let (feed, channels) = feed_with_peers(&[], 1);
        let cancel = CancellationToken::new();
        let handle = feed.clone().start(channels, cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
        assert!(feed.next().await.is_none());
    }
}
