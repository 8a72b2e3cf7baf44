//! Gossip subscription fabric: joins topics, counts deliveries and
//! attributes them to peers.

use std::sync::{Arc, Mutex};

use armiarma_peerdb::{Peer, PeerStore, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::host::{Host, TopicSubscription};

mod config;
pub use config::{gossipsub_config, message_id};

mod metrics;
pub use metrics::{MessageMetrics, TopicStats};

/// Errors from the gossip driver.
#[derive(Debug, Error)]
pub enum GossipError {
    /// The host refused the subscription.
    #[error(transparent)]
    Host(#[from] crate::host::HostError),
}

/// Drives one reader task per joined topic.
///
/// Every delivery bumps the topic counter in [`MessageMetrics`] and the
/// sending peer's per-topic counter in the [`PeerStore`]. Payloads are
/// hashed for identity and otherwise opaque.
pub struct GossipDriver {
    host: Arc<dyn Host>,
    store: Arc<PeerStore>,
    metrics: Arc<MessageMetrics>,
    cancel: CancellationToken,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for GossipDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipDriver").field("topics", &self.metrics.snapshot().len()).finish()
    }
}

impl GossipDriver {
    /// Creates a driver over `host`, recording into `store`.
    pub fn new(host: Arc<dyn Host>, store: Arc<PeerStore>, cancel: CancellationToken) -> Self {
        Self {
            host,
            store,
            metrics: Arc::new(MessageMetrics::new()),
            cancel,
            readers: Mutex::new(Vec::new()),
        }
    }

    /// The per-topic counters.
    pub fn metrics(&self) -> Arc<MessageMetrics> {
        self.metrics.clone()
    }

    /// Joins `topic`, registers its counter and spawns the reader.
    pub async fn join_and_subscribe(&self, topic: &str) -> Result<(), GossipError> {
        let subscription = self.host.subscribe(topic).await?;
        self.metrics.register_topic(topic);
        info!(target: "crawler::gossip", topic, "joined and subscribed");

        let handle = tokio::spawn(reader_loop(
            subscription,
            self.store.clone(),
            self.metrics.clone(),
            self.cancel.clone(),
        ));
        self.readers.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
        Ok(())
    }

    /// Waits for every reader to wind down. Call after cancelling the
    /// token passed at construction.
    pub async fn close(&self) {
        let readers: Vec<_> =
            std::mem::take(&mut *self.readers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in readers {
            let _ = handle.await;
        }
        debug!(target: "crawler::gossip", "all topic readers closed");
    }
}

/// Blocks on the subscription and records every delivery.
///
/// Transient subscription errors are logged and the loop continues; the
/// reader exits when the subscription closes or the run is cancelled.
async fn reader_loop(
    mut subscription: TopicSubscription,
    store: Arc<PeerStore>,
    metrics: Arc<MessageMetrics>,
    cancel: CancellationToken,
) {
    let topic = subscription.topic().to_string();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "crawler::gossip", topic, "reader cancelled");
                return;
            }
            delivery = subscription.next() => {
                match delivery {
                    None => {
                        debug!(target: "crawler::gossip", topic, "subscription closed");
                        return;
                    }
                    Some(Err(err)) => {
                        warn!(target: "crawler::gossip", topic, %err, "subscription error");
                    }
                    Some(Ok(message)) => {
                        let id = message_id(&message.data);
                        let count = metrics.on_message(&topic);
                        crate::inc!(GOSSIP_MESSAGES);
                        trace!(target: "crawler::gossip", topic, %id, count, "message");

                        let Some(source) = message.source else { continue };
                        let peer_id = source.to_string();
                        if let Err(err) = record_message(&store, &peer_id, &topic) {
                            warn!(target: "crawler::gossip", topic, peer_id, %err, "failed to record message");
                        }
                    }
                }
            }
        }
    }
}

/// Counts a delivery against `peer_id`, sighting the peer first if gossip
/// is how we learned it exists.
fn record_message(store: &PeerStore, peer_id: &str, topic: &str) -> Result<(), StoreError> {
    match store.message_event(peer_id, topic) {
        Err(StoreError::NotFound(_)) => {
            store.store_or_update(Peer::new(peer_id))?;
            store.message_event(peer_id, topic)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_message_sights_unknown_peers() {
        let store = PeerStore::in_memory();
        record_message(&store, "p-gossip", "blocks").unwrap();
        record_message(&store, "p-gossip", "blocks").unwrap();

        let peer = store.load("p-gossip").unwrap();
        assert_eq!(peer.messages["blocks"].count, 2);
        assert_eq!(peer.attempts, 0);
    }
}
