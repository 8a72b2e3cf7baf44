//! The crawler controller: wires the subsystems and owns the lifecycle.

use std::{sync::Arc, time::Duration};

use armiarma_peerdb::{
    BackendKind, Direction, ExportError, ExporterService, Peer, PeerStore, StoreError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, CrawlerConfig},
    feed::{DEFAULT_MIN_WAIT, DiscoveryFeed, FeedChannels},
    gossip::GossipDriver,
    host::{Host, HostError, HostEvent, PeerInfo, SwarmHost},
    locator::{ApiLocator, CachedLocator, IpLocator, NoopLocator},
    workers::{DEFAULT_DIAL_TIMEOUT, DEFAULT_NEIGHBOR_TIMEOUT, WorkerPool},
};

/// Interval between crawl summary log lines.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between periodic CSV exports.
const EXPORT_INTERVAL: Duration = Duration::from_secs(600);

/// Grace period granted past the dial timeout at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// An error type for the [`Crawler`].
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The peer store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The exporter could not write its first export.
    #[error(transparent)]
    Export(#[from] ExportError),
    /// The libp2p host could not be brought up.
    #[error(transparent)]
    Host(#[from] HostError),
    /// The output directory could not be created.
    #[error("failed to prepare output directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A builder for the [`Crawler`].
pub struct CrawlerBuilder {
    config: CrawlerConfig,
    host: Option<Arc<dyn Host>>,
    host_events: Option<mpsc::Receiver<HostEvent>>,
    locator: Option<Arc<dyn IpLocator>>,
    dial_timeout: Duration,
    neighbor_timeout: Duration,
    min_wait: Duration,
    metrics_reset_interval: Option<Duration>,
}

impl std::fmt::Debug for CrawlerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlerBuilder").field("config", &self.config).finish()
    }
}

impl CrawlerBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            host: None,
            host_events: None,
            locator: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            neighbor_timeout: DEFAULT_NEIGHBOR_TIMEOUT,
            min_wait: DEFAULT_MIN_WAIT,
            metrics_reset_interval: None,
        }
    }

    /// Supplies a host instead of the bundled libp2p swarm.
    pub fn with_host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Supplies the connection-event stream matching a custom host.
    pub fn with_host_events(mut self, events: mpsc::Receiver<HostEvent>) -> Self {
        self.host_events = Some(events);
        self
    }

    /// Supplies a locator instead of the cached ip-api client.
    pub fn with_locator(mut self, locator: Arc<dyn IpLocator>) -> Self {
        self.locator = Some(locator);
        self
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

    /// Overrides the empty-feed backoff.
    pub fn with_min_wait(mut self, min_wait: Duration) -> Self {
        self.min_wait = min_wait;
        self
    }

    /// Periodically zeroes the store's dynamic metrics, bounding memory
    /// growth on multi-day runs.
    pub fn with_metrics_reset_interval(mut self, interval: Duration) -> Self {
        self.metrics_reset_interval = Some(interval);
        self
    }

    /// Validates the configuration and assembles the crawler.
    pub fn build(self) -> Result<Crawler, CrawlerError> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.output_path)?;

        let store = Arc::new(PeerStore::open(
            BackendKind::parse(&self.config.peerstore_backend),
            &self.config.output_path,
        )?);
        let cancel = CancellationToken::new();

        let (host, host_events) = match (self.host, self.host_events) {
            (Some(host), events) => (host, events),
            (None, _) => {
                let (host, events) = SwarmHost::builder()
                    .with_kad_protocol(self.config.network.kad_protocol())
                    .start(cancel.clone())?;
                (Arc::new(host) as Arc<dyn Host>, Some(events))
            }
        };

        let locator = match self.locator {
            Some(locator) => locator,
            None => match ApiLocator::new() {
                Ok(api) => Arc::new(CachedLocator::new(api)) as Arc<dyn IpLocator>,
                Err(err) => {
                    warn!(target: "crawler", %err, "ip locator unavailable, proceeding without geolocation");
                    Arc::new(NoopLocator)
                }
            },
        };

        let (feed, feed_channels) =
            DiscoveryFeed::new(store.clone(), self.config.workers, self.min_wait);

        Ok(Crawler {
            config: self.config,
            store,
            feed,
            feed_channels: Some(feed_channels),
            host,
            host_events,
            locator,
            cancel,
            dial_timeout: self.dial_timeout,
            neighbor_timeout: self.neighbor_timeout,
            metrics_reset_interval: self.metrics_reset_interval,
        })
    }
}

/// The assembled crawler.
pub struct Crawler {
    config: CrawlerConfig,
    store: Arc<PeerStore>,
    feed: Arc<DiscoveryFeed>,
    feed_channels: Option<FeedChannels>,
    host: Arc<dyn Host>,
    host_events: Option<mpsc::Receiver<HostEvent>>,
    locator: Arc<dyn IpLocator>,
    cancel: CancellationToken,
    dial_timeout: Duration,
    neighbor_timeout: Duration,
    metrics_reset_interval: Option<Duration>,
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler").field("config", &self.config).finish()
    }
}

impl Crawler {
    /// Returns a new [`CrawlerBuilder`].
    pub fn builder(config: CrawlerConfig) -> CrawlerBuilder {
        CrawlerBuilder::new(config)
    }

    /// The root cancellation token; cancel it to stop the crawl.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The peer store backing this crawl.
    pub fn store(&self) -> Arc<PeerStore> {
        self.store.clone()
    }

    /// Runs the crawl until the root token is cancelled, then shuts the
    /// subsystems down in reverse start order and flushes the store.
    pub async fn run(mut self) -> Result<(), CrawlerError> {
        info!(target: "crawler", network = %self.config.network, workers = self.config.workers, "starting crawl");

        // Exporter first: an unwritable output directory fails the run
        // before any network activity.
        let exporter =
            ExporterService::new(self.store.clone(), &self.config.output_path, EXPORT_INTERVAL)
                .start(self.cancel.clone())?;

        // Connection lifecycle events feed the store independently of the
        // dial workers.
        let event_pump = self.host_events.take().map(|events| {
            tokio::spawn(pump_host_events(events, self.store.clone(), self.cancel.clone()))
        });

        // Seed the feed with the bootstrap set.
        for addr in &self.config.bootstrap_nodes {
            match PeerInfo::from_multiaddr(addr) {
                Ok(info) => {
                    if let Err(err) = self.feed.seed(&info) {
                        warn!(target: "crawler", %addr, %err, "failed to seed bootstrap peer");
                    }
                }
                Err(err) => warn!(target: "crawler", %addr, %err, "skipping bootstrap address"),
            }
        }

        let feed_handle = self
            .feed
            .clone()
            .start(self.feed_channels.take().expect("built with channels"), self.cancel.clone());

        let worker_handles = WorkerPool::new(
            self.store.clone(),
            self.feed.clone(),
            self.host.clone(),
            self.locator.clone(),
        )
        .with_dial_timeout(self.dial_timeout)
        .with_neighbor_timeout(self.neighbor_timeout)
        .spawn(self.config.workers, self.cancel.clone());

        let gossip = GossipDriver::new(self.host.clone(), self.store.clone(), self.cancel.clone());
        for topic in &self.config.topics {
            if let Err(err) = gossip.join_and_subscribe(topic).await {
                warn!(target: "crawler", topic, %err, "failed to join topic");
            }
        }

        let summary = tokio::spawn(summary_loop(
            self.store.clone(),
            self.feed.clone(),
            gossip.metrics(),
            self.cancel.clone(),
        ));

        if let Some(interval) = self.metrics_reset_interval {
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = store.reset_dynamic_metrics() {
                                warn!(target: "crawler", %err, "metrics reset failed");
                            }
                        }
                    }
                }
            });
        }

        // Crawl until cancelled.
        self.cancel.cancelled().await;
        info!(target: "crawler", "shutdown requested");

        // Reverse order: summary, gossip readers, workers, feed, event
        // pump; the exporter flushes last so the final CSV sees every
        // write.
        let _ = summary.await;
        gossip.close().await;
        let join_workers = futures::future::join_all(worker_handles);
        if tokio::time::timeout(self.dial_timeout + SHUTDOWN_GRACE, join_workers).await.is_err() {
            warn!(target: "crawler", "workers did not stop within the grace period");
        }
        let _ = feed_handle.await;
        if let Some(pump) = event_pump {
            let _ = pump.await;
        }
        let _ = exporter.await;

        info!(
            target: "crawler",
            discovered = self.store.len(),
            blacklisted = self.feed.blacklisted_count(),
            "crawl finished"
        );
        Ok(())
    }
}

/// Applies host connection notifications to the store.
async fn pump_host_events(
    mut events: mpsc::Receiver<HostEvent>,
    store: Arc<PeerStore>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let result = match event {
            HostEvent::Connected { peer_id, inbound } => {
                let direction = if inbound { Direction::Inbound } else { Direction::Outbound };
                let id = peer_id.to_string();
                match store.connection_event(&id, direction) {
                    // Inbound dialers may be peers we have never sighted.
                    Err(StoreError::NotFound(_)) => store
                        .store_or_update(Peer::new(id.as_str()))
                        .and_then(|_| store.connection_event(&id, direction)),
                    other => other,
                }
            }
            HostEvent::Disconnected { peer_id } => {
                store.disconnection_event(&peer_id.to_string())
            }
        };
        if let Err(err) = result {
            debug!(target: "crawler", %err, "failed to record connection event");
        }
    }
}

/// Logs a crawl summary every few seconds.
async fn summary_loop(
    store: Arc<PeerStore>,
    feed: Arc<DiscoveryFeed>,
    metrics: Arc<crate::gossip::MessageMetrics>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let discovered = store.len();
                let blacklisted = feed.blacklisted_count();
                crate::set!(DISCOVERED_PEERS, discovered as f64);
                crate::set!(BLACKLISTED_PEERS, blacklisted as f64);
                info!(
                    target: "crawler",
                    discovered,
                    blacklisted,
                    messages = metrics.total(),
                    "crawl summary"
                );
            }
        }
    }
}
