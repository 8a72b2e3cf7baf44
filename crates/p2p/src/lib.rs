//! # armiarma-p2p
//!
//! The crawler runtime for the armiarma network observatory: peer
//! discovery, concurrent connection attempts, gossip observation and the
//! controller that wires them together.
//!
//! ## Architecture
//!
//! - [`DiscoveryFeed`]: the work queue of peer identities, refreshed from
//!   the peer store and consumed by the workers.
//! - [`WorkerPool`]: a fixed set of dial workers recording attempt
//!   outcomes and harvesting identify data and DHT neighbours.
//! - [`GossipDriver`]: one reader per joined topic, counting deliveries
//!   per topic and per peer.
//! - [`Crawler`]: the controller owning startup, the summary ticker and
//!   the reverse-order shutdown sequence.
//!
//! The libp2p stack is consumed through the [`Host`] trait; the bundled
//! [`SwarmHost`] drives a tcp/noise/yamux swarm with gossipsub, identify,
//! ping and kademlia behaviours in a dedicated task.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod config;
pub use config::{ConfigError, CrawlerConfig, DEFAULT_WORKERS, Network};

mod crawler;
pub use crawler::{Crawler, CrawlerBuilder, CrawlerError};

mod feed;
pub use feed::{DEFAULT_MIN_WAIT, DiscoveryFeed, FeedChannels};

mod gossip;
pub use gossip::{GossipDriver, GossipError, MessageMetrics, TopicStats, gossipsub_config, message_id};

mod host;
pub use host::{
    GossipMessage, Host, HostError, HostEvent, HostInfo, PeerInfo, SwarmHost, SwarmHostBuilder,
    TopicSubscription, multiaddr_ip,
};

mod locator;
pub use locator::{
    ApiLocator, CachedLocator, DEFAULT_CACHE_SIZE, Geolocation, IpLocator, NoopLocator,
};

/// Metric gauge identifiers for the crawler runtime.
pub mod metrics;

mod workers;
pub use workers::{DEFAULT_DIAL_TIMEOUT, DEFAULT_NEIGHBOR_TIMEOUT, WorkerPool};
