//! The host seam: everything the crawler needs from the libp2p stack.

use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use thiserror::Error;
use tokio::sync::mpsc;

mod swarm;
pub use swarm::{SwarmHost, SwarmHostBuilder};

/// Identity and addresses of a peer, the currency of discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's identity.
    pub peer_id: PeerId,
    /// Addresses the peer can be dialed at.
    pub addresses: Vec<Multiaddr>,
}

impl PeerInfo {
    /// Creates a peer-info from its parts.
    pub fn new(peer_id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        Self { peer_id, addresses }
    }

    /// Extracts the peer identity from a `/p2p/`-suffixed multiaddress.
    ///
    /// The returned info carries the address with the `/p2p/` component
    /// stripped, ready to dial.
    pub fn from_multiaddr(addr: &Multiaddr) -> Result<Self, HostError> {
        let mut dial_addr = Multiaddr::empty();
        let mut peer_id = None;
        for protocol in addr.iter() {
            match protocol {
                Protocol::P2p(id) => peer_id = Some(id),
                other => dial_addr.push(other),
            }
        }
        let peer_id = peer_id.ok_or_else(|| HostError::MissingPeerId(addr.clone()))?;
        Ok(Self { peer_id, addresses: vec![dial_addr] })
    }

    /// The first IP found among the peer's addresses.
    pub fn ip(&self) -> Option<IpAddr> {
        self.addresses.iter().find_map(multiaddr_ip)
    }
}

/// The IP component of a multiaddress, if it has one.
pub fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Identify and ping data collected for a connected peer.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    /// The agent string the peer advertised.
    pub user_agent: String,
    /// Protocols the peer supports.
    pub protocols: Vec<String>,
    /// Addresses the peer advertised or was observed at.
    pub addresses: Vec<Multiaddr>,
    /// Round-trip latency, once a ping completed.
    pub latency: Option<Duration>,
}

/// A message delivered on a gossip topic.
///
/// Payloads are opaque: the crawler hashes and counts them, never decodes
/// them.
#[derive(Debug, Clone)]
pub struct GossipMessage {
    /// The peer the message arrived from.
    pub source: Option<PeerId>,
    /// Raw payload bytes.
    pub data: Vec<u8>,
}

/// A live subscription to one gossip topic.
#[derive(Debug)]
pub struct TopicSubscription {
    topic: String,
    receiver: mpsc::Receiver<Result<GossipMessage, HostError>>,
}

impl TopicSubscription {
    /// Pairs a subscription with the sender side the host keeps.
    pub fn channel(
        topic: impl Into<String>,
        capacity: usize,
    ) -> (mpsc::Sender<Result<GossipMessage, HostError>>, Self) {
        let (tx, receiver) = mpsc::channel(capacity);
        (tx, Self { topic: topic.into(), receiver })
    }

    /// The subscribed topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The next delivery, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Result<GossipMessage, HostError>> {
        self.receiver.recv().await
    }
}

/// Connection lifecycle notifications emitted by a host implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A connection to `peer_id` was established.
    Connected {
        /// The remote peer.
        peer_id: PeerId,
        /// Whether we dialed or were dialed.
        inbound: bool,
    },
    /// The connection to `peer_id` went away.
    Disconnected {
        /// The remote peer.
        peer_id: PeerId,
    },
}

/// Errors surfaced by a host implementation.
///
/// Display strings double as classifier input, so they carry the upstream
/// error text verbatim where one exists.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The dial failed; the string is the transport-level error.
    #[error("failed to dial: {0}")]
    Dial(String),
    /// The dial did not finish inside the attempt timeout.
    #[error("dial timeout")]
    DialTimeout,
    /// A multiaddress had no `/p2p/` component to take an identity from.
    #[error("no peer id in multiaddr: {0}")]
    MissingPeerId(Multiaddr),
    /// The neighbour query failed.
    #[error("neighbor query failed: {0}")]
    NeighborQuery(String),
    /// Joining or subscribing a topic failed.
    #[error("subscription failed: {0}")]
    Subscription(String),
    /// The host service task is gone.
    #[error("host service stopped")]
    ServiceStopped,
    /// The host could not be brought up.
    #[error("host setup failed: {0}")]
    Setup(String),
}

/// The capabilities the crawler borrows from the underlying libp2p host.
///
/// Implementations are expected to be cheap to clone behind an [`Arc`] and
/// callable from many workers at once. The bundled implementation is
/// [`SwarmHost`]; tests drive the crawler with channel-backed fakes.
///
/// [`Arc`]: std::sync::Arc
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Dials the peer and waits for the connection to be established.
    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError>;

    /// Identify and ping data collected for `peer_id`, if any.
    async fn host_info(&self, peer_id: &PeerId) -> Option<HostInfo>;

    /// Asks a connected peer for the peers closest to it.
    async fn fetch_neighbors(&self, peer: &PeerInfo) -> Result<Vec<PeerInfo>, HostError>;

    /// Joins `topic` and returns the stream of deliveries.
    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_info_from_multiaddr_splits_identity() {
        let addr: Multiaddr =
            "/ip4/3.224.142.21/tcp/1347/p2p/12D3KooWCVe8MmsEMes2FzgTpt9fXtmCY7wrq91GRiaC8PHSCCBj"
                .parse()
                .unwrap();
        let info = PeerInfo::from_multiaddr(&addr).unwrap();
        assert_eq!(
            info.peer_id.to_string(),
            "12D3KooWCVe8MmsEMes2FzgTpt9fXtmCY7wrq91GRiaC8PHSCCBj"
        );
        assert_eq!(info.addresses, vec!["/ip4/3.224.142.21/tcp/1347".parse().unwrap()]);
        assert_eq!(info.ip(), Some("3.224.142.21".parse().unwrap()));
    }

    #[test]
    fn multiaddr_without_identity_is_rejected() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/9000".parse().unwrap();
        assert!(matches!(PeerInfo::from_multiaddr(&addr), Err(HostError::MissingPeerId(_))));
    }
}
