//! The [`Peer`] record and its event-level bookkeeping.

use std::{collections::BTreeMap, net::IpAddr, time::Duration};

use chrono::{DateTime, Utc};
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::{Client, ErrorKind};

/// Number of attempt timestamps retained in the positive/negative logs.
///
/// The prune policy only looks at the recent history, so the logs are
/// bounded to keep long-running records small.
pub const ATTEMPT_LOG_CAP: usize = 10;

/// Direction of a connection episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The remote peer dialed us.
    Inbound,
    /// We dialed the remote peer.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// A single connection episode: one established connection and, once the
/// peer goes away, the time it was torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEpisode {
    /// Who initiated the connection.
    pub direction: Direction,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
    /// When the connection was closed. `None` while the episode is open.
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl ConnectionEpisode {
    /// Duration of the episode, if it has been closed.
    pub fn duration(&self) -> Option<Duration> {
        let end = self.disconnected_at?;
        (end - self.connected_at).to_std().ok()
    }
}

/// Per-topic message bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCount {
    /// Messages attributed to the peer on this topic.
    pub count: u64,
    /// Last time a message arrived on this topic.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Everything the crawler has observed about a single peer.
///
/// Identity attributes (agent, keys, addresses, location) change rarely and
/// are overwritten by fresher observations. Dynamic metrics (attempts,
/// episodes, message counters) only grow, and survive observational
/// updates via [`Peer::fetch_from`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable peer identity, the store key.
    pub peer_id: String,
    /// Chain-specific node identity, when the network defines one.
    pub node_id: Option<String>,
    /// The peer's public key, as advertised.
    pub pubkey: Option<String>,
    /// Raw identify user-agent.
    pub user_agent: String,
    /// Client family parsed from the user-agent.
    pub client: Client,
    /// Client version parsed from the user-agent.
    pub version: String,

    /// Known multiaddresses for the peer.
    #[serde(with = "serde_multiaddr")]
    pub addresses: Vec<Multiaddr>,
    /// IP the peer was last observed at.
    pub ip: Option<IpAddr>,
    /// Country resolved for [`Peer::ip`].
    pub country: String,
    /// City resolved for [`Peer::ip`].
    pub city: String,
    /// Protocols advertised through identify.
    pub protocols: Vec<String>,
    /// Last measured round-trip latency.
    pub latency: Option<Duration>,

    /// Total connection attempts made against this peer.
    pub attempts: u64,
    /// Whether any attempt was ever made.
    pub attempted: bool,
    /// Whether any attempt ever succeeded.
    pub succeed: bool,
    /// Classified kind of the most recent attempt error.
    pub last_error: ErrorKind,
    /// Whether a connection was ever established.
    pub connection_established: bool,
    /// Whether the peer is connected right now.
    pub is_connected: bool,
    /// Marked by the prune policy once the peer is considered hopeless.
    pub deprecated: bool,

    /// Connection episodes, oldest first. At most one is open.
    pub episodes: Vec<ConnectionEpisode>,
    /// Count of connection events, including ones cleared by a metrics reset.
    pub connections: u64,
    /// Count of disconnection events.
    pub disconnections: u64,
    /// Accumulated time spent connected over all closed episodes.
    pub connected_time: Duration,

    /// Whether a metadata exchange was requested.
    pub metadata_requested: bool,
    /// Whether a metadata exchange succeeded.
    pub metadata_succeeded: bool,

    /// Per-topic message counters.
    pub messages: BTreeMap<String, TopicCount>,

    /// Recent failed attempt timestamps, bounded to [`ATTEMPT_LOG_CAP`].
    pub negative_attempts: Vec<DateTime<Utc>>,
    /// Recent successful attempt timestamps, bounded to [`ATTEMPT_LOG_CAP`].
    pub positive_attempts: Vec<DateTime<Utc>>,
}

impl Peer {
    /// Creates an empty record for a freshly sighted peer.
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self { peer_id: peer_id.into(), ..Default::default() }
    }

    /// Creates a record for a peer known only by its addresses.
    pub fn with_addresses(peer_id: impl Into<String>, addresses: Vec<Multiaddr>) -> Self {
        Self { peer_id: peer_id.into(), addresses, ..Default::default() }
    }

    /// Merges fresher observational data from `other` into `self`.
    ///
    /// Identity attributes are overwritten when `other` carries a value;
    /// attempt history, episodes and message counters are left untouched.
    pub fn fetch_from(&mut self, other: &Peer) {
        if !other.user_agent.is_empty() {
            self.user_agent = other.user_agent.clone();
            self.client = other.client;
            self.version = other.version.clone();
        }
        if other.node_id.is_some() {
            self.node_id = other.node_id.clone();
        }
        if other.pubkey.is_some() {
            self.pubkey = other.pubkey.clone();
        }
        for addr in &other.addresses {
            if !self.addresses.contains(addr) {
                self.addresses.push(addr.clone());
            }
        }
        if other.ip.is_some() {
            self.ip = other.ip;
        }
        if !other.country.is_empty() {
            self.country = other.country.clone();
        }
        if !other.city.is_empty() {
            self.city = other.city.clone();
        }
        if !other.protocols.is_empty() {
            self.protocols = other.protocols.clone();
        }
        if other.latency.is_some() {
            self.latency = other.latency;
        }
    }

    /// Records an established connection, opening a new episode.
    pub fn connection_event(&mut self, direction: Direction, at: DateTime<Utc>) {
        // A lost disconnection notification would leave the previous
        // episode dangling; close it at the new connection time so
        // episodes never overlap.
        if let Some(open) = self.episodes.last_mut() {
            if open.disconnected_at.is_none() {
                open.disconnected_at = Some(at);
                self.disconnections += 1;
            }
        }
        self.episodes.push(ConnectionEpisode { direction, connected_at: at, disconnected_at: None });
        self.connections += 1;
        self.connection_established = true;
        self.is_connected = true;
    }

    /// Records a disconnection, closing the open episode.
    pub fn disconnection_event(&mut self, at: DateTime<Utc>) {
        if let Some(open) = self.episodes.last_mut() {
            if open.disconnected_at.is_none() {
                open.disconnected_at = Some(at);
                self.disconnections += 1;
                if let Ok(d) = (at - open.connected_at).to_std() {
                    self.connected_time += d;
                }
            }
        }
        self.is_connected = false;
    }

    /// Records the outcome of a connection attempt.
    ///
    /// On failure the caller passes the classified error kind; on success
    /// the stored error is cleared and the negative log is reset.
    pub fn connection_attempt(&mut self, succeed: bool, error: ErrorKind, at: DateTime<Utc>) {
        self.attempts += 1;
        self.attempted = true;
        if succeed {
            self.succeed = true;
            self.last_error = ErrorKind::None;
            self.negative_attempts.clear();
            push_bounded(&mut self.positive_attempts, at);
        } else {
            self.last_error = error;
            push_bounded(&mut self.negative_attempts, at);
        }
    }

    /// Records a message received from this peer on `topic`.
    pub fn message_event(&mut self, topic: &str, at: DateTime<Utc>) {
        let entry = self.messages.entry(topic.to_string()).or_default();
        entry.count += 1;
        entry.last_seen = Some(at);
    }

    /// Sum of the closed-episode durations.
    pub fn total_connected_time(&self) -> Duration {
        self.connected_time
    }

    /// Messages counted on topics whose name contains `fragment`.
    pub fn messages_matching(&self, fragment: &str) -> u64 {
        self.messages
            .iter()
            .filter(|(topic, _)| topic.contains(fragment))
            .map(|(_, tc)| tc.count)
            .sum()
    }

    /// Total messages counted across every topic.
    pub fn total_messages(&self) -> u64 {
        self.messages.values().map(|tc| tc.count).sum()
    }

    /// Zeroes the dynamic metrics while preserving identity attributes.
    ///
    /// Episodes, connection/disconnection counters and message counters
    /// are cleared. A peer that is connected while the reset runs gets a
    /// fresh open episode starting now, so its next reported connected
    /// time only covers the tail of the real connection. That skew is
    /// accepted; the alternative would be keeping the old episode alive
    /// and defeating the memory bound the reset exists for.
    pub fn reset_dynamic_metrics(&mut self, at: DateTime<Utc>) {
        let was_connected = self.is_connected;
        let direction = self
            .episodes
            .iter()
            .rev()
            .find(|e| e.disconnected_at.is_none())
            .map(|e| e.direction)
            .unwrap_or(Direction::Outbound);
        self.episodes.clear();
        self.connections = 0;
        self.disconnections = 0;
        self.connected_time = Duration::ZERO;
        self.messages.clear();
        self.negative_attempts.clear();
        self.positive_attempts.clear();
        if was_connected {
            self.episodes.push(ConnectionEpisode {
                direction,
                connected_at: at,
                disconnected_at: None,
            });
        }
    }
}

fn push_bounded(log: &mut Vec<DateTime<Utc>>, at: DateTime<Utc>) {
    if log.len() == ATTEMPT_LOG_CAP {
        log.remove(0);
    }
    log.push(at);
}

/// Multiaddresses persist as their canonical string form.
mod serde_multiaddr {
    use multiaddr::Multiaddr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(
        addrs: &[Multiaddr],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let strings: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        strings.serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Multiaddr>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings.into_iter().map(|s| s.parse().map_err(D::Error::custom)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn episodes_pair_up() {
        let mut peer = Peer::new("p1");
        peer.connection_event(Direction::Outbound, t(0));
        peer.disconnection_event(t(10));
        peer.connection_event(Direction::Inbound, t(20));
        peer.disconnection_event(t(25));

        assert_eq!(peer.episodes.len(), 2);
        assert_eq!(peer.connections, 2);
        assert_eq!(peer.disconnections, 2);
        assert_eq!(peer.total_connected_time(), Duration::from_secs(15));
        assert!(!peer.is_connected);
    }

    #[test]
    fn dangling_episode_is_closed_by_next_connection() {
        let mut peer = Peer::new("p1");
        peer.connection_event(Direction::Outbound, t(0));
        peer.connection_event(Direction::Outbound, t(30));

        assert_eq!(peer.episodes.len(), 2);
        assert_eq!(peer.episodes[0].disconnected_at, Some(t(30)));
        assert!(peer.episodes[1].disconnected_at.is_none());
        assert!(peer.is_connected);
    }

    #[test]
    fn attempt_bookkeeping_holds_invariants() {
        let mut peer = Peer::new("p1");
        peer.connection_attempt(false, ErrorKind::DialTimeout, t(0));
        assert_eq!(peer.attempts, 1);
        assert!(peer.attempted);
        assert!(!peer.succeed);
        assert_eq!(peer.last_error, ErrorKind::DialTimeout);

        peer.connection_attempt(true, ErrorKind::None, t(5));
        assert_eq!(peer.attempts, 2);
        assert!(peer.succeed);
        assert_eq!(peer.last_error, ErrorKind::None);
        assert!(peer.negative_attempts.is_empty());
        assert!(peer.attempts >= (peer.negative_attempts.len() + peer.positive_attempts.len()) as u64);
    }

    #[test]
    fn attempt_logs_are_bounded() {
        let mut peer = Peer::new("p1");
        for i in 0..(ATTEMPT_LOG_CAP as i64 + 5) {
            peer.connection_attempt(false, ErrorKind::ConnectionRefused, t(i));
        }
        assert_eq!(peer.negative_attempts.len(), ATTEMPT_LOG_CAP);
        assert_eq!(peer.attempts, ATTEMPT_LOG_CAP as u64 + 5);
    }

    #[test]
    fn fetch_from_overwrites_identity_and_keeps_counters() {
        let mut stored = Peer::new("p1");
        stored.message_event("topic", t(0));
        stored.connection_event(Direction::Outbound, t(0));
        stored.attempts = 3;

        let mut fresh = Peer::new("p1");
        fresh.user_agent = "teku/v23.1.0".into();
        fresh.client = Client::Teku;
        fresh.version = "v23.1.0".into();
        fresh.addresses = vec!["/ip4/10.0.0.1/tcp/9000".parse().unwrap()];
        fresh.latency = Some(Duration::from_millis(80));

        stored.fetch_from(&fresh);
        assert_eq!(stored.client, Client::Teku);
        assert_eq!(stored.addresses.len(), 1);
        assert_eq!(stored.latency, Some(Duration::from_millis(80)));
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.messages["topic"].count, 1);
        assert_eq!(stored.connections, 1);
    }

    #[test]
    fn reset_clears_counters_and_keeps_identity() {
        let mut peer = Peer::new("p1");
        peer.user_agent = "lighthouse/v4.0.1".into();
        for i in 0..10 {
            peer.connection_event(Direction::Outbound, t(i * 10));
            peer.disconnection_event(t(i * 10 + 5));
        }
        for i in 0..100 {
            peer.message_event("beacon_block", t(i));
        }

        peer.reset_dynamic_metrics(t(1000));
        assert_eq!(peer.user_agent, "lighthouse/v4.0.1");
        assert_eq!(peer.connections, 0);
        assert_eq!(peer.disconnections, 0);
        assert_eq!(peer.total_messages(), 0);
        assert!(peer.episodes.is_empty());

        peer.message_event("beacon_block", t(1001));
        assert_eq!(peer.total_messages(), 1);
    }

    #[test]
    fn reset_reopens_episode_for_connected_peer() {
        let mut peer = Peer::new("p1");
        peer.connection_event(Direction::Inbound, t(0));
        peer.reset_dynamic_metrics(t(500));

        assert!(peer.is_connected);
        assert_eq!(peer.episodes.len(), 1);
        assert_eq!(peer.episodes[0].connected_at, t(500));
        assert_eq!(peer.episodes[0].direction, Direction::Inbound);

        peer.disconnection_event(t(510));
        assert_eq!(peer.total_connected_time(), Duration::from_secs(10));
    }

    #[test]
    fn topic_fragment_matching() {
        let mut peer = Peer::new("p1");
        peer.message_event("/eth2/abcd1234/beacon_block/ssz_snappy", t(0));
        peer.message_event("/eth2/abcd1234/beacon_block/ssz_snappy", t(1));
        peer.message_event("/eth2/abcd1234/voluntary_exit/ssz_snappy", t(2));

        assert_eq!(peer.messages_matching("beacon_block"), 2);
        assert_eq!(peer.messages_matching("voluntary_exit"), 1);
        assert_eq!(peer.messages_matching("proposer_slashing"), 0);
        assert_eq!(peer.total_messages(), 3);
    }
}
