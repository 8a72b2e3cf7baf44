//! Connection-error taxonomy and store errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified kind of a connection-attempt error.
///
/// Upstream dial errors arrive as free-form strings; [`ErrorKind::classify`]
/// is the single place they are normalised, so the prune policy and the
/// aggregate error counter always see the same kind for the same error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No attempt has failed yet.
    #[default]
    None,
    /// The dial did not complete within the attempt timeout.
    DialTimeout,
    /// The remote host actively refused the connection.
    ConnectionRefused,
    /// No route to the host, or the network is unreachable.
    NoRoute,
    /// The remote peer reset the connection.
    ResetByPeer,
    /// An i/o deadline elapsed mid-exchange.
    IoDeadline,
    /// The peer does not speak any protocol we asked for.
    ProtocolNotSupported,
    /// The dialed address answered with a different peer identity.
    PeerIdMismatch,
    /// The peer record carries no addresses to dial.
    NoAddresses,
    /// Anything that did not match a known pattern.
    Unknown,
}

impl ErrorKind {
    /// Normalises a free-form error string into a kind.
    pub fn classify(error: &str) -> Self {
        let lower = error.to_ascii_lowercase();
        if lower.contains("i/o deadline") || lower.contains("io deadline") {
            Self::IoDeadline
        } else if lower.contains("i/o timeout")
            || lower.contains("dial timeout")
            || lower.contains("deadline exceeded")
            || lower.contains("timed out")
        {
            Self::DialTimeout
        } else if lower.contains("connection refused") || lower.contains("connect refused") {
            Self::ConnectionRefused
        } else if lower.contains("no route to host") || lower.contains("network is unreachable") {
            Self::NoRoute
        } else if lower.contains("connection reset") || lower.contains("reset by peer") {
            Self::ResetByPeer
        } else if lower.contains("protocol not supported")
            || lower.contains("protocols not supported")
            || lower.contains("protocol negotiation")
        {
            Self::ProtocolNotSupported
        } else if lower.contains("peer id mismatch") || lower.contains("unexpected peer id") {
            Self::PeerIdMismatch
        } else if lower.contains("no addresses") || lower.contains("no good addresses") {
            Self::NoAddresses
        } else {
            Self::Unknown
        }
    }

    /// Stable string used in logs, the CSV export and the error counter.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DialTimeout => "dial-timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::NoRoute => "no-route",
            Self::ResetByPeer => "reset-by-peer",
            Self::IoDeadline => "i/o-deadline",
            Self::ProtocolNotSupported => "protocol-not-supported",
            Self::PeerIdMismatch => "peer-id-mismatch",
            Self::NoAddresses => "no-addresses",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::None,
            "dial-timeout" => Self::DialTimeout,
            "connection-refused" => Self::ConnectionRefused,
            "no-route" | "network-unreachable" => Self::NoRoute,
            "reset-by-peer" => Self::ResetByPeer,
            "i/o-deadline" => Self::IoDeadline,
            "protocol-not-supported" => Self::ProtocolNotSupported,
            "peer-id-mismatch" => Self::PeerIdMismatch,
            "no-addresses" => Self::NoAddresses,
            _ => Self::Unknown,
        })
    }
}

/// Errors surfaced by the peer store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested peer is not in the store.
    #[error("peer not found in peerstore: {0}")]
    NotFound(String),
    /// The embedded database failed.
    #[error("peerstore backend error: {0}")]
    Backend(#[from] sled::Error),
    /// A stored record could not be decoded.
    #[error("failed to decode stored peer {id}: {source}")]
    Decode {
        /// Key of the undecodable record.
        id: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
    /// A record could not be encoded for storage.
    #[error("failed to encode peer {id}: {source}")]
    Encode {
        /// Key of the unencodable record.
        id: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_table() {
        let cases = [
            ("failed to dial: i/o timeout", ErrorKind::DialTimeout),
            ("context deadline exceeded", ErrorKind::DialTimeout),
            ("dial tcp 1.2.3.4:9000: connection refused", ErrorKind::ConnectionRefused),
            ("dial tcp: no route to host", ErrorKind::NoRoute),
            ("network is unreachable", ErrorKind::NoRoute),
            ("read: connection reset by peer", ErrorKind::ResetByPeer),
            ("stream reset by peer", ErrorKind::ResetByPeer),
            ("i/o deadline reached", ErrorKind::IoDeadline),
            ("protocol not supported", ErrorKind::ProtocolNotSupported),
            ("failed during protocol negotiation", ErrorKind::ProtocolNotSupported),
            ("peer id mismatch: expected 12D3..., got 16Ui...", ErrorKind::PeerIdMismatch),
            ("no good addresses", ErrorKind::NoAddresses),
            ("something exotic happened", ErrorKind::Unknown),
        ];
        for (raw, kind) in cases {
            assert_eq!(ErrorKind::classify(raw), kind, "raw: {raw}");
        }
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let kinds = [
            ErrorKind::None,
            ErrorKind::DialTimeout,
            ErrorKind::ConnectionRefused,
            ErrorKind::NoRoute,
            ErrorKind::ResetByPeer,
            ErrorKind::IoDeadline,
            ErrorKind::ProtocolNotSupported,
            ErrorKind::PeerIdMismatch,
            ErrorKind::NoAddresses,
            ErrorKind::Unknown,
        ];
        for kind in kinds {
            let parsed: ErrorKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
