//! Metrics for the crawler runtime.

/// Identifier for the gauge that tracks discovered peers.
pub const DISCOVERED_PEERS: &str = "armiarma_discovered_peers";

/// Identifier for the gauge that tracks blacklisted peers.
pub const BLACKLISTED_PEERS: &str = "armiarma_blacklisted_peers";

/// Identifier for the gauge that tracks gossip deliveries.
pub const GOSSIP_MESSAGES: &str = "armiarma_gossip_messages";

/// Identifier for the gauge that tracks dial attempts.
pub const DIAL_ATTEMPTS: &str = "armiarma_dial_attempts";

/// Sets a metric value, optionally with a specified label.
#[macro_export]
macro_rules! set {
    ($metric:ident, $label:expr, $value:expr) => {
        #[cfg(feature = "metrics")]
        metrics::gauge!($crate::metrics::$metric, "type" => $label).set($value);
    };
    ($metric:ident, $value:expr) => {
        #[cfg(feature = "metrics")]
        metrics::gauge!($crate::metrics::$metric).set($value);
    };
}

/// Increments a metric value, optionally with a specified label.
#[macro_export]
macro_rules! inc {
    ($metric:ident, $label:expr) => {
        #[cfg(feature = "metrics")]
        metrics::gauge!($crate::metrics::$metric, "type" => $label).increment(1);
    };
    ($metric:ident) => {
        #[cfg(feature = "metrics")]
        metrics::gauge!($crate::metrics::$metric).increment(1);
    };
}
