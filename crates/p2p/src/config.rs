//! Crawler configuration: the JSON document and per-network defaults.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of concurrent dial workers.
pub const DEFAULT_WORKERS: usize = 100;

/// Mainnet fork digest baked into the default eth2 topic names.
const ETH2_FORK_DIGEST: &str = "b5303f2a";

/// Topic families observed on the eth2 consensus layer.
const ETH2_TOPIC_KINDS: [&str; 5] = [
    "beacon_block",
    "beacon_aggregate_and_proof",
    "voluntary_exit",
    "proposer_slashing",
    "attester_slashing",
];

/// Mainnet bootstrap multiaddresses for the Filecoin network.
const FILECOIN_BOOTSTRAP: [&str; 15] = [
    "/ip4/3.224.142.21/tcp/1347/p2p/12D3KooWCVe8MmsEMes2FzgTpt9fXtmCY7wrq91GRiaC8PHSCCBj",
    "/ip4/107.23.112.60/tcp/1347/p2p/12D3KooWCwevHg1yLCvktf2nvLu7L9894mcrJR4MsBCcm4syShVc",
    "/ip4/100.25.69.197/tcp/1347/p2p/12D3KooWEWVwHGn2yR36gKLozmb4YjDJGerotAPGxmdWZx2nxMC4",
    "/ip4/3.123.163.135/tcp/1347/p2p/12D3KooWKhgq8c7NQ9iGjbyK7v7phXvG6492HQfiDaGHLHLQjk7R",
    "/ip4/18.198.196.213/tcp/1347/p2p/12D3KooWL6PsFNPhYftrJzGgF5U18hFoaVhfGk7xwzD8yVrHJ3Uc",
    "/ip4/18.195.111.146/tcp/1347/p2p/12D3KooWLFynvDQiUpXoHroV1YxKHhPJgysQGH2k3ZGwtWzR4dFH",
    "/ip4/52.77.116.139/tcp/1347/p2p/12D3KooWP5MwCiqdMETF9ub1P3MbCvQCcfconnYHbWg6sUJcDRQQ",
    "/ip4/18.136.2.101/tcp/1347/p2p/12D3KooWRs3aY1p3juFjPy8gPN95PEQChm2QKGUCAdcDCC4EBMKf",
    "/ip4/13.250.155.222/tcp/1347/p2p/12D3KooWScFR7385LTyR4zU1bYdzSiiAb5rnNABfVahPvVSzyTkR",
    "/ip4/47.115.22.33/tcp/41778/p2p/12D3KooWDqaZkm3oSczUm3dvAJ5aL2rdSeQ5VQbnHRTQNEFShhmc",
    "/ip4/61.147.123.111/tcp/12757/p2p/12D3KooWGhufNmZHF3sv48aQeS13ng5XVJZ9E6qy2Ms4VzqeUsHk",
    "/ip4/61.147.123.121/tcp/12757/p2p/12D3KooWDgQrcyZpcMAkbEFSJJYV2qXEMwXX67WTbqpNdbifHaEq",
    "/ip4/3.129.112.217/tcp/1235/p2p/12D3KooWBF8cpp65hp2u9LK5mh19x67ftAam84z9LsfaquTDSBpt",
    "/ip4/36.103.232.198/tcp/34721/p2p/12D3KooWQnwEGNqcM2nAcPtRR9rAX8Hrg4k9kJLCHoTR5chJfz6d",
    "/ip4/36.103.232.198/tcp/34723/p2p/12D3KooWMKxMkD5DMpSWsW7dBddKxKT7L2GgbNuckz9otxvkvByP",
];

/// The overlay network being crawled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Ethereum consensus layer.
    #[default]
    Eth2,
    /// Filecoin mainnet.
    Filecoin,
}

impl Network {
    /// Default gossip topics for the network.
    pub fn default_topics(&self) -> Vec<String> {
        match self {
            Self::Eth2 => ETH2_TOPIC_KINDS
                .iter()
                .map(|kind| format!("/eth2/{ETH2_FORK_DIGEST}/{kind}/ssz_snappy"))
                .collect(),
            Self::Filecoin => {
                vec!["/fil/blocks/testnetnet".to_string(), "/fil/msgs/testnetnet".to_string()]
            }
        }
    }

    /// Default bootstrap multiaddresses for the network.
    ///
    /// The eth2 set is empty: consensus-layer bootstrap lists are
    /// published as ENRs, so eth2 runs supply multiaddresses through the
    /// config document.
    pub fn default_bootstrap(&self) -> Vec<Multiaddr> {
        match self {
            Self::Eth2 => Vec::new(),
            Self::Filecoin => FILECOIN_BOOTSTRAP
                .iter()
                .map(|s| s.parse().expect("static bootstrap addresses parse"))
                .collect(),
        }
    }

    /// Kademlia protocol id used for neighbour queries.
    pub const fn kad_protocol(&self) -> &'static str {
        match self {
            Self::Eth2 => "/ipfs/kad/1.0.0",
            Self::Filecoin => "/ipfs/kad/1.0.0",
        }
    }

    /// Every DHT protocol the network's peers may answer on.
    pub fn dht_protocols(&self) -> Vec<&'static str> {
        match self {
            Self::Eth2 => vec!["/ipfs/kad/1.0.0"],
            Self::Filecoin => vec!["/ipfs/kad/1.0.0", "/ipfs/kad/2.0.0"],
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eth2 => write!(f, "eth2"),
            Self::Filecoin => write!(f, "filecoin"),
        }
    }
}

/// Errors loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to open config file: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON for the expected shape.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    /// A crawl with zero workers can never make progress.
    #[error("worker count must be positive")]
    ZeroWorkers,
    /// Nowhere to put the CSV and the embedded database.
    #[error("output path must not be empty")]
    EmptyOutputPath,
}

/// The crawler's JSON configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlerConfig {
    /// The network to crawl; selects bootstrap and topic defaults.
    pub network: Network,
    /// Bootstrap multiaddresses seeded into the discovery feed.
    #[serde(with = "serde_multiaddr")]
    pub bootstrap_nodes: Vec<Multiaddr>,
    /// Gossip topics to join.
    pub topics: Vec<String>,
    /// Number of concurrent dial workers.
    pub workers: usize,
    /// SQL connection string, carried for external sinks.
    pub db_endpoint: Option<String>,
    /// Directory for the CSV export and the embedded database.
    pub output_path: PathBuf,
    /// Peer store backend selector (`memory` or the embedded file store).
    pub peerstore_backend: String,
    /// Log level for the tracing subscriber.
    pub log_level: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self::for_network(Network::Eth2)
    }
}

impl CrawlerConfig {
    /// Configuration pre-filled with the network's defaults.
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            bootstrap_nodes: network.default_bootstrap(),
            topics: network.default_topics(),
            workers: DEFAULT_WORKERS,
            db_endpoint: None,
            output_path: PathBuf::from("./results"),
            peerstore_backend: "sled".to_string(),
            log_level: "info".to_string(),
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the crawler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputPath);
        }
        Ok(())
    }
}

/// Bootstrap nodes appear in the JSON document as multiaddress strings.
mod serde_multiaddr {
    use libp2p::Multiaddr;
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

    #[test]
    fn defaults_are_valid() {
        CrawlerConfig::for_network(Network::Eth2).validate().unwrap();
        CrawlerConfig::for_network(Network::Filecoin).validate().unwrap();
    }

    #[test]
    fn filecoin_defaults_carry_bootstrap_nodes() {
        let config = CrawlerConfig::for_network(Network::Filecoin);
        assert!(!config.bootstrap_nodes.is_empty());
        assert_eq!(config.topics.len(), 2);
        assert_eq!(config.network.dht_protocols(), ["/ipfs/kad/1.0.0", "/ipfs/kad/2.0.0"]);
    }

    #[test]
    fn eth2_topics_cover_the_five_families() {
        let topics = Network::Eth2.default_topics();
        assert_eq!(topics.len(), 5);
        assert!(topics.iter().all(|t| t.starts_with("/eth2/") && t.ends_with("/ssz_snappy")));
        assert!(topics.iter().any(|t| t.contains("beacon_block")));
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let mut config = CrawlerConfig::default();
        config.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn json_round_trip_uses_kebab_case() {
        let config = CrawlerConfig::for_network(Network::Filecoin);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("bootstrap-nodes"));
        assert!(json.contains("peerstore-backend"));

        let parsed: CrawlerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.network, Network::Filecoin);
        assert_eq!(parsed.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn partial_documents_fall_back_to_defaults() {
        let parsed: CrawlerConfig =
            serde_json::from_str(r#"{"network":"filecoin","workers":8}"#).unwrap();
        assert_eq!(parsed.network, Network::Filecoin);
        assert_eq!(parsed.workers, 8);
        assert_eq!(parsed.log_level, "info");
    }
}
