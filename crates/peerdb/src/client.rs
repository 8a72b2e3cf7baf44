//! User-agent parsing into client family and version.

use serde::{Deserialize, Serialize};

/// Client family advertised in an identify user-agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Client {
    /// Prysmatic Labs' eth2 client.
    Prysm,
    /// Sigma Prime's eth2 client.
    Lighthouse,
    /// ConsenSys' eth2 client.
    Teku,
    /// Status' eth2 client.
    Nimbus,
    /// ChainSafe's eth2 client.
    Lodestar,
    /// Grandine eth2 client.
    Grandine,
    /// Protocol Labs' Filecoin client.
    Lotus,
    /// Anything we could not recognise.
    #[default]
    Unknown,
}

impl std::fmt::Display for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prysm => "Prysm",
            Self::Lighthouse => "Lighthouse",
            Self::Teku => "Teku",
            Self::Nimbus => "Nimbus",
            Self::Lodestar => "Lodestar",
            Self::Grandine => "Grandine",
            Self::Lotus => "Lotus",
            Self::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for Client {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Ok(match lower.as_str() {
            "prysm" => Self::Prysm,
            "lighthouse" => Self::Lighthouse,
            "teku" => Self::Teku,
            "nimbus" => Self::Nimbus,
            "lodestar" => Self::Lodestar,
            "grandine" => Self::Grandine,
            "lotus" => Self::Lotus,
            _ => Self::Unknown,
        })
    }
}

/// Splits a user-agent like `Lighthouse/v4.5.0-1234abc/x86_64-linux` into
/// client family and version.
///
/// The version is the second `/`-separated segment when present; agents
/// that advertise only a name get an empty version.
pub fn parse_user_agent(user_agent: &str) -> (Client, String) {
    let mut segments = user_agent.split('/');
    let name = segments.next().unwrap_or_default().trim();
    let version = segments.next().unwrap_or_default().trim().to_string();

    let lower = name.to_ascii_lowercase();
    let client = if lower.contains("prysm") {
        Client::Prysm
    } else if lower.contains("lighthouse") {
        Client::Lighthouse
    } else if lower.contains("teku") {
        Client::Teku
    } else if lower.contains("nimbus") {
        Client::Nimbus
    } else if lower.contains("lodestar") {
        Client::Lodestar
    } else if lower.contains("grandine") {
        Client::Grandine
    } else if lower.contains("lotus") {
        Client::Lotus
    } else {
        Client::Unknown
    };

    (client, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_agents() {
        let cases = [
            ("Lighthouse/v4.5.0-1234abc/x86_64-linux", Client::Lighthouse, "v4.5.0-1234abc"),
            ("Prysm/v2.0.2/abcdef", Client::Prysm, "v2.0.2"),
            ("teku/v23.10.0/linux-x86_64/...", Client::Teku, "v23.10.0"),
            ("nimbus", Client::Nimbus, ""),
            ("lotus-1.23.0+mainnet/...", Client::Lotus, "..."),
        ];
        for (agent, client, version) in cases {
            let (c, v) = parse_user_agent(agent);
            assert_eq!(c, client, "agent {agent}");
            assert_eq!(v, version, "agent {agent}");
        }
    }

    #[test]
    fn unknown_agents_fall_through() {
        let (c, v) = parse_user_agent("rust-libp2p/0.53.0");
        assert_eq!(c, Client::Unknown);
        assert_eq!(v, "0.53.0");

        let (c, _) = parse_user_agent("");
        assert_eq!(c, Client::Unknown);
    }
}
