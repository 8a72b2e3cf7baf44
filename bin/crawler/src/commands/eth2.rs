//! The `eth2` subcommand.

use armiarma_p2p::{CrawlerError, Network};
use clap::Parser;

use super::CrawlArgs;

/// Crawl the eth2 consensus-layer network with the configuration in the
/// config file.
#[derive(Parser, Debug, Clone)]
pub struct Eth2Command {
    #[command(flatten)]
    args: CrawlArgs,
}

impl Eth2Command {
    /// Run the eth2 crawl.
    pub async fn run(self, verbosity: u8) -> Result<(), CrawlerError> {
        self.args.crawl(Network::Eth2, verbosity).await
    }
}
