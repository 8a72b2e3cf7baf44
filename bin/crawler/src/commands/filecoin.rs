//! The `filecoin` subcommand.

use armiarma_p2p::{CrawlerError, Network};
use clap::Parser;

use super::CrawlArgs;

/// Crawl the Filecoin network with the configuration in the config file.
#[derive(Parser, Debug, Clone)]
pub struct FilecoinCommand {
    #[command(flatten)]
    args: CrawlArgs,
}

impl FilecoinCommand {
    /// Run the Filecoin crawl.
    pub async fn run(self, verbosity: u8) -> Result<(), CrawlerError> {
        self.args.crawl(Network::Filecoin, verbosity).await
    }
}
