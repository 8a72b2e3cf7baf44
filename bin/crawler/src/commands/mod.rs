//! CLI subcommands.

use std::path::PathBuf;

use armiarma_p2p::{Crawler, CrawlerConfig, CrawlerError, Network};
use clap::Args;

mod eth2;
pub use eth2::Eth2Command;

mod filecoin;
pub use filecoin::FilecoinCommand;

/// Flags shared by the per-network crawl subcommands.
#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Path to the JSON config file used to configure the crawler.
    #[arg(long, env = "ARMIARMA_CONFIG_FILE_NAME")]
    pub config_file: Option<PathBuf>,
}

impl CrawlArgs {
    /// Loads the configuration for `network`, from the config file when
    /// one was given and from the network presets otherwise.
    pub fn load_config(&self, network: Network) -> Result<CrawlerConfig, CrawlerError> {
        let mut config = match &self.config_file {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                CrawlerConfig::from_file(path)?
            }
            None => CrawlerConfig::for_network(network),
        };
        // The subcommand decides the network, whatever the file says.
        config.network = network;
        Ok(config)
    }

    /// Builds the crawler and runs it until interrupted.
    pub async fn crawl(&self, network: Network, verbosity: u8) -> Result<(), CrawlerError> {
        let config = self.load_config(network)?;
        crate::init_tracing(&config.log_level, verbosity);
        tracing::info!(%network, "starting crawler");

        let crawler = Crawler::builder(config).build()?;
        let cancel = crawler.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
        crawler.run().await
    }
}
