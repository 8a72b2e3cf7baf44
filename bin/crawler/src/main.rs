//! The armiarma network observatory CLI.

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use armiarma_p2p::CrawlerError;

mod commands;
use commands::{Eth2Command, FilecoinCommand};

/// armiarma: a libp2p network crawler and observatory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v debug, -vv trace).
    #[arg(long, short, global = true, action = ArgAction::Count)]
    v: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crawl the eth2 consensus-layer network.
    Eth2(Eth2Command),
    /// Crawl the Filecoin network.
    Filecoin(FilecoinCommand),
}

fn main() {
    let cli = Cli::parse();
    let result = match run(cli) {
        Ok(()) => {
            tracing::info!("clean shutdown");
            0
        }
        Err(err) => {
            // The subscriber may not be up yet for early failures.
            eprintln!("Error: {err}");
            exit_code(&err)
        }
    };
    std::process::exit(result);
}

fn run(cli: Cli) -> Result<(), CrawlerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CrawlerError::Io)?;
    match cli.command {
        Commands::Eth2(cmd) => runtime.block_on(cmd.run(cli.v)),
        Commands::Filecoin(cmd) => runtime.block_on(cmd.run(cli.v)),
    }
}

/// 0 clean shutdown, 1 configuration error, 2 host bring-up failure.
fn exit_code(err: &CrawlerError) -> i32 {
    match err {
        CrawlerError::Host(_) => 2,
        _ => 1,
    }
}

/// Initialises the tracing subscriber from the configured level, bumped
/// by the `-v` count.
pub(crate) fn init_tracing(level: &str, verbosity: u8) {
    let directive = match verbosity {
        0 => level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
