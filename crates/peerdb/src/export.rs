//! CSV export of the peer store.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Peer, PeerStore, StoreError};

/// Column header of the CSV export. The field order is part of the
/// external contract and must not change.
pub const CSV_HEADER: &str = "Peer Id,Node Id,User Agent,Client,Version,Pubkey,Address,Ip,Country,City,Request Metadata,Success Metadata,Attempted,Succeed,ConnStablished,IsConnected,Attempts,Error,Latency,Connections,Disconnections,Connected Time,Beacon Blocks,Beacon Aggregations,Voluntary Exits,Proposer Slashings,Attester Slashings,Total Messages";

/// Topic-name fragments backing the five per-topic CSV columns.
const TOPIC_COLUMNS: [&str; 5] = [
    "beacon_block",
    "beacon_aggregate_and_proof",
    "voluntary_exit",
    "proposer_slashing",
    "attester_slashing",
];

/// Errors raised by the CSV export/import paths.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The export file could not be written or read.
    #[error("csv i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer store failed mid-drain.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A CSV row did not have the expected number of columns.
    #[error("malformed csv row at line {0}")]
    MalformedRow(usize),
}

/// Writes the whole store to `path` in the contract column order.
pub fn export_csv(store: &PeerStore, path: &Path) -> Result<(), ExportError> {
    info!(target: "peerdb::export", path = %path.display(), peers = store.len(), "exporting csv");
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{CSV_HEADER}")?;

    let mut write_err = None;
    store.range(|_, peer| {
        if let Err(err) = writeln!(out, "{}", csv_row(&peer)) {
            write_err = Some(err);
            return false;
        }
        true
    })?;
    if let Some(err) = write_err {
        return Err(err.into());
    }
    out.flush()?;
    Ok(())
}

/// Restores peers from a previous export into `store`.
///
/// Only the exported columns are restored; the episode log and per-topic
/// breakdown beyond the contract columns are not reconstructible from a
/// CSV and come back empty. Re-exporting an imported store reproduces the
/// original file byte for byte.
pub fn import_csv(store: &PeerStore, path: &Path) -> Result<usize, ExportError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut imported = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if idx == 0 || line.is_empty() {
            continue;
        }
        let peer = parse_row(&line).ok_or(ExportError::MalformedRow(idx + 1))?;
        store.store(peer)?;
        imported += 1;
    }
    info!(target: "peerdb::export", path = %path.display(), imported, "imported csv");
    Ok(imported)
}

/// Renders one peer as a CSV row in the contract column order.
pub(crate) fn csv_row(peer: &Peer) -> String {
    let latency = peer.latency.map(|d| d.as_millis().to_string()).unwrap_or_default();
    let address = peer.addresses.first().map(|a| a.to_string()).unwrap_or_default();
    let ip = peer.ip.map(|ip| ip.to_string()).unwrap_or_default();
    let topic_counts: Vec<String> =
        TOPIC_COLUMNS.iter().map(|t| peer.messages_matching(t).to_string()).collect();

    [
        sanitize(&peer.peer_id),
        sanitize(peer.node_id.as_deref().unwrap_or_default()),
        sanitize(&peer.user_agent),
        peer.client.to_string(),
        sanitize(&peer.version),
        sanitize(peer.pubkey.as_deref().unwrap_or_default()),
        address,
        ip,
        sanitize(&peer.country),
        sanitize(&peer.city),
        peer.metadata_requested.to_string(),
        peer.metadata_succeeded.to_string(),
        peer.attempted.to_string(),
        peer.succeed.to_string(),
        peer.connection_established.to_string(),
        peer.is_connected.to_string(),
        peer.attempts.to_string(),
        peer.last_error.to_string(),
        latency,
        peer.connections.to_string(),
        peer.disconnections.to_string(),
        peer.connected_time.as_millis().to_string(),
        topic_counts.join(","),
        peer.total_messages().to_string(),
    ]
    .join(",")
}

// Values are written unquoted, so the separator cannot appear in them.
fn sanitize(field: &str) -> String {
    field.replace(',', ";")
}

fn parse_row(line: &str) -> Option<Peer> {
    let cols: Vec<&str> = line.split(',').collect();
    if cols.len() != 28 {
        return None;
    }

    let mut peer = Peer::new(cols[0]);
    peer.node_id = (!cols[1].is_empty()).then(|| cols[1].to_string());
    peer.user_agent = cols[2].to_string();
    peer.client = cols[3].parse().ok()?;
    peer.version = cols[4].to_string();
    peer.pubkey = (!cols[5].is_empty()).then(|| cols[5].to_string());
    if let Ok(addr) = cols[6].parse() {
        peer.addresses.push(addr);
    }
    peer.ip = cols[7].parse().ok();
    peer.country = cols[8].to_string();
    peer.city = cols[9].to_string();
    peer.metadata_requested = cols[10].parse().ok()?;
    peer.metadata_succeeded = cols[11].parse().ok()?;
    peer.attempted = cols[12].parse().ok()?;
    peer.succeed = cols[13].parse().ok()?;
    peer.connection_established = cols[14].parse().ok()?;
    peer.is_connected = cols[15].parse().ok()?;
    peer.attempts = cols[16].parse().ok()?;
    peer.last_error = cols[17].parse().ok()?;
    peer.latency = (!cols[18].is_empty())
        .then(|| cols[18].parse().map(Duration::from_millis).ok())
        .flatten();
    peer.connections = cols[19].parse().ok()?;
    peer.disconnections = cols[20].parse().ok()?;
    peer.connected_time = Duration::from_millis(cols[21].parse().ok()?);

    let mut accounted = 0u64;
    for (fragment, col) in TOPIC_COLUMNS.iter().zip(&cols[22..27]) {
        let count: u64 = col.parse().ok()?;
        if count > 0 {
            let entry = peer.messages.entry(fragment.to_string()).or_default();
            entry.count = count;
            accounted += count;
        }
    }
    let total: u64 = cols[27].parse().ok()?;
    if total > accounted {
        peer.messages.entry("other".to_string()).or_default().count = total - accounted;
    }

    Some(peer)
}

/// Periodically drains the peer store to a CSV file, with a final flush
/// when the run is cancelled.
///
/// Runtime export failures are logged and the crawl continues; only the
/// initial export surfaces an error to the caller, so an unwritable
/// output directory is caught at startup.
#[derive(Debug)]
pub struct ExporterService {
    store: Arc<PeerStore>,
    path: PathBuf,
    interval: Duration,
}

impl ExporterService {
    /// Creates a service exporting `store` to `<output_path>/peerstore.csv`.
    pub fn new(store: Arc<PeerStore>, output_path: &Path, interval: Duration) -> Self {
        Self { store, path: output_path.join("peerstore.csv"), interval }
    }

    /// Path of the CSV file the service writes.
    pub fn csv_path(&self) -> &Path {
        &self.path
    }

    /// Writes one export immediately.
    pub fn export_now(&self) -> Result<(), ExportError> {
        export_csv(&self.store, &self.path)
    }

    /// Verifies the output is writable, then spawns the periodic drain.
    pub fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>, ExportError> {
        self.export_now()?;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await; // first tick fires immediately; already exported
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.export_now() {
                            warn!(target: "peerdb::export", %err, "periodic csv export failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        if let Err(err) = self.export_now() {
                            warn!(target: "peerdb::export", %err, "final csv export failed");
                        } else {
                            info!(target: "peerdb::export", path = %self.path.display(), "final csv export written");
                        }
                        return;
                    }
                }
            }
        });
        Ok(handle)
    }
}
