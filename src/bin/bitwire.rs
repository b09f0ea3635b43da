//! Thin CLI: parse a `.torrent` file, announce to its tracker, and dial the
//! peers it returns. The core library does the work; this binary only wires
//! it together and prints what happened.

use anyhow::Context;
use bitwire::peer::PeerService;
use bitwire::torrent::Metainfo;
use bitwire::tracker::TrackerClient;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bitwire", about = "Announce to a tracker and connect to its peers")]
struct Cli {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Local port to listen on for inbound peer connections.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Number of peers to request from the tracker.
    #[arg(long)]
    numwant: Option<i64>,

    /// How long to stay connected before shutting down, in seconds.
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let metainfo = Metainfo::from_file(&cli.torrent)
        .with_context(|| format!("failed to parse {}", cli.torrent.display()))?;
    info!(info_hash = %metainfo.info_hash_hex(), name = %metainfo.info.name, "parsed torrent");

    let tracker = TrackerClient::new(cli.port);
    let mut request = bitwire::tracker::TrackerRequest::new(&metainfo, tracker.peer_id(), cli.port);
    request.numwant = cli.numwant;
    let response = tracker
        .announce_with(&metainfo, request)
        .await
        .context("tracker announce failed")?;
    info!(
        peers = response.peers.len(),
        interval = response.interval,
        "tracker announce succeeded"
    );

    let service = PeerService::new(cli.port, tracker.peer_id());
    service.add_hash(metainfo.info_hash);
    service.start_listening().await.context("failed to start listening")?;

    let peer_addrs: Vec<SocketAddr> = response
        .peers
        .iter()
        .map(|p| SocketAddr::new(p.ip, p.port))
        .collect();
    service.initiate_handshakes(metainfo.info_hash, peer_addrs).await;

    tokio::time::sleep(std::time::Duration::from_secs(cli.duration_secs)).await;

    service.stop_listening().await;
    Ok(())
}
