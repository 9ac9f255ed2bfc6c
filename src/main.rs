//! `rstc`: a minimal BitTorrent client core. Downloads a single torrent to
//! disk and exits once every piece has been verified.
use clap::Parser;
use rs_torrent_client::config::{Args, Config};
use rs_torrent_client::file::FileLayer;
use rs_torrent_client::scheduler::Scheduler;
use rs_torrent_client::torrent::Metainfo;
use rs_torrent_client::tracker::{self, PeerInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        error!(%err, "fatal error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.to_config();

    let raw = std::fs::read(&args.torrent_path)?;
    let metainfo = Metainfo::parse(&raw)?;
    info!(name = %metainfo.name, pieces = metainfo.num_pieces(), "loaded torrent");

    std::fs::create_dir_all(&args.output_dir)?;
    let mut file_layer = FileLayer::open(&metainfo, &args.output_dir)?;
    let already_complete = file_layer.verify_all(&metainfo)?;
    let have = already_complete.iter().filter(|c| **c).count();
    info!(have, total = metainfo.num_pieces(), "verified existing data");

    let shared_file_layer = Arc::new(tokio::sync::Mutex::new(file_layer));

    let http_client = tracker::Client::new(args.port, config.request_timeout)?;
    let local_peer_id = http_client.peer_id();

    let mut scheduler = Scheduler::new(
        metainfo.clone(),
        shared_file_layer,
        config.clone(),
        local_peer_id,
        already_complete,
    );

    let (feed_tx, feed_rx) = mpsc::channel::<Vec<PeerInfo>>(32);
    for tracker_url in &metainfo.trackers {
        tokio::spawn(tracker_announce_loop(
            tracker_url.clone(),
            metainfo.info_hash,
            local_peer_id,
            args.port,
            metainfo.total_size,
            config.clone(),
            feed_tx.clone(),
        ));
    }
    drop(feed_tx);

    scheduler.run(feed_rx).await;
    info!("download complete");
    Ok(())
}

/// Announces to one tracker on a loop, forwarding discovered peers until the
/// process exits. Announce failures are logged and retried after the
/// configured minimum interval rather than aborting the whole download.
async fn tracker_announce_loop(
    tracker_url: String,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    port: u16,
    left: u64,
    config: Config,
    feed_tx: mpsc::Sender<Vec<PeerInfo>>,
) {
    let Ok(parsed) = url::Url::parse(&tracker_url) else {
        warn!(url = %tracker_url, "skipping unparseable tracker URL");
        return;
    };

    loop {
        let outcome = match parsed.scheme() {
            "http" | "https" => announce_http(&tracker_url, info_hash, local_peer_id, left, port, &config).await,
            "udp" => announce_udp(&parsed, info_hash, local_peer_id, port, &config).await,
            other => {
                warn!(scheme = other, url = %tracker_url, "unsupported tracker scheme");
                return;
            }
        };

        let interval = match outcome {
            Ok((interval, peers)) => {
                info!(url = %tracker_url, peers = peers.len(), "tracker announce succeeded");
                let _ = feed_tx.send(peers).await;
                interval
            }
            Err(err) => {
                warn!(url = %tracker_url, error = %err, "tracker announce failed");
                config.min_interval
            }
        };

        tokio::time::sleep(interval.max(config.min_interval)).await;
    }
}

async fn announce_http(
    url: &str,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    left: u64,
    port: u16,
    config: &Config,
) -> anyhow::Result<(Duration, Vec<PeerInfo>)> {
    let client = tracker::Client::with_peer_id(local_peer_id, port, config.request_timeout)?;
    let response = client.announce(url, info_hash, left, config.min_interval).await?;
    Ok((response.interval, response.peers))
}

async fn announce_udp(
    url: &url::Url,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    port: u16,
    config: &Config,
) -> anyhow::Result<(Duration, Vec<PeerInfo>)> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("UDP tracker URL has no host"))?
        .to_string();
    let tracker_port = url
        .port()
        .ok_or_else(|| anyhow::anyhow!("UDP tracker URL has no port"))?;

    let addr = tokio::net::lookup_host((host.as_str(), tracker_port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("UDP tracker host did not resolve"))?;

    let result = tracker::udp::announce(
        addr,
        &host,
        info_hash,
        local_peer_id,
        port,
        config.request_timeout,
        config.udp_send_hostname,
    )
    .await?;
    Ok((result.interval, result.peers))
}
