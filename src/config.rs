//! Tunable limits and timeouts, with defaults matching a conventional
//! BitTorrent client, and a `clap`-derived CLI surface for `main.rs`.
use std::time::Duration;

/// Block size used for outbound piece requests (16 KiB, the conventional
/// BitTorrent request unit).
pub const MAX_BLOCK: u32 = 16 * 1024;

/// Largest `request` length we will honor when serving a peer (128 KiB) —
/// guards against a peer asking for an unreasonably large block.
pub const MAX_BLOCK_SERVE: u32 = 128 * 1024;

/// Runtime-tunable limits and timeouts for a single torrent's scheduler and
/// its peer sessions.
#[derive(Debug, Clone)]
pub struct Config {
    /// Max outstanding block requests per peer.
    pub max_inflight: usize,
    /// Max pieces being downloaded concurrently.
    pub max_active_pieces: usize,
    /// How long a single block request may stay unresolved.
    pub request_timeout: Duration,
    /// How long to wait for a peer's handshake.
    pub handshake_timeout: Duration,
    /// Minimum quiet time before sending a keepalive.
    pub keepalive_interval: Duration,
    /// Upper bound on how long the scheduler's dispatch loop waits for a
    /// ready peer before running its bookkeeping/progress pass.
    pub progress_tick: Duration,
    /// Floor applied to tracker announce intervals.
    pub min_interval: Duration,
    /// Delay applied to a peer with a 0% recent success rate.
    pub punish_max: Duration,
    /// Punishment delays below this floor are not actually slept.
    pub punish_floor: Duration,
    /// Length of each peer's rolling (result, duration) score history.
    pub score_history: usize,
    /// Whether the UDP tracker announce includes the optional trailing
    /// hostname extension. Most deployments omit it.
    pub udp_send_hostname: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_inflight: 6,
            max_active_pieces: 20,
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(12),
            keepalive_interval: Duration::from_secs(60),
            progress_tick: Duration::from_secs(1),
            min_interval: Duration::from_secs(60),
            punish_max: Duration::from_secs(8),
            punish_floor: Duration::from_millis(200),
            score_history: 16,
            udp_send_hostname: false,
        }
    }
}

/// Command-line arguments for the `rstc` binary.
#[derive(Debug, clap::Parser)]
#[command(name = "rstc", about = "Minimal BitTorrent client core")]
pub struct Args {
    /// Path to the .torrent file to download.
    pub torrent_path: std::path::PathBuf,

    /// Directory files are written into (created if missing).
    #[arg(short, long, default_value = ".")]
    pub output_dir: std::path::PathBuf,

    /// TCP port this client listens on for incoming peer connections.
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum outstanding block requests per peer.
    #[arg(long, default_value_t = Config::default().max_inflight)]
    pub max_inflight: usize,

    /// Maximum pieces being downloaded concurrently.
    #[arg(long, default_value_t = Config::default().max_active_pieces)]
    pub max_active_pieces: usize,
}

impl Args {
    pub fn to_config(&self) -> Config {
        Config {
            max_inflight: self.max_inflight,
            max_active_pieces: self.max_active_pieces,
            ..Config::default()
        }
    }
}
