//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers over
//! HTTP(S), including announce requests, bencoded response parsing (both
//! compact and dict peer formats), and peer ID generation / URL encoding
//! helpers. See [`udp`] for the BEP 15 UDP transport.
pub mod udp;

use crate::bencode::{decode, BencodeValue};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid announce URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("bencode error in tracker response: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed tracker response: {0}")]
    InvalidResponse(String),

    #[error("tracker request timed out")]
    Timeout,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A candidate peer endpoint returned by a tracker. Equality and set
/// membership ignore `peer_id` — the same `(ip, port)` seen again (even
/// advertising a different id) is the same candidate.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub peer_id: Option<[u8; 20]>,
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}
impl Eq for PeerInfo {}

impl std::hash::Hash for PeerInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl PeerInfo {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

/// Contains the parsed response from a tracker announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<PeerInfo>,
}

/// An HTTP(S) tracker client for one local client identity.
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

impl Client {
    pub fn new(port: u16, request_timeout: Duration) -> TrackerResult<Self> {
        Self::with_peer_id(generate_peer_id(), port, request_timeout)
    }

    /// Builds a client that announces under a caller-supplied `peer_id`,
    /// so the identity reported to trackers matches the one used in peer
    /// handshakes.
    pub fn with_peer_id(peer_id: [u8; 20], port: u16, request_timeout: Duration) -> TrackerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { peer_id, port, http })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to `announce_url` and parses the response.
    /// `min_interval` clamps the reported interval from below.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn announce(
        &self,
        announce_url: &str,
        info_hash: [u8; 20],
        left: u64,
        min_interval: Duration,
    ) -> TrackerResult<AnnounceResponse> {
        let mut url = url::Url::parse(announce_url)?;
        let params = [
            ("info_hash", url_encode(&info_hash)),
            ("peer_id", url_encode(&self.peer_id)),
            ("port", self.port.to_string()),
            ("uploaded", "0".to_string()),
            ("downloaded", "0".to_string()),
            ("left", left.to_string()),
            ("compact", "1".to_string()),
        ];
        url.query_pairs_mut().extend_pairs(&params).finish();

        tracing::debug!(%url, "announcing to tracker");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { TrackerError::Timeout } else { e.into() })?;
        let bytes = response.bytes().await?;
        Self::parse_announce_response(&bytes, min_interval)
    }

    /// Parses a bencoded tracker announce response, handling both the
    /// compact (`6N`-byte) and dict-list peer formats.
    fn parse_announce_response(bytes: &[u8], min_interval: Duration) -> TrackerResult<AnnounceResponse> {
        let value = decode(bytes)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| TrackerError::InvalidResponse("response is not a dict".to_string()))?;

        let interval_secs = dict.get(b"interval").and_then(BencodeValue::as_integer).unwrap_or(0);
        let interval = Duration::from_secs(interval_secs.max(0) as u64).max(min_interval);

        let peers = match dict.get(b"peers") {
            Some(BencodeValue::String(bytes)) => parse_compact_peers(bytes)?,
            Some(BencodeValue::List(entries)) => parse_dict_peers(entries)?,
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, peers })
    }
}

fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<PeerInfo>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(
            "compact peers field length is not a multiple of 6".to_string(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerInfo {
                ip: IpAddr::V4(ip),
                port,
                peer_id: None,
            }
        })
        .collect())
}

fn parse_dict_peers(entries: &[BencodeValue]) -> TrackerResult<Vec<PeerInfo>> {
    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(dict) = entry.as_dict() else { continue };
        let Some(ip_bytes) = dict.get(b"ip").and_then(BencodeValue::as_bytes) else { continue };
        let Ok(ip_str) = std::str::from_utf8(ip_bytes) else { continue };
        let Ok(ip) = ip_str.parse::<IpAddr>() else { continue };
        let Some(port) = dict.get(b"port").and_then(BencodeValue::as_integer) else { continue };
        let peer_id = dict
            .get(b"peer id")
            .and_then(BencodeValue::as_bytes)
            .and_then(|b| <[u8; 20]>::try_from(b).ok());
        peers.push(PeerInfo {
            ip,
            port: port as u16,
            peer_id,
        });
    }
    Ok(peers)
}

/// Generates a unique peer ID for this client: an 8-byte client prefix
/// followed by 12 random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT1000-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986, leaving the unreserved
/// character set untouched. Used for `info_hash`/`peer_id`, which are raw
/// bytes rather than text and must survive percent-encoding byte-for-byte.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_leaves_unreserved_chars_alone() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
        assert_eq!(url_encode(&[0x00, 0xff]), "%00%FF");
    }

    #[test]
    fn peer_id_has_expected_prefix_and_length() {
        let id = generate_peer_id();
        assert_eq!(id.len(), 20);
        assert_eq!(&id[..8], b"-RT1000-");
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut body = crate::bencode::Dict::new();
        body.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        body.insert(
            b"peers".to_vec(),
            BencodeValue::String(vec![127, 0, 0, 1, 0x1a, 0xe1]),
        );
        let bytes = crate::bencode::encoder::encode_to_vec(&BencodeValue::Dict(body)).unwrap();
        let response = Client::parse_announce_response(&bytes, Duration::from_secs(60)).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(response.peers[0].port, 0x1ae1);
    }

    #[test]
    fn interval_is_clamped_to_minimum() {
        let mut body = crate::bencode::Dict::new();
        body.insert(b"interval".to_vec(), BencodeValue::Integer(5));
        body.insert(b"peers".to_vec(), BencodeValue::String(vec![]));
        let bytes = crate::bencode::encoder::encode_to_vec(&BencodeValue::Dict(body)).unwrap();
        let response = Client::parse_announce_response(&bytes, Duration::from_secs(60)).unwrap();
        assert_eq!(response.interval, Duration::from_secs(60));
    }

    #[test]
    fn parses_dict_form_peer_list() {
        let mut peer = crate::bencode::Dict::new();
        peer.insert(b"ip".to_vec(), BencodeValue::String(b"10.0.0.5".to_vec()));
        peer.insert(b"port".to_vec(), BencodeValue::Integer(6881));
        let mut body = crate::bencode::Dict::new();
        body.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        body.insert(b"peers".to_vec(), BencodeValue::List(vec![BencodeValue::Dict(peer)]));
        let bytes = crate::bencode::encoder::encode_to_vec(&BencodeValue::Dict(body)).unwrap();
        let response = Client::parse_announce_response(&bytes, Duration::from_secs(60)).unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
    }
}
