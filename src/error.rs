//! Crate-wide error type, aggregating each module's error enum.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error(transparent)]
    Torrent(#[from] crate::torrent::TorrentError),

    #[error(transparent)]
    File(#[from] crate::file::FileError),

    #[error(transparent)]
    Peer(#[from] crate::peer::PeerError),

    #[error(transparent)]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
