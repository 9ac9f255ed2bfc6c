//! Torrent metainfo parsing and piece-map types.
pub mod info_hash;
pub mod metainfo;
pub mod piece;

pub use metainfo::{FileInfo, Metainfo};
pub use piece::PieceInfo;

use thiserror::Error;

/// Errors surfaced while loading a torrent descriptor. All of these
/// correspond to the `MalformedInput` kind: they are fatal to the torrent
/// at load time and are meant to be surfaced to the operator, not recovered
/// from internally.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid pieces hash length: must be a multiple of 20, got {0}")]
    InvalidPiecesHashLength(usize),

    #[error("unsafe path component in file list: {0}")]
    UnsafePath(String),

    #[error("torrent declares no files")]
    EmptyFileList,
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
