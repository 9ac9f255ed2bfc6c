//! A single piece's static description.

/// An immutable description of one piece: its index, its length (equal to
/// the torrent's `piece_length` except possibly for the last piece), and
/// its expected SHA-1 hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
}
