//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
use crate::peer::{PeerError, PeerResult, EXTENDED_PROTOCOL_BIT};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::instrument;

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates a new handshake with the specified info hash and peer ID.

    Arguments:
    - info_hash - The SHA-1 hash of the torrent's info dictionary
    - peer_id - A unique identifier for this client

    Returns:
    A new Handshake instance with default protocol settings, advertising
    extended-message support (reserved bit 20 from the MSB). */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        set_reserved_bit(&mut reserved, EXTENDED_PROTOCOL_BIT);
        Self {
            protocol_len: 19,
            protocol: *b"BitTorrent protocol",
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the peer that sent this handshake advertised extended
    /// message support.
    pub fn supports_extended(&self) -> bool {
        reserved_bit(&self.reserved, EXTENDED_PROTOCOL_BIT)
    }

    /** Serializes the handshake into a 68-byte array as per the BitTorrent protocol.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID

    Returns:
    A 68-byte array containing the serialized handshake */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and parses a 68-byte handshake from `stream`, validating the
    /// protocol length and string but not the info_hash (see [`validate`]).
    ///
    /// [`validate`]: Handshake::validate
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        let protocol_len = length_buf[0];
        if protocol_len != 19 {
            return Err(PeerError::BadProtocolLength(protocol_len));
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[0..19]);
        if &protocol != b"BitTorrent protocol" {
            return Err(PeerError::BadProtocolString);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Checks this handshake's info_hash against the torrent we expect to
    /// be downloading.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}

fn set_reserved_bit(reserved: &mut [u8; 8], bit_from_msb: u32) {
    let byte_index = (bit_from_msb / 8) as usize;
    let bit_in_byte = 7 - (bit_from_msb % 8);
    reserved[byte_index] |= 1 << bit_in_byte;
}

fn reserved_bit(reserved: &[u8; 8], bit_from_msb: u32) -> bool {
    let byte_index = (bit_from_msb / 8) as usize;
    let bit_in_byte = 7 - (bit_from_msb % 8);
    (reserved[byte_index] >> bit_in_byte) & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handshake_advertises_extended_support() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.supports_extended());
    }

    #[test]
    fn serialize_round_trips_reserved_bytes() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &hs.reserved);
        assert_eq!(&bytes[28..48], &hs.info_hash);
        assert_eq!(&bytes[48..68], &hs.peer_id);
    }

    #[test]
    fn validate_rejects_mismatched_info_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(matches!(
            hs.validate([9u8; 20]),
            Err(PeerError::InfoHashMismatch)
        ));
        assert!(hs.validate([1u8; 20]).is_ok());
    }
}
