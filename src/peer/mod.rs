//! The peer wire protocol: handshake, message framing, bitfields, scoring,
//! and the per-connection session state machine.
pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod score;
pub mod session;

pub use bitfield::{Bitfield, BitfieldError};
pub use handshake::Handshake;
pub use message::{Message, MessageError};
pub use score::Score;
pub use session::{PeerSession, PeerState, SessionEvent, SessionHandle};

use thiserror::Error;

/// Bit index (from the MSB of the 8 reserved handshake bytes) that
/// advertises support for the extended message protocol (BEP 10).
pub const EXTENDED_PROTOCOL_BIT: u32 = 20;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake protocol length {0} is not 19")]
    BadProtocolLength(u8),

    #[error("handshake protocol string was not \"BitTorrent protocol\"")]
    BadProtocolString,

    #[error("handshake info_hash mismatch")]
    InfoHashMismatch,

    #[error("bitfield error: {0}")]
    Bitfield(#[from] BitfieldError),

    #[error("message framing error: {0}")]
    Message(#[from] MessageError),

    #[error("bitfield received after another post-handshake message")]
    BitfieldNotFirst,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection idle past the allowed bound")]
    Idle,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
