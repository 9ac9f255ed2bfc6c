//! Wire framing for the peer protocol: every message after the handshake is
//! a 4-byte big-endian length prefix followed by that many bytes, with the
//! first payload byte (if any) naming the message id. `length == 0` is a
//! keepalive.
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_EXTENDED: u8 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message id {0}")]
    UnknownId(u8),

    #[error("message id {id} payload too short: need {need} bytes, have {have}")]
    PayloadTooShort { id: u8, need: usize, have: usize },
}

/// One peer-protocol message, post-handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Keepalive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Extended { ext_id: u8, payload: Vec<u8> },
}

impl Message {
    /// Encodes the message, including its 4-byte length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::Keepalive => {}
            Message::Choke => body.push(ID_CHOKE),
            Message::Unchoke => body.push(ID_UNCHOKE),
            Message::Interested => body.push(ID_INTERESTED),
            Message::NotInterested => body.push(ID_NOT_INTERESTED),
            Message::Have { piece_index } => {
                body.push(ID_HAVE);
                body.write_u32::<BigEndian>(*piece_index).expect("writing to Vec never fails");
            }
            Message::Bitfield { bytes } => {
                body.push(ID_BITFIELD);
                body.extend_from_slice(bytes);
            }
            Message::Request { index, begin, length } => {
                body.push(ID_REQUEST);
                body.write_u32::<BigEndian>(*index).unwrap();
                body.write_u32::<BigEndian>(*begin).unwrap();
                body.write_u32::<BigEndian>(*length).unwrap();
            }
            Message::Piece { index, begin, block } => {
                body.push(ID_PIECE);
                body.write_u32::<BigEndian>(*index).unwrap();
                body.write_u32::<BigEndian>(*begin).unwrap();
                body.extend_from_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                body.push(ID_CANCEL);
                body.write_u32::<BigEndian>(*index).unwrap();
                body.write_u32::<BigEndian>(*begin).unwrap();
                body.write_u32::<BigEndian>(*length).unwrap();
            }
            Message::Extended { ext_id, payload } => {
                body.push(ID_EXTENDED);
                body.push(*ext_id);
                body.extend_from_slice(payload);
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.write_u32::<BigEndian>(body.len() as u32).unwrap();
        out.extend_from_slice(&body);
        out
    }

    /// Parses a message body (i.e. the bytes following the 4-byte length
    /// prefix; an empty slice is a keepalive).
    pub fn from_body(body: &[u8]) -> Result<Message, MessageError> {
        if body.is_empty() {
            return Ok(Message::Keepalive);
        }
        let id = body[0];
        let mut cur = Cursor::new(&body[1..]);
        let need = |need: usize| -> Result<(), MessageError> {
            if body.len() - 1 < need {
                Err(MessageError::PayloadTooShort {
                    id,
                    need,
                    have: body.len() - 1,
                })
            } else {
                Ok(())
            }
        };
        match id {
            ID_CHOKE => Ok(Message::Choke),
            ID_UNCHOKE => Ok(Message::Unchoke),
            ID_INTERESTED => Ok(Message::Interested),
            ID_NOT_INTERESTED => Ok(Message::NotInterested),
            ID_HAVE => {
                need(4)?;
                Ok(Message::Have {
                    piece_index: cur.read_u32::<BigEndian>().expect("length checked above"),
                })
            }
            ID_BITFIELD => Ok(Message::Bitfield {
                bytes: body[1..].to_vec(),
            }),
            ID_REQUEST => {
                need(12)?;
                Ok(Message::Request {
                    index: cur.read_u32::<BigEndian>().unwrap(),
                    begin: cur.read_u32::<BigEndian>().unwrap(),
                    length: cur.read_u32::<BigEndian>().unwrap(),
                })
            }
            ID_PIECE => {
                need(8)?;
                let index = cur.read_u32::<BigEndian>().unwrap();
                let begin = cur.read_u32::<BigEndian>().unwrap();
                let block = body[9..].to_vec();
                Ok(Message::Piece { index, begin, block })
            }
            ID_CANCEL => {
                need(12)?;
                Ok(Message::Cancel {
                    index: cur.read_u32::<BigEndian>().unwrap(),
                    begin: cur.read_u32::<BigEndian>().unwrap(),
                    length: cur.read_u32::<BigEndian>().unwrap(),
                })
            }
            ID_EXTENDED => {
                need(1)?;
                let ext_id = body[1];
                let payload = body[2..].to_vec();
                Ok(Message::Extended { ext_id, payload })
            }
            other => Err(MessageError::UnknownId(other)),
        }
    }
}
