use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{self, Read};

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Size of the big-endian length prefix in front of every message
pub const LENGTH_PREFIX: usize = 4;

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent in a connection and is always 68 bytes.
/// It identifies the torrent being requested (`info_hash`) and the client (`peer_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string used to identify the client
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new `Handshake` with the given `info_hash` and `peer_id`.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array.
    ///
    /// This array can be written directly to a TCP stream.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..1 + PROTOCOL_STR.len()].copy_from_slice(PROTOCOL_STR.as_bytes());
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decodes a 68-byte handshake message.
    ///
    /// Only the protocol string is validated; the caller decides what to do
    /// with an unexpected info hash.
    pub fn decode(buf: &[u8]) -> Result<Self, ApplicationError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ApplicationError::ParserError(
                "invalid handshake length".into(),
            ));
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STR.len() {
            return Err(ApplicationError::ParserError(
                "invalid protocol string length".into(),
            ));
        }

        if &buf[1..1 + pstrlen] != PROTOCOL_STR.as_bytes() {
            return Err(ApplicationError::ParserError(
                "invalid protocol string".into(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Represents a protocol message exchanged after the handshake.
///
/// These messages follow the BitTorrent peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `choke` message: tells the peer it will not receive requests
    Choke,
    /// `unchoke` message: peer is allowed to request blocks
    Unchoke,
    /// `interested` message: client is interested in pieces from peer
    Interested,
    /// `not interested` message: client is not interested
    NotInterested,
    /// `have` message: peer has a specific piece
    Have(u32),
    /// `bitfield` message: bitmap of pieces the peer has
    Bitfield(Vec<u8>),
    /// `request` message: request a block of data
    Request { index: u32, begin: u32, length: u32 },
    /// `piece` message: sends a block of a piece
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// `cancel` message: cancels a previously sent request
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Wire identifier carried in the first payload byte.
    pub fn id(&self) -> u8 {
        match self {
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request { .. } => 6,
            Message::Piece { .. } => 7,
            Message::Cancel { .. } => 8,
        }
    }

    fn payload_len(&self) -> usize {
        1 + match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have(_) => 4,
            Message::Bitfield(bitfield) => bitfield.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
        }
    }

    /// Serializes a `Message` into a length-prefixed frame.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload_len();
        let mut buf = vec![0u8; LENGTH_PREFIX + len];
        BigEndian::write_u32(&mut buf[0..4], len as u32);
        buf[4] = self.id();

        let body = &mut buf[5..];
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => BigEndian::write_u32(&mut body[0..4], *index),
            Message::Bitfield(bitfield) => body.copy_from_slice(bitfield),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                BigEndian::write_u32(&mut body[0..4], *index);
                BigEndian::write_u32(&mut body[4..8], *begin);
                BigEndian::write_u32(&mut body[8..12], *length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                BigEndian::write_u32(&mut body[0..4], *index);
                BigEndian::write_u32(&mut body[4..8], *begin);
                body[8..].copy_from_slice(block);
            }
        }
        buf
    }

    /// Parses a complete length-prefixed frame into a `Message`.
    ///
    /// Returns `Ok(None)` if the message is a keep-alive (length 0).
    pub fn decode(mut buf: &[u8]) -> Result<Option<Self>, ApplicationError> {
        if buf.len() < LENGTH_PREFIX {
            return Err(ApplicationError::ParserError(
                "buffer too short to read length".into(),
            ));
        }

        let len = buf.read_u32::<BigEndian>().map_err(truncated)?;

        if len == 0 {
            return Ok(None);
        }

        if buf.len() < len as usize {
            return Err(ApplicationError::ParserError(
                "incomplete message data".into(),
            ));
        }

        let id = buf.read_u8().map_err(truncated)?;
        let payload_len = len as usize - 1;

        let message = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                expect_len("have", payload_len, 4)?;
                Message::Have(buf.read_u32::<BigEndian>().map_err(truncated)?)
            }
            5 => {
                let mut bitfield = vec![0u8; payload_len];
                buf.read_exact(&mut bitfield).map_err(truncated)?;
                Message::Bitfield(bitfield)
            }
            6 | 8 => {
                expect_len(if id == 6 { "request" } else { "cancel" }, payload_len, 12)?;
                let index = buf.read_u32::<BigEndian>().map_err(truncated)?;
                let begin = buf.read_u32::<BigEndian>().map_err(truncated)?;
                let length = buf.read_u32::<BigEndian>().map_err(truncated)?;
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if payload_len < 8 {
                    return Err(ApplicationError::ParserError(
                        "invalid piece message length".into(),
                    ));
                }
                let index = buf.read_u32::<BigEndian>().map_err(truncated)?;
                let begin = buf.read_u32::<BigEndian>().map_err(truncated)?;
                let mut block = vec![0u8; payload_len - 8];
                buf.read_exact(&mut block).map_err(truncated)?;
                Message::Piece {
                    index,
                    begin,
                    block,
                }
            }
            _ => {
                return Err(ApplicationError::ParserError(format!(
                    "unknown message id: {}",
                    id
                )));
            }
        };
        Ok(Some(message))
    }
}

fn expect_len(kind: &str, actual: usize, expected: usize) -> Result<(), ApplicationError> {
    if actual != expected {
        return Err(ApplicationError::ParserError(format!(
            "invalid {} message length: {}",
            kind, actual
        )));
    }
    Ok(())
}

fn truncated(e: io::Error) -> ApplicationError {
    ApplicationError::ParserError(format!("protocol: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_is_68_bytes_with_pstrlen_19() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let buf = handshake.encode();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(Handshake::decode(&buf).unwrap(), handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        let mut buf = Handshake::new([1u8; 20], [2u8; 20]).encode();
        buf[1] = b'b';
        assert!(Handshake::decode(&buf).is_err());
    }

    #[test]
    fn request_layout_is_byte_exact() {
        let buf = Message::Request {
            index: 1,
            begin: 0x4000,
            length: 0x4000,
        }
        .encode();

        assert_eq!(
            buf,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn piece_frame_is_13_plus_block_len() {
        let block = vec![7u8; 300];
        let buf = Message::Piece {
            index: 3,
            begin: 16384,
            block: block.clone(),
        }
        .encode();

        assert_eq!(buf.len(), 13 + 300);
        assert_eq!(
            Message::decode(&buf).unwrap(),
            Some(Message::Piece {
                index: 3,
                begin: 16384,
                block
            })
        );
    }

    #[test]
    fn simple_messages_are_five_bytes() {
        for (msg, id) in [
            (Message::Choke, 0),
            (Message::Unchoke, 1),
            (Message::Interested, 2),
            (Message::NotInterested, 3),
        ] {
            assert_eq!(msg.encode(), vec![0, 0, 0, 1, id]);
        }
    }

    #[test]
    fn decodes_have_bitfield_and_cancel() {
        assert_eq!(
            Message::decode(&[0, 0, 0, 5, 4, 0, 0, 1, 2]).unwrap(),
            Some(Message::Have(258))
        );
        assert_eq!(
            Message::decode(&[0, 0, 0, 3, 5, 0b1010_0000, 0xff]).unwrap(),
            Some(Message::Bitfield(vec![0b1010_0000, 0xff]))
        );

        let cancel = Message::Cancel {
            index: 9,
            begin: 32,
            length: 8,
        };
        assert_eq!(Message::decode(&cancel.encode()).unwrap(), Some(cancel));
    }

    #[test]
    fn zero_length_is_keep_alive() {
        assert_eq!(Message::decode(&[0, 0, 0, 0]).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_id_and_bad_lengths() {
        assert!(Message::decode(&[0, 0, 0, 1, 42]).is_err());
        assert!(Message::decode(&[0, 0, 0, 3, 4, 0, 1]).is_err());
        assert!(Message::decode(&[0, 0, 0, 5, 7, 0, 0, 0, 1]).is_err());
    }
}
