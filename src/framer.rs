use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::ApplicationError;
use crate::protocol::LENGTH_PREFIX;

/// Largest frame accepted from a peer; a 16 KiB block plus headers, or the
/// bitfield of a very large torrent, fits comfortably.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// One complete unit cut from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(Bytes),
    Message(Bytes),
}

/// Splits a peer's byte stream into frames: the handshake first, then
/// length-prefixed messages.
#[derive(Debug)]
pub struct Framer {
    handshake_expected: bool,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            handshake_expected: true,
        }
    }

    /// Total length of the frame at the head of `buf`. Needs 4 buffered bytes.
    fn frame_len(&self, buf: &[u8]) -> usize {
        if self.handshake_expected {
            buf[0] as usize + 49
        } else {
            BigEndian::read_u32(&buf[..LENGTH_PREFIX]) as usize + LENGTH_PREFIX
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Framer {
    type Item = Frame;
    type Error = ApplicationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ApplicationError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = self.frame_len(src);
        if len > MAX_FRAME_LEN {
            return Err(ApplicationError::ProtocolError(format!(
                "frame of {} bytes exceeds limit",
                len
            )));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(len).freeze();
        if self.handshake_expected {
            self.handshake_expected = false;
            Ok(Some(Frame::Handshake(bytes)))
        } else {
            Ok(Some(Frame::Message(bytes)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Handshake, Message};

    fn stream() -> Vec<u8> {
        let mut data = Handshake::new([3u8; 20], [4u8; 20]).encode().to_vec();
        data.extend(Message::Unchoke.encode());
        data.extend([0, 0, 0, 0]);
        data.extend(Message::Bitfield(vec![0xc0]).encode());
        data.extend(
            Message::Piece {
                index: 1,
                begin: 0,
                block: vec![9u8; 40],
            }
            .encode(),
        );
        data
    }

    fn feed(chunks: impl IntoIterator<Item = Vec<u8>>) -> Vec<Frame> {
        let mut framer = Framer::new();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
            while let Some(frame) = framer.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        frames
    }

    #[test]
    fn byte_at_a_time_matches_single_delivery() {
        let data = stream();
        let whole = feed([data.clone()]);
        let trickled = feed(data.iter().map(|b| vec![*b]));

        assert_eq!(whole.len(), 5);
        assert_eq!(whole, trickled);
    }

    #[test]
    fn first_frame_is_the_handshake() {
        let frames = feed([stream()]);
        match &frames[0] {
            Frame::Handshake(bytes) => assert_eq!(bytes.len(), 68),
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(frames[2], Frame::Message(Bytes::from_static(&[0, 0, 0, 0])));
        match &frames[4] {
            Frame::Message(bytes) => assert_eq!(bytes.len(), 13 + 40),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn waits_for_four_bytes_before_sizing() {
        let mut framer = Framer::new();
        let mut buf = BytesMut::from(&[19u8, b'B', b'i'][..]);
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        assert!(framer.handshake_expected);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn frame_split_across_deliveries() {
        let data = stream();
        let (a, b) = data.split_at(70);
        let frames = feed([a.to_vec(), b.to_vec()]);
        assert_eq!(frames, feed([data]));
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut framer = Framer {
            handshake_expected: false,
        };
        let mut buf = BytesMut::from(&[0xffu8, 0xff, 0xff, 0xff][..]);
        assert!(framer.decode(&mut buf).is_err());
    }
}
