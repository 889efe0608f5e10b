//! Wire-format definitions for broadcast payloads.
//!
//! Every datagram exchanged between nodes carries exactly one [`Payload`].
//! This module is responsible for:
//! - Defining the on-wire binary layout (header fields, content, vector clock).
//! - Serialising a [`Payload`] into a byte buffer ready for transmission.
//! - Deserialising a raw datagram back into a [`Payload`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Packet UID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Sender ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Owner ID                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Is ACK     |             Content (N bytes) ...             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Vector clock: one u32 per entry (node count + 1)     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The content length is not stored: it is whatever remains of the datagram
//! after the header and the fixed-size vector clock.
//!
//! Total header size: [`HEADER_LEN`] = 13 bytes.
//! packet_uid(4) + sender_id(4) + owner_id(4) + is_ack(1)

use std::fmt;

use thiserror::Error;

use crate::hosts::NodeId;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 13;

/// Byte length of one vector clock entry.
pub const CLOCK_ENTRY_LEN: usize = 4;

/// Largest datagram we ever put on (or read from) the wire.
pub const MAX_DATAGRAM: usize = 65_535;

// Byte offsets of each field within the serialised header.
const OFF_UID: usize = 0;
const OFF_SENDER: usize = 4;
const OFF_OWNER: usize = 8;
const OFF_ACK: usize = 12;

/// One broadcast datagram: a piece of application content plus the
/// bookkeeping the link and broadcast layers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Sequence number chosen by the owning node (starts at 1).
    pub packet_uid: u32,
    /// Node that originated the message.
    pub owner_id: NodeId,
    /// Node that put this datagram on the wire.
    ///
    /// Differs from `owner_id` when the message is relayed.
    pub sender_id: NodeId,
    /// `true` for link-level acknowledgements.
    pub is_ack: bool,
    /// Raw application content.
    pub buffer: Vec<u8>,
    /// Per-node delivered counters at the owner when it broadcast this
    /// message, indexed by node id.
    pub vector_clock: Vec<u32>,
}

impl Payload {
    /// A data payload owned and sent by `owner_id`, with a zeroed clock of
    /// `clock_len` entries.
    pub fn new(owner_id: NodeId, packet_uid: u32, buffer: Vec<u8>, clock_len: usize) -> Self {
        Self {
            packet_uid,
            owner_id,
            sender_id: owner_id,
            is_ack: false,
            buffer,
            vector_clock: vec![0; clock_len],
        }
    }

    /// The acknowledgement a receiver sends back for this payload.
    ///
    /// `sender_id` is restamped by the sender loop, so it is left untouched.
    pub fn to_ack(&self) -> Self {
        Self {
            is_ack: true,
            ..self.clone()
        }
    }

    /// Number of bytes [`encode`](Self::encode) will produce.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.buffer.len() + self.vector_clock.len() * CLOCK_ENTRY_LEN
    }

    /// Serialise this payload into a newly allocated byte vector.
    ///
    /// Fails only when the result would not fit in a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let len = self.encoded_len();
        if len > MAX_DATAGRAM {
            return Err(PacketError::TooLarge { len });
        }

        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&self.packet_uid.to_be_bytes());
        buf.extend_from_slice(&self.sender_id.to_be_bytes());
        buf.extend_from_slice(&self.owner_id.to_be_bytes());
        buf.push(u8::from(self.is_ack));
        buf.extend_from_slice(&self.buffer);
        for entry in &self.vector_clock {
            buf.extend_from_slice(&entry.to_be_bytes());
        }

        debug_assert_eq!(buf.len(), len);
        Ok(buf)
    }

    /// Parse a [`Payload`] from one received datagram.
    ///
    /// `clock_len` is the number of vector clock entries every node appends
    /// (configured node count + 1).
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the remaining bytes cannot hold the vector clock, or
    /// - the ack flag is neither 0 nor 1.
    pub fn decode(buf: &[u8], clock_len: usize) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort { len: buf.len() });
        }

        let clock_bytes = clock_len * CLOCK_ENTRY_LEN;
        let needed = HEADER_LEN + clock_bytes;
        if buf.len() < needed {
            return Err(PacketError::ClockTruncated {
                len: buf.len(),
                needed,
            });
        }

        let is_ack = match buf[OFF_ACK] {
            0 => false,
            1 => true,
            other => return Err(PacketError::InvalidAckFlag(other)),
        };

        let content_end = buf.len() - clock_bytes;
        let vector_clock = buf[content_end..]
            .chunks_exact(CLOCK_ENTRY_LEN)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Payload {
            packet_uid: read_u32(buf, OFF_UID),
            sender_id: read_u32(buf, OFF_SENDER),
            owner_id: read_u32(buf, OFF_OWNER),
            is_ack,
            buffer: buf[HEADER_LEN..content_end].to_vec(),
            vector_clock,
        })
    }

    /// Content rendered for logs and the output file.
    pub fn content(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{uid={} owner={} sender={} content={:?} vc={:?}}}",
            if self.is_ack { "ACK" } else { "DATA" },
            self.packet_uid,
            self.owner_id,
            self.sender_id,
            self.content(),
            self.vector_clock,
        )
    }
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the fixed header.
    #[error("datagram of {len} bytes is too short to contain a header")]
    BufferTooShort { len: usize },
    /// Datagram holds a header but not the full vector clock.
    #[error("datagram of {len} bytes cannot hold the vector clock ({needed} bytes needed)")]
    ClockTruncated { len: usize, needed: usize },
    /// Ack byte is not a boolean.
    #[error("invalid ack flag {0:#04x}")]
    InvalidAckFlag(u8),
    /// Encoded payload exceeds [`MAX_DATAGRAM`].
    #[error("encoded payload of {len} bytes exceeds the datagram limit")]
    TooLarge { len: usize },
}

/// Peek at the ack flag of an encoded datagram without decoding it.
pub fn is_ack_datagram(buf: &[u8]) -> bool {
    buf.get(OFF_ACK) == Some(&1)
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_payload(uid: u32, owner: u32, sender: u32, content: &[u8], clock: &[u32]) -> Payload {
        Payload {
            packet_uid: uid,
            owner_id: owner,
            sender_id: sender,
            is_ack: false,
            buffer: content.to_vec(),
            vector_clock: clock.to_vec(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let p = make_payload(42, 1, 3, b"hello", &[0, 4, 0, 2]);
        let decoded = Payload::decode(&p.encode().unwrap(), 4).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn ack_flag_survives_roundtrip() {
        let p = make_payload(7, 2, 2, b"7", &[0, 0, 0]).to_ack();
        let decoded = Payload::decode(&p.encode().unwrap(), 3).unwrap();
        assert!(decoded.is_ack);
        assert_eq!(decoded.buffer, b"7");
    }

    #[test]
    fn empty_content_roundtrip() {
        let p = make_payload(1, 1, 1, b"", &[0, 0]);
        let bytes = p.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 2 * CLOCK_ENTRY_LEN);
        assert_eq!(Payload::decode(&bytes, 2).unwrap().buffer, Vec::<u8>::new());
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let p = make_payload(0x0102_0304, 0x0a0b_0c0d, 0x0506_0708, b"", &[]);
        let bytes = p.encode().unwrap();
        assert_eq!(&bytes[OFF_UID..OFF_UID + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_SENDER..OFF_SENDER + 4], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[OFF_OWNER..OFF_OWNER + 4], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(bytes[OFF_ACK], 0);
    }

    #[test]
    fn clock_follows_content() {
        let p = make_payload(1, 1, 1, b"ab", &[0, 0x0000_0102]);
        let bytes = p.encode().unwrap();
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 2], b"ab");
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 1, 2]);
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(
            Payload::decode(&[], 0),
            Err(PacketError::BufferTooShort { len: 0 })
        );
    }

    #[test]
    fn decode_short_header_returns_error() {
        assert_eq!(
            Payload::decode(&[0u8; HEADER_LEN - 1], 0),
            Err(PacketError::BufferTooShort { len: HEADER_LEN - 1 })
        );
    }

    #[test]
    fn decode_missing_clock_returns_error() {
        let bytes = make_payload(1, 1, 1, b"", &[1, 2]).encode().unwrap();
        assert_eq!(
            Payload::decode(&bytes, 3),
            Err(PacketError::ClockTruncated {
                len: bytes.len(),
                needed: HEADER_LEN + 12,
            })
        );
    }

    #[test]
    fn decode_rejects_garbage_ack_flag() {
        let mut bytes = make_payload(1, 1, 1, b"x", &[]).encode().unwrap();
        bytes[OFF_ACK] = 9;
        assert_eq!(Payload::decode(&bytes, 0), Err(PacketError::InvalidAckFlag(9)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let p = make_payload(1, 1, 1, &vec![0u8; MAX_DATAGRAM], &[0]);
        assert!(matches!(p.encode(), Err(PacketError::TooLarge { .. })));
    }

    #[test]
    fn largest_content_fits_exactly() {
        let clock = [0u32; 4];
        let content = vec![b'x'; MAX_DATAGRAM - HEADER_LEN - clock.len() * CLOCK_ENTRY_LEN];
        let p = make_payload(1, 1, 1, &content, &clock);
        let bytes = p.encode().unwrap();
        assert_eq!(bytes.len(), MAX_DATAGRAM);
        assert_eq!(Payload::decode(&bytes, clock.len()).unwrap(), p);
    }

    #[test]
    fn peek_ack_flag() {
        let p = make_payload(1, 1, 1, b"x", &[0]);
        assert!(!is_ack_datagram(&p.encode().unwrap()));
        assert!(is_ack_datagram(&p.to_ack().encode().unwrap()));
        assert!(!is_ack_datagram(&[]));
    }

    #[test]
    fn to_ack_keeps_identity() {
        let p = make_payload(5, 2, 3, b"5", &[0, 1, 0]);
        let ack = p.to_ack();
        assert!(ack.is_ack);
        assert_eq!((ack.owner_id, ack.packet_uid), (p.owner_id, p.packet_uid));
        assert_eq!(ack.vector_clock, p.vector_clock);
    }
}
