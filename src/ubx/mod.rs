//! UBX framing.
//!
//! Wire format: `0xB5 0x62 class id len_lo len_hi payload.. ck_a ck_b`, with
//! the checksum running over everything between the sync bytes and the
//! checksum itself.

use tinyvec::ArrayVec;

pub mod cfg;
pub mod demux;
pub mod generator;
pub mod packets;
pub mod parser;
pub mod window;

pub use demux::{split_frames, validate_batch, BatchSummary, FrameIter};
pub use generator::{RawPacket, SendablePacket, UbxGenerator};
pub use parser::{ParsedPacket, UbxParser};
pub use window::FrameWindow;

pub const SYNC_1: u8 = 0xb5;
pub const SYNC_2: u8 = 0x62;

/// Sync bytes, class, id, length and checksum.
pub const FRAME_OVERHEAD: usize = 8;

const UBX_BUFSIZE: usize = 256;
type UbxBuf = ArrayVec<[u8; UBX_BUFSIZE]>;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UbxChecksum(pub u8, pub u8);

impl UbxChecksum {
    pub const fn new() -> Self {
        Self(0, 0)
    }

    pub const fn next(self, byte: u8) -> Self {
        let Self(a, b) = self;
        let a = a.wrapping_add(byte);
        Self(a, b.wrapping_add(a))
    }

    pub fn over(bytes: &[u8]) -> Self {
        bytes.iter().fold(Self::new(), |ck, &b| ck.next(b))
    }
}

impl PartialEq<(u8, u8)> for UbxChecksum {
    fn eq(&self, (other_a, other_b): &(u8, u8)) -> bool {
        let Self(a, b) = self;
        a == other_a && b == other_b
    }
}

impl From<UbxChecksum> for (u8, u8) {
    fn from(UbxChecksum(a, b): UbxChecksum) -> Self {
        (a, b)
    }
}

/// Errors from the byte-wise [`UbxParser`].
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UbxError {
    #[error("checksum mismatch: expected {expect:02x?}, saw {saw:02x?}")]
    BadChecksum { expect: (u8, u8), saw: (u8, u8) },
    #[error("payload does not match its message layout")]
    BadPayload,
    #[error("payload of {0} bytes exceeds the parser buffer")]
    TooLarge(u16),
}

/// Why a byte window does not hold a frame at offset 0.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FramingError {
    #[error("missing UBX sync bytes")]
    BadMagic,
    #[error("checksum mismatch: expected {expect:02x?}, saw {saw:02x?}")]
    BadChecksum { expect: (u8, u8), saw: (u8, u8) },
    #[error("truncated frame: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },
}

/// Outcome of looking for a frame at the start of a byte window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Validation {
    /// A complete, checksum-correct frame occupies this many leading bytes.
    Valid(usize),
    /// More bytes are needed before anything can be decided.
    Incomplete,
    /// Bad sync bytes or bad checksum at this offset.
    Invalid,
}

/// Classify the frame starting at `bytes[0]`. Trailing bytes are ignored.
pub fn validate(bytes: &[u8]) -> Validation {
    match Frame::parse(bytes) {
        Ok(frame) => Validation::Valid(frame.len()),
        Err(FramingError::Truncated { .. }) => Validation::Incomplete,
        Err(_) => Validation::Invalid,
    }
}

/// Payload length declared in a header, if the header has arrived.
pub fn declared_len(bytes: &[u8]) -> Option<usize> {
    match bytes {
        [_, _, _, _, lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi]) as usize),
        _ => None,
    }
}

/// Identifies a message type for coalescing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageKey {
    pub class_id: u8,
    pub msg_id: u8,
}

impl MessageKey {
    pub const fn new(class_id: u8, msg_id: u8) -> Self {
        Self { class_id, msg_id }
    }
}

/// A checksum-verified frame borrowed from the buffer it was found in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    raw: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FramingError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FramingError::Truncated {
                needed: FRAME_OVERHEAD,
                available: bytes.len(),
            });
        }
        if bytes[0] != SYNC_1 || bytes[1] != SYNC_2 {
            return Err(FramingError::BadMagic);
        }
        let total = declared_len(bytes).unwrap_or_default() + FRAME_OVERHEAD;
        if bytes.len() < total {
            return Err(FramingError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }

        let raw = &bytes[..total];
        let expect = UbxChecksum::over(&raw[2..total - 2]);
        let saw = (raw[total - 2], raw[total - 1]);
        if expect != saw {
            return Err(FramingError::BadChecksum {
                expect: expect.into(),
                saw,
            });
        }
        Ok(Self { raw })
    }

    /// Caller guarantees `raw` is exactly one frame that passed [`validate`].
    pub(crate) fn from_validated(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    pub fn class_id(&self) -> u8 {
        self.raw[2]
    }

    pub fn msg_id(&self) -> u8 {
        self.raw[3]
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.class_id(), self.msg_id())
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.raw[6..self.raw.len() - 2]
    }

    pub fn checksum(&self) -> (u8, u8) {
        (self.raw[self.raw.len() - 2], self.raw[self.raw.len() - 1])
    }

    /// Encoded length, header and checksum included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// The frame exactly as it appeared on the wire.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: [u8; 8] = [0xb5, 0x62, 0x01, 0x03, 0x00, 0x00, 0x04, 0x0d];

    #[test]
    fn zero_payload_frame() {
        assert_eq!(validate(&POLL), Validation::Valid(8));
        let frame = Frame::parse(&POLL).unwrap();
        assert_eq!(frame.key(), MessageKey::new(0x01, 0x03));
        assert!(frame.payload().is_empty());
        assert_eq!(frame.checksum(), (0x04, 0x0d));
    }

    #[test]
    fn flipped_checksum_is_invalid() {
        let mut bad = POLL;
        bad[7] = 0x0e;
        assert_eq!(validate(&bad), Validation::Invalid);
        assert_eq!(
            Frame::parse(&bad),
            Err(FramingError::BadChecksum {
                expect: (0x04, 0x0d),
                saw: (0x04, 0x0e)
            })
        );
    }

    #[test]
    fn short_input_is_incomplete() {
        assert_eq!(validate(&POLL[..4]), Validation::Incomplete);
        assert_eq!(validate(&[]), Validation::Incomplete);
    }

    #[test]
    fn declared_length_beyond_input_is_incomplete() {
        let header = [0xb5, 0x62, 0x01, 0x07, 0x5c, 0x00, 0, 0, 0, 0];
        assert_eq!(validate(&header), Validation::Incomplete);
        assert_eq!(
            Frame::parse(&header),
            Err(FramingError::Truncated {
                needed: 100,
                available: 10
            })
        );
    }

    #[test]
    fn checksum_is_a_running_pair() {
        assert_eq!(UbxChecksum::over(&[0x01, 0x03, 0x00, 0x00]), (0x04, 0x0d));
        let ck = UbxChecksum::over(&[0xff; 300]);
        let (mut a, mut b) = (0u8, 0u8);
        for _ in 0..300 {
            a = a.wrapping_add(0xff);
            b = b.wrapping_add(a);
        }
        assert_eq!(ck, (a, b));
    }
}
