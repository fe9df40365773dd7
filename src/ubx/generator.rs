use core::{future::Future, iter::Copied, slice};

use super::{UbxChecksum, FRAME_OVERHEAD, SYNC_1, SYNC_2};
use crate::rb::Producer;

pub trait SendablePacket: Sized {
    type I: Iterator<Item = u8>;

    fn class(&self) -> u8;
    fn id(&self) -> u8;
    fn payload_len(&self) -> usize;
    fn payload_bytes(self) -> Self::I;

    fn to_bytes(self) -> UbxGenerator<Self, Self::I> {
        UbxGenerator(Some(GeneratorState::Sync1 { packet: self }))
    }

    fn packet_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload_len()
    }

    /// Queue the whole frame on `tx`, waiting for room as needed.
    fn send<'a, const N: usize>(self, tx: &'a Producer<u8, N>) -> impl Future<Output = usize> + 'a
    where
        Self: 'a,
        Self::I: 'a,
    {
        tx.async_write_iter(self.to_bytes())
    }
}

/// A frame assembled from an already known class, id and payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawPacket<'a> {
    pub class: u8,
    pub id: u8,
    pub payload: &'a [u8],
}

impl<'a> SendablePacket for RawPacket<'a> {
    type I = Copied<slice::Iter<'a, u8>>;

    fn class(&self) -> u8 {
        self.class
    }

    fn id(&self) -> u8 {
        self.id
    }

    fn payload_len(&self) -> usize {
        self.payload.len()
    }

    fn payload_bytes(self) -> Self::I {
        self.payload.iter().copied()
    }
}

// Each state names the next field to emit
enum GeneratorState<T, I>
where
    T: SendablePacket<I = I>,
{
    Sync1 { packet: T },
    Sync2 { packet: T },
    Class { packet: T },
    Id { packet: T, checksum: UbxChecksum },
    Len1 { packet: T, checksum: UbxChecksum },
    Len2 { packet: T, checksum: UbxChecksum },
    Payload { iter: I, checksum: UbxChecksum },
    Checksum2 { checksum: UbxChecksum },
    Done,
}
use GeneratorState::*;

pub struct UbxGenerator<T, I>(Option<GeneratorState<T, I>>)
where
    T: SendablePacket<I = I>;

impl<T, I> Iterator for UbxGenerator<T, I>
where
    T: SendablePacket<I = I>,
    I: Iterator<Item = u8>,
{
    type Item = u8;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.0.take()?;
        let (next, val) = match state {
            Sync1 { packet } => (Sync2 { packet }, SYNC_1),
            Sync2 { packet } => (Class { packet }, SYNC_2),
            Class { packet } => {
                let val = packet.class();
                let checksum = UbxChecksum::new().next(val);
                (Id { packet, checksum }, val)
            }
            Id { packet, checksum } => {
                let val = packet.id();
                let checksum = checksum.next(val);
                (Len1 { packet, checksum }, val)
            }
            Len1 { packet, checksum } => {
                let val = (packet.payload_len() as u16).to_le_bytes()[0];
                let checksum = checksum.next(val);
                (Len2 { packet, checksum }, val)
            }
            Len2 { packet, checksum } => {
                let val = (packet.payload_len() as u16).to_le_bytes()[1];
                let next = Payload {
                    iter: packet.payload_bytes(),
                    checksum: checksum.next(val),
                };
                (next, val)
            }
            Payload { mut iter, checksum } => match iter.next() {
                Some(val) => {
                    let checksum = checksum.next(val);
                    (Payload { iter, checksum }, val)
                }
                None => (Checksum2 { checksum }, checksum.0),
            },
            Checksum2 { checksum } => (Done, checksum.1),
            Done => {
                self.0 = Some(Done);
                return None;
            }
        };
        self.0 = Some(next);
        Some(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubx::{validate, Validation};

    #[test]
    fn raw_packet_produces_valid_frame() {
        let packet = RawPacket {
            class: 0x05,
            id: 0x01,
            payload: &[0x06, 0x8a],
        };
        assert_eq!(packet.packet_len(), 10);
        let mut generator = packet.to_bytes();
        let bytes: Vec<u8> = generator.by_ref().collect();
        assert_eq!(bytes, [0xb5, 0x62, 0x05, 0x01, 0x02, 0x00, 0x06, 0x8a, 0x98, 0xc1]);
        assert_eq!(validate(&bytes), Validation::Valid(10));
        // Stays exhausted
        assert_eq!(generator.next(), None);
        assert_eq!(generator.next(), None);
    }

    #[test]
    fn empty_payload() {
        let bytes: Vec<u8> = RawPacket {
            class: 0x01,
            id: 0x03,
            payload: &[],
        }
        .to_bytes()
        .collect();
        assert_eq!(bytes, [0xb5, 0x62, 0x01, 0x03, 0x00, 0x00, 0x04, 0x0d]);
    }
}
