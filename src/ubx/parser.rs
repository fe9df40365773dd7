use super::{
    packets::{MgaAck, NavPvt},
    UbxBuf, UbxChecksum, UbxError, SYNC_1, SYNC_2, UBX_BUFSIZE,
};

// Each state names the field just consumed
#[derive(Copy, Clone)]
enum ParserState {
    Start,
    Sync1,
    Sync2,
    Class {
        class: u8,
        checksum: UbxChecksum,
    },
    Id {
        class: u8,
        id: u8,
        checksum: UbxChecksum,
    },
    Len1 {
        class: u8,
        id: u8,
        len1: u8,
        checksum: UbxChecksum,
    },
    Len2 {
        class: u8,
        id: u8,
        len: u16,
        checksum: UbxChecksum,
    },
    Payload {
        class: u8,
        id: u8,
        len: u16,
        checksum: UbxChecksum,
    },
    Checksum1 {
        class: u8,
        id: u8,
        expect: UbxChecksum,
        found: u8,
    },
}
use ParserState::*;

/// Byte-at-a-time UBX decoder used by the navigation state.
pub struct UbxParser {
    state: ParserState,
    buf: UbxBuf,
}

impl Default for UbxParser {
    fn default() -> Self {
        Self::new()
    }
}

impl UbxParser {
    pub fn new() -> Self {
        Self {
            state: Start,
            buf: UbxBuf::new(),
        }
    }

    fn feed(&mut self, b: u8) -> Option<Result<(u8, u8), UbxError>> {
        match self.state {
            Start => {
                if b == SYNC_1 {
                    self.state = Sync1;
                }
                None
            }
            Sync1 => {
                if b == SYNC_2 {
                    self.state = Sync2;
                } else if b != SYNC_1 {
                    self.state = Start;
                }
                None
            }
            Sync2 => {
                self.state = Class {
                    class: b,
                    checksum: UbxChecksum::new().next(b),
                };
                None
            }
            Class { class, checksum } => {
                self.state = Id {
                    class,
                    id: b,
                    checksum: checksum.next(b),
                };
                None
            }
            Id {
                class,
                id,
                checksum,
            } => {
                self.state = Len1 {
                    class,
                    id,
                    len1: b,
                    checksum: checksum.next(b),
                };
                None
            }
            Len1 {
                class,
                id,
                len1,
                checksum,
            } => {
                let len = u16::from_le_bytes([len1, b]);
                if len as usize > UBX_BUFSIZE {
                    self.state = Start;
                    Some(Err(UbxError::TooLarge(len)))
                } else {
                    self.state = Len2 {
                        class,
                        id,
                        len,
                        checksum: checksum.next(b),
                    };
                    None
                }
            }
            Len2 {
                class,
                id,
                len,
                checksum,
            } => {
                self.buf.clear();
                if len > 0 {
                    self.buf.push(b);
                    self.state = Payload {
                        class,
                        id,
                        len,
                        checksum: checksum.next(b),
                    };
                } else {
                    self.state = Checksum1 {
                        class,
                        id,
                        expect: checksum,
                        found: b,
                    };
                }
                None
            }
            Payload {
                class,
                id,
                len,
                checksum,
            } => {
                if self.buf.len() == len as usize {
                    self.state = Checksum1 {
                        class,
                        id,
                        expect: checksum,
                        found: b,
                    };
                } else {
                    // `len` was bounded by UBX_BUFSIZE in Len1
                    self.buf.push(b);
                    self.state = Payload {
                        class,
                        id,
                        len,
                        checksum: checksum.next(b),
                    };
                }
                None
            }
            Checksum1 {
                class,
                id,
                expect,
                found,
            } => {
                self.state = Start;
                if expect == (found, b) {
                    Some(Ok((class, id)))
                } else {
                    Some(Err(UbxError::BadChecksum {
                        expect: expect.into(),
                        saw: (found, b),
                    }))
                }
            }
        }
    }

    pub fn process_byte(&mut self, b: u8) -> Option<Result<ParsedPacket, UbxError>> {
        self.feed(b).map(|r| {
            r.and_then(|(class, id)| {
                let payload = self.buf.as_slice();
                match (class, id) {
                    (0x05, 0x01) => match payload {
                        [class, id, ..] => Ok(ParsedPacket::AckAck {
                            class: *class,
                            id: *id,
                        }),
                        _ => Err(UbxError::BadPayload),
                    },
                    (0x05, 0x00) => match payload {
                        [class, id, ..] => Ok(ParsedPacket::AckNak {
                            class: *class,
                            id: *id,
                        }),
                        _ => Err(UbxError::BadPayload),
                    },
                    (0x01, 0x07) => bytemuck::try_pod_read_unaligned(payload)
                        .map(ParsedPacket::NavPvt)
                        .map_err(|_| UbxError::BadPayload),
                    (0x13, 0x60) => MgaAck::parse(payload)
                        .map(ParsedPacket::MgaAck)
                        .ok_or(UbxError::BadPayload),
                    _ => Ok(ParsedPacket::OtherPacket { class, id }),
                }
            })
        })
    }
}

#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParsedPacket {
    AckAck { class: u8, id: u8 },
    AckNak { class: u8, id: u8 },

    NavPvt(NavPvt),
    MgaAck(MgaAck),

    OtherPacket { class: u8, id: u8 },
}
