use chrono::{DateTime, Utc};

use crate::{
    fix::FixRecord,
    ubx::{packets::MgaAck, packets::NavPvt, ParsedPacket, UbxError, UbxParser},
};

/// Consumer of raw receiver bytes that owns the position and time semantics.
pub trait NavigationState {
    fn update(&mut self, byte: u8);

    /// The current fix, if the receiver has one.
    fn fix(&self) -> Option<FixRecord>;
}

/// Navigation state built from UBX NAV-PVT solutions.
#[derive(Default)]
pub struct UbxNavigation {
    parser: UbxParser,
    last_navpvt: Option<NavPvt>,
    last_mga_ack: Option<MgaAck>,
    last_error: Option<UbxError>,
    packets: usize,
    // A NAV-PVT arrived since the last `take_fresh_datetime`
    fresh: bool,
}

impl UbxNavigation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_navpvt(&self) -> Option<&NavPvt> {
        self.last_navpvt.as_ref()
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        self.last_navpvt.as_ref().and_then(NavPvt::datetime)
    }

    /// Receiver time of a solution that arrived since the previous call.
    /// Repeated calls without new solutions return `None`, so a stale time is
    /// never mistaken for a current one.
    pub fn take_fresh_datetime(&mut self) -> Option<DateTime<Utc>> {
        if !core::mem::take(&mut self.fresh) {
            return None;
        }
        self.datetime()
    }

    pub fn last_mga_ack(&self) -> Option<MgaAck> {
        self.last_mga_ack
    }

    pub fn last_error(&self) -> Option<UbxError> {
        self.last_error
    }

    /// Packets decoded without error.
    pub fn packets(&self) -> usize {
        self.packets
    }
}

impl NavigationState for UbxNavigation {
    fn update(&mut self, byte: u8) {
        match self.parser.process_byte(byte) {
            None => {}
            Some(Ok(packet)) => {
                self.packets += 1;
                match packet {
                    ParsedPacket::NavPvt(pvt) => {
                        self.last_navpvt = Some(pvt);
                        self.fresh = true;
                    }
                    ParsedPacket::MgaAck(ack) => {
                        if !ack.accepted {
                            warn!("assistance message {=u8:x} rejected: {=u8}", ack.msg_id, ack.info_code);
                        }
                        self.last_mga_ack = Some(ack);
                    }
                    ParsedPacket::AckNak { class, id } => {
                        warn!("receiver NAK for {=u8:x}/{=u8:x}", class, id);
                    }
                    ParsedPacket::AckAck { .. } | ParsedPacket::OtherPacket { .. } => {}
                }
            }
            Some(Err(e)) => {
                debug!("dropping UBX packet: {}", e);
                self.last_error = Some(e);
            }
        }
    }

    fn fix(&self) -> Option<FixRecord> {
        self.last_navpvt.as_ref().and_then(NavPvt::fix)
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;
    use crate::ubx::{RawPacket, SendablePacket};

    fn feed(nav: &mut UbxNavigation, packet: RawPacket<'_>) {
        packet.to_bytes().for_each(|b| nav.update(b));
    }

    #[test]
    fn fix_requires_fix_ok() {
        let mut pvt = NavPvt::zeroed();
        pvt.fix_type = 3;
        pvt.lat = 370_000_000;
        pvt.lon = -1_220_000_000;
        pvt.h_msl = 30_000;

        let mut nav = UbxNavigation::new();
        feed(&mut nav, RawPacket { class: 0x01, id: 0x07, payload: bytemuck::bytes_of(&pvt) });
        assert_eq!(nav.packets(), 1);
        assert!(nav.fix().is_none());

        pvt.flags = NavPvt::GNSS_FIX_OK;
        feed(&mut nav, RawPacket { class: 0x01, id: 0x07, payload: bytemuck::bytes_of(&pvt) });
        let fix = nav.fix().unwrap();
        assert!((fix.latitude - 37.0).abs() < 1e-9);
        assert!((fix.longitude + 122.0).abs() < 1e-9);
        assert_eq!(fix.altitude, 30.0);
    }

    #[test]
    fn records_errors() {
        let mut nav = UbxNavigation::new();
        // NAV-PVT with a truncated payload
        feed(&mut nav, RawPacket { class: 0x01, id: 0x07, payload: &[0; 4] });
        assert_eq!(nav.last_error(), Some(UbxError::BadPayload));
        assert!(nav.last_navpvt().is_none());
    }

    #[test]
    fn fresh_time_is_handed_out_once() {
        let mut pvt = NavPvt::zeroed();
        pvt.year = 2025;
        pvt.month = 6;
        pvt.day = 1;
        pvt.valid = NavPvt::VALID_DATE | NavPvt::VALID_TIME;

        let mut nav = UbxNavigation::new();
        assert_eq!(nav.take_fresh_datetime(), None);
        feed(&mut nav, RawPacket { class: 0x01, id: 0x07, payload: bytemuck::bytes_of(&pvt) });
        assert!(nav.take_fresh_datetime().is_some());
        assert_eq!(nav.take_fresh_datetime(), None);
        assert!(nav.datetime().is_some());
    }
}
