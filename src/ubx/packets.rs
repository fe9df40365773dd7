use core::{
    array,
    iter::{Chain, FlatMap},
};

use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use tinyvec::ArrayVecIterator;

use super::{cfg::CfgItem, generator::SendablePacket};
use crate::fix::FixRecord;

////////////////////////////////////////////////////////////////////////////////
// Packets which can be parsed /////////////////////////////////////////////////
////////////////////////////////////////////////////////////////////////////////

// SAFETY: All fields are naturally aligned, so there is no padding.
// Also, this device has the same endianness as UBX (little)
#[repr(C)]
#[derive(Pod, Zeroable, Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NavPvt {
    pub i_tow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,

    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    pub valid: u8,

    pub t_acc: u32,
    pub nano: i32,

    pub fix_type: u8,
    pub flags: u8,
    pub flags2: u8,
    pub sum_sv: u8,

    pub lon: i32,
    pub lat: i32,
    pub height: i32,
    pub h_msl: i32,
    pub h_acc: u32,
    pub v_acc: u32,
    pub vel_n: i32,
    pub vel_e: i32,
    pub vel_d: i32,
    pub g_speed: i32,
    pub head_mot: i32,
    pub s_acc: u32,
    pub head_acc: u32,

    pub p_dop: u16,
    pub flags3: u16,

    pub reserved0_a: [u8; 4],
    pub head_veh: i32,

    pub mag_dec: i16,
    pub mag_acc: u16,
}

impl NavPvt {
    pub const VALID_DATE: u8 = 1 << 0;
    pub const VALID_TIME: u8 = 1 << 1;
    pub const GNSS_FIX_OK: u8 = 1 << 0;

    pub fn lat_degrees(&self) -> f64 {
        f64::from(self.lat) * 1e-7
    }

    pub fn lon_degrees(&self) -> f64 {
        f64::from(self.lon) * 1e-7
    }

    /// Height above mean sea level in metres.
    pub fn altitude(&self) -> f64 {
        f64::from(self.h_msl) / 1000.0
    }

    /// 2D, 3D or GNSS + dead reckoning, with the receiver's fix-OK flag set.
    pub fn has_fix(&self) -> bool {
        matches!(self.fix_type, 2..=4) && self.flags & Self::GNSS_FIX_OK != 0
    }

    pub fn fix(&self) -> Option<FixRecord> {
        self.has_fix().then(|| FixRecord {
            latitude: self.lat_degrees(),
            longitude: self.lon_degrees(),
            altitude: self.altitude(),
        })
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        let valid = Self::VALID_DATE | Self::VALID_TIME;
        if self.valid & valid != valid {
            return None;
        }
        NaiveDate::from_ymd_opt(self.year.into(), self.month.into(), self.day.into())?
            .and_hms_opt(self.hour.into(), self.min.into(), self.sec.into())
            .map(|naive| naive.and_utc())
    }
}

/// UBX-MGA-ACK-DATA0: the receiver's verdict on one assistance message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MgaAck {
    pub accepted: bool,
    pub info_code: u8,
    pub msg_id: u8,
}

impl MgaAck {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [kind, _version, info_code, msg_id, _, _, _, _] => Some(Self {
                accepted: *kind == 1,
                info_code: *info_code,
                msg_id: *msg_id,
            }),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Packets which can be generated //////////////////////////////////////////////
////////////////////////////////////////////////////////////////////////////////

pub struct CfgValSet<const N: usize> {
    pub ram: bool,
    pub bbr: bool,
    pub flash: bool,
    pub items: [CfgItem; N],
}

impl<const N: usize> CfgValSet<N> {
    pub fn layers(&self) -> u8 {
        (if self.ram { 1 << 0 } else { 0 })
            | (if self.bbr { 1 << 1 } else { 0 })
            | (if self.flash { 1 << 2 } else { 0 })
    }
}

impl<const N: usize> SendablePacket for CfgValSet<N> {
    type I = Chain<
        array::IntoIter<u8, 4>,
        FlatMap<
            array::IntoIter<CfgItem, N>,
            ArrayVecIterator<[u8; 12]>,
            fn(CfgItem) -> ArrayVecIterator<[u8; 12]>,
        >,
    >;

    fn class(&self) -> u8 {
        0x06
    }

    fn id(&self) -> u8 {
        0x8a
    }

    fn payload_len(&self) -> usize {
        4 + self.items.iter().map(|i| i.packed_size()).sum::<usize>()
    }

    fn payload_bytes(self) -> Self::I {
        let to_bytes: fn(CfgItem) -> ArrayVecIterator<[u8; 12]> = CfgItem::into_bytes;
        [0x00, self.layers(), 0x00, 0x00]
            .into_iter()
            .chain(self.items.into_iter().flat_map(to_bytes))
    }
}

const MGA_CLASS: u8 = 0x13;
const MGA_INI: u8 = 0x40;

/// Leap seconds unknown; the receiver uses its own value.
pub const LEAP_SECONDS_UNKNOWN: i8 = -128;

/// UBX-MGA-INI-TIME_UTC: coarse UTC time to seed the receiver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MgaIniTimeUtc {
    pub leap_secs: i8,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub ns: u32,
    pub t_acc_s: u16,
    pub t_acc_ns: u32,
}

impl MgaIniTimeUtc {
    pub fn from_datetime(now: &DateTime<Utc>, t_acc_s: u16) -> Self {
        Self {
            leap_secs: LEAP_SECONDS_UNKNOWN,
            year: u16::try_from(now.year()).unwrap_or_default(),
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            // chrono folds a leap second into the nanoseconds
            second: now.second() as u8,
            ns: now.nanosecond().min(999_999_999),
            t_acc_s,
            t_acc_ns: 0,
        }
    }
}

impl SendablePacket for MgaIniTimeUtc {
    type I = array::IntoIter<u8, 24>;

    fn class(&self) -> u8 {
        MGA_CLASS
    }

    fn id(&self) -> u8 {
        MGA_INI
    }

    fn payload_len(&self) -> usize {
        24
    }

    fn payload_bytes(self) -> Self::I {
        let mut p = [0u8; 24];
        p[0] = 0x10; // type
        p[1] = 0x00; // version
        p[2] = 0x00; // ref: on receipt
        p[3] = self.leap_secs as u8;
        p[4..6].copy_from_slice(&self.year.to_le_bytes());
        p[6] = self.month;
        p[7] = self.day;
        p[8] = self.hour;
        p[9] = self.minute;
        p[10] = self.second;
        p[12..16].copy_from_slice(&self.ns.to_le_bytes());
        p[16..18].copy_from_slice(&self.t_acc_s.to_le_bytes());
        p[20..24].copy_from_slice(&self.t_acc_ns.to_le_bytes());
        p.into_iter()
    }
}

/// UBX-MGA-INI-POS_LLH: a-priori position.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MgaIniPosLlh {
    /// Degrees * 1e7
    pub lat: i32,
    /// Degrees * 1e7
    pub lon: i32,
    /// Centimetres
    pub alt: i32,
    /// Centimetres
    pub pos_acc: u32,
}

fn scaled(value: f64, factor: f64) -> i32 {
    let v = value * factor;
    // `as` saturates at the i32 bounds
    (if v >= 0.0 { v + 0.5 } else { v - 0.5 }) as i32
}

impl MgaIniPosLlh {
    pub fn from_fix(fix: &FixRecord, pos_acc_cm: u32) -> Self {
        Self {
            lat: scaled(fix.latitude, 1e7),
            lon: scaled(fix.longitude, 1e7),
            alt: scaled(fix.altitude, 1e2),
            pos_acc: pos_acc_cm,
        }
    }
}

impl SendablePacket for MgaIniPosLlh {
    type I = array::IntoIter<u8, 20>;

    fn class(&self) -> u8 {
        MGA_CLASS
    }

    fn id(&self) -> u8 {
        MGA_INI
    }

    fn payload_len(&self) -> usize {
        20
    }

    fn payload_bytes(self) -> Self::I {
        let mut p = [0u8; 20];
        p[0] = 0x01; // type
        p[1] = 0x00; // version
        p[4..8].copy_from_slice(&self.lat.to_le_bytes());
        p[8..12].copy_from_slice(&self.lon.to_le_bytes());
        p[12..16].copy_from_slice(&self.alt.to_le_bytes());
        p[16..20].copy_from_slice(&self.pos_acc.to_le_bytes());
        p.into_iter()
    }
}

/// UBX-UPD-SOS: ask the receiver to write its navigation state to the
/// backup store, so the next start can skip most of the search.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdSosCreateBackup;

impl SendablePacket for UpdSosCreateBackup {
    type I = array::IntoIter<u8, 4>;

    fn class(&self) -> u8 {
        0x09
    }

    fn id(&self) -> u8 {
        0x14
    }

    fn payload_len(&self) -> usize {
        4
    }

    fn payload_bytes(self) -> Self::I {
        // cmd 0: create backup
        [0x00, 0x00, 0x00, 0x00].into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubx::{validate, Frame, Validation};
    use chrono::TimeZone;

    #[test]
    fn time_init_layout() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let bytes: Vec<u8> = MgaIniTimeUtc::from_datetime(&now, 2).to_bytes().collect();
        assert_eq!(validate(&bytes), Validation::Valid(32));
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!((frame.class_id(), frame.msg_id()), (0x13, 0x40));
        let p = frame.payload();
        assert_eq!(p[0], 0x10);
        assert_eq!(p[3] as i8, LEAP_SECONDS_UNKNOWN);
        assert_eq!(u16::from_le_bytes([p[4], p[5]]), 2025);
        assert_eq!(&p[6..11], &[3, 14, 15, 9, 26]);
        assert_eq!(u16::from_le_bytes([p[16], p[17]]), 2);
    }

    #[test]
    fn position_is_scaled_and_rounded() {
        let fix = FixRecord {
            latitude: 37.0,
            longitude: -122.00000006,
            altitude: 30.004,
        };
        let pos = MgaIniPosLlh::from_fix(&fix, 300_000);
        assert_eq!(pos.lat, 370_000_000);
        assert_eq!(pos.lon, -1_220_000_001);
        assert_eq!(pos.alt, 3000);

        let bytes: Vec<u8> = pos.to_bytes().collect();
        let frame = Frame::parse(&bytes).unwrap();
        let p = frame.payload();
        assert_eq!(p.len(), 20);
        assert_eq!(p[0], 0x01);
        assert_eq!(i32::from_le_bytes(p[4..8].try_into().unwrap()), 370_000_000);
        assert_eq!(u32::from_le_bytes(p[16..20].try_into().unwrap()), 300_000);
    }

    #[test]
    fn navpvt_datetime_requires_valid_flags() {
        let mut pvt = NavPvt::zeroed();
        pvt.year = 2024;
        pvt.month = 2;
        pvt.day = 29;
        pvt.hour = 23;
        pvt.min = 59;
        pvt.sec = 1;
        assert_eq!(pvt.datetime(), None);
        pvt.valid = NavPvt::VALID_DATE | NavPvt::VALID_TIME;
        assert_eq!(
            pvt.datetime(),
            Some(Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 1).unwrap())
        );
    }

    #[test]
    fn navpvt_fix_needs_fix_ok() {
        let mut pvt = NavPvt::zeroed();
        pvt.fix_type = 3;
        pvt.lat = 370_000_000;
        pvt.lon = -1_220_000_000;
        pvt.h_msl = 30_000;
        assert_eq!(pvt.fix(), None);
        pvt.flags = NavPvt::GNSS_FIX_OK;
        let fix = pvt.fix().unwrap();
        assert!((fix.latitude - 37.0).abs() < 1e-9);
        assert!((fix.longitude + 122.0).abs() < 1e-9);
        assert_eq!(fix.altitude, 30.0);
    }

    #[test]
    fn sos_backup_layout() {
        let bytes: Vec<u8> = UpdSosCreateBackup.to_bytes().collect();
        assert_eq!(
            bytes,
            [0xb5, 0x62, 0x09, 0x14, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x21, 0xec]
        );
        assert_eq!(validate(&bytes), Validation::Valid(12));
    }
}
