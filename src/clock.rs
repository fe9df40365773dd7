//! Wall-clock time kept by a battery-backed calendar.
//!
//! The calendar keeps counting through resets, so it can seed the receiver's
//! time before the receiver has produced one of its own. A marker word in a
//! backup register records that the calendar was set from receiver time; a
//! calendar that was never set reads as unknown rather than as its reset date.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::fix::BackupRegisters;

/// Hardware calendar counting UTC.
pub trait Calendar {
    /// The current reading, or `None` if the registers hold no valid date.
    fn read(&self) -> Option<NaiveDateTime>;

    fn write(&mut self, time: &NaiveDateTime);
}

pub struct WallClock<C, R> {
    calendar: C,
    regs: R,
    marker: usize,
}

impl<C: Calendar, R: BackupRegisters> WallClock<C, R> {
    const MAGIC: u32 = 0x434c_4b53;

    /// `marker` is the index of the backup register holding the set marker.
    pub fn new(calendar: C, regs: R, marker: usize) -> Self {
        Self {
            calendar,
            regs,
            marker,
        }
    }

    pub fn is_set(&self) -> bool {
        self.regs.read_register(self.marker) == Self::MAGIC
    }

    /// Calendar time, or `None` if the calendar was never set.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        if !self.is_set() {
            return None;
        }
        self.calendar.read().map(|t| t.and_utc())
    }

    /// Set the calendar to `time` when it is unset or off by more than
    /// `tolerance_ms`. Returns whether the calendar was written.
    pub fn sync(&mut self, time: DateTime<Utc>, tolerance_ms: u32) -> bool {
        if let Some(current) = self.now() {
            let drift = time.signed_duration_since(current).num_milliseconds();
            if drift.unsigned_abs() <= u64::from(tolerance_ms) {
                return false;
            }
            debug!("calendar drifted by {=i64} ms", drift);
        }
        self.calendar.write(&time.naive_utc());
        self.regs.write_register(self.marker, Self::MAGIC);
        true
    }

    pub fn calendar(&self) -> &C {
        &self.calendar
    }
}
