//! Front-end for a u-blox GNSS receiver on a small microcontroller.
//!
//! Bytes arriving from the receiver's UART are captured by an interrupt into a
//! [`rb::Ringbuf`], reassembled into checksum-verified UBX frames by
//! [`ubx::FrameWindow`], coalesced per message type by [`coalesce::Coalescer`]
//! and handed to a [`nav::NavigationState`]. In the other direction,
//! [`assist::Injector`] fetches AssistNow data, validates it with the same
//! framing rules and writes it back to the receiver together with locally
//! built time and position seeds taken from the [`fix::FixCache`].
//!
//! The library is `no_std` and never allocates; the `std` feature only adds a
//! file-backed fix store.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub mod assist;
pub mod clock;
pub mod coalesce;
pub mod fix;
pub mod ingest;
pub mod nav;
pub mod rb;
pub mod ubx;

use core::fmt::Write;
use tinyvec::ArrayVec;

/// Fixed-capacity text buffer for `core::fmt` output.
///
/// Writes that would overflow the buffer fail instead of truncating, so a
/// formatted record is either complete or rejected.
pub struct FmtBuf<const N: usize = 256>(pub ArrayVec<[u8; N]>);

impl<const N: usize> Write for FmtBuf<N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.0.len() + s.len() > N {
            return Err(core::fmt::Error);
        }
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

impl<const N: usize> FmtBuf<N> {
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.0.as_slice()).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn new() -> Self {
        Self(Default::default())
    }
}

impl<const N: usize> Default for FmtBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_buf_rejects_overflow() {
        let mut buf = FmtBuf::<4>::new();
        assert!(write!(buf, "abc").is_ok());
        assert!(write!(buf, "de").is_err());
        assert_eq!(buf.as_str(), Some("abc"));
    }
}
