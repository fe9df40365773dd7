//! Splitting a buffer of back-to-back frames.

use core::iter::FusedIterator;

use super::{Frame, FramingError};

/// Lazily yields the frames of a buffer that is expected to hold nothing but
/// complete frames.
///
/// The first framing break is yielded once as an error and ends the
/// iteration: there is no attempt to resynchronise, and the iterator cannot be
/// restarted.
///
/// ```compile_fail
/// let frames = gnss_assist::ubx::split_frames(&[]);
/// let _replay = frames.clone();
/// ```
#[derive(Debug)]
pub struct FrameIter<'a> {
    rest: &'a [u8],
    failed: bool,
}

pub fn split_frames(bytes: &[u8]) -> FrameIter<'_> {
    FrameIter {
        rest: bytes,
        failed: false,
    }
}

impl<'a> FrameIter<'a> {
    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match Frame::parse(self.rest) {
            Ok(frame) => {
                self.rest = &self.rest[frame.len()..];
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for FrameIter<'_> {}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatchSummary {
    pub frames: usize,
    pub bytes: usize,
}

/// Walk the whole buffer and fail on the first framing break.
pub fn validate_batch(bytes: &[u8]) -> Result<BatchSummary, FramingError> {
    split_frames(bytes).try_fold(BatchSummary::default(), |summary, frame| {
        frame.map(|frame| BatchSummary {
            frames: summary.frames + 1,
            bytes: summary.bytes + frame.len(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: [u8; 8] = [0xb5, 0x62, 0x01, 0x03, 0x00, 0x00, 0x04, 0x0d];
    const B: [u8; 9] = [0xb5, 0x62, 0x05, 0x01, 0x01, 0x00, 0x06, 0x0d, 0x26];

    #[test]
    fn yields_frames_in_order() {
        let mut buf = A.to_vec();
        buf.extend_from_slice(&B);
        let keys: Vec<_> = split_frames(&buf).map(|f| f.unwrap().key()).collect();
        assert_eq!(keys.len(), 2);
        assert_eq!((keys[0].class_id, keys[0].msg_id), (0x01, 0x03));
        assert_eq!((keys[1].class_id, keys[1].msg_id), (0x05, 0x01));
        assert_eq!(
            validate_batch(&buf),
            Ok(BatchSummary {
                frames: 2,
                bytes: 17
            })
        );
    }

    #[test]
    fn stops_after_first_error() {
        let mut buf = A.to_vec();
        buf.extend_from_slice(&[0x00; 8]);
        buf.extend_from_slice(&A);
        let mut it = split_frames(&buf);
        assert!(it.next().unwrap().is_ok());
        assert_eq!(it.next(), Some(Err(FramingError::BadMagic)));
        assert_eq!(it.next(), None);
        assert_eq!(it.next(), None);
        assert_eq!(validate_batch(&buf), Err(FramingError::BadMagic));
    }

    #[test]
    fn trailing_partial_frame_is_an_error() {
        let mut buf = A.to_vec();
        buf.extend_from_slice(&A[..5]);
        assert!(matches!(
            validate_batch(&buf),
            Err(FramingError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(split_frames(&[]).count(), 0);
        assert_eq!(validate_batch(&[]), Ok(BatchSummary::default()));
    }
}
