use super::{declared_len, validate, Frame, Validation, FRAME_OVERHEAD, SYNC_1, SYNC_2};

/// Reassembles frames from an untrusted byte stream.
///
/// Bytes are appended with [`FrameWindow::fill`] and frames are taken out with
/// [`FrameWindow::next_frame`]. Garbage before a sync pattern is skipped, a
/// header whose checksum fails is abandoned one byte at a time, and a partial
/// frame stays buffered until the rest of it arrives.
pub struct FrameWindow<const W: usize> {
    buf: [u8; W],
    len: usize,
    // Length of the frame handed out by the last `next_frame`, released on
    // the next call so the returned frame can borrow the buffer.
    consumed: usize,
    skipped: usize,
    resyncs: usize,
}

impl<const W: usize> Default for FrameWindow<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const W: usize> FrameWindow<W> {
    /// The window must hold at least an empty frame.
    ///
    /// ```compile_fail
    /// let _ = gnss_assist::ubx::FrameWindow::<4>::new();
    /// ```
    pub const fn new() -> Self {
        const { assert!(W >= FRAME_OVERHEAD, "window smaller than a frame") };
        Self {
            buf: [0; W],
            len: 0,
            consumed: 0,
            skipped: 0,
            resyncs: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len - self.consumed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes dropped while hunting for a sync pattern.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Headers abandoned because the frame behind them was corrupt.
    pub fn resyncs(&self) -> usize {
        self.resyncs
    }

    /// Let `f` write into the free tail of the window; `f` returns how many
    /// bytes it wrote.
    pub fn fill(&mut self, f: impl FnOnce(&mut [u8]) -> usize) -> usize {
        self.release();
        let count = f(&mut self.buf[self.len..]).min(W - self.len);
        self.len += count;
        count
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        self.fill(|spare| {
            let count = spare.len().min(bytes.len());
            spare[..count].copy_from_slice(&bytes[..count]);
            count
        })
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.consumed = 0;
    }

    fn release(&mut self) {
        let count = core::mem::take(&mut self.consumed);
        self.discard(count);
    }

    fn discard(&mut self, count: usize) {
        self.buf.copy_within(count..self.len, 0);
        self.len -= count;
    }

    /// Offset of the first byte that could start a frame.
    fn sync_offset(&self) -> usize {
        let bytes = &self.buf[..self.len];
        bytes
            .iter()
            .enumerate()
            .position(|(i, &b)| b == SYNC_1 && bytes.get(i + 1).map_or(true, |&n| n == SYNC_2))
            .unwrap_or(self.len)
    }

    /// The next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Frame<'_>> {
        self.release();
        loop {
            let offset = self.sync_offset();
            if offset > 0 {
                self.skipped += offset;
                self.discard(offset);
            }

            match validate(&self.buf[..self.len]) {
                Validation::Valid(len) => {
                    self.consumed = len;
                    return Some(Frame::from_validated(&self.buf[..len]));
                }
                Validation::Incomplete => {
                    let fits = declared_len(&self.buf[..self.len])
                        .map_or(true, |len| len + FRAME_OVERHEAD <= W);
                    if fits {
                        return None;
                    }
                    debug!("frame header declares more than the window holds");
                    self.resyncs += 1;
                    self.discard(1);
                }
                Validation::Invalid => {
                    trace!("abandoning corrupt frame header");
                    self.resyncs += 1;
                    self.discard(1);
                }
            }
        }
    }
}
