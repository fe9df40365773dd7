//! Receiver-to-navigation pipeline.

use crate::{
    coalesce::Coalescer,
    fix::FixRecord,
    nav::NavigationState,
    rb::Consumer,
    ubx::{FrameWindow, MessageKey},
};

/// Everything the receiving task owns: the consumer end of the capture ring,
/// the frame window, the coalescer and the navigation state.
pub struct Ingest<Nav, const CAP: usize, const WIN: usize, const SLOTS: usize, const LEN: usize> {
    rx: Consumer<u8, CAP>,
    window: FrameWindow<WIN>,
    coalescer: Coalescer<MessageKey, SLOTS, LEN>,
    nav: Nav,
}

impl<Nav, const CAP: usize, const WIN: usize, const SLOTS: usize, const LEN: usize>
    Ingest<Nav, CAP, WIN, SLOTS, LEN>
where
    Nav: NavigationState,
{
    pub fn new(rx: Consumer<u8, CAP>, nav: Nav) -> Self {
        Self {
            rx,
            window: FrameWindow::new(),
            coalescer: Coalescer::new(),
            nav,
        }
    }

    /// Move everything captured so far through the frame window into the
    /// coalescer. Returns the number of frames found.
    pub fn pump(&mut self) -> usize {
        let mut frames = 0;
        loop {
            let moved = self.rx.drain_frame_window(&mut self.window);
            while let Some(frame) = self.window.next_frame() {
                frames += 1;
                if let Err(e) = self.coalescer.update(frame.key(), frame.as_bytes()) {
                    debug!("frame {=u8:x}/{=u8:x} not coalesced: {}", frame.class_id(), frame.msg_id(), e);
                }
            }
            if moved == 0 {
                return frames;
            }
        }
    }

    /// Apply the coalesced frames to the navigation state and report its fix.
    pub fn flush(&mut self) -> Option<FixRecord> {
        let applied = self.coalescer.flush_into(&mut self.nav);
        trace!("applied {=usize} coalesced frames", applied);
        self.nav.fix()
    }

    /// Resolves once the capture ring has data.
    pub async fn wait(&self) {
        self.rx.readable().await
    }

    pub fn nav(&self) -> &Nav {
        &self.nav
    }

    pub fn nav_mut(&mut self) -> &mut Nav {
        &mut self.nav
    }

    pub fn window(&self) -> &FrameWindow<WIN> {
        &self.window
    }

    pub fn coalescer(&self) -> &Coalescer<MessageKey, SLOTS, LEN> {
        &self.coalescer
    }

    /// Bytes lost to capture overflow.
    pub fn dropped(&self) -> usize {
        self.rx.dropped()
    }
}
