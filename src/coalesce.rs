//! Latest-wins cache of raw messages, one entry per message type.
//!
//! The receiver emits a burst of message types every epoch. Only the newest
//! message of each type survives until the next [`Coalescer::flush`], so the
//! navigation state always sees the freshest sample of every type instead of
//! a stale interleaving.

use core::hash::Hash;

use heapless::{FnvIndexMap, Vec};

use crate::nav::NavigationState;
pub use crate::ubx::MessageKey;

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoalesceError {
    #[error("message of {len} bytes does not fit a slot")]
    TooLong { len: usize },
    #[error("no free slot for a new message type")]
    Full,
}

/// `SLOTS` must be a power of two.
pub struct Coalescer<K, const SLOTS: usize, const LEN: usize> {
    latest: FnvIndexMap<K, Vec<u8, LEN>, SLOTS>,
    rejected: usize,
}

impl<K, const SLOTS: usize, const LEN: usize> Default for Coalescer<K, SLOTS, LEN>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, const SLOTS: usize, const LEN: usize> Coalescer<K, SLOTS, LEN>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            latest: FnvIndexMap::new(),
            rejected: 0,
        }
    }

    /// Replace whatever is held for `key` with `raw`.
    ///
    /// On error the mapping is left as it was.
    pub fn update(&mut self, key: K, raw: &[u8]) -> Result<(), CoalesceError> {
        let Ok(value) = Vec::from_slice(raw) else {
            self.rejected += 1;
            return Err(CoalesceError::TooLong { len: raw.len() });
        };
        match self.latest.insert(key, value) {
            Ok(_) => Ok(()),
            Err(_) => {
                self.rejected += 1;
                Err(CoalesceError::Full)
            }
        }
    }

    pub fn latest(&self, key: &K) -> Option<&[u8]> {
        self.latest.get(key).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Messages turned away by [`Coalescer::update`] so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Hand every held message to `sink` and empty the cache. Order is
    /// unspecified.
    pub fn flush(&mut self, mut sink: impl FnMut(&K, &[u8])) -> usize {
        let count = self.latest.len();
        for (key, raw) in self.latest.iter() {
            sink(key, raw);
        }
        self.latest.clear();
        count
    }

    pub fn flush_into(&mut self, nav: &mut impl NavigationState) -> usize {
        self.flush(|_, raw| raw.iter().for_each(|&b| nav.update(b)))
    }
}

/// Talker and sentence type of an NMEA line, e.g. `GPGGA`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SentenceKey(pub [u8; 5]);

impl SentenceKey {
    pub fn from_line(line: &[u8]) -> Option<Self> {
        let rest = line.strip_prefix(b"$")?;
        if rest.get(5) != Some(&b',') {
            return None;
        }
        rest.get(..5)?.try_into().ok().map(Self)
    }
}
