//! Last known position, kept across power cycles to seed assistance.

use core::fmt::Write;

use crate::FmtBuf;

/// Room for three formatted coordinates.
pub const RECORD_CAPACITY: usize = 80;

#[derive(Debug, Default, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FixRecord {
    /// Degrees, positive north.
    pub latitude: f64,
    /// Degrees, positive east.
    pub longitude: f64,
    /// Metres above mean sea level.
    pub altitude: f64,
}

impl FixRecord {
    pub fn is_plausible(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.altitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Three newline-terminated decimals: latitude, longitude, altitude.
    pub fn encode(&self) -> Result<FmtBuf<RECORD_CAPACITY>, FixError> {
        let mut buf = FmtBuf::new();
        write!(buf, "{}\n{}\n{}\n", self.latitude, self.longitude, self.altitude)
            .map_err(|_| FixError::Format)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = core::str::from_utf8(bytes).ok()?;
        let mut values = text.lines().map(|l| l.trim().parse::<f64>());
        let record = Self {
            latitude: values.next()?.ok()?,
            longitude: values.next()?.ok()?,
            altitude: values.next()?.ok()?,
        };
        if values.next().is_some() || !record.is_plausible() {
            return None;
        }
        Some(record)
    }
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    #[error("I/O error")]
    Io,
    #[error("record of {len} bytes exceeds capacity {capacity}")]
    TooLarge { len: usize, capacity: usize },
    #[error("store unavailable")]
    Unavailable,
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FixError {
    #[error("record does not fit its text buffer")]
    Format,
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

/// Small persistent blob holding one record.
pub trait FixStore {
    /// Copy the stored record into `buf`, returning its length, or `None` if
    /// nothing was ever stored.
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StoreError>;

    /// Replace the stored record. A reader sees either the old record or the
    /// new one, never a mix.
    fn replace(&mut self, data: &[u8]) -> Result<(), StoreError>;
}

/// RAM-only store.
#[derive(Default)]
pub struct MemoryStore {
    data: Option<FmtBuf<RECORD_CAPACITY>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|d| d.as_bytes())
    }
}

impl FixStore for MemoryStore {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let Some(data) = self.contents() else {
            return Ok(None);
        };
        let capacity = buf.len();
        let dst = buf.get_mut(..data.len()).ok_or(StoreError::TooLarge {
            len: data.len(),
            capacity,
        })?;
        dst.copy_from_slice(data);
        Ok(Some(data.len()))
    }

    fn replace(&mut self, data: &[u8]) -> Result<(), StoreError> {
        let mut buf = FmtBuf::new();
        if data.len() > RECORD_CAPACITY {
            return Err(StoreError::TooLarge {
                len: data.len(),
                capacity: RECORD_CAPACITY,
            });
        }
        buf.0.extend_from_slice(data);
        self.data = Some(buf);
        Ok(())
    }
}

/// Word-addressed registers that survive a reset, such as the RTC backup
/// domain.
pub trait BackupRegisters {
    fn read_register(&self, index: usize) -> u32;
    fn write_register(&mut self, index: usize, value: u32);
}

impl<const N: usize> BackupRegisters for [u32; N] {
    fn read_register(&self, index: usize) -> u32 {
        self.get(index).copied().unwrap_or_default()
    }

    fn write_register(&mut self, index: usize, value: u32) {
        if let Some(r) = self.get_mut(index) {
            *r = value;
        }
    }
}

impl<R: BackupRegisters + ?Sized> BackupRegisters for &mut R {
    fn read_register(&self, index: usize) -> u32 {
        (**self).read_register(index)
    }

    fn write_register(&mut self, index: usize, value: u32) {
        (**self).write_register(index, value)
    }
}

/// Two record slots in backup registers behind a header word.
///
/// Register 0 holds `MAGIC | slot << 8 | len`. A new record goes into the
/// slot the header does not point at, and only then is the header rewritten,
/// so an interrupted write leaves the previous record readable.
pub struct BackupSlots<R> {
    regs: R,
}

impl<R: BackupRegisters> BackupSlots<R> {
    const MAGIC: u32 = 0x4658_0000;
    const MAGIC_MASK: u32 = 0xffff_0000;
    const HEADER: usize = 0;
    const SLOT_WORDS: usize = 15;
    pub const SLOT_BYTES: usize = Self::SLOT_WORDS * 4;
    /// Registers occupied, counting from index 0.
    pub const REGISTERS: usize = Self::HEADER + 1 + 2 * Self::SLOT_WORDS;

    pub fn new(regs: R) -> Self {
        Self { regs }
    }

    pub fn into_inner(self) -> R {
        self.regs
    }

    fn slot_base(slot: usize) -> usize {
        Self::HEADER + 1 + slot * Self::SLOT_WORDS
    }

    /// `(slot, len)` of the committed record.
    fn header(&self) -> Option<(usize, usize)> {
        let header = self.regs.read_register(Self::HEADER);
        if header & Self::MAGIC_MASK != Self::MAGIC {
            return None;
        }
        let slot = ((header >> 8) & 0xff) as usize;
        let len = (header & 0xff) as usize;
        (slot < 2 && len <= Self::SLOT_BYTES).then_some((slot, len))
    }
}

impl<R: BackupRegisters> FixStore for BackupSlots<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let Some((slot, len)) = self.header() else {
            return Ok(None);
        };
        let capacity = buf.len();
        let dst = buf
            .get_mut(..len)
            .ok_or(StoreError::TooLarge { len, capacity })?;
        let base = Self::slot_base(slot);
        for (i, chunk) in dst.chunks_mut(4).enumerate() {
            let word = self.regs.read_register(base + i).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(Some(len))
    }

    fn replace(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > Self::SLOT_BYTES {
            return Err(StoreError::TooLarge {
                len: data.len(),
                capacity: Self::SLOT_BYTES,
            });
        }
        let slot = match self.header() {
            Some((0, _)) => 1,
            _ => 0,
        };
        let base = Self::slot_base(slot);
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.regs.write_register(base + i, u32::from_le_bytes(word));
        }
        let header = Self::MAGIC | (slot as u32) << 8 | data.len() as u32;
        self.regs.write_register(Self::HEADER, header);
        Ok(())
    }
}

/// Record kept in a file, replaced through a temporary file and a rename.
#[cfg(feature = "std")]
pub struct FileStore {
    path: std::path::PathBuf,
}

#[cfg(feature = "std")]
impl FileStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(feature = "std")]
impl FixStore for FileStore {
    fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, StoreError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(_) => return Err(StoreError::Io),
        };
        let capacity = buf.len();
        let dst = buf.get_mut(..data.len()).ok_or(StoreError::TooLarge {
            len: data.len(),
            capacity,
        })?;
        dst.copy_from_slice(&data);
        Ok(Some(data.len()))
    }

    fn replace(&mut self, data: &[u8]) -> Result<(), StoreError> {
        use std::io::Write as _;

        let tmp = self.path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|_| StoreError::Io)
    }
}

/// Loads and stores the last fix, rate limiting writes to the backing store.
pub struct FixCache<S> {
    backend: S,
    min_interval_ms: u64,
    last_store_ms: Option<u64>,
}

impl<S: FixStore> FixCache<S> {
    pub fn new(backend: S, min_interval_ms: u64) -> Self {
        Self {
            backend,
            min_interval_ms,
            last_store_ms: None,
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Missing or corrupt records read as `None`.
    pub fn load(&mut self) -> Option<FixRecord> {
        let mut buf = [0; RECORD_CAPACITY];
        match self.backend.read(&mut buf) {
            Ok(Some(len)) => {
                let record = FixRecord::decode(&buf[..len]);
                if record.is_none() {
                    warn!("discarding corrupt fix record");
                }
                record
            }
            Ok(None) => None,
            Err(e) => {
                warn!("fix store unreadable: {}", e);
                None
            }
        }
    }

    pub fn store(&mut self, record: FixRecord) -> Result<(), FixError> {
        let text = record.encode()?;
        self.backend.replace(text.as_bytes())?;
        Ok(())
    }

    /// Store `record` unless the last store was less than the minimum
    /// interval ago. Returns whether it was written.
    ///
    /// `now_ms` is a free-running millisecond counter; a reading below the
    /// last store counts as a wrapped counter, not as a store in the future.
    pub fn offer(&mut self, now_ms: u64, record: FixRecord) -> bool {
        if !record.is_plausible() {
            return false;
        }
        if let Some(last) = self.last_store_ms {
            if now_ms.wrapping_sub(last) < self.min_interval_ms {
                return false;
            }
        }
        match self.store(record) {
            Ok(()) => {
                self.last_store_ms = Some(now_ms);
                true
            }
            Err(e) => {
                warn!("failed to store fix: {}", e);
                false
            }
        }
    }
}
