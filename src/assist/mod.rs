//! AssistNow injection.
//!
//! A run associates with the network, fetches an assistance blob, checks that
//! the blob is nothing but well-formed UBX frames and only then writes to the
//! receiver: a time seed, a position seed when one is known, and the fetched
//! frames in the order they arrived.

use core::fmt;

use chrono::{DateTime, Utc};
use embassy_futures::select::{select, Either};

use crate::{
    fix::FixRecord,
    rb::Producer,
    ubx::{
        packets::{MgaIniPosLlh, MgaIniTimeUtc},
        split_frames, validate_batch, FramingError, SendablePacket,
    },
};

mod relay;

pub use relay::SerialRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssistConfig {
    pub chip_code: &'static str,
    /// Constellations, e.g. `gps,gal`.
    pub gnss: &'static str,
    /// Data types, e.g. `uporb_1,ualm`.
    pub data: &'static str,
    pub association_attempts: u32,
    pub association_poll_ms: u32,
    pub fetch_timeout_ms: u32,
    /// Accuracy claimed for the time seed, in seconds.
    pub time_accuracy_s: u16,
    /// Accuracy claimed for the position seed, in centimetres.
    pub position_accuracy_cm: u32,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            chip_code: "",
            gnss: "gps,gal",
            data: "uporb_1,ualm",
            association_attempts: 50,
            association_poll_ms: 100,
            fetch_timeout_ms: 30_000,
            time_accuracy_s: 2,
            position_accuracy_cm: 300_000,
        }
    }
}

/// Query parameters of an AssistNow request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssistRequest<'a> {
    pub chip_code: &'a str,
    pub gnss: &'a str,
    pub data: &'a str,
}

impl<'a> From<&'a AssistConfig> for AssistRequest<'a> {
    fn from(config: &'a AssistConfig) -> Self {
        Self {
            chip_code: config.chip_code,
            gnss: config.gnss,
            data: config.data,
        }
    }
}

impl fmt::Display for AssistRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chipcode={}&gnss={}&data={}", self.chip_code, self.gnss, self.data)
    }
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetError {
    #[error("link is down")]
    LinkDown,
    #[error("endpoint unreachable")]
    Unreachable,
    #[error("malformed response")]
    Protocol,
    #[error("response of {len} bytes exceeds buffer of {capacity}")]
    TooLarge { len: usize, capacity: usize },
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AssistError {
    #[error("association failed: {0}")]
    Association(NetError),
    #[error("not associated after {attempts} attempts")]
    AssociationTimeout { attempts: u32 },
    #[error("fetch timed out")]
    FetchTimeout,
    #[error("fetch failed: {0}")]
    Network(NetError),
    #[error("assistance data is not a clean frame sequence: {0}")]
    Framing(#[from] FramingError),
}

/// Where assistance data comes from.
#[allow(async_fn_in_trait)]
pub trait AssistanceSource {
    /// Start joining the network. Completion is polled with
    /// [`AssistanceSource::is_associated`].
    async fn associate(&mut self) -> Result<(), NetError>;

    fn is_associated(&mut self) -> bool;

    /// Fetch into `blob`, returning the number of bytes received.
    async fn fetch(&mut self, request: &AssistRequest<'_>, blob: &mut [u8]) -> Result<usize, NetError>;

    async fn disconnect(&mut self);
}

#[allow(async_fn_in_trait)]
pub trait Sleep {
    async fn sleep_ms(&mut self, ms: u32);
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AssistReport {
    /// Fetched frames written to the receiver.
    pub frames: usize,
    /// Total bytes written, seeds included.
    pub bytes: usize,
    pub time_seeded: bool,
    pub position_seeded: bool,
}

pub struct Injector<'a, S, D, const N: usize> {
    source: S,
    sleep: D,
    tx: &'a Producer<u8, N>,
    config: AssistConfig,
}

impl<'a, S, D, const N: usize> Injector<'a, S, D, N>
where
    S: AssistanceSource,
    D: Sleep,
{
    pub fn new(source: S, sleep: D, tx: &'a Producer<u8, N>, config: AssistConfig) -> Self {
        Self {
            source,
            sleep,
            tx,
            config,
        }
    }

    pub fn config(&self) -> &AssistConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run one assistance cycle. `blob` receives the fetched data.
    ///
    /// Nothing is written to the receiver unless the whole blob validates.
    /// The source is disconnected on every path.
    pub async fn run(
        &mut self,
        now: Option<DateTime<Utc>>,
        seed: Option<FixRecord>,
        blob: &mut [u8],
    ) -> Result<AssistReport, AssistError> {
        let result = self.fetch_and_inject(now, seed, blob).await;
        self.source.disconnect().await;
        match &result {
            Ok(report) => info!(
                "assistance injected: {=usize} frames, {=usize} bytes",
                report.frames,
                report.bytes
            ),
            Err(e) => warn!("assistance aborted: {}", e),
        }
        result
    }

    async fn associate(&mut self) -> Result<(), AssistError> {
        self.source
            .associate()
            .await
            .map_err(AssistError::Association)?;
        for attempt in 0..self.config.association_attempts {
            if attempt > 0 {
                self.sleep.sleep_ms(self.config.association_poll_ms).await;
            }
            if self.source.is_associated() {
                debug!("associated after {=u32} polls", attempt + 1);
                return Ok(());
            }
        }
        Err(AssistError::AssociationTimeout {
            attempts: self.config.association_attempts,
        })
    }

    async fn fetch<'b>(&mut self, blob: &'b mut [u8]) -> Result<&'b [u8], AssistError> {
        let request = AssistRequest::from(&self.config);
        let fetch = self.source.fetch(&request, blob);
        let timeout = self.sleep.sleep_ms(self.config.fetch_timeout_ms);
        let len = match select(fetch, timeout).await {
            Either::First(result) => result.map_err(AssistError::Network)?,
            Either::Second(()) => return Err(AssistError::FetchTimeout),
        };
        Ok(&blob[..len.min(blob.len())])
    }

    async fn fetch_and_inject(
        &mut self,
        now: Option<DateTime<Utc>>,
        seed: Option<FixRecord>,
        blob: &mut [u8],
    ) -> Result<AssistReport, AssistError> {
        self.associate().await?;
        let blob = self.fetch(blob).await?;
        let summary = validate_batch(blob)?;
        debug!("fetched {=usize} frames", summary.frames);

        let mut report = AssistReport {
            frames: summary.frames,
            ..Default::default()
        };
        if let Some(now) = now {
            let time = MgaIniTimeUtc::from_datetime(&now, self.config.time_accuracy_s);
            report.bytes += time.send(self.tx).await;
            report.time_seeded = true;
        }
        if let Some(seed) = seed.filter(FixRecord::is_plausible) {
            let pos = MgaIniPosLlh::from_fix(&seed, self.config.position_accuracy_cm);
            report.bytes += pos.send(self.tx).await;
            report.position_seeded = true;
        }
        for frame in split_frames(blob) {
            let frame = frame?;
            report.bytes += self.tx.async_write_iter(frame.as_bytes().iter().copied()).await;
        }
        Ok(report)
    }
}
