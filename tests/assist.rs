use chrono::{NaiveDateTime, TimeZone, Utc};
use embassy_futures::block_on;
use gnss_assist::{
    assist::{
        AssistConfig, AssistError, AssistRequest, AssistanceSource, Injector, NetError, Sleep,
    },
    clock::{Calendar, WallClock},
    fix::FixRecord,
    rb::{Consumer, Producer, Ringbuf},
    ubx::{split_frames, FramingError, RawPacket, SendablePacket},
};

#[derive(Default)]
struct FakeSource {
    blob: Vec<u8>,
    /// Polls of `is_associated` that report "not yet".
    associate_after: usize,
    never_associate: bool,
    hang_on_fetch: bool,
    fail_fetch: Option<NetError>,
    polls: usize,
    requests: Vec<String>,
    disconnects: usize,
}

impl AssistanceSource for FakeSource {
    async fn associate(&mut self) -> Result<(), NetError> {
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.polls += 1;
        !self.never_associate && self.polls > self.associate_after
    }

    async fn fetch(&mut self, request: &AssistRequest<'_>, blob: &mut [u8]) -> Result<usize, NetError> {
        self.requests.push(request.to_string());
        if self.hang_on_fetch {
            core::future::pending::<()>().await;
        }
        if let Some(e) = self.fail_fetch {
            return Err(e);
        }
        blob[..self.blob.len()].copy_from_slice(&self.blob);
        Ok(self.blob.len())
    }

    async fn disconnect(&mut self) {
        self.disconnects += 1;
    }
}

#[derive(Default)]
struct CountingSleep {
    slept_ms: u64,
}

impl Sleep for CountingSleep {
    async fn sleep_ms(&mut self, ms: u32) {
        self.slept_ms += u64::from(ms);
    }
}

fn uart() -> (Producer<u8, 4096>, Consumer<u8, 4096>) {
    let rb: &'static Ringbuf<u8, 4096> = Box::leak(Box::new(Ringbuf::new(None)));
    rb.try_split().unwrap()
}

fn drain(rx: &Consumer<u8, 4096>) -> Vec<u8> {
    std::iter::from_fn(|| rx.try_read()).collect()
}

fn assistance_blob() -> Vec<u8> {
    [
        RawPacket { class: 0x13, id: 0x00, payload: &[0x01; 12] },
        RawPacket { class: 0x13, id: 0x02, payload: &[0x02; 20] },
        RawPacket { class: 0x13, id: 0x00, payload: &[0x03; 12] },
    ]
    .into_iter()
    .flat_map(|p| p.to_bytes())
    .collect()
}

fn config() -> AssistConfig {
    AssistConfig {
        chip_code: "test",
        ..Default::default()
    }
}

const SEED: FixRecord = FixRecord {
    latitude: 37.0,
    longitude: -122.0,
    altitude: 30.0,
};

#[test]
fn writes_seeds_then_batch_in_order() {
    let (tx, rx) = uart();
    let blob = assistance_blob();
    let source = FakeSource {
        blob: blob.clone(),
        associate_after: 3,
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    let mut buf = [0; 1024];
    let report = block_on(injector.run(Some(now), Some(SEED), &mut buf)).unwrap();
    assert_eq!(report.frames, 3);
    assert!(report.time_seeded && report.position_seeded);

    let written = drain(&rx);
    assert_eq!(report.bytes, written.len());
    let frames: Vec<_> = split_frames(&written).map(Result::unwrap).collect();
    assert_eq!(frames.len(), 5);
    // Time seed, position seed, then the batch untouched
    assert_eq!(frames[0].key().msg_id, 0x40);
    assert_eq!(frames[0].payload()[0], 0x10);
    assert_eq!(frames[1].key().msg_id, 0x40);
    assert_eq!(frames[1].payload()[0], 0x01);
    assert_eq!(&written[frames[0].len() + frames[1].len()..], &blob[..]);

    let source = injector.source();
    assert_eq!(
        source.requests,
        ["chipcode=test&gnss=gps,gal&data=uporb_1,ualm"]
    );
    assert_eq!(source.disconnects, 1);
}

#[test]
fn position_seed_is_omitted_without_a_fix() {
    let (tx, rx) = uart();
    let source = FakeSource {
        blob: assistance_blob(),
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());

    let mut buf = [0; 1024];
    let report = block_on(injector.run(None, None, &mut buf)).unwrap();
    assert!(!report.time_seeded && !report.position_seeded);

    let written = drain(&rx);
    assert_eq!(written, assistance_blob());
}

#[test]
fn corrupt_blob_aborts_before_writing() {
    let (tx, rx) = uart();
    let mut blob = assistance_blob();
    blob.truncate(blob.len() - 3);
    let source = FakeSource {
        blob,
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());

    let mut buf = [0; 1024];
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
    let err = block_on(injector.run(Some(now), Some(SEED), &mut buf)).unwrap_err();
    assert!(matches!(
        err,
        AssistError::Framing(FramingError::Truncated { .. })
    ));
    assert!(rx.is_empty());
    assert_eq!(injector.source().disconnects, 1);
}

#[test]
fn association_gives_up_after_bounded_attempts() {
    let (tx, rx) = uart();
    let source = FakeSource {
        never_associate: true,
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());

    let mut buf = [0; 16];
    let err = block_on(injector.run(None, Some(SEED), &mut buf)).unwrap_err();
    assert_eq!(err, AssistError::AssociationTimeout { attempts: 50 });
    assert_eq!(injector.source().polls, 50);
    assert!(injector.source().requests.is_empty());
    assert_eq!(injector.source().disconnects, 1);
    assert!(rx.is_empty());
}

#[test]
fn fetch_timeout_cancels_the_run() {
    let (tx, rx) = uart();
    let source = FakeSource {
        hang_on_fetch: true,
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());

    let mut buf = [0; 16];
    let err = block_on(injector.run(None, Some(SEED), &mut buf)).unwrap_err();
    assert_eq!(err, AssistError::FetchTimeout);
    assert_eq!(injector.source().disconnects, 1);
    assert!(rx.is_empty());
}

#[test]
fn network_errors_are_reported() {
    let (tx, _rx) = uart();
    let source = FakeSource {
        fail_fetch: Some(NetError::Unreachable),
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());

    let mut buf = [0; 16];
    let err = block_on(injector.run(None, None, &mut buf)).unwrap_err();
    assert_eq!(err, AssistError::Network(NetError::Unreachable));
}

/// Calendar that keeps counting through a "reset" of the clock wrapper.
struct Coin(Option<NaiveDateTime>);

impl Calendar for &mut Coin {
    fn read(&self) -> Option<NaiveDateTime> {
        self.0
    }

    fn write(&mut self, time: &NaiveDateTime) {
        self.0 = Some(*time);
    }
}

#[test]
fn cold_start_seeds_time_from_a_set_calendar() {
    let mut coin = Coin(None);
    let mut regs = [0u32; 32];
    let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    // Before any receiver time the calendar reads as unknown
    {
        let clock = WallClock::new(&mut coin, &mut regs, 31);
        assert_eq!(clock.now(), None);
    }
    {
        let mut clock = WallClock::new(&mut coin, &mut regs, 31);
        assert!(clock.sync(t, 2_000));
    }

    // After a reset, the first run has a time seed before any NAV-PVT
    let clock = WallClock::new(&mut coin, &mut regs, 31);
    let (tx, rx) = uart();
    let source = FakeSource {
        blob: assistance_blob(),
        ..Default::default()
    };
    let mut injector = Injector::new(source, CountingSleep::default(), &tx, config());
    let mut buf = [0; 1024];
    let report = block_on(injector.run(clock.now(), None, &mut buf)).unwrap();
    assert!(report.time_seeded);

    let written = drain(&rx);
    let first = split_frames(&written).next().unwrap().unwrap();
    assert_eq!((first.class_id(), first.msg_id()), (0x13, 0x40));
    assert_eq!(&first.payload()[4..11], &[0xe9, 0x07, 6, 1, 12, 0, 0]);
}
