#![no_main]
#![no_std]

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{Datelike as _, NaiveDate, NaiveDateTime, Timelike as _};
use defmt::{debug, error, info, trace, warn};
use defmt_brtt as _; // global logger
use embassy_futures::select::{select, Either};
use gnss_assist::{
    assist::{AssistConfig, Injector, SerialRelay, Sleep},
    clock::{Calendar, WallClock},
    fix::{BackupRegisters, BackupSlots, FixCache},
    ingest::Ingest,
    nav::{NavigationState as _, UbxNavigation},
    rb::{Consumer, Producer, Ringbuf},
    ubx::{
        cfg,
        packets::{CfgValSet, UpdSosCreateBackup},
        SendablePacket,
    },
};
use panic_probe as _;
use rtic_monotonics::{
    create_systick_token,
    systick::{ExtU64 as _, Systick},
    Monotonic as _,
};
use stm32_usbd::UsbBus;
use stm32l4xx_hal::{
    self as hal,
    datetime::{Date, Time},
    gpio::{Alternate, PushPull, PA2, PA3},
    hal::serial::{Read as _, Write as _},
    pac::{self, Interrupt, USART2},
    prelude::*,
    rcc::{ClockSecuritySystem, CrystalBypass},
    rtc::{Rtc, RtcClockSource, RtcConfig},
    serial::{self, Config, Serial},
};
use tinyvec::ArrayVec;
use usb_device::{
    device::{UsbDeviceBuilder, UsbDeviceState, UsbVidPid},
    UsbError,
};
use usbd_serial::{SerialPort, USB_CLASS_CDC};

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}

static COUNT: AtomicUsize = AtomicUsize::new(0);
defmt::timestamp!("{=usize}", {
    // NOTE(no-CAS) `timestamps` runs with interrupts disabled
    let n = COUNT.load(Ordering::Relaxed);
    COUNT.store(n + 1, Ordering::Relaxed);
    n
});

type Uart2 = Serial<USART2, (PA2<Alternate<PushPull, 7>>, PA3<Alternate<PushPull, 7>>)>;

struct UartStuff {
    uart: Uart2,
    rx_send: Producer<u8, CAPTURE_BUFSIZE>,
    tx_recv: Consumer<u8, UART_TX_BUFSIZE>,
    tx_pending: Option<u8>,
}

/// Backup-domain registers of the RTC. They sit beside the calendar, which
/// the `Rtc` driver owns, and each user keeps to its own register range.
#[derive(Clone, Copy)]
struct RtcBackup;

impl BackupRegisters for RtcBackup {
    fn read_register(&self, index: usize) -> u32 {
        let rtc = unsafe { &*pac::RTC::ptr() };
        rtc.bkpr.get(index).map_or(0, |r| r.read().bits())
    }

    fn write_register(&mut self, index: usize, value: u32) {
        let rtc = unsafe { &*pac::RTC::ptr() };
        if let Some(r) = rtc.bkpr.get(index) {
            r.write(|w| unsafe { w.bits(value) });
        }
    }
}

struct RtcCalendar(Rtc);

impl Calendar for RtcCalendar {
    fn read(&self) -> Option<NaiveDateTime> {
        let (date, time) = self.0.get_date_time();
        NaiveDate::from_ymd_opt(date.year as i32, date.month, date.date)?
            .and_hms_micro_opt(time.hours, time.minutes, time.seconds, time.micros)
    }

    fn write(&mut self, t: &NaiveDateTime) {
        // Two BCD digits of year, counted from 1970
        if !(1970..2070).contains(&t.year()) {
            warn!("year {=i32} does not fit the calendar", t.year());
            return;
        }
        let date = Date {
            day: t.weekday().number_from_monday(),
            date: t.day(),
            month: t.month(),
            year: t.year() as u32,
        };
        let time = Time {
            hours: t.hour(),
            minutes: t.minute(),
            seconds: t.second(),
            micros: 0,
            daylight_savings: false,
        };
        self.0.set_date_time(date, time);
    }
}

struct SystickSleep;

impl Sleep for SystickSleep {
    async fn sleep_ms(&mut self, ms: u32) {
        Systick::delay(u64::from(ms).millis()).await
    }
}

type GpsIngest = Ingest<UbxNavigation, CAPTURE_BUFSIZE, WINDOW_SIZE, COALESCE_SLOTS, COALESCE_LEN>;

const CAPTURE_BUFSIZE: usize = 10_000;
const UART_TX_BUFSIZE: usize = 64;
const USB_BUFSIZE: usize = 256;
const WINDOW_SIZE: usize = 512;
const COALESCE_SLOTS: usize = 16;
const COALESCE_LEN: usize = 128;
const ASSIST_BUFSIZE: usize = 16 * 1024;

const FIX_STORE_INTERVAL_MS: u64 = 60_000;
const ASSIST_INTERVAL_S: u64 = 4 * 3600;
const ASSIST_RETRY_S: u64 = 60;
const SOS_INTERVAL_S: u64 = 60;
const CLOCK_TOLERANCE_MS: u32 = 2_000;

/// Host link on the USB port: configured and DTR raised.
static LINK_UP: AtomicBool = AtomicBool::new(false);
static UART_ERRORS: AtomicUsize = AtomicUsize::new(0);

fn pend_uart() {
    rtic::pend(Interrupt::USART2);
}

fn now_ms() -> u64 {
    Systick::now().duration_since_epoch().to_millis()
}

fn receiver_config() -> CfgValSet<5> {
    CfgValSet {
        ram: true,
        bbr: true,
        flash: false,
        items: [
            // UBX only
            (cfg::CFG_UART1OUTPROT_UBX, true).into(),
            (cfg::CFG_UART1OUTPROT_NMEA, false).into(),
            // NAV-PVT every navigation solution
            (cfg::CFG_MSGOUT_UBX_NAV_PVT_UART1, 1_u8).into(),
            (cfg::CFG_NAVSPG_DYNMODEL, cfg::DYNMODEL_AUTOMOTIVE).into(),
            (cfg::CFG_NAVSPG_ACKAIDING, true).into(),
        ],
    }
}

#[rtic::app(
    device = stm32l4xx_hal::pac,
    dispatchers = [EXTI2, EXTI3],
)]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        fix_cache: FixCache<BackupSlots<RtcBackup>>,
        clock: WallClock<RtcCalendar, RtcBackup>,
    }

    #[local]
    struct Local {
        uart: UartStuff,
    }

    ////////////////////////////////////////////////////////////////////////////
    // Main thread tasks ///////////////////////////////////////////////////////
    ////////////////////////////////////////////////////////////////////////////

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        trace!("init enter");

        let mut flash = cx.device.FLASH.constrain();
        let mut rcc = cx.device.RCC.constrain();
        let mut pwr = cx.device.PWR.constrain(&mut rcc.apb1r1);
        let clocks = rcc
            .cfgr
            .lse(CrystalBypass::Disable, ClockSecuritySystem::Disable)
            .freeze(&mut flash.acr, &mut pwr);

        let mut gpioa = cx.device.GPIOA.split(&mut rcc.ahb2);

        // Create SysTick monotonic for task scheduling
        Systick::start(cx.core.SYST, clocks.sysclk().raw(), create_systick_token!());

        // Calendar and backup registers run on the coin cell across resets
        let rtc = Rtc::rtc(
            cx.device.RTC,
            &mut rcc.apb1r1,
            &mut rcc.bdcr,
            &mut pwr.cr1,
            RtcConfig::default().clock_config(RtcClockSource::LSE),
        );
        let fix_cache = FixCache::new(BackupSlots::new(RtcBackup), FIX_STORE_INTERVAL_MS);
        let clock = WallClock::new(
            RtcCalendar(rtc),
            RtcBackup,
            BackupSlots::<RtcBackup>::REGISTERS,
        );
        info!("calendar set: {}", clock.is_set());

        // Initialize UART for GPS
        let tx = gpioa
            .pa2
            .into_alternate(&mut gpioa.moder, &mut gpioa.otyper, &mut gpioa.afrl);
        let rx = gpioa
            .pa3
            .into_alternate(&mut gpioa.moder, &mut gpioa.otyper, &mut gpioa.afrl);
        let mut uart = Serial::usart2(
            cx.device.USART2,
            (tx, rx),
            Config::default().baudrate(9600.bps()),
            clocks,
            &mut rcc.apb1r1,
        );
        uart.listen(serial::Event::Rxne);

        // Capture ring filled by the UART interrupt, and the outbound ring it drains
        static CAPTURE: Ringbuf<u8, CAPTURE_BUFSIZE> = Ringbuf::new(None);
        let (capture_send, capture_recv) = defmt::unwrap!(CAPTURE.try_split());
        static UART_TX: Ringbuf<u8, UART_TX_BUFSIZE> = Ringbuf::new(Some(pend_uart));
        let (uart_tx_send, uart_tx_recv) = defmt::unwrap!(UART_TX.try_split());

        let uart = UartStuff {
            uart,
            rx_send: capture_send,
            tx_recv: uart_tx_recv,
            tx_pending: None,
        };

        // Initialize USB Serial
        let dm = gpioa
            .pa11
            .into_alternate(&mut gpioa.moder, &mut gpioa.otyper, &mut gpioa.afrh);
        let dp = gpioa
            .pa12
            .into_alternate(&mut gpioa.moder, &mut gpioa.otyper, &mut gpioa.afrh);

        // Turn on USB power
        unsafe {
            pac::Peripherals::steal()
                .PWR
                .cr2
                .modify(|_, w| w.usv().set_bit())
        };

        let usb = hal::usb::Peripheral {
            usb: cx.device.USB,
            pin_dm: dm,
            pin_dp: dp,
        };

        static USB_RX: Ringbuf<u8, USB_BUFSIZE> = Ringbuf::new(None);
        let (usb_rx_send, usb_rx_recv) = defmt::unwrap!(USB_RX.try_split());
        static USB_TX: Ringbuf<u8, USB_BUFSIZE> = Ringbuf::new(None);
        let (usb_tx_send, usb_tx_recv) = defmt::unwrap!(USB_TX.try_split());

        defmt::unwrap!(usb_poll::spawn(usb, usb_tx_recv, usb_rx_send).map_err(|_| ()));
        defmt::unwrap!(gps_task::spawn(capture_recv).map_err(|_| ()));
        defmt::unwrap!(assist_task::spawn(uart_tx_send, usb_tx_send, usb_rx_recv).map_err(|_| ()));

        info!("done initializing!");
        trace!("init exit");
        (
            Shared { fix_cache, clock },
            Local { uart },
        )
    }

    #[idle]
    fn idle(_: idle::Context) -> ! {
        trace!("idle enter");

        loop {
            // Only sleep in release mode, since the debugger doesn't interact with sleep very nicely
            #[cfg(debug_assertions)]
            cortex_m::asm::nop();
            #[cfg(not(debug_assertions))]
            cortex_m::asm::wfi();
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Hardware interrupt handlers /////////////////////////////////////////////
    ////////////////////////////////////////////////////////////////////////////

    // Transfer UART data to/from the buffers. Never waits on a consumer: a full
    // capture ring drops the newest bytes.
    #[task(binds = USART2, priority = 10, local = [uart])]
    fn on_uart(cx: on_uart::Context) {
        let UartStuff {
            uart,
            rx_send,
            tx_recv,
            tx_pending,
        } = cx.local.uart;

        // Rxne
        loop {
            match uart.read() {
                Ok(b) => {
                    rx_send.write(core::slice::from_ref(&b));
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(_)) => {
                    UART_ERRORS.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Txe
        while let Some(b) = tx_pending.take().or_else(|| tx_recv.try_read()) {
            if uart.write(b).is_err() {
                *tx_pending = Some(b);
                break;
            }
        }
        if tx_pending.is_some() || !tx_recv.is_empty() {
            uart.listen(serial::Event::Txe);
        } else {
            uart.unlisten(serial::Event::Txe);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Software tasks //////////////////////////////////////////////////////////
    ////////////////////////////////////////////////////////////////////////////

    // Reassemble receiver frames and apply the freshest of each type once a second
    #[task(priority = 2, shared = [fix_cache, clock])]
    async fn gps_task(mut cx: gps_task::Context, capture: Consumer<u8, CAPTURE_BUFSIZE>) {
        trace!("gps_task enter");

        let mut ingest = GpsIngest::new(capture, UbxNavigation::new());
        let mut next_flush = Systick::now() + 1_u64.secs();
        let mut dropped = 0;

        loop {
            select(ingest.wait(), Systick::delay_until(next_flush)).await;
            ingest.pump();

            if Systick::now() < next_flush {
                continue;
            }
            next_flush += 1_u64.secs();

            let fix = ingest.flush();
            let now = now_ms();
            if let Some(fix) = fix {
                if cx.shared.fix_cache.lock(|cache| cache.offer(now, fix)) {
                    info!("stored fix {}", fix);
                }
            }
            if let Some(time) = ingest.nav_mut().take_fresh_datetime() {
                if cx.shared.clock.lock(|clock| clock.sync(time, CLOCK_TOLERANCE_MS)) {
                    info!("calendar set from receiver time");
                }
            }
            if let Some(e) = ingest.nav().last_error() {
                trace!("last UBX error: {}", e);
            }

            if ingest.dropped() != dropped {
                dropped = ingest.dropped();
                warn!(
                    "capture overflow: {=usize} bytes dropped, {=usize} resyncs, {=usize} uart errors",
                    dropped,
                    ingest.window().resyncs(),
                    UART_ERRORS.load(Ordering::Relaxed)
                );
            }
            debug!("fix: {}", ingest.nav().fix());
        }
    }

    // Configure the receiver, feed it assistance whenever the host link is up,
    // and have it save its state to the backup store once a minute
    #[task(
        priority = 1,
        shared = [fix_cache, clock],
        local = [blob: [u8; ASSIST_BUFSIZE] = [0; ASSIST_BUFSIZE]],
    )]
    async fn assist_task(
        mut cx: assist_task::Context,
        uart_tx: Producer<u8, UART_TX_BUFSIZE>,
        usb_tx: Producer<u8, USB_BUFSIZE>,
        usb_rx: Consumer<u8, USB_BUFSIZE>,
    ) {
        trace!("assist_task enter");

        info!("sending receiver configuration");
        receiver_config().send(&uart_tx).await;
        uart_tx.flush().await;

        let config = AssistConfig {
            chip_code: option_env!("ASSIST_CHIPCODE").unwrap_or(""),
            ..Default::default()
        };
        if config.chip_code.is_empty() {
            warn!("ASSIST_CHIPCODE was not set at build time");
        }

        let relay = SerialRelay::new(&usb_tx, &usb_rx, &LINK_UP);
        let mut injector = Injector::new(relay, SystickSleep, &uart_tx, config);

        let mut next_assist = Systick::now();
        let mut next_save = Systick::now() + SOS_INTERVAL_S.secs();

        loop {
            match select(Systick::delay_until(next_assist), Systick::delay_until(next_save)).await {
                Either::First(()) => {
                    let seed = cx.shared.fix_cache.lock(|cache| cache.load());
                    // Read fresh from the calendar on every run
                    let now = cx.shared.clock.lock(|clock| clock.now());
                    debug!("assistance seed: {}, time known: {}", seed, now.is_some());

                    let wait = match injector.run(now, seed, &mut cx.local.blob[..]).await {
                        Ok(report) => {
                            info!("assistance done: {}", report);
                            ASSIST_INTERVAL_S
                        }
                        Err(e) => {
                            error!("assistance failed: {}", e);
                            ASSIST_RETRY_S
                        }
                    };
                    next_assist = Systick::now() + wait.secs();
                }
                Either::Second(()) => {
                    trace!("saving receiver state");
                    UpdSosCreateBackup.send(&uart_tx).await;
                    next_save = Systick::now() + SOS_INTERVAL_S.secs();
                }
            }
        }
    }

    // Poll USB and shuttle bytes between the CDC port and the relay rings
    #[task(priority = 1)]
    async fn usb_poll(
        _cx: usb_poll::Context,
        usb: hal::usb::Peripheral,
        tx_recv: Consumer<u8, USB_BUFSIZE>,
        rx_send: Producer<u8, USB_BUFSIZE>,
    ) {
        trace!("usb_poll enter");

        let usb_bus = UsbBus::new(usb);

        let mut serial = SerialPort::new(&usb_bus);

        let mut usb_dev = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0x16c0, 0x27dd))
            .manufacturer("ECE500")
            .product("GNSS Assist")
            .serial_number("TEST")
            .device_class(USB_CLASS_CDC)
            .build();

        let mut tx_buf = ArrayVec::<[u8; 64]>::new();
        let mut rx_buf = ArrayVec::<[u8; 64]>::new();

        loop {
            Systick::delay(10_u64.millis()).await;

            while tx_buf.len() < tx_buf.capacity() {
                if let Some(b) = tx_recv.try_read() {
                    tx_buf.push(b);
                } else {
                    break;
                }
            }

            let polled = usb_dev.poll(&mut [&mut serial]);
            let up = usb_dev.state() == UsbDeviceState::Configured && serial.dtr();
            if LINK_UP.swap(up, Ordering::Release) != up {
                info!("host link {}", if up { "up" } else { "down" });
            }
            if !polled {
                continue;
            }

            // Only take more from the host once the relay ring accepted the last read
            if rx_buf.is_empty() {
                let mut chunk = [0; 64];
                match serial.read(&mut chunk) {
                    Ok(count) => rx_buf.extend_from_slice(&chunk[..count]),
                    Err(UsbError::WouldBlock) => {}
                    Err(e) => error!("usb read error: {}", e),
                }
            }
            let (_, written) = rx_send.try_write_iter(&mut rx_buf.iter().copied(), None);
            rx_buf.drain(..written).for_each(drop);

            if !tx_buf.is_empty() {
                match serial.write(&tx_buf) {
                    Ok(count) => {
                        trace!("sent {} bytes to usb", count);
                        tx_buf.drain(..count).for_each(drop);
                    }
                    Err(UsbError::WouldBlock) => {}
                    Err(e) => error!("usb write error: {}", e),
                }
            }
        }
    }
}
