use core::{
    cell::{Cell, UnsafeCell},
    future::{poll_fn, Future},
    mem::MaybeUninit,
    sync::atomic::{
        AtomicBool, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release},
    },
    task::{
        Poll::{Pending, Ready},
        Waker,
    },
};

use critical_section::Mutex;

use crate::ubx::FrameWindow;

/// Single-producer/single-consumer ring buffer with a fixed capacity `N`.
///
/// Push at HEAD, pop at TAIL. Only the [`Producer`] ever stores `head` and
/// only the [`Consumer`] ever stores `tail`; each side publishes its cursor
/// with `Release` after touching the slots and reads the other cursor with
/// `Acquire`. Both cursors count over `0..2N`, so a full buffer (distance `N`)
/// and an empty one (distance `0`) never alias. Critical sections are only
/// taken to swap the wakers.
pub struct Ringbuf<T, const N: usize> {
    is_split: AtomicBool,
    notify: Option<fn()>,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicUsize,
    consumer_waker: Mutex<Cell<Option<Waker>>>,
    producer_waker: Mutex<Cell<Option<Waker>>>,
    buf: [UnsafeCell<MaybeUninit<T>>; N],
}

// SAFETY: The safety guarantees within later unsafe blocks in this implementation
// allow us to safely share the UnsafeCells over thread boundaries.
unsafe impl<T: Send, const N: usize> Sync for Ringbuf<T, N> {}

impl<T, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T, const N: usize> Ringbuf<T, N> {
    const WRAP: usize = 2 * N;

    /// `notify` runs after every successful producer write, e.g. to pend the
    /// interrupt that drains the buffer.
    pub const fn new(notify: Option<fn()>) -> Self {
        const { assert!(N > 0 && N <= usize::MAX / 4, "unsupported ring capacity") };
        Self {
            is_split: AtomicBool::new(false),
            notify,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            consumer_waker: Mutex::new(Cell::new(None)),
            producer_waker: Mutex::new(Cell::new(None)),
            buf: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
        }
    }

    /// ## Safety
    /// Must only be called once, as only one Producer and Consumer may
    /// exist per Ringbuf.
    pub unsafe fn split(&'static self) -> (Producer<T, N>, Consumer<T, N>) {
        self.is_split.store(true, Relaxed);
        (Producer(self), Consumer(self))
    }

    pub fn try_split(&'static self) -> Option<(Producer<T, N>, Consumer<T, N>)> {
        if self.is_split.fetch_or(true, Relaxed) {
            None
        } else {
            // SAFETY: We have just checked to ensure that this Ringbuf has not
            // been split.
            Some(unsafe { self.split() })
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of items rejected by [`Producer::write`] because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Relaxed)
    }

    fn occupied(head: usize, tail: usize) -> usize {
        if head >= tail {
            head - tail
        } else {
            head + Self::WRAP - tail
        }
    }

    fn advance(index: usize, by: usize) -> usize {
        let next = index + by;
        if next >= Self::WRAP {
            next - Self::WRAP
        } else {
            next
        }
    }

    fn slot(&self, index: usize) -> *mut MaybeUninit<T> {
        self.buf[index % N].get()
    }

    fn len(&self) -> usize {
        Self::occupied(self.head.load(Acquire), self.tail.load(Acquire))
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() == N
    }

    fn wake_consumer(&self) {
        if let Some(waker) = critical_section::with(|cs| self.consumer_waker.borrow(cs).take()) {
            waker.wake();
            trace!("woke up Consumer from Producer");
        }
    }

    fn wake_producer(&self) {
        if let Some(waker) = critical_section::with(|cs| self.producer_waker.borrow(cs).take()) {
            waker.wake();
            trace!("woke up Producer from Consumer");
        }
    }

    fn register_consumer(&self, waker: &Waker) {
        critical_section::with(|cs| self.consumer_waker.borrow(cs).set(Some(waker.clone())));
    }

    fn register_producer(&self, waker: &Waker) {
        critical_section::with(|cs| self.producer_waker.borrow(cs).set(Some(waker.clone())));
    }
}

pub struct Consumer<T: 'static, const N: usize>(&'static Ringbuf<T, N>);

impl<T: 'static, const N: usize> Consumer<T, N> {
    pub fn try_read(&self) -> Option<T> {
        let tail = self.0.tail.load(Relaxed);
        let head = self.0.head.load(Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: The slot at `tail` was published by the producer's Release
        // store of `head`, and the producer will not reuse it until `tail`
        // moves past it.
        let val = unsafe { self.0.slot(tail).read().assume_init() };
        self.0.tail.store(Ringbuf::<T, N>::advance(tail, 1), Release);
        self.0.wake_producer();
        Some(val)
    }

    pub fn async_read(&self) -> impl Future<Output = T> + '_ {
        poll_fn(|ctx| match self.try_read() {
            Some(val) => Ready(val),
            None => {
                self.0.register_consumer(ctx.waker());
                // The producer may have written between the failed read and
                // the registration.
                match self.try_read() {
                    Some(val) => Ready(val),
                    None => Pending,
                }
            }
        })
    }

    /// Resolves once at least one item is available, without consuming it.
    pub fn readable(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(|ctx| {
            if !self.0.is_empty() {
                return Ready(());
            }
            self.0.register_consumer(ctx.waker());
            if self.0.is_empty() {
                Pending
            } else {
                Ready(())
            }
        })
    }

    pub fn read_available(&self) -> usize {
        self.0.len()
    }

    pub fn dropped(&self) -> usize {
        self.0.dropped()
    }

    pub fn is_full(&self) -> bool {
        self.0.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> Consumer<u8, N> {
    fn peek_at(&self, tail: usize, offset: usize) -> u8 {
        // SAFETY: Callers only pass offsets below the occupied length observed
        // after an Acquire load of `head`.
        unsafe { self.0.slot(tail + offset).read().assume_init() }
    }

    fn release(&self, tail: usize, count: usize) {
        if count > 0 {
            self.0.tail.store(Ringbuf::<u8, N>::advance(tail, count), Release);
            self.0.wake_producer();
        }
    }

    /// Copy as many bytes as are available (up to `out.len()`) and advance
    /// past them.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let tail = self.0.tail.load(Relaxed);
        let head = self.0.head.load(Acquire);
        let count = Ringbuf::<u8, N>::occupied(head, tail).min(out.len());
        for (i, b) in out[..count].iter_mut().enumerate() {
            *b = self.peek_at(tail, i);
        }
        self.release(tail, count);
        count
    }

    /// Take one `\n`-terminated line, terminator included.
    ///
    /// Lines longer than `out` are cut to `out.len()` and the remainder up to
    /// the terminator is discarded. Without a terminator, data is only handed
    /// out once it fills `out` (or the whole ring), so a line is never split
    /// just because it is still arriving.
    pub fn drain_line(&self, out: &mut [u8]) -> Option<usize> {
        if out.is_empty() {
            return None;
        }
        let tail = self.0.tail.load(Relaxed);
        let head = self.0.head.load(Acquire);
        let available = Ringbuf::<u8, N>::occupied(head, tail);

        let newline = (0..available).position(|i| self.peek_at(tail, i) == b'\n');
        let (consume, keep) = match newline {
            Some(i) => (i + 1, (i + 1).min(out.len())),
            None if available >= out.len() || available == N => {
                let n = available.min(out.len());
                (n, n)
            }
            None => return None,
        };

        for (i, b) in out[..keep].iter_mut().enumerate() {
            *b = self.peek_at(tail, i);
        }
        self.release(tail, consume);
        Some(keep)
    }

    /// Move whatever fits from the ring into `window`, returning the byte count.
    pub fn drain_frame_window<const W: usize>(&self, window: &mut FrameWindow<W>) -> usize {
        window.fill(|spare| self.read_into(spare))
    }
}

pub struct Producer<T: 'static, const N: usize>(&'static Ringbuf<T, N>);

impl<T: 'static, const N: usize> Producer<T, N> {
    pub fn try_write(&self, val: T) -> Result<(), T> {
        let head = self.0.head.load(Relaxed);
        let tail = self.0.tail.load(Acquire);
        if Ringbuf::<T, N>::occupied(head, tail) == N {
            return Err(val);
        }
        // SAFETY: The buffer is not full, and could not have become full since
        // we checked it because only one Producer may exist.
        unsafe {
            (*self.0.slot(head)).write(val);
        }
        self.0.head.store(Ringbuf::<T, N>::advance(head, 1), Release);
        self.0.wake_consumer();
        if let Some(notify) = self.0.notify {
            notify();
        }
        Ok(())
    }

    /// Write `leftover` and then the iterator until the buffer fills up.
    /// Returns the item that did not fit, and the number of items written.
    pub fn try_write_iter(
        &self,
        iter: &mut impl Iterator<Item = T>,
        leftover: Option<T>,
    ) -> (Result<(), T>, usize) {
        let mut count = 0_usize;
        for val in leftover.into_iter().chain(iter) {
            if let Err(val) = self.try_write(val) {
                return (Err(val), count);
            }
            count += 1;
        }
        (Ok(()), count)
    }

    pub fn async_write(&self, val: T) -> impl Future<Output = ()> + '_ {
        let mut pending = Some(val);
        poll_fn(move |ctx| {
            let Some(val) = pending.take() else {
                return Ready(());
            };
            match self.try_write(val) {
                Ok(()) => Ready(()),
                Err(val) => {
                    self.0.register_producer(ctx.waker());
                    match self.try_write(val) {
                        Ok(()) => Ready(()),
                        Err(val) => {
                            pending = Some(val);
                            Pending
                        }
                    }
                }
            }
        })
    }

    pub fn async_write_iter<'a>(
        &'a self,
        mut iter: impl Iterator<Item = T> + 'a,
    ) -> impl Future<Output = usize> + 'a {
        let mut leftover = None;
        let mut count = 0;
        poll_fn(move |ctx| loop {
            let (result, written) = self.try_write_iter(&mut iter, leftover.take());
            count += written;
            match result {
                Ok(()) => return Ready(count),
                Err(val) => {
                    leftover = Some(val);
                    self.0.register_producer(ctx.waker());
                    if self.0.is_full() {
                        return Pending;
                    }
                }
            }
        })
    }

    /// Resolves once the consumer has taken everything written so far.
    pub fn flush(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(|ctx| {
            if self.0.is_empty() {
                return Ready(());
            }
            self.0.register_producer(ctx.waker());
            if self.0.is_empty() {
                Ready(())
            } else {
                Pending
            }
        })
    }

    pub fn is_full(&self) -> bool {
        self.0.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> Producer<u8, N> {
    /// Copy as much of `bytes` as fits without waiting. Whatever does not fit
    /// is dropped and counted in [`Ringbuf::dropped`]; the producer never
    /// blocks on the consumer.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let head = self.0.head.load(Relaxed);
        let tail = self.0.tail.load(Acquire);
        let free = N - Ringbuf::<u8, N>::occupied(head, tail);
        let count = free.min(bytes.len());
        for (i, &b) in bytes[..count].iter().enumerate() {
            // SAFETY: The `free` slots after `head` belong to the producer until
            // `head` is published below.
            unsafe {
                (*self.0.slot(head + i)).write(b);
            }
        }
        if count > 0 {
            self.0.head.store(Ringbuf::<u8, N>::advance(head, count), Release);
            self.0.wake_consumer();
            if let Some(notify) = self.0.notify {
                notify();
            }
        }
        if count < bytes.len() {
            self.0.dropped.fetch_add(bytes.len() - count, Relaxed);
        }
        count
    }

    pub fn dropped(&self) -> usize {
        self.0.dropped()
    }
}
