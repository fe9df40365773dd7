use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering::Acquire},
};

use tinyvec::ArrayVec;

use super::{AssistRequest, AssistanceSource, NetError};
use crate::{
    rb::{Consumer, Producer},
    FmtBuf,
};

/// Fetches assistance data through a host on the other end of a serial link.
///
/// The host receives `GET /GetAssistNowData.ashx?<query>\n` and answers with
/// `OK <len>\n` followed by exactly `len` bytes, or with `ERR <reason>\n`.
pub struct SerialRelay<'a, const TX: usize, const RX: usize> {
    tx: &'a Producer<u8, TX>,
    rx: &'a Consumer<u8, RX>,
    link_up: &'a AtomicBool,
}

impl<'a, const TX: usize, const RX: usize> SerialRelay<'a, TX, RX> {
    pub fn new(tx: &'a Producer<u8, TX>, rx: &'a Consumer<u8, RX>, link_up: &'a AtomicBool) -> Self {
        Self { tx, rx, link_up }
    }

    fn discard_input(&self) {
        while self.rx.try_read().is_some() {}
    }

    async fn read_header(&self) -> Result<ArrayVec<[u8; 32]>, NetError> {
        let mut line = ArrayVec::new();
        loop {
            match self.rx.async_read().await {
                b'\n' => return Ok(line),
                b => {
                    if line.try_push(b).is_some() {
                        return Err(NetError::Protocol);
                    }
                }
            }
        }
    }
}

fn parse_header(line: &[u8]) -> Result<usize, NetError> {
    let line = core::str::from_utf8(line).map_err(|_| NetError::Protocol)?;
    let line = line.trim_end_matches('\r');
    if let Some(len) = line.strip_prefix("OK ") {
        len.trim().parse().map_err(|_| NetError::Protocol)
    } else if line.starts_with("ERR") {
        Err(NetError::Unreachable)
    } else {
        Err(NetError::Protocol)
    }
}

impl<const TX: usize, const RX: usize> AssistanceSource for SerialRelay<'_, TX, RX> {
    async fn associate(&mut self) -> Result<(), NetError> {
        self.discard_input();
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.link_up.load(Acquire)
    }

    async fn fetch(&mut self, request: &AssistRequest<'_>, blob: &mut [u8]) -> Result<usize, NetError> {
        if !self.is_associated() {
            return Err(NetError::LinkDown);
        }
        let mut line = FmtBuf::<256>::new();
        writeln!(line, "GET /GetAssistNowData.ashx?{}", request).map_err(|_| NetError::Protocol)?;
        self.tx.async_write_iter(line.as_bytes().iter().copied()).await;

        let header = self.read_header().await?;
        let len = parse_header(&header)?;
        let Some(body) = blob.get_mut(..len) else {
            return Err(NetError::TooLarge {
                len,
                capacity: blob.len(),
            });
        };
        let mut received = 0;
        while received < len {
            self.rx.readable().await;
            received += self.rx.read_into(&mut body[received..]);
        }
        Ok(len)
    }

    async fn disconnect(&mut self) {
        self.discard_input();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        assert_eq!(parse_header(b"OK 1234"), Ok(1234));
        assert_eq!(parse_header(b"OK 12\r"), Ok(12));
        assert_eq!(parse_header(b"ERR no route"), Err(NetError::Unreachable));
        assert_eq!(parse_header(b"OK"), Err(NetError::Protocol));
        assert_eq!(parse_header(b"HTTP/1.1 200"), Err(NetError::Protocol));
    }

    #[test]
    fn request_line() {
        let request = AssistRequest {
            chip_code: "abc",
            gnss: "gps,gal",
            data: "uporb_1,ualm",
        };
        let mut line = FmtBuf::<128>::new();
        writeln!(line, "GET /GetAssistNowData.ashx?{}", request).unwrap();
        assert_eq!(
            line.as_str(),
            Some("GET /GetAssistNowData.ashx?chipcode=abc&gnss=gps,gal&data=uporb_1,ualm\n")
        );
    }
}
