//! Layer 1 over a serial line.
//!
//! The card's layer 1 sits behind a KISS-style framing: every frame starts
//! and ends with FEND, with FEND and FESC inside escaped. The first byte of
//! a frame says which layer 1 channel it is for (high nibble, 0 D, 1 B1,
//! 2 B2) and what it is (low nibble, 0 data, 1 activate, 2 deactivate).
//! Activate requests carry one byte of mode, everything else coming up
//! from the card is an indication.
use crate::channel::L1Mode;
use crate::driver::{L1Chan, Phy, PhInd};
use anyhow::{Error, Result};
use log::debug;
use std::collections::VecDeque;
use std::io::{Read, Write};

pub const KISS_FEND: u8 = 0xC0;
pub const KISS_FESC: u8 = 0xDB;
pub const KISS_TFEND: u8 = 0xDC;
pub const KISS_TFESC: u8 = 0xDD;

pub const PRIM_DATA: u8 = 0;
pub const PRIM_ACTIVATE: u8 = 1;
pub const PRIM_DEACTIVATE: u8 = 2;

fn mode_byte(mode: L1Mode) -> u8 {
    match mode {
        L1Mode::DChannel => 0,
        L1Mode::Hdlc => 1,
        L1Mode::Transparent => 2,
    }
}

/// Frame a payload for the wire.
#[must_use]
pub fn escape(chan: L1Chan, prim: u8, bytes: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(bytes.len() + 4);
    ret.push(KISS_FEND);
    ret.push((chan.number() << 4) | prim);
    for &b in bytes {
        match b {
            KISS_FEND => ret.extend([KISS_FESC, KISS_TFEND]),
            KISS_FESC => ret.extend([KISS_FESC, KISS_TFESC]),
            b => ret.push(b),
        }
    }
    ret.push(KISS_FEND);
    ret
}

/// Activation request for a channel.
#[must_use]
pub fn activate_frame(chan: L1Chan, mode: L1Mode) -> Vec<u8> {
    escape(chan, PRIM_ACTIVATE, &[mode_byte(mode)])
}

// Position of the first two FENDs.
fn find_frame(buf: &VecDeque<u8>) -> Option<(usize, usize)> {
    let start = buf.iter().position(|&b| b == KISS_FEND)?;
    let end = buf.iter().skip(start + 1).position(|&b| b == KISS_FEND)?;
    Some((start, start + 1 + end))
}

fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &b in data {
        if escaped {
            out.push(match b {
                KISS_TFEND => KISS_FEND,
                KISS_TFESC => KISS_FESC,
                b => b,
            });
            escaped = false;
        } else if b == KISS_FESC {
            escaped = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Make sense of an unescaped frame from the card.
pub fn parse(frame: &[u8]) -> Result<(L1Chan, PhInd)> {
    let (&typ, payload) = frame
        .split_first()
        .ok_or_else(|| Error::msg("empty frame"))?;
    let chan = L1Chan::from_number(typ >> 4)
        .ok_or_else(|| Error::msg(format!("bad channel in type byte {typ:#04x}")))?;
    let ind = match typ & 0x0f {
        PRIM_DATA => PhInd::Data(payload.to_vec()),
        PRIM_ACTIVATE => PhInd::Activate,
        PRIM_DEACTIVATE => PhInd::Deactivate,
        p => return Err(Error::msg(format!("unknown primitive {p}"))),
    };
    Ok((chan, ind))
}

/// Longest escaped frame kept while waiting for its closing FEND.
pub const MAX_FRAME: usize = 8192;

/// Reassembles indications from a byte stream.
#[derive(Debug, Default)]
pub struct KissDecoder {
    buf: VecDeque<u8>,
    // Dropping input until the next FEND.
    resync: bool,
}

impl KissDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.buf.is_empty() || self.resync {
            // Only a FEND starts a frame.
            let Some(n) = bytes.iter().position(|&b| b == KISS_FEND) else {
                return;
            };
            bytes = &bytes[n..];
            self.resync = false;
        }
        self.buf.extend(bytes);
        let open = self
            .buf
            .iter()
            .rev()
            .position(|&b| b == KISS_FEND)
            .unwrap_or(self.buf.len());
        if open > MAX_FRAME {
            debug!("kiss: no frame end in {open} bytes, resyncing");
            self.buf.truncate(self.buf.len() - open);
            self.resync = true;
        }
    }

    /// Next complete indication, skipping anything unparsable.
    pub fn next_ind(&mut self) -> Option<(L1Chan, PhInd)> {
        while let Some((a, b)) = find_frame(&self.buf) {
            if b - a < 2 {
                // Back to back FENDs.
                self.buf.drain(..=a);
                continue;
            }
            let raw: Vec<u8> = self.buf.iter().skip(a + 1).take(b - a - 1).copied().collect();
            // The closing FEND may open the next frame.
            self.buf.drain(..b);
            match parse(&unescape(&raw)) {
                Ok(ind) => return Some(ind),
                Err(e) => debug!("kiss: dropping frame: {e}"),
            }
        }
        None
    }
}

/// A card on a serial port, the sending half.
pub struct SerialPhy {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPhy {
    pub fn open(port: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(port, baud)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(Self { port })
    }

    /// The receiving half, on a clone of the port.
    pub fn reader(&self) -> Result<SerialReader> {
        Ok(SerialReader {
            port: self.port.try_clone()?,
            dec: KissDecoder::new(),
        })
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }
}

pub struct SerialReader {
    port: Box<dyn serialport::SerialPort>,
    dec: KissDecoder,
}

impl SerialReader {
    /// Wait up to `timeout` for an indication.
    pub fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<Option<(L1Chan, PhInd)>> {
        let end = std::time::Instant::now() + timeout;
        loop {
            if let Some(ind) = self.dec.next_ind() {
                return Ok(Some(ind));
            }
            let left = end.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.port.set_timeout(left)?;
            let mut buf = [0u8; 512];
            match self.port.read(&mut buf) {
                Ok(n) => {
                    debug!("kiss: {n} bytes from serial");
                    self.dec.push(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Phy for SerialPhy {
    // The card answers with an activate indication.
    fn activate(&mut self, chan: L1Chan, mode: L1Mode) -> Result<bool> {
        self.write_frame(&activate_frame(chan, mode))?;
        Ok(false)
    }
    fn deactivate(&mut self, chan: L1Chan) -> Result<()> {
        self.write_frame(&escape(chan, PRIM_DEACTIVATE, &[]))
    }
    fn send(&mut self, chan: L1Chan, frame: &[u8]) -> Result<()> {
        self.write_frame(&escape(chan, PRIM_DATA, frame))
    }
}
