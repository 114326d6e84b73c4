//! tokio front end.
//!
//! [`run`] owns a [`Driver`] and feeds it one input at a time: consumer
//! commands, layer 1 indications from the card links, and timer expiries.
//! Each runs to completion before the next is looked at, so the protocol
//! engine never sees two events at once.
use crate::channel::{L1Mode, Status};
use crate::driver::{Command, Driver, L1Chan, Phy, PhInd};
use crate::serial::{self, KissDecoder};

use anyhow::{Error, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub enum Input {
    Command(usize, Command),
    Write(usize, Vec<u8>),
    Phy(usize, L1Chan, PhInd),
    /// Text report of every channel.
    Report(oneshot::Sender<String>),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Status(Status),
    /// Received on a channel.
    Data(usize, Vec<u8>),
    /// A command or write for a channel failed.
    Error(usize, String),
}

// Far enough to not matter when no timer is armed.
const IDLE: Duration = Duration::from_secs(86400);

async fn emit(out: &mpsc::Sender<Output>, o: Output) -> Result<()> {
    out.send(o)
        .await
        .map_err(|_| Error::msg("consumer went away"))
}

// Hand everything the last input produced to the consumer.
async fn drain(driver: &mut Driver, out: &mpsc::Sender<Output>) -> Result<()> {
    while let Some(s) = driver.poll_status() {
        emit(out, Output::Status(s)).await?;
    }
    for chan in 0..driver.channels() {
        while let Some(data) = driver.read(chan) {
            emit(out, Output::Data(chan, data)).await?;
        }
    }
    Ok(())
}

/// Drive until [`Input::Stop`] or every input sender is gone.
pub async fn run(
    mut driver: Driver,
    mut rx: mpsc::Receiver<Input>,
    out: mpsc::Sender<Output>,
) -> Result<()> {
    let start = Instant::now();
    let ms = |t: Instant| u64::try_from(t.duration_since(start).as_millis()).unwrap_or(u64::MAX);
    loop {
        drain(&mut driver, &out).await?;
        let wake = driver
            .next_deadline()
            .map_or(Instant::now() + IDLE, |d| start + Duration::from_millis(d));
        tokio::select! {
            () = tokio::time::sleep_until(wake) => {
                driver.tick(ms(Instant::now()));
            },
            input = rx.recv() => {
                // Timers armed now count from now.
                driver.tick(ms(Instant::now()));
                let Some(input) = input else {
                    info!("all inputs closed");
                    return Ok(());
                };
                match input {
                    Input::Command(chan, cmd) => {
                        if let Err(e) = driver.command(chan, cmd) {
                            warn!("ch{chan}: {e}");
                            emit(&out, Output::Error(chan, e.to_string())).await?;
                        }
                    }
                    Input::Write(chan, data) => {
                        if let Err(e) = driver.write(chan, &data) {
                            emit(&out, Output::Error(chan, e.to_string())).await?;
                        }
                    }
                    Input::Phy(card, l1, ind) => {
                        if let Err(e) = driver.ph_indication(card, l1, ind) {
                            warn!("card {card}: {e}");
                        }
                    }
                    Input::Report(tx) => {
                        let _ = tx.send(driver.report());
                    }
                    Input::Stop => return Ok(()),
                }
            },
        }
    }
}

/// Open a serial port for [`spawn_link`].
pub fn open_serial(path: &str, baud: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;
    Ok(tokio_serial::new(path, baud).open_native_async()?)
}

/// Layer 1 of a card behind an async byte stream.
///
/// Requests are framed and queued for the link task, which also turns what
/// the card sends into [`Input::Phy`] for the runner.
pub struct LinkPhy {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl LinkPhy {
    fn queue(&self, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::msg("link task gone"))
    }
}

impl Phy for LinkPhy {
    fn activate(&mut self, chan: L1Chan, mode: L1Mode) -> Result<bool> {
        self.queue(serial::activate_frame(chan, mode))?;
        Ok(false)
    }
    fn deactivate(&mut self, chan: L1Chan) -> Result<()> {
        self.queue(serial::escape(chan, serial::PRIM_DEACTIVATE, &[]))
    }
    fn send(&mut self, chan: L1Chan, frame: &[u8]) -> Result<()> {
        self.queue(serial::escape(chan, serial::PRIM_DATA, frame))
    }
}

/// Run the KISS link of card `card` over `stream`.
pub fn spawn_link<S>(stream: S, card: usize, input: mpsc::Sender<Input>) -> LinkPhy
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        let mut stream = stream;
        let mut dec = KissDecoder::new();
        let mut buf = [0; 1024];
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    if let Err(e) = stream.write_all(&frame).await {
                        warn!("card {card}: write: {e}");
                        break;
                    }
                    if let Err(e) = stream.flush().await {
                        warn!("card {card}: flush: {e}");
                        break;
                    }
                },
                res = stream.read(&mut buf) => match res {
                    Ok(0) => {
                        info!("card {card}: link closed");
                        break;
                    }
                    Ok(n) => {
                        debug!("card {card}: {n} bytes");
                        dec.push(&buf[..n]);
                        while let Some((l1, ind)) = dec.next_ind() {
                            if input.send(Input::Phy(card, l1, ind)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("card {card}: read: {e}");
                        break;
                    }
                },
            }
        }
        debug!("card {card}: link task ending");
    });
    LinkPhy { tx }
}
