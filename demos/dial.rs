//! Dial a number over a KISS serial card and print what happens.
//!
//! Ctrl-C hangs up. Received data goes to stdout.
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Error, Result};
use clap::Parser;
use tokio::sync::mpsc;

use teles::r#async::{self as runner, Input, Output};
use teles::{
    BProto, Command, Config, DProtocol, Driver, PcapWriter, SerialPhy, Status, StatusEvent,
};

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'p', default_value = "/dev/ttyUSB0")]
    port: String,

    #[clap(short = 'b', default_value = "115200")]
    baud: u32,

    /// Own number (MSN / EAZ).
    #[clap(short = 'c', default_value = "")]
    calling: String,

    #[clap(long, default_value = "7")]
    si1: u8,

    #[clap(long, default_value = "0")]
    si2: u8,

    /// Use 1TR6 instead of E-DSS1.
    #[clap(long)]
    tr6: bool,

    /// Fixed TEI instead of automatic assignment.
    #[clap(long)]
    tei: Option<u8>,

    /// B channel protocol: x75, hdlc or trans.
    #[clap(short = 'l', default_value = "x75")]
    l2: String,

    /// Capture the D channel to this file.
    #[clap(long)]
    pcap: Option<std::path::PathBuf>,

    /// Run without tokio.
    #[clap(long)]
    blocking: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap()]
    number: String,
}

impl Opt {
    fn config(&self) -> Result<Config> {
        let l2_protocol = match self.l2.as_str() {
            "x75" => BProto::X75,
            "hdlc" => BProto::Hdlc,
            "trans" => BProto::Transparent,
            other => return Err(Error::msg(format!("unknown B channel protocol {other}"))),
        };
        Ok(Config {
            protocol: if self.tr6 {
                DProtocol::Tr6
            } else {
                DProtocol::Ets
            },
            tei: self.tei,
            l2_protocol,
            ..Config::default()
        })
    }

    fn dial(&self) -> Command {
        Command::Dial(format!(
            "{},{},{},{}",
            self.number, self.calling, self.si1, self.si2
        ))
    }
}

// True once the call is over.
fn show(s: &Status) -> bool {
    match &s.event {
        StatusEvent::Icall(setup) => println!("incoming call {setup} ignored"),
        StatusEvent::Cinf(units) => println!("charge: {units} units"),
        StatusEvent::Bsent => {}
        ev => println!("{ev:?}"),
    }
    s.event == StatusEvent::Dhup
}

fn blocking(opt: &Opt, cfg: Config) -> Result<()> {
    let phy = SerialPhy::open(&opt.port, opt.baud)?;
    let mut reader = phy.reader()?;
    let mut driver = Driver::new(0, cfg, vec![Box::new(phy)])?;
    if let Some(path) = &opt.pcap {
        driver.set_pcap(PcapWriter::create(path)?);
    }
    let hangup = Arc::new(AtomicBool::new(false));
    {
        let hangup = Arc::clone(&hangup);
        ctrlc::set_handler(move || hangup.store(true, Ordering::SeqCst))?;
    }
    let start = std::time::Instant::now();
    let now = || u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    driver.command(0, opt.dial())?;
    loop {
        if hangup.swap(false, Ordering::SeqCst) {
            eprintln!("Hanging up");
            driver.command(0, Command::Hangup)?;
        }
        let wait = driver
            .next_deadline()
            .map_or(100, |d| d.saturating_sub(now()).min(100));
        if let Some((l1, ind)) = reader.recv_timeout(std::time::Duration::from_millis(wait))? {
            driver.tick(now());
            driver.ph_indication(0, l1, ind)?;
        }
        driver.tick(now());
        while let Some(s) = driver.poll_status() {
            if show(&s) {
                return Ok(());
            }
        }
        while let Some(data) = driver.read(0) {
            std::io::stdout().write_all(&data)?;
            std::io::stdout().flush()?;
        }
    }
}

async fn with_tokio(opt: &Opt, cfg: Config) -> Result<()> {
    let (tx, rx) = mpsc::channel(100);
    let (out_tx, mut out) = mpsc::channel(100);
    let link = runner::spawn_link(runner::open_serial(&opt.port, opt.baud)?, 0, tx.clone());
    let mut driver = Driver::new(0, cfg, vec![Box::new(link)])?;
    if let Some(path) = &opt.pcap {
        driver.set_pcap(PcapWriter::create(path)?);
    }
    let task = tokio::spawn(runner::run(driver, rx, out_tx));
    {
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            eprintln!("Hanging up");
            let _ = tx.blocking_send(Input::Command(0, Command::Hangup));
        })?;
    }
    tx.send(Input::Command(0, opt.dial())).await?;
    while let Some(o) = out.recv().await {
        match o {
            Output::Status(s) => {
                if show(&s) {
                    break;
                }
            }
            Output::Data(_, data) => {
                std::io::stdout().write_all(&data)?;
                std::io::stdout().flush()?;
            }
            Output::Error(chan, e) => {
                eprintln!("ch{chan}: {e}");
                break;
            }
        }
    }
    let (rtx, rrx) = tokio::sync::oneshot::channel();
    tx.send(Input::Report(rtx)).await?;
    eprint!("{}", rrx.await?);
    tx.send(Input::Stop).await?;
    task.await?
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("teles")
        .verbosity(opt.v)
        .init()
        .map_err(|e| Error::msg(format!("logging: {e}")))?;
    let cfg = opt.config()?;
    if opt.blocking {
        blocking(&opt, cfg)
    } else {
        tokio::runtime::Runtime::new()?.block_on(with_tokio(&opt, cfg))
    }
}
