//! Driver context.
//!
//! A [`Driver`] owns every channel of its cards together with the shared
//! state machine definitions and buffer pool. It is the only way in from
//! outside: consumer commands, physical layer indications and the passing
//! of time all enter here, run to completion, and leave as calls on the
//! card's [`Phy`] and as queued status events.
//!
//! ```no_run
//! use teles::{Command, Config, Driver, SerialPhy};
//!
//! let phy = SerialPhy::open("/dev/ttyUSB0", 115200)?;
//! let mut driver = Driver::new(0, Config::default(), vec![Box::new(phy)])?;
//! driver.command(0, Command::Dial("12345,,7,0".into()))?;
//! # Ok::<(), anyhow::Error>(())
//! ```
use crate::buffer::BufPool;
use crate::callc::{self, CcArg, CcEvent, DialString};
use crate::channel::{Channel, Defs, L1Mode, LcSide, PhReq, StackId, Status};
use crate::config::{BProto, Config};
use crate::lc::LcState;
use crate::pcap::PcapWriter;
use anyhow::{Error, Result};
use log::{debug, warn};
use std::sync::Arc;

/// Channels of one card's layer 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L1Chan {
    D,
    B1,
    B2,
}

impl L1Chan {
    /// Number on the serial line.
    #[must_use]
    pub fn number(self) -> u8 {
        match self {
            L1Chan::D => 0,
            L1Chan::B1 => 1,
            L1Chan::B2 => 2,
        }
    }

    #[must_use]
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(L1Chan::D),
            1 => Some(L1Chan::B1),
            2 => Some(L1Chan::B2),
            _ => None,
        }
    }
}

/// Indication from a card's layer 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhInd {
    Activate,
    Deactivate,
    Data(Vec<u8>),
}

/// Physical layer of one card.
pub trait Phy: Send {
    /// Bring a channel up. Returns true if it already is, in which case no
    /// activate indication follows.
    fn activate(&mut self, chan: L1Chan, mode: L1Mode) -> Result<bool>;
    fn deactivate(&mut self, chan: L1Chan) -> Result<()>;
    fn send(&mut self, chan: L1Chan, frame: &[u8]) -> Result<()>;
}

/// Consumer commands for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `called,calling,si1,si2`.
    Dial(String),
    AcceptD,
    AcceptB,
    Hangup,
    Suspend,
    Resume,
    /// B channel protocol for the next call.
    SetL2(BProto),
    /// Debug mask, see [`crate::config::DEBUG_CALLC`] and friends.
    Debug(u32),
    /// Stop acknowledging received I frames on the D channel.
    Impair(bool),
}

pub struct Driver {
    id: usize,
    now: u64,
    cfg: Arc<Config>,
    pool: Arc<BufPool>,
    channels: Vec<Channel>,
    phys: Vec<Box<dyn Phy>>,
    d_active: Vec<bool>,
    pcap: Option<PcapWriter>,
}

// Two B channels per card.
fn card_of(chan: usize) -> usize {
    chan / 2
}

fn b_chan(chan: usize) -> L1Chan {
    if chan % 2 == 0 {
        L1Chan::B1
    } else {
        L1Chan::B2
    }
}

impl Driver {
    /// One physical layer per card.
    pub fn new(id: usize, cfg: Config, phys: Vec<Box<dyn Phy>>) -> Result<Self> {
        if phys.len() != cfg.cards {
            return Err(Error::msg(format!(
                "{} cards configured, {} physical layers given",
                cfg.cards,
                phys.len()
            )));
        }
        let cfg = Arc::new(cfg);
        let defs = Defs::new();
        let pool = BufPool::new("teles", cfg.pool_buffers, cfg.pool_buffer_size);
        let channels = (0..cfg.cards * 2)
            .map(|chan| {
                Channel::new(
                    id,
                    chan,
                    Arc::clone(&cfg),
                    Arc::clone(&defs),
                    Arc::clone(&pool),
                )
            })
            .collect();
        Ok(Self {
            id,
            now: 0,
            d_active: vec![false; cfg.cards],
            cfg,
            pool,
            channels,
            phys,
            pcap: None,
        })
    }

    /// Capture D channel frames in both directions.
    pub fn set_pcap(&mut self, pcap: PcapWriter) {
        self.pcap = Some(pcap);
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn channel(&self, chan: usize) -> Option<&Channel> {
        self.channels.get(chan)
    }

    fn chan_mut(&mut self, chan: usize) -> Result<&mut Channel> {
        let now = self.now;
        let ch = self
            .channels
            .get_mut(chan)
            .ok_or_else(|| Error::msg(format!("no channel {chan}")))?;
        ch.now = now;
        Ok(ch)
    }

    pub fn command(&mut self, chan: usize, cmd: Command) -> Result<()> {
        let ch = self.chan_mut(chan)?;
        debug!("ch{chan}: command {cmd:?}");
        let ev = match cmd {
            Command::Dial(s) => {
                let d = DialString::parse(&s)?;
                if !callc::event(ch, CcEvent::Dial, CcArg::Dial(d)).is_handled() {
                    return Err(Error::msg(format!(
                        "ch{chan}: busy in state {:?}",
                        ch.state()
                    )));
                }
                self.pump();
                return Ok(());
            }
            Command::AcceptD => CcEvent::AcceptD,
            Command::AcceptB => CcEvent::AcceptB,
            Command::Hangup => CcEvent::Hangup,
            Command::Suspend => CcEvent::Suspend,
            Command::Resume => CcEvent::Resume,
            Command::SetL2(p) => {
                ch.l2_protocol = p;
                return Ok(());
            }
            Command::Debug(mask) => {
                ch.set_debug(mask);
                return Ok(());
            }
            Command::Impair(on) => {
                ch.is.l2.impair = on;
                return Ok(());
            }
        };
        if !callc::event(ch, ev, CcArg::None).is_handled() {
            debug!("ch{chan}: {ev:?} ignored in state {:?}", ch.state());
        }
        self.pump();
        Ok(())
    }

    /// Send data on an active call.
    pub fn write(&mut self, chan: usize, data: &[u8]) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        let ch = self.chan_mut(chan)?;
        if !ch.data_open {
            return Err(Error::msg(format!("ch{chan}: no B channel connection")));
        }
        let max = ch.max_write();
        if data.len() > max {
            return Err(Error::msg(format!(
                "ch{chan}: {} bytes is more than a frame holds ({max})",
                data.len()
            )));
        }
        let buf = pool
            .get_with("write", data)
            .ok_or_else(|| Error::msg("out of buffers"))?;
        callc::event(ch, CcEvent::WriteBuf, CcArg::Data(buf));
        self.pump();
        Ok(())
    }

    /// Next received frame of a channel.
    pub fn read(&mut self, chan: usize) -> Option<Vec<u8>> {
        self.channels
            .get_mut(chan)?
            .read()
            .map(|b| b.to_vec())
    }

    pub fn poll_status(&mut self) -> Option<Status> {
        self.channels.iter_mut().find_map(Channel::poll_status)
    }

    /// Something happened on a card's layer 1.
    pub fn ph_indication(&mut self, card: usize, l1: L1Chan, ind: PhInd) -> Result<()> {
        if card >= self.phys.len() {
            return Err(Error::msg(format!("no card {card}")));
        }
        let now = self.now;
        let first = card * 2;
        match l1 {
            L1Chan::D => {
                if let PhInd::Data(bytes) = &ind {
                    self.capture(bytes);
                }
                if let PhInd::Activate | PhInd::Deactivate = ind {
                    self.d_active[card] = ind == PhInd::Activate;
                }
                // Every channel of the card listens on the D channel.
                for ch in &mut self.channels[first..first + 2] {
                    ch.now = now;
                    match &ind {
                        PhInd::Activate => ch.ph_activate(StackId::Is),
                        PhInd::Deactivate => ch.ph_deactivate(StackId::Is),
                        PhInd::Data(bytes) => match self.pool.get_with("ph", bytes) {
                            Some(buf) => ch.ph_data(StackId::Is, buf),
                            None => warn!("ch{}: out of buffers, D frame dropped", ch.chan),
                        },
                    }
                }
            }
            L1Chan::B1 | L1Chan::B2 => {
                let chan = first + usize::from(l1 == L1Chan::B2);
                let pool = Arc::clone(&self.pool);
                let ch = self.chan_mut(chan)?;
                match ind {
                    PhInd::Activate => ch.ph_activate(StackId::Ds),
                    PhInd::Deactivate => ch.ph_deactivate(StackId::Ds),
                    PhInd::Data(bytes) => match pool.get_with("ph", &bytes) {
                        Some(buf) => ch.ph_data(StackId::Ds, buf),
                        None => warn!("ch{chan}: out of buffers, B frame dropped"),
                    },
                }
            }
        }
        self.pump();
        Ok(())
    }

    /// Advance the clock to `now` ms and run every timer due.
    pub fn tick(&mut self, now: u64) {
        self.now = now;
        for ch in &mut self.channels {
            ch.run_timers(now);
        }
        self.pump();
    }

    /// Earliest armed timer of any channel, in ms.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.channels.iter().filter_map(Channel::next_deadline).min()
    }

    /// State of every channel.
    #[must_use]
    pub fn report(&self) -> String {
        let mut s = format!(
            "driver {} {} card(s) {:?} buffers {}/{}\n",
            self.id,
            self.cfg.cards,
            self.cfg.protocol,
            self.pool.available(),
            self.pool.count()
        );
        for (card, active) in self.d_active.iter().enumerate() {
            s += &format!("card {card} D channel {}\n", if *active { "up" } else { "down" });
        }
        for ch in &self.channels {
            s += &ch.report();
        }
        s
    }

    fn capture(&mut self, frame: &[u8]) {
        if let Some(pcap) = &mut self.pcap {
            if let Err(e) = pcap.write(frame) {
                warn!("pcap: {e}, capture stopped");
                self.pcap = None;
            }
        }
    }

    // Work off the requests the stacks queued for layer 1. Answering them
    // can queue more.
    fn pump(&mut self) {
        loop {
            let mut busy = false;
            for idx in 0..self.channels.len() {
                for id in [StackId::Is, StackId::Ds] {
                    while let Some(req) = self.channels[idx].stack_mut(id).out.pop_front() {
                        busy = true;
                        self.handle(idx, id, req);
                    }
                }
            }
            if !busy {
                return;
            }
        }
    }

    fn handle(&mut self, idx: usize, id: StackId, req: PhReq) {
        let card = card_of(idx);
        let l1 = match id {
            StackId::Is => L1Chan::D,
            StackId::Ds => b_chan(idx),
        };
        match req {
            PhReq::RequestPull => self.channels[idx].ph_pull_ack(id),
            PhReq::Data(buf) | PhReq::DataPulled(buf) => {
                if id == StackId::Is {
                    self.capture(&buf);
                }
                if let Err(e) = self.phys[card].send(l1, &buf) {
                    warn!("card {card}: send on {l1:?}: {e}");
                }
            }
            PhReq::Activate(mode) => {
                if id == StackId::Is && self.d_active[card] {
                    self.channels[idx].ph_activate(id);
                    return;
                }
                match self.phys[card].activate(l1, mode) {
                    Ok(true) => {
                        if id == StackId::Is {
                            self.d_active[card] = true;
                        }
                        self.channels[idx].ph_activate(id);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("card {card}: activate {l1:?}: {e}"),
                }
            }
            PhReq::Deactivate => {
                if id == StackId::Is {
                    // The D channel stays up while another channel uses it.
                    let first = card * 2;
                    let in_use = self.channels[first..first + 2]
                        .iter()
                        .any(|ch| ch.lc_state(LcSide::D) != LcState::Null);
                    if in_use || !self.d_active[card] {
                        return;
                    }
                    self.d_active[card] = false;
                }
                if let Err(e) = self.phys[card].deactivate(l1) {
                    warn!("card {card}: deactivate {l1:?}: {e}");
                }
            }
        }
    }
}
