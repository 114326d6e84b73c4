//! Per B-channel context.
//!
//! A [`Channel`] owns everything one call needs: the call control instance,
//! the D and B link connections, the signalling stack (`is`, LAPD + layer 3)
//! and the data stack (`ds`, the B-channel protocol). All state machines of
//! the channel are driven through `&mut Channel`, which is what makes
//! reentrant dispatch between the layers safe.
use crate::buffer::{Buf, BufPool, BufQueue};
use crate::callc::{self, CcEvent, CcFsm, CcState};
use crate::config::{BProto, Config, DEBUG_CALLC, DEBUG_L2, DEBUG_L3, DEBUG_LC};
use crate::fsm::{FsmEnum, FsmInst};
use crate::l2::{self, L2Arg, L2Event, L2Fsm, L2Link, Layer2};
use crate::l3::Layer3;
use crate::lc::{self, LcEvent, LcFsm, LinkConn};
use crate::tei::{self, TeiMgr};
use log::{debug, info};
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;

/// The two protocol stacks of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackId {
    /// Signalling: LAPD on the D channel.
    Is,
    /// Data: the B channel.
    Ds,
}

/// Which link connection of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LcSide {
    D,
    B,
}

impl LcSide {
    #[must_use]
    pub fn stack(self) -> StackId {
        match self {
            LcSide::D => StackId::Is,
            LcSide::B => StackId::Ds,
        }
    }
}

/// Layer 1 operating mode requested on activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1Mode {
    DChannel,
    Hdlc,
    Transparent,
}

/// Request from a stack to its physical layer.
#[derive(Debug)]
pub enum PhReq {
    Activate(L1Mode),
    Deactivate,
    /// Frame to transmit.
    Data(Buf),
    /// Layer 2 has I frames queued and wants a transmit opportunity,
    /// answered by a pull acknowledge.
    RequestPull,
    /// I frame built in response to a pull acknowledge.
    DataPulled(Buf),
}

/// A protocol stack: queued requests towards layer 1, and the data link.
pub struct PStack {
    pub out: VecDeque<PhReq>,
    pub l2: Layer2,
}

/// Status events for the link-level consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Incoming call, `calling,si1,si2,called`.
    Icall(String),
    Dconn,
    Bconn,
    Dhup,
    Bhup,
    /// Charge units, decimal.
    Cinf(String),
    /// Queued B-channel data has been sent.
    Bsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub driver: usize,
    pub chan: usize,
    pub event: StatusEvent,
}

/// Parameters of the current call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallParams {
    /// Remote party on incoming calls, dialled number on outgoing ones.
    pub phone: String,
    /// Own number (EAZ / MSN).
    pub eazmsn: String,
    pub si1: u8,
    pub si2: u8,
    /// Channel bitmask from the channel identification (1 = B1, 2 = B2).
    pub bchannel: u8,
    pub callref: u8,
    pub cause: Option<u8>,
    pub chargeinfo: u32,
}

/// Immutable state machine definitions shared by every channel.
pub struct Defs {
    pub callc: CcFsm,
    pub lc: LcFsm,
    pub l2: L2Fsm,
}

impl Defs {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callc: callc::fsm(),
            lc: lc::fsm(),
            l2: l2::fsm(),
        })
    }
}

/// Layer 2 side of a B-channel protocol.
///
/// Selected once per call when the data stack is set up, and fixed until the
/// next call.
pub trait BProtocol: Sync {
    fn name(&self) -> &'static str;
    fn l1_mode(&self) -> L1Mode;
    /// Does the link connection have to bring up a data link on top of
    /// layer 1?
    fn uses_l2(&self) -> bool;
    /// Consumer data to send.
    fn data_req(&self, ch: &mut Channel, buf: Buf);
    /// Frame received from layer 1.
    fn ph_data(&self, ch: &mut Channel, buf: Buf);
}

struct X75;
struct Hdlc;
struct Transparent;

impl BProtocol for X75 {
    fn name(&self) -> &'static str {
        "X.75"
    }
    fn l1_mode(&self) -> L1Mode {
        L1Mode::Hdlc
    }
    fn uses_l2(&self) -> bool {
        true
    }
    fn data_req(&self, ch: &mut Channel, buf: Buf) {
        if !l2::event(ch, StackId::Ds, L2Event::DlData, L2Arg::Data(buf)).is_handled() {
            debug!("ch{}: X.75 link not up, data dropped", ch.chan);
        }
    }
    fn ph_data(&self, ch: &mut Channel, buf: Buf) {
        l2::frame_in(ch, StackId::Ds, buf);
    }
}

// Without a data link every queued frame counts as sent.
fn raw_data_req(ch: &mut Channel, buf: Buf) {
    ch.ds.out.push_back(PhReq::Data(buf));
    ch.emit(StatusEvent::Bsent);
}

impl BProtocol for Hdlc {
    fn name(&self) -> &'static str {
        "HDLC"
    }
    fn l1_mode(&self) -> L1Mode {
        L1Mode::Hdlc
    }
    fn uses_l2(&self) -> bool {
        false
    }
    fn data_req(&self, ch: &mut Channel, buf: Buf) {
        raw_data_req(ch, buf);
    }
    fn ph_data(&self, ch: &mut Channel, buf: Buf) {
        callc::event(ch, CcEvent::DataIn, callc::CcArg::Data(buf));
    }
}

impl BProtocol for Transparent {
    fn name(&self) -> &'static str {
        "transparent"
    }
    fn l1_mode(&self) -> L1Mode {
        L1Mode::Transparent
    }
    fn uses_l2(&self) -> bool {
        false
    }
    fn data_req(&self, ch: &mut Channel, buf: Buf) {
        raw_data_req(ch, buf);
    }
    fn ph_data(&self, ch: &mut Channel, buf: Buf) {
        callc::event(ch, CcEvent::DataIn, callc::CcArg::Data(buf));
    }
}

#[must_use]
pub fn b_protocol(p: BProto) -> &'static dyn BProtocol {
    match p {
        BProto::X75 => &X75,
        BProto::Hdlc => &Hdlc,
        BProto::Transparent => &Transparent,
    }
}

pub struct Channel {
    pub chan: usize,
    pub driver: usize,
    pub(crate) now: u64,
    pub(crate) cfg: Arc<Config>,
    pub(crate) defs: Arc<Defs>,
    pub(crate) pool: Arc<BufPool>,

    pub(crate) fi: FsmInst<CcState>,
    pub(crate) lc_d: LinkConn,
    pub(crate) lc_b: LinkConn,
    pub(crate) is: PStack,
    pub(crate) ds: PStack,
    pub(crate) tei: TeiMgr,
    pub(crate) l3: Layer3,

    pub(crate) para: CallParams,
    /// Set with SETL2, used for the next call.
    pub(crate) l2_protocol: BProto,
    pub(crate) bproto: &'static dyn BProtocol,
    pub(crate) outcallref: u8,
    pub(crate) data_open: bool,
    pub(crate) incoming: bool,
    /// The consumer knows about this call and is owed a DHUP.
    pub(crate) ll_call: bool,
    /// BCONN was reported, BHUP is owed.
    pub(crate) bconn: bool,

    pub(crate) status: VecDeque<Status>,
    pub(crate) rx: BufQueue,
}

impl Channel {
    #[must_use]
    pub fn new(
        driver: usize,
        chan: usize,
        cfg: Arc<Config>,
        defs: Arc<Defs>,
        pool: Arc<BufPool>,
    ) -> Self {
        // A fixed TEI is the base for the first channel of a card.
        let tei = cfg.tei.map(|t| t.wrapping_add((chan % 2) as u8));
        let is = PStack {
            out: VecDeque::new(),
            l2: Layer2::new(format!("ch{chan} isdnl2"), L2Link::Lapd, tei, &cfg.d_l2),
        };
        let ds = PStack {
            out: VecDeque::new(),
            l2: Layer2::new(
                format!("ch{chan} x75"),
                L2Link::Lapb { orig: true },
                None,
                &cfg.b_l2,
            ),
        };
        let mut ch = Self {
            chan,
            driver,
            now: 0,
            fi: FsmInst::new(format!("ch{chan} callc"), CcState::Null),
            lc_d: LinkConn::new(format!("ch{chan} lc_d"), &cfg.lc),
            lc_b: LinkConn::new(format!("ch{chan} lc_b"), &cfg.lc),
            is,
            ds,
            tei: TeiMgr::new(cfg.t202, cfg.n202),
            l3: Layer3::new(format!("ch{chan} isdnl3"), cfg.protocol),
            para: CallParams::default(),
            l2_protocol: cfg.l2_protocol,
            bproto: b_protocol(cfg.l2_protocol),
            outcallref: 64,
            data_open: false,
            incoming: false,
            ll_call: false,
            bconn: false,
            status: VecDeque::new(),
            rx: BufQueue::new(),
            defs,
            pool,
            cfg,
        };
        ch.lc_d.l2_establish = true;
        ch.lc_d.l2_start = true;
        let mask = ch.cfg.debug;
        ch.set_debug(mask);
        ch
    }

    #[must_use]
    pub fn stack(&self, id: StackId) -> &PStack {
        match id {
            StackId::Is => &self.is,
            StackId::Ds => &self.ds,
        }
    }

    pub fn stack_mut(&mut self, id: StackId) -> &mut PStack {
        match id {
            StackId::Is => &mut self.is,
            StackId::Ds => &mut self.ds,
        }
    }

    pub fn lc_mut(&mut self, side: LcSide) -> &mut LinkConn {
        match side {
            LcSide::D => &mut self.lc_d,
            LcSide::B => &mut self.lc_b,
        }
    }

    #[must_use]
    pub fn state(&self) -> CcState {
        self.fi.state()
    }

    pub fn set_debug(&mut self, mask: u32) {
        self.fi.debug = mask & DEBUG_CALLC != 0;
        self.lc_d.fi.debug = mask & DEBUG_LC != 0;
        self.lc_b.fi.debug = mask & DEBUG_LC != 0;
        self.is.l2.fi.debug = mask & DEBUG_L2 != 0;
        self.ds.l2.fi.debug = mask & DEBUG_L2 != 0;
        self.l3.debug = mask & DEBUG_L3 != 0;
    }

    fn debug_mask(&self) -> u32 {
        let mut mask = 0;
        if self.fi.debug {
            mask |= DEBUG_CALLC;
        }
        if self.lc_d.fi.debug {
            mask |= DEBUG_LC;
        }
        if self.is.l2.fi.debug {
            mask |= DEBUG_L2;
        }
        if self.l3.debug {
            mask |= DEBUG_L3;
        }
        mask
    }

    /// Queue a status event for the consumer.
    pub(crate) fn emit(&mut self, event: StatusEvent) {
        info!("ch{}: {event:?}", self.chan);
        self.status.push_back(Status {
            driver: self.driver,
            chan: self.chan,
            event,
        });
    }

    /// Fresh data stack for a new call.
    pub(crate) fn init_ds(&mut self, orig: bool) {
        let bproto = b_protocol(self.l2_protocol);
        self.bproto = bproto;
        let debug = self.ds.l2.fi.debug;
        self.ds.out.clear();
        self.ds.l2 = Layer2::new(
            format!("ch{} x75", self.chan),
            L2Link::Lapb { orig },
            None,
            &self.cfg.b_l2,
        );
        self.ds.l2.fi.debug = debug;
        self.lc_b.l2_establish = bproto.uses_l2();
        self.lc_b.l2_start = bproto.uses_l2() && orig;
        debug!(
            "ch{}: B channel {} {}",
            self.chan,
            bproto.name(),
            if orig { "outgoing" } else { "incoming" }
        );
    }

    /// Largest payload a single write can carry on the current B protocol.
    pub(crate) fn max_write(&self) -> usize {
        let header = if self.bproto.uses_l2() {
            self.ds.l2.i_header_len()
        } else {
            0
        };
        self.pool.size().saturating_sub(header)
    }

    /// Next outgoing call reference, cycling through 64..128.
    pub(crate) fn next_callref(&mut self) -> u8 {
        let cr = self.outcallref;
        self.outcallref = if cr >= 127 { 64 } else { cr + 1 };
        cr
    }

    /// Forget the last call.
    pub(crate) fn reset_call(&mut self) {
        self.para = CallParams::default();
        self.data_open = false;
        self.incoming = false;
        self.ll_call = false;
        self.bconn = false;
        self.rx.discard();
    }

    /// Frame received by this stack's physical layer.
    pub fn ph_data(&mut self, id: StackId, buf: Buf) {
        match id {
            StackId::Is => l2::d_frame_in(self, buf),
            StackId::Ds => {
                let bproto = self.bproto;
                bproto.ph_data(self, buf);
            }
        }
    }

    pub fn ph_activate(&mut self, id: StackId) {
        let side = match id {
            StackId::Is => LcSide::D,
            StackId::Ds => LcSide::B,
        };
        lc::event(self, side, LcEvent::PhActivate);
    }

    pub fn ph_deactivate(&mut self, id: StackId) {
        l2::event(self, id, L2Event::PhDeactivate, L2Arg::None);
        let side = match id {
            StackId::Is => LcSide::D,
            StackId::Ds => LcSide::B,
        };
        lc::event(self, side, LcEvent::PhDeactivate);
    }

    /// Transmit opportunity for a stack that asked for one.
    pub fn ph_pull_ack(&mut self, id: StackId) {
        l2::event(self, id, L2Event::PullAck, L2Arg::None);
    }

    /// Deliver every timer due at `now`.
    pub fn run_timers(&mut self, now: u64) {
        self.now = now;
        loop {
            if let Some(ev) = self.lc_d.timer.expire(now) {
                lc::event(self, LcSide::D, ev);
            } else if let Some(ev) = self.lc_b.timer.expire(now) {
                lc::event(self, LcSide::B, ev);
            } else if let Some(ev) = self.is.l2.t200.expire(now) {
                l2::event(self, StackId::Is, ev, L2Arg::None);
            } else if let Some(ev) = self.is.l2.t203.expire(now) {
                l2::event(self, StackId::Is, ev, L2Arg::None);
            } else if let Some(ev) = self.ds.l2.t200.expire(now) {
                l2::event(self, StackId::Ds, ev, L2Arg::None);
            } else if let Some(ev) = self.ds.l2.t203.expire(now) {
                l2::event(self, StackId::Ds, ev, L2Arg::None);
            } else if self.tei.t202.expire(now).is_some() {
                tei::t202_expired(self);
            } else {
                break;
            }
        }
    }

    /// Earliest armed timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.lc_d.timer.deadline(),
            self.lc_b.timer.deadline(),
            self.is.l2.t200.deadline(),
            self.is.l2.t203.deadline(),
            self.ds.l2.t200.deadline(),
            self.ds.l2.t203.deadline(),
            self.tei.t202.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Take the next received B-channel frame.
    pub fn read(&mut self) -> Option<Buf> {
        self.rx.unlink()
    }

    pub fn poll_status(&mut self) -> Option<Status> {
        self.status.pop_front()
    }

    /// One line per layer, for diagnostics.
    #[must_use]
    pub fn report(&self) -> String {
        let mut s = String::new();
        let link = |l2: &Layer2| {
            format!(
                "{} vs={} va={} vr={} queued={}",
                l2.fi.state().name(),
                l2.vs,
                l2.va,
                l2.vr,
                l2.i_queue.len()
            )
        };
        let _ = writeln!(
            s,
            "ch{} callc {} proto {} debug {:#x}",
            self.chan,
            self.fi.state().name(),
            self.bproto.name(),
            self.debug_mask()
        );
        let _ = writeln!(
            s,
            "  lc_d {} lc_b {}",
            self.lc_d.fi.state().name(),
            self.lc_b.fi.state().name()
        );
        let _ = writeln!(
            s,
            "  is tei {:?} {}{}",
            self.is.l2.tei,
            link(&self.is.l2),
            if self.is.l2.impair { " impaired" } else { "" }
        );
        let _ = writeln!(s, "  ds {}", link(&self.ds.l2));
        let _ = writeln!(
            s,
            "  l3 {} state {} callref {}",
            self.l3.proto.name(),
            self.l3.state,
            self.l3.callref
        );
        let _ = writeln!(
            s,
            "  call {} {:?} {:?} si {}/{} charge {}",
            if self.incoming { "in" } else { "out" },
            self.para.phone,
            self.para.eazmsn,
            self.para.si1,
            self.para.si2,
            self.para.chargeinfo
        );
        s
    }

    /// Incoming SETUP on this channel is addressed to it.
    #[must_use]
    pub(crate) fn bchannel_matches(&self) -> bool {
        (((self.chan & 1) + 1) as u8) & self.para.bchannel != 0
    }

    #[must_use]
    pub fn l3_state(&self) -> u8 {
        self.l3.state
    }

    #[must_use]
    pub fn l2_state(&self, id: StackId) -> l2::L2State {
        self.stack(id).l2.fi.state()
    }

    #[must_use]
    pub fn lc_state(&self, side: LcSide) -> lc::LcState {
        match side {
            LcSide::D => self.lc_d.fi.state(),
            LcSide::B => self.lc_b.fi.state(),
        }
    }
}

/// Helpers shared by the protocol tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn config() -> Config {
        Config {
            tei: Some(64),
            ..Config::default()
        }
    }

    pub fn channel_with(chan: usize, cfg: Config) -> Channel {
        let pool = BufPool::new("test", 64, cfg.pool_buffer_size);
        Channel::new(0, chan, Arc::new(cfg), Defs::new(), pool)
    }

    pub fn channel(chan: usize) -> Channel {
        channel_with(chan, config())
    }

    /// Everything queued towards layer 1 of a stack.
    pub fn drain(ch: &mut Channel, id: StackId) -> Vec<PhReq> {
        ch.stack_mut(id).out.drain(..).collect()
    }

    /// Frames queued towards layer 1, as bytes.
    pub fn sent_frames(ch: &mut Channel, id: StackId) -> Vec<Vec<u8>> {
        drain(ch, id)
            .into_iter()
            .filter_map(|r| match r {
                PhReq::Data(b) | PhReq::DataPulled(b) => Some(b.to_vec()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(ch: &mut Channel) -> Vec<StatusEvent> {
        ch.status.drain(..).map(|s| s.event).collect()
    }

    pub fn buf(ch: &Channel, bytes: &[u8]) -> Buf {
        ch.pool.get_with("test", bytes).unwrap()
    }
}
