//! Q.921 (LAPD) data link layer, also used as X.75 (LAPB) on the B channel.
//!
//! Acknowledged I frames go out through a pull handshake: a DL_DATA request
//! only queues the frame and asks layer 1 for a transmit opportunity; the
//! frame is numbered and put into the send window when the pull is
//! acknowledged.
use crate::buffer::{Buf, BufQueue};
use crate::callc::{self, CcArg, CcEvent};
use crate::channel::{Channel, LcSide, PhReq, StackId, StatusEvent};
use crate::config::L2Params;
use crate::fsm::{fsm_enum, Dispatch, Fsm, FsmBuilder, FsmInst};
use crate::frame::{
    Address, Frame, FrameType, LAPB_A, LAPB_B, SAPI_CALLCTRL, SAPI_TEIMGR, TEI_BROADCAST,
};
use crate::l3;
use crate::lc::{self, LcEvent};
use crate::tei;
use crate::timer::FsmTimer;
use log::{debug, warn};
use std::sync::Arc;

fsm_enum! {
    pub enum L2State {
        TeiUnassigned => "ST_L2_1",
        EstablishAwaitingTei => "ST_L2_3",
        TeiAssigned => "ST_L2_4",
        AwaitingEstablish => "ST_L2_5",
        AwaitingRelease => "ST_L2_6",
        MultiFrame => "ST_L2_7",
        TimerRecovery => "ST_L2_8",
    }
}

fsm_enum! {
    pub enum L2Event {
        DlEstablish => "EV_L2_DL_ESTABLISH",
        DlRelease => "EV_L2_DL_RELEASE",
        DlData => "EV_L2_DL_DATA",
        DlUnitData => "EV_L2_DL_UNIT_DATA",
        MdlAssign => "EV_L2_MDL_ASSIGN",
        MdlRemove => "EV_L2_MDL_REMOVE",
        Sabme => "EV_L2_SABMX",
        Ua => "EV_L2_UA",
        Disc => "EV_L2_DISC",
        Dm => "EV_L2_DM",
        I => "EV_L2_I",
        Rr => "EV_L2_RR",
        Rnr => "EV_L2_RNR",
        Rej => "EV_L2_REJ",
        Frmr => "EV_L2_FRMR",
        Ui => "EV_L2_UI",
        PullAck => "EV_L2_ACK_PULL",
        T200 => "EV_L2_T200",
        T203 => "EV_L2_T203",
        PhDeactivate => "EV_L2_PH_DEACTIVATE",
    }
}

#[derive(Debug)]
pub enum L2Arg {
    None,
    /// Received frame, header still in front of the buffer.
    Frame(Frame, Buf),
    /// Layer 3 or consumer payload.
    Data(Buf),
    /// TEI from the management entity.
    Tei(u8),
}

pub type L2Fsm = Fsm<Channel, StackId, L2State, L2Event, L2Arg>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Link {
    Lapd,
    /// `orig` is the side that called.
    Lapb { orig: bool },
}

pub struct Layer2 {
    pub fi: FsmInst<L2State>,
    pub link: L2Link,
    pub tei: Option<u8>,
    pub params: L2Params,
    pub vs: u8,
    pub va: u8,
    pub vr: u8,
    /// Window slot of the oldest unacknowledged frame.
    pub sow: usize,
    rc: u32,
    rejexp: bool,
    peer_busy: bool,
    /// Suppress acknowledgements of received I frames. For testing peers.
    pub impair: bool,
    windowar: Vec<Option<Buf>>,
    pub i_queue: BufQueue,
    pub t200: FsmTimer<L2Event>,
    pub t203: FsmTimer<L2Event>,
}

impl Layer2 {
    #[must_use]
    pub fn new(name: String, link: L2Link, tei: Option<u8>, params: &L2Params) -> Self {
        let state = match (link, tei) {
            (L2Link::Lapd, None) => L2State::TeiUnassigned,
            _ => L2State::TeiAssigned,
        };
        let window = usize::from(params.window.max(1));
        Self {
            fi: FsmInst::new(name, state),
            link,
            tei,
            params: params.clone(),
            vs: 0,
            va: 0,
            vr: 0,
            sow: 0,
            rc: 0,
            rejexp: false,
            peer_busy: false,
            impair: false,
            windowar: (0..window).map(|_| None).collect(),
            i_queue: BufQueue::new(),
            t200: FsmTimer::new("T200"),
            t203: FsmTimer::new("T203"),
        }
    }

    fn modulus(&self) -> u8 {
        self.params.modulus()
    }

    fn window(&self) -> usize {
        self.windowar.len()
    }

    /// Number of sent, unacknowledged I frames.
    #[must_use]
    pub fn outstanding(&self) -> u8 {
        let m = self.modulus();
        (self.vs + m - self.va) % m
    }

    /// Address and control field length of an I frame on this link.
    #[must_use]
    pub fn i_header_len(&self) -> usize {
        Frame {
            addr: self.address(true),
            kind: FrameType::I {
                ns: 0,
                nr: 0,
                poll: false,
            },
        }
        .header_len(self.params.extended)
    }

    /// Room in the send window for another I frame.
    #[must_use]
    pub fn cansend(&self) -> bool {
        usize::from(self.outstanding()) < self.window()
    }

    /// Does `nr` acknowledge only frames actually sent?
    #[must_use]
    pub fn legalnr(&self, nr: u8) -> bool {
        let m = self.modulus();
        nr < m && (nr + m - self.va) % m <= self.outstanding()
    }

    // Window slot of the frame with send sequence number `ns`.
    fn slot(&self, ns: u8) -> usize {
        let m = self.modulus();
        (usize::from((ns + m - self.va) % m) + self.sow) % self.window()
    }

    fn reset_seq(&mut self) {
        self.vs = 0;
        self.va = 0;
        self.vr = 0;
        self.sow = 0;
        for slot in &mut self.windowar {
            *slot = None;
        }
    }

    fn clear_exceptions(&mut self) {
        self.rejexp = false;
        self.peer_busy = false;
    }

    fn discard(&mut self) {
        self.i_queue.discard();
        for slot in &mut self.windowar {
            *slot = None;
        }
    }

    fn stop_timers(&mut self) {
        self.t200.cancel();
        self.t203.cancel();
    }

    // T200 and T203 never run together.
    fn restart_t200(&mut self, now: u64) {
        self.t203.cancel();
        self.t200.restart(now, self.params.t200, L2Event::T200);
    }

    fn start_t200(&mut self, now: u64) {
        self.t203.cancel();
        if !self.t200.is_armed() {
            self.t200.restart(now, self.params.t200, L2Event::T200);
        }
    }

    fn restart_t203(&mut self, now: u64) {
        self.t200.cancel();
        self.t203.restart(now, self.params.t203, L2Event::T203);
    }

    fn address(&self, command: bool) -> Address {
        match self.link {
            L2Link::Lapd => Address::Lapd {
                sapi: SAPI_CALLCTRL,
                tei: self.tei.unwrap_or(TEI_BROADCAST),
                cr: !command,
            },
            L2Link::Lapb { orig } => Address::Lapb(if orig == command { LAPB_A } else { LAPB_B }),
        }
    }

    fn is_command(&self, addr: Address) -> bool {
        match (self.link, addr) {
            (L2Link::Lapd, Address::Lapd { cr, .. }) => cr,
            (L2Link::Lapb { orig }, Address::Lapb(a)) => a == if orig { LAPB_B } else { LAPB_A },
            _ => false,
        }
    }
}

/// Deliver an event to one of the channel's data links.
pub fn event(ch: &mut Channel, id: StackId, ev: L2Event, arg: L2Arg) -> Dispatch<L2Arg> {
    let defs = Arc::clone(&ch.defs);
    defs.l2.event(ch, id, ev, arg)
}

fn l2_mut(ch: &mut Channel, id: StackId) -> &mut Layer2 {
    &mut ch.stack_mut(id).l2
}

fn side(id: StackId) -> LcSide {
    match id {
        StackId::Is => LcSide::D,
        StackId::Ds => LcSide::B,
    }
}

enum DlInd {
    Establish,
    Release,
    Data(Buf),
    UnitData(Buf),
}

fn dl_up(ch: &mut Channel, id: StackId, ind: DlInd) {
    match ind {
        DlInd::Establish => {
            lc::event(ch, side(id), LcEvent::DlEstablish);
        }
        DlInd::Release => {
            lc::event(ch, side(id), LcEvent::DlRelease);
        }
        DlInd::Data(buf) | DlInd::UnitData(buf) => match id {
            StackId::Is => l3::dl_data(ch, buf),
            StackId::Ds => {
                callc::event(ch, CcEvent::DataIn, CcArg::Data(buf));
            }
        },
    }
}

fn write_wakeup(ch: &mut Channel, id: StackId) {
    if id == StackId::Ds {
        ch.emit(StatusEvent::Bsent);
    }
}

// Control frames. Without a buffer the frame is skipped, the next timer
// retry sends another one.
fn send(ch: &mut Channel, id: StackId, kind: FrameType, command: bool) {
    let l2 = &ch.stack(id).l2;
    let bytes = Frame {
        addr: l2.address(command),
        kind,
    }
    .serialize(l2.params.extended);
    let Some(buf) = ch.pool.get_with("l2 control", &bytes) else {
        debug!("{}: no buffer for {kind:?}", l2.fi.name());
        return;
    };
    ch.stack_mut(id).out.push_back(PhReq::Data(buf));
}

fn send_rr(ch: &mut Channel, id: StackId, pf: bool, command: bool) {
    let nr = ch.stack(id).l2.vr;
    send(ch, id, FrameType::Rr { nr, pf }, command);
}

// RR command with the poll bit.
fn enquiry(ch: &mut Channel, id: StackId) {
    send_rr(ch, id, true, true);
}

fn request_pull(ch: &mut Channel, id: StackId) {
    ch.stack_mut(id).out.push_back(PhReq::RequestPull);
}

/// Frame received on a stack.
pub fn frame_in(ch: &mut Channel, id: StackId, buf: Buf) {
    let l2 = &ch.stack(id).l2;
    let lapb = matches!(l2.link, L2Link::Lapb { .. });
    let parsed = Frame::parse(&buf, l2.params.extended, lapb);
    match parsed {
        Ok((frame, _)) => dispatch_frame(ch, id, frame, buf),
        Err(e) => debug!("{}: dropping frame: {e}", ch.stack(id).l2.fi.name()),
    }
}

/// Frame received on the D channel, shared by all channels of the card.
pub fn d_frame_in(ch: &mut Channel, mut buf: Buf) {
    let l2 = &ch.is.l2;
    let (frame, off) = match Frame::parse(&buf, l2.params.extended, false) {
        Ok(f) => f,
        Err(e) => {
            debug!("{}: dropping frame: {e}", l2.fi.name());
            return;
        }
    };
    let Address::Lapd { sapi, tei, .. } = frame.addr else {
        return;
    };
    match sapi {
        SAPI_TEIMGR => {
            if tei == TEI_BROADCAST && matches!(frame.kind, FrameType::Ui { .. }) && buf.pull(off).is_ok()
            {
                tei::mdl_data(ch, &buf);
            }
        }
        SAPI_CALLCTRL => {
            if tei == TEI_BROADCAST || Some(tei) == l2.tei {
                dispatch_frame(ch, StackId::Is, frame, buf);
            }
        }
        _ => debug!("{}: SAPI {sapi} not supported", l2.fi.name()),
    }
}

fn dispatch_frame(ch: &mut Channel, id: StackId, frame: Frame, buf: Buf) {
    let l2 = &ch.stack(id).l2;
    let command = l2.is_command(frame.addr);
    let (ev, ok) = match frame.kind {
        FrameType::I { .. } => (L2Event::I, command),
        FrameType::Rr { .. } => (L2Event::Rr, true),
        FrameType::Rnr { .. } => (L2Event::Rnr, true),
        FrameType::Rej { .. } => (L2Event::Rej, true),
        FrameType::Sabm { .. } | FrameType::Sabme { .. } => (L2Event::Sabme, command),
        FrameType::Disc { .. } => (L2Event::Disc, command),
        FrameType::Ua { .. } => (L2Event::Ua, !command),
        FrameType::Dm { .. } => (L2Event::Dm, !command),
        FrameType::Frmr { .. } => (L2Event::Frmr, !command),
        FrameType::Ui { .. } => (L2Event::Ui, true),
    };
    if !ok {
        debug!("{}: {:?} with wrong C/R bit", l2.fi.name(), frame.kind);
        return;
    }
    if let Dispatch::Unhandled(_) = event(ch, id, ev, L2Arg::Frame(frame, buf)) {
        debug!("{}: {:?} dropped", ch.stack(id).l2.fi.name(), frame.kind);
    }
}

fn frame_pf(arg: &L2Arg) -> bool {
    match arg {
        L2Arg::Frame(f, _) => f.kind.pf(),
        _ => false,
    }
}

// Page 106 of Q.921 (establish data link).
fn establish_link(ch: &mut Channel, id: StackId) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    l2.clear_exceptions();
    l2.rc = 0;
    l2.restart_t200(now);
    let kind = if l2.params.extended {
        FrameType::Sabme { poll: true }
    } else {
        FrameType::Sabm { poll: true }
    };
    send(ch, id, kind, true);
}

// Back to TEI assigned after a failure or a peer disconnect.
fn link_down(ch: &mut Channel, id: StackId) {
    let l2 = l2_mut(ch, id);
    l2.discard();
    l2.stop_timers();
    l2.fi.change_state(L2State::TeiAssigned);
    dl_up(ch, id, DlInd::Release);
}

fn setva(ch: &mut Channel, id: StackId, nr: u8) {
    let l2 = l2_mut(ch, id);
    let m = l2.modulus();
    let w = l2.window();
    let mut freed = false;
    while l2.va != nr {
        l2.va = (l2.va + 1) % m;
        if l2.windowar[l2.sow].take().is_none() {
            warn!("{}: window slot {} already empty", l2.fi.name(), l2.sow);
        }
        l2.sow = (l2.sow + 1) % w;
        freed = true;
    }
    if freed {
        write_wakeup(ch, id);
    }
}

// Go back to `nr`: every frame from `nr` on is queued again, oldest first.
// Returns true if anything was requeued.
fn invoke_retransmission(ch: &mut Channel, id: StackId, nr: u8) -> bool {
    let l2 = l2_mut(ch, id);
    if l2.vs == nr {
        return false;
    }
    let m = l2.modulus();
    while l2.vs != nr {
        l2.vs = (l2.vs + m - 1) % m;
        let p1 = l2.slot(l2.vs);
        match l2.windowar[p1].take() {
            Some(buf) => l2.i_queue.link_front(buf),
            None => warn!("{}: nothing to retransmit in slot {p1}", l2.fi.name()),
        }
    }
    request_pull(ch, id);
    true
}

// Ask for a transmit opportunity if there is something to send and room.
fn kick(ch: &mut Channel, id: StackId) {
    let l2 = &ch.stack(id).l2;
    if l2.fi.state() == L2State::MultiFrame
        && !l2.peer_busy
        && l2.cansend()
        && !l2.i_queue.is_empty()
    {
        request_pull(ch, id);
    }
}

// Acknowledgement in multiple frame established state.
fn ack_mf(ch: &mut Channel, id: StackId, nr: u8) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    if !l2.legalnr(nr) {
        debug!(
            "{}: illegal N(R) {nr}, va={} vs={}",
            l2.fi.name(),
            l2.va,
            l2.vs
        );
        return;
    }
    if nr == l2.vs {
        setva(ch, id, nr);
        l2_mut(ch, id).restart_t203(now);
    } else if nr != l2.va {
        setva(ch, id, nr);
        l2_mut(ch, id).restart_t200(now);
    }
}

fn assign_tei(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if let L2Arg::Tei(tei) = arg {
        let l2 = l2_mut(ch, id);
        l2.tei = Some(tei);
        l2.fi.change_state(L2State::TeiAssigned);
    }
}

fn establish_awaiting_tei(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    l2_mut(ch, id).fi.change_state(L2State::EstablishAwaitingTei);
    tei::assign_request(ch);
}

fn tei_then_establish(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if let L2Arg::Tei(tei) = arg {
        let l2 = l2_mut(ch, id);
        l2.tei = Some(tei);
        l2.fi.change_state(L2State::AwaitingEstablish);
        establish_link(ch, id);
    }
}

fn release_awaiting_tei(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    tei::cancel(ch);
    l2_mut(ch, id).fi.change_state(L2State::TeiUnassigned);
    dl_up(ch, id, DlInd::Release);
}

fn tei_removed(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let l2 = l2_mut(ch, id);
    let was = l2.fi.state();
    l2.discard();
    l2.stop_timers();
    l2.tei = None;
    l2.fi.change_state(L2State::TeiUnassigned);
    if was != L2State::TeiAssigned {
        dl_up(ch, id, DlInd::Release);
    }
}

fn establish(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    l2_mut(ch, id).fi.change_state(L2State::AwaitingEstablish);
    establish_link(ch, id);
}

// Peer established the link.
fn sabme_idle(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    let now = ch.now;
    send(ch, id, FrameType::Ua { fin: frame_pf(&arg) }, false);
    let l2 = l2_mut(ch, id);
    l2.clear_exceptions();
    l2.reset_seq();
    l2.restart_t203(now);
    l2.fi.change_state(L2State::MultiFrame);
    dl_up(ch, id, DlInd::Establish);
}

fn disc_idle(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    send(ch, id, FrameType::Dm { fin: frame_pf(&arg) }, false);
}

fn ua_establish(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if !frame_pf(&arg) {
        debug!("{}: UA without F bit ignored", ch.stack(id).l2.fi.name());
        return;
    }
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    l2.reset_seq();
    l2.restart_t203(now);
    l2.fi.change_state(L2State::MultiFrame);
    send_rr(ch, id, false, false);
    dl_up(ch, id, DlInd::Establish);
    kick(ch, id);
}

fn t200_establish(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    if l2.rc >= l2.params.n200 {
        l2.discard();
        l2.fi.change_state(L2State::TeiAssigned);
        dl_up(ch, id, DlInd::Release);
        return;
    }
    l2.rc += 1;
    l2.restart_t200(now);
    let kind = if l2.params.extended {
        FrameType::Sabme { poll: true }
    } else {
        FrameType::Sabm { poll: true }
    };
    send(ch, id, kind, true);
}

fn dm_establish(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if frame_pf(&arg) {
        link_down(ch, id);
    }
}

fn release_establishing(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    link_down(ch, id);
}

fn release_confirm(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    dl_up(ch, id, DlInd::Release);
}

fn queue_data(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if let L2Arg::Data(buf) = arg {
        l2_mut(ch, id).i_queue.link(buf);
    }
}

fn send_data(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if let L2Arg::Data(buf) = arg {
        l2_mut(ch, id).i_queue.link(buf);
        kick(ch, id);
    }
}

fn unit_data(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    let L2Arg::Data(payload) = arg else {
        return;
    };
    let l2 = &ch.stack(id).l2;
    let header = Frame {
        addr: l2.address(true),
        kind: FrameType::Ui { poll: false },
    }
    .serialize(l2.params.extended);
    let Some(mut buf) = ch.pool.get("l2 UI") else {
        return;
    };
    if let Err(e) = buf.put(&header).and_then(|()| buf.put(&payload)) {
        warn!("{}: {e}", l2.fi.name());
        return;
    }
    ch.stack_mut(id).out.push_back(PhReq::Data(buf));
}

fn ui_in(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    let L2Arg::Frame(frame, mut buf) = arg else {
        return;
    };
    let off = frame.header_len(ch.stack(id).l2.params.extended);
    if buf.pull(off).is_ok() {
        dl_up(ch, id, DlInd::UnitData(buf));
    }
}

// Queued I frames that fit the window go out ahead of the DISC, so a
// final RELEASE COMPLETE is not lost.
fn release_mf(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let now = ch.now;
    if ch.stack(id).l2.fi.state() == L2State::MultiFrame {
        while let Some(out) = next_i_frame(ch, id) {
            ch.stack_mut(id).out.push_back(PhReq::Data(out));
        }
    }
    let l2 = l2_mut(ch, id);
    if !l2.i_queue.is_empty() {
        debug!("{}: {} I frames not sent", l2.fi.name(), l2.i_queue.len());
    }
    l2.discard();
    l2.rc = 0;
    l2.restart_t200(now);
    l2.fi.change_state(L2State::AwaitingRelease);
    send(ch, id, FrameType::Disc { poll: true }, true);
}

fn ua_release(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if frame_pf(&arg) {
        let l2 = l2_mut(ch, id);
        l2.t200.cancel();
        l2.fi.change_state(L2State::TeiAssigned);
        dl_up(ch, id, DlInd::Release);
    }
}

fn t200_release(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    if l2.rc >= l2.params.n200 {
        l2.fi.change_state(L2State::TeiAssigned);
        dl_up(ch, id, DlInd::Release);
        return;
    }
    l2.rc += 1;
    l2.restart_t200(now);
    send(ch, id, FrameType::Disc { poll: true }, true);
}

fn disc_mf(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    send(ch, id, FrameType::Ua { fin: frame_pf(&arg) }, false);
    link_down(ch, id);
}

fn disc_establish(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    send(ch, id, FrameType::Dm { fin: frame_pf(&arg) }, false);
}

fn disc_release(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    send(ch, id, FrameType::Ua { fin: frame_pf(&arg) }, false);
}

// Collision: both sides sent SABME. Our UA is on its way.
fn sabme_establish(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    send(ch, id, FrameType::Ua { fin: frame_pf(&arg) }, false);
}

fn sabme_release(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    send(ch, id, FrameType::Dm { fin: frame_pf(&arg) }, false);
}

// Link reset by the peer.
fn sabme_mf(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    let now = ch.now;
    send(ch, id, FrameType::Ua { fin: frame_pf(&arg) }, false);
    let l2 = l2_mut(ch, id);
    l2.discard();
    l2.clear_exceptions();
    l2.reset_seq();
    l2.restart_t203(now);
    l2.fi.change_state(L2State::MultiFrame);
    dl_up(ch, id, DlInd::Establish);
}

fn dm_mf(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if !frame_pf(&arg) {
        debug!("{}: DM, link released by peer", ch.stack(id).l2.fi.name());
        link_down(ch, id);
    }
}

fn frmr(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    if let L2Arg::Frame(_, buf) = arg {
        warn!("{}: FRMR received: {:02x?}", ch.stack(id).l2.fi.name(), &buf[..]);
    }
}

fn ph_gone(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    link_down(ch, id);
}

// Page 96 of Q.921: I frame receive.
fn iframe(ch: &mut Channel, id: StackId, _ev: L2Event, arg: L2Arg) {
    let L2Arg::Frame(frame, mut buf) = arg else {
        return;
    };
    let FrameType::I { ns, nr, poll } = frame.kind else {
        return;
    };
    let l2 = l2_mut(ch, id);
    if l2.fi.state() == L2State::MultiFrame {
        ack_mf(ch, id, nr);
    } else if l2.legalnr(nr) {
        setva(ch, id, nr);
    }

    let l2 = l2_mut(ch, id);
    if ns == l2.vr {
        l2.vr = (l2.vr + 1) % l2.modulus();
        l2.rejexp = false;
        if !l2.impair {
            send_rr(ch, id, poll, false);
        }
        let off = frame.header_len(ch.stack(id).l2.params.extended);
        if buf.pull(off).is_ok() {
            dl_up(ch, id, DlInd::Data(buf));
        }
    } else {
        drop(buf);
        if !l2.rejexp {
            l2.rejexp = true;
            let nr = l2.vr;
            send(ch, id, FrameType::Rej { nr, pf: poll }, false);
        } else if poll {
            send_rr(ch, id, true, false);
        }
    }
    kick(ch, id);
}

fn super_nr(frame: &Frame) -> (u8, bool) {
    match frame.kind {
        FrameType::Rr { nr, pf } | FrameType::Rnr { nr, pf } | FrameType::Rej { nr, pf } => {
            (nr, pf)
        }
        _ => (0, false),
    }
}

// RR, RNR and REJ in multiple frame established state.
fn super_mf(ch: &mut Channel, id: StackId, ev: L2Event, arg: L2Arg) {
    let L2Arg::Frame(frame, _) = arg else {
        return;
    };
    let now = ch.now;
    let (nr, pf) = super_nr(&frame);
    let l2 = l2_mut(ch, id);
    if l2.is_command(frame.addr) && pf {
        send_rr(ch, id, true, false);
    }
    let l2 = l2_mut(ch, id);
    match ev {
        L2Event::Rr => {
            l2.peer_busy = false;
            ack_mf(ch, id, nr);
            kick(ch, id);
        }
        L2Event::Rnr => {
            l2.peer_busy = true;
            if l2.legalnr(nr) {
                setva(ch, id, nr);
                l2_mut(ch, id).restart_t200(now);
            }
        }
        _ => {
            l2.peer_busy = false;
            if l2.legalnr(nr) {
                setva(ch, id, nr);
                l2_mut(ch, id).restart_t203(now);
                if !invoke_retransmission(ch, id, nr) {
                    kick(ch, id);
                }
            }
        }
    }
}

// RR, RNR and REJ while waiting for the answer to an enquiry.
fn super_recovery(ch: &mut Channel, id: StackId, ev: L2Event, arg: L2Arg) {
    let L2Arg::Frame(frame, _) = arg else {
        return;
    };
    let now = ch.now;
    let (nr, pf) = super_nr(&frame);
    let l2 = l2_mut(ch, id);
    let command = l2.is_command(frame.addr);
    if command && pf {
        send_rr(ch, id, true, false);
    }
    let l2 = l2_mut(ch, id);
    l2.peer_busy = ev == L2Event::Rnr;
    if !l2.legalnr(nr) {
        debug!("{}: illegal N(R) {nr}", l2.fi.name());
        return;
    }
    setva(ch, id, nr);
    if !command && pf {
        let l2 = l2_mut(ch, id);
        l2.restart_t203(now);
        l2.fi.change_state(L2State::MultiFrame);
        if !invoke_retransmission(ch, id, nr) {
            kick(ch, id);
        }
    }
}

// Next queued I frame with its header, if the window allows one. The
// payload moves into the window for retransmission.
fn next_i_frame(ch: &mut Channel, id: StackId) -> Option<Buf> {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    if l2.peer_busy || !l2.cansend() {
        return None;
    }
    let payload = l2.i_queue.unlink()?;
    let header = Frame {
        addr: l2.address(true),
        kind: FrameType::I {
            ns: l2.vs,
            nr: l2.vr,
            poll: false,
        },
    }
    .serialize(l2.params.extended);
    let Some(mut out) = ch.pool.get("l2 I") else {
        l2_mut(ch, id).i_queue.link_front(payload);
        return None;
    };
    if let Err(e) = out.put(&header).and_then(|()| out.put(&payload)) {
        warn!(
            "{}: {} byte I frame dropped: {e}",
            ch.stack(id).l2.fi.name(),
            payload.len()
        );
        return None;
    }
    let l2 = l2_mut(ch, id);
    let p1 = l2.slot(l2.vs);
    if l2.windowar[p1].replace(payload).is_some() {
        warn!("{}: window slot {p1} overwritten", l2.fi.name());
    }
    l2.vs = (l2.vs + 1) % l2.modulus();
    l2.start_t200(now);
    Some(out)
}

// Transmit opportunity: send the next queued I frame.
fn pull(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let Some(out) = next_i_frame(ch, id) else {
        return;
    };
    let l2 = &ch.stack(id).l2;
    let more = l2.cansend() && !l2.i_queue.is_empty();
    ch.stack_mut(id).out.push_back(PhReq::DataPulled(out));
    if more {
        request_pull(ch, id);
    }
}

fn t200_mf(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    l2.rc = 1;
    l2.restart_t200(now);
    l2.fi.change_state(L2State::TimerRecovery);
    enquiry(ch, id);
}

fn t203_mf(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    l2.rc = 0;
    l2.restart_t200(now);
    l2.fi.change_state(L2State::TimerRecovery);
    enquiry(ch, id);
}

// Retry the enquiry, and give up after N200 of them.
fn t200_recovery(ch: &mut Channel, id: StackId, _ev: L2Event, _arg: L2Arg) {
    let now = ch.now;
    let l2 = l2_mut(ch, id);
    if l2.rc >= l2.params.n200 {
        warn!("{}: no answer after {} retries, link down", l2.fi.name(), l2.rc);
        send(ch, id, FrameType::Disc { poll: true }, true);
        link_down(ch, id);
        return;
    }
    l2.rc += 1;
    l2.restart_t200(now);
    enquiry(ch, id);
}

fn locate(ch: &mut Channel, id: StackId) -> &mut FsmInst<L2State> {
    &mut ch.stack_mut(id).l2.fi
}

pub fn fsm() -> L2Fsm {
    use L2Event as E;
    use L2State as S;
    let all = [
        S::TeiUnassigned,
        S::EstablishAwaitingTei,
        S::TeiAssigned,
        S::AwaitingEstablish,
        S::AwaitingRelease,
        S::MultiFrame,
        S::TimerRecovery,
    ];
    let linked = [
        S::AwaitingEstablish,
        S::AwaitingRelease,
        S::MultiFrame,
        S::TimerRecovery,
    ];
    let established = [S::MultiFrame, S::TimerRecovery];
    FsmBuilder::new("isdnl2", locate)
        .on(&[S::TeiUnassigned], E::MdlAssign, assign_tei)
        .on(&[S::TeiUnassigned], E::DlEstablish, establish_awaiting_tei)
        .on(&[S::TeiUnassigned, S::TeiAssigned], E::DlRelease, release_confirm)
        .on(&[S::EstablishAwaitingTei], E::MdlAssign, tei_then_establish)
        .on(&[S::EstablishAwaitingTei], E::DlRelease, release_awaiting_tei)
        .on(&all[1..], E::MdlRemove, tei_removed)
        .on(&all, E::Ui, ui_in)
        .on(&all[2..], E::DlUnitData, unit_data)
        .on(&[S::TeiAssigned], E::DlEstablish, establish)
        .on(&[S::TeiAssigned], E::Sabme, sabme_idle)
        .on(&[S::TeiAssigned], E::Disc, disc_idle)
        .on(&[S::AwaitingEstablish], E::Ua, ua_establish)
        .on(&[S::AwaitingEstablish], E::Dm, dm_establish)
        .on(&[S::AwaitingEstablish], E::T200, t200_establish)
        .on(&[S::AwaitingEstablish], E::DlRelease, release_establishing)
        .on(&[S::AwaitingEstablish], E::Disc, disc_establish)
        .on(&[S::AwaitingEstablish], E::Sabme, sabme_establish)
        .on(&[S::AwaitingEstablish, S::TimerRecovery], E::DlData, queue_data)
        .on(&[S::AwaitingRelease], E::Ua, ua_release)
        .on(&[S::AwaitingRelease], E::Dm, ua_release)
        .on(&[S::AwaitingRelease], E::T200, t200_release)
        .on(&[S::AwaitingRelease], E::Disc, disc_release)
        .on(&[S::AwaitingRelease], E::Sabme, sabme_release)
        .on(&[S::MultiFrame], E::DlData, send_data)
        .on(&established, E::DlRelease, release_mf)
        .on(&established, E::Disc, disc_mf)
        .on(&established, E::Sabme, sabme_mf)
        .on(&established, E::Dm, dm_mf)
        .on(&established, E::I, iframe)
        .on(&[S::MultiFrame], E::Rr, super_mf)
        .on(&[S::MultiFrame], E::Rnr, super_mf)
        .on(&[S::MultiFrame], E::Rej, super_mf)
        .on(&[S::TimerRecovery], E::Rr, super_recovery)
        .on(&[S::TimerRecovery], E::Rnr, super_recovery)
        .on(&[S::TimerRecovery], E::Rej, super_recovery)
        .on(&[S::MultiFrame], E::PullAck, pull)
        .on(&[S::MultiFrame], E::T200, t200_mf)
        .on(&[S::MultiFrame], E::T203, t203_mf)
        .on(&[S::TimerRecovery], E::T200, t200_recovery)
        .on(&linked, E::Frmr, frmr)
        .on(&linked, E::PhDeactivate, ph_gone)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::*;
    use crate::fsm::FsmEnum;
    use crate::lc::LcState;

    const IS: StackId = StackId::Is;

    // Network side frames towards TEI 64. C/R=1 on commands.
    fn net(ch: &Channel, bytes: &[u8]) -> Buf {
        buf(ch, bytes)
    }

    fn up(ch: &mut Channel) {
        event(ch, IS, L2Event::DlEstablish, L2Arg::None);
        let b = net(ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(IS, b);
        assert_eq!(ch.l2_state(IS), L2State::MultiFrame);
        drain(ch, IS);
    }

    fn data(ch: &mut Channel, payload: &[u8]) {
        let b = buf(ch, payload);
        assert!(event(ch, IS, L2Event::DlData, L2Arg::Data(b)).is_handled());
    }

    fn pulls(reqs: &[PhReq]) -> usize {
        reqs.iter().filter(|r| matches!(r, PhReq::RequestPull)).count()
    }

    #[test]
    fn establish_and_send() {
        let mut ch = channel(0);
        event(&mut ch, IS, L2Event::DlEstablish, L2Arg::None);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x00, 0x81, 0x7f]]);
        assert!(ch.is.l2.t200.is_armed());

        let ua = net(&ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.l2_state(IS), L2State::MultiFrame);
        assert!(!ch.is.l2.t200.is_armed());
        assert!(ch.is.l2.t203.is_armed());
        // RR response, N(R)=0.
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x02, 0x81, 0x01, 0x00]]);

        data(&mut ch, &[0x08, 0x01]);
        assert_eq!(pulls(&drain(&mut ch, IS)), 1);
        ch.ph_pull_ack(IS);
        assert_eq!(
            sent_frames(&mut ch, IS),
            vec![vec![0x00, 0x81, 0x00, 0x00, 0x08, 0x01]]
        );
        assert_eq!((ch.is.l2.vs, ch.is.l2.va), (1, 0));
        assert!(ch.is.l2.t200.is_armed());
        assert!(!ch.is.l2.t203.is_armed());

        // RR response N(R)=1 acknowledges it.
        let rr = net(&ch, &[0x00, 0x81, 0x01, 0x02]);
        ch.ph_data(IS, rr);
        assert_eq!(ch.is.l2.va, 1);
        assert!(!ch.is.l2.t200.is_armed());
        assert!(ch.is.l2.t203.is_armed());
        assert_eq!(ch.is.l2.outstanding(), 0);
    }

    #[test]
    fn window_holds_back() {
        let mut ch = channel(0);
        up(&mut ch);
        data(&mut ch, &[1]);
        data(&mut ch, &[2]);
        drain(&mut ch, IS);
        ch.ph_pull_ack(IS);
        ch.ph_pull_ack(IS);
        // Window of one: only the first frame goes out.
        assert_eq!(sent_frames(&mut ch, IS).len(), 1);
        assert!(!ch.is.l2.cansend());
        assert_eq!(ch.is.l2.i_queue.len(), 1);

        let rr = net(&ch, &[0x00, 0x81, 0x01, 0x02]);
        ch.ph_data(IS, rr);
        assert!(ch.is.l2.cansend());
        assert_eq!(pulls(&drain(&mut ch, IS)), 1);
        ch.ph_pull_ack(IS);
        assert_eq!(
            sent_frames(&mut ch, IS),
            vec![vec![0x00, 0x81, 0x02, 0x00, 2]]
        );
    }

    #[test]
    fn t200_exhaustion_disconnects_once() {
        let mut ch = channel(0);
        up(&mut ch);
        ch.lc_d.fi.change_state(LcState::Connected);
        data(&mut ch, &[1]);
        ch.ph_pull_ack(IS);
        drain(&mut ch, IS);
        let n200 = ch.is.l2.params.n200;
        let mut now = 0;
        for i in 0..n200 {
            now += 1000;
            ch.run_timers(now);
            assert_eq!(ch.l2_state(IS), L2State::TimerRecovery, "expiry {i}");
            // Enquiry: RR command, P=1.
            assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x00, 0x81, 0x01, 0x01]]);
        }
        now += 1000;
        ch.run_timers(now);
        assert_eq!(ch.l2_state(IS), L2State::TeiAssigned);
        let reqs = drain(&mut ch, IS);
        let frames: Vec<_> = reqs
            .iter()
            .filter_map(|r| match r {
                PhReq::Data(b) => Some(b.to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![vec![0x00, 0x81, 0x53]]);
        assert_eq!(
            reqs.iter().filter(|r| matches!(r, PhReq::Deactivate)).count(),
            1
        );
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
        assert!(!ch.is.l2.t200.is_armed());
        assert!(!ch.is.l2.t203.is_armed());
        assert_eq!(ch.next_deadline(), None);
    }

    #[test]
    fn rej_retransmits() {
        let mut ch = channel(0);
        up(&mut ch);
        // One frame outstanding at vs=3, va=2.
        for _ in 0..2 {
            data(&mut ch, &[0xaa]);
            ch.ph_pull_ack(IS);
            let nr = ch.is.l2.vs << 1;
            let rr = net(&ch, &[0x00, 0x81, 0x01, nr]);
            ch.ph_data(IS, rr);
        }
        data(&mut ch, &[0x42]);
        ch.ph_pull_ack(IS);
        drain(&mut ch, IS);
        assert_eq!((ch.is.l2.vs, ch.is.l2.va), (3, 2));

        let rej = net(&ch, &[0x00, 0x81, 0x09, 0x04]);
        ch.ph_data(IS, rej);
        assert_eq!(ch.is.l2.vs, 2);
        assert_eq!(ch.is.l2.i_queue.len(), 1);
        assert_eq!(pulls(&drain(&mut ch, IS)), 1);

        ch.ph_pull_ack(IS);
        assert_eq!(
            sent_frames(&mut ch, IS),
            vec![vec![0x00, 0x81, 0x04, 0x00, 0x42]]
        );
        assert_eq!(ch.is.l2.vs, 3);
    }

    #[test]
    fn receive_in_and_out_of_sequence() {
        let mut ch = channel(0);
        up(&mut ch);
        // I command, N(S)=0 N(R)=0 P=1.
        let i = net(&ch, &[0x02, 0x81, 0x00, 0x01, 0x08]);
        ch.ph_data(IS, i);
        assert_eq!(ch.is.l2.vr, 1);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x02, 0x81, 0x01, 0x03]]);

        // N(S)=2 is out of sequence: REJ once, then only answer polls.
        let i = net(&ch, &[0x02, 0x81, 0x04, 0x00, 0x08]);
        ch.ph_data(IS, i);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x02, 0x81, 0x09, 0x02]]);
        let i = net(&ch, &[0x02, 0x81, 0x04, 0x00, 0x08]);
        ch.ph_data(IS, i);
        assert!(sent_frames(&mut ch, IS).is_empty());
        let i = net(&ch, &[0x02, 0x81, 0x04, 0x01, 0x08]);
        ch.ph_data(IS, i);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x02, 0x81, 0x01, 0x03]]);
        assert_eq!(ch.is.l2.vr, 1);

        // The expected one clears the reject condition.
        ch.is.l2.impair = true;
        let i = net(&ch, &[0x02, 0x81, 0x02, 0x00, 0x08]);
        ch.ph_data(IS, i);
        assert_eq!(ch.is.l2.vr, 2);
        assert!(sent_frames(&mut ch, IS).is_empty());
    }

    #[test]
    fn idle_poll() {
        let mut ch = channel(0);
        up(&mut ch);
        ch.run_timers(10000);
        assert_eq!(ch.l2_state(IS), L2State::TimerRecovery);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x00, 0x81, 0x01, 0x01]]);
        assert!(ch.is.l2.t200.is_armed());
        // RR response with F=1.
        let rr = net(&ch, &[0x00, 0x81, 0x01, 0x01]);
        ch.ph_data(IS, rr);
        assert_eq!(ch.l2_state(IS), L2State::MultiFrame);
        assert!(ch.is.l2.t203.is_armed());
        assert!(!ch.is.l2.t200.is_armed());
    }

    #[test]
    fn peer_disconnect() {
        let mut ch = channel(0);
        up(&mut ch);
        data(&mut ch, &[1]);
        // DISC command, P=1.
        let disc = net(&ch, &[0x02, 0x81, 0x53]);
        ch.ph_data(IS, disc);
        assert_eq!(ch.l2_state(IS), L2State::TeiAssigned);
        assert!(ch.is.l2.i_queue.is_empty());
        // UA response, F=1.
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x02, 0x81, 0x73]]);
        // DISC while idle gets DM.
        let disc = net(&ch, &[0x02, 0x81, 0x53]);
        ch.ph_data(IS, disc);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x02, 0x81, 0x1f]]);
    }

    #[test]
    fn release_flushes_queue_before_disc() {
        let mut ch = channel(0);
        up(&mut ch);
        data(&mut ch, &[0x5a]);
        data(&mut ch, &[0x42]);
        assert!(event(&mut ch, IS, L2Event::DlRelease, L2Arg::None).is_handled());
        // Window of one: the first goes out ahead of the DISC, the second is lost.
        assert_eq!(
            sent_frames(&mut ch, IS),
            vec![vec![0x00, 0x81, 0x00, 0x00, 0x5a], vec![0x00, 0x81, 0x53]]
        );
        assert_eq!(ch.l2_state(IS), L2State::AwaitingRelease);
        assert!(ch.is.l2.i_queue.is_empty());
        // A pull requested before the release finds nothing to do.
        ch.ph_pull_ack(IS);
        assert!(drain(&mut ch, IS).is_empty());

        let ua = net(&ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.l2_state(IS), L2State::TeiAssigned);
    }

    #[test]
    fn busy_peer_holds_frames() {
        let mut ch = channel(0);
        up(&mut ch);
        // RNR response, N(R)=0.
        let rnr = net(&ch, &[0x00, 0x81, 0x05, 0x00]);
        ch.ph_data(IS, rnr);
        assert!(ch.is.l2.peer_busy);
        data(&mut ch, &[7]);
        assert_eq!(pulls(&drain(&mut ch, IS)), 0);
        ch.ph_pull_ack(IS);
        assert!(sent_frames(&mut ch, IS).is_empty());
        assert_eq!(ch.is.l2.i_queue.len(), 1);
        assert_eq!(ch.is.l2.vs, 0);

        // RR clears the busy condition.
        let rr = net(&ch, &[0x00, 0x81, 0x01, 0x00]);
        ch.ph_data(IS, rr);
        assert!(!ch.is.l2.peer_busy);
        assert_eq!(pulls(&drain(&mut ch, IS)), 1);
        ch.ph_pull_ack(IS);
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x00, 0x81, 0x00, 0x00, 7]]);
    }

    #[test]
    fn frmr_only_logged() {
        let mut ch = channel(0);
        up(&mut ch);
        data(&mut ch, &[1]);
        ch.ph_pull_ack(IS);
        drain(&mut ch, IS);
        let frmr = net(&ch, &[0x00, 0x81, 0x87, 0x00, 0x00, 0x00, 0x00, 0x00]);
        ch.ph_data(IS, frmr);
        assert_eq!(ch.l2_state(IS), L2State::MultiFrame);
        assert!(drain(&mut ch, IS).is_empty());
        assert_eq!((ch.is.l2.vs, ch.is.l2.va), (1, 0));
        assert!(ch.is.l2.t200.is_armed());
    }

    #[test]
    fn frames_for_other_tei_ignored() {
        let mut ch = channel(0);
        event(&mut ch, IS, L2Event::DlEstablish, L2Arg::None);
        drain(&mut ch, IS);
        let ua = net(&ch, &[0x00, 0x83, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.l2_state(IS), L2State::AwaitingEstablish);
        // UA with the command bit is ignored too.
        let ua = net(&ch, &[0x02, 0x81, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.l2_state(IS), L2State::AwaitingEstablish);
    }

    #[test]
    fn lapb_addresses() {
        let mut ch = channel(0);
        ch.init_ds(true);
        event(&mut ch, StackId::Ds, L2Event::DlEstablish, L2Arg::None);
        assert_eq!(sent_frames(&mut ch, StackId::Ds), vec![vec![LAPB_A, 0x3f]]);
        let ua = buf(&ch, &[LAPB_A, 0x73]);
        ch.ph_data(StackId::Ds, ua);
        assert_eq!(ch.l2_state(StackId::Ds), L2State::MultiFrame);
        assert_eq!(sent_frames(&mut ch, StackId::Ds), vec![vec![LAPB_B, 0x01]]);

        let mut ch = channel(1);
        ch.init_ds(false);
        let sabm = buf(&ch, &[LAPB_A, 0x3f]);
        ch.ph_data(StackId::Ds, sabm);
        assert_eq!(ch.l2_state(StackId::Ds), L2State::MultiFrame);
        assert_eq!(sent_frames(&mut ch, StackId::Ds), vec![vec![LAPB_A, 0x73]]);
    }

    // Random RR/REJ/I/timer sequences never break the window invariants.
    #[test]
    fn window_invariants_hold() {
        let mut seed: u32 = 0x1234_5678;
        let mut rnd = move |n: u32| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed % n
        };
        let mut cfg = config();
        cfg.d_l2.window = 3;
        let mut ch = channel_with(0, cfg);
        up(&mut ch);
        let mut now = 0;
        for step in 0..2000 {
            let l2 = &ch.is.l2;
            let (va, vs, vr) = (l2.va, l2.vs, l2.vr);
            match rnd(6) {
                0 => {
                    if ch.is.l2.i_queue.len() < 8 {
                        data(&mut ch, &[step as u8]);
                    }
                }
                1 => ch.ph_pull_ack(IS),
                2 => {
                    let nr = ((u32::from(va) + rnd(u32::from(vs.wrapping_sub(va) % 128) + 1)) % 128) as u8;
                    let b = net(&ch, &[0x00, 0x81, 0x01, nr << 1 | u8::from(rnd(2) == 0)]);
                    ch.ph_data(IS, b);
                }
                3 => {
                    let b = net(&ch, &[0x00, 0x81, 0x09, va << 1]);
                    ch.ph_data(IS, b);
                }
                4 => {
                    let b = net(&ch, &[0x02, 0x81, vr << 1, va << 1, 0]);
                    ch.ph_data(IS, b);
                }
                _ => {
                    now += 1000;
                    ch.run_timers(now);
                }
            }
            drain(&mut ch, IS);
            if ch.l2_state(IS) == L2State::TeiAssigned {
                up(&mut ch);
            }
            let l2 = &ch.is.l2;
            assert!(!(l2.t200.is_armed() && l2.t203.is_armed()), "step {step}");
            assert!(usize::from(l2.outstanding()) <= l2.window(), "step {step}");
            assert!(l2.legalnr(l2.va), "step {step}");
            let occupied = l2.windowar.iter().filter(|s| s.is_some()).count();
            assert_eq!(occupied, usize::from(l2.outstanding()), "step {step}");
        }
    }

    #[test]
    fn unit_data_and_names() {
        let mut ch = channel(0);
        let b = buf(&ch, &[0x08, 0x00]);
        event(&mut ch, IS, L2Event::DlUnitData, L2Arg::Data(b));
        assert_eq!(sent_frames(&mut ch, IS), vec![vec![0x00, 0x81, 0x03, 0x08, 0x00]]);
        assert_eq!(L2State::TimerRecovery.name(), "ST_L2_8");
        assert_eq!(L2Event::COUNT, 20);
    }
}
