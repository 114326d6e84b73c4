//! E-DSS1 (ETS 300 102) message set.
use super::{reset, sbit, send, send_raw, up, CcPrim, DownRow, L3Protocol, Msg, UpRow, ALL_STATES};
use crate::callc::CcState;
use crate::channel::{CallParams, Channel};
use crate::ie::{self, IE_BEARER, IE_CALLED, IE_CALLING, IE_CALL_STATE, IE_CAUSE, IE_CHANNEL_ID};
use log::{debug, info};

pub const PD: u8 = 0x08;

pub const MT_ALERTING: u8 = 0x01;
pub const MT_CALL_PROCEEDING: u8 = 0x02;
pub const MT_SETUP: u8 = 0x05;
pub const MT_CONNECT: u8 = 0x07;
pub const MT_SETUP_ACKNOWLEDGE: u8 = 0x0d;
pub const MT_CONNECT_ACKNOWLEDGE: u8 = 0x0f;
pub const MT_DISCONNECT: u8 = 0x45;
pub const MT_RELEASE: u8 = 0x4d;
pub const MT_RELEASE_COMPLETE: u8 = 0x5a;
pub const MT_STATUS_ENQUIRY: u8 = 0x75;
pub const MT_STATUS: u8 = 0x7d;

pub struct Ets;

/// SETUP elements for an outgoing call.
#[must_use]
pub fn setup_ies(para: &CallParams) -> Vec<u8> {
    let mut ies = vec![];
    ie::put(&mut ies, IE_BEARER, ie::bearer_for_si(para.si1));
    ie::put_channel_any(&mut ies);
    if !para.eazmsn.is_empty() {
        ie::put_number(&mut ies, IE_CALLING, &para.eazmsn);
    }
    ie::put_number(&mut ies, IE_CALLED, &para.phone);
    ies
}

/// Call parameters of an incoming SETUP. None without channel
/// identification.
#[must_use]
pub fn parse_setup(ies: &[u8]) -> Option<CallParams> {
    let bchannel = ie::channel_id(ie::find(ies, 0, IE_CHANNEL_ID)?)?;
    let num = |id| {
        ie::find(ies, 0, id)
            .and_then(ie::number)
            .unwrap_or_default()
    };
    Some(CallParams {
        bchannel,
        si1: ie::find(ies, 0, IE_BEARER)
            .and_then(ie::si_for_bearer)
            .unwrap_or(7),
        si2: 0,
        phone: num(IE_CALLING),
        eazmsn: num(IE_CALLED),
        ..CallParams::default()
    })
}

fn cause_of(msg: &Msg) -> Option<u8> {
    ie::find(msg.ies, 0, IE_CAUSE).and_then(ie::cause)
}

fn setup_req(ch: &mut Channel) {
    ch.l3.callref = ch.para.callref;
    ch.l3.orig = true;
    let ies = setup_ies(&ch.para);
    send(ch, MT_SETUP, &ies);
    ch.l3.newstate(1);
}

fn alerting_req(ch: &mut Channel) {
    send(ch, MT_ALERTING, &[]);
    ch.l3.newstate(7);
}

fn setup_rsp(ch: &mut Channel) {
    send(ch, MT_CONNECT, &[]);
    ch.l3.newstate(8);
}

fn disconnect_req(ch: &mut Channel) {
    let mut ies = vec![];
    ie::put(&mut ies, IE_CAUSE, &ie::cause_ie(ie::CAUSE_NORMAL));
    send(ch, MT_DISCONNECT, &ies);
    ch.l3.newstate(11);
}

fn release_req(ch: &mut Channel) {
    send(ch, MT_RELEASE, &[]);
    ch.l3.newstate(19);
}

fn setup(ch: &mut Channel, msg: &Msg) {
    // A SETUP is broadcast to every channel, only idle ones take it.
    if ch.state() != CcState::Null {
        return;
    }
    let Some(mut para) = parse_setup(msg.ies) else {
        debug!("ch{}: SETUP without channel identification", ch.chan);
        return;
    };
    if para.si1 == 1 {
        info!("ch{}: incoming voice call from {:?}", ch.chan, para.phone);
    }
    para.callref = msg.callref;
    ch.para = para;
    ch.l3.callref = msg.callref;
    ch.l3.orig = false;
    ch.l3.newstate(6);
    up(ch, CcPrim::SetupInd);
}

fn proceeding(ch: &mut Channel, msg: &Msg) {
    if let Some(b) = ie::find(msg.ies, 0, IE_CHANNEL_ID).and_then(ie::channel_id) {
        ch.para.bchannel = b;
    }
    ch.l3.newstate(3);
    up(ch, CcPrim::ProceedingInd);
}

fn alerting(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(4);
    up(ch, CcPrim::AlertingInd);
}

fn connect(ch: &mut Channel, _msg: &Msg) {
    send(ch, MT_CONNECT_ACKNOWLEDGE, &[]);
    ch.l3.newstate(10);
    up(ch, CcPrim::SetupCnf);
}

fn connect_ack(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(10);
    up(ch, CcPrim::SetupCompleteInd);
}

fn disconnect(ch: &mut Channel, msg: &Msg) {
    ch.para.cause = cause_of(msg);
    ch.l3.newstate(12);
    up(ch, CcPrim::DisconnectInd);
}

fn release(ch: &mut Channel, msg: &Msg) {
    ch.para.cause = cause_of(msg).or(ch.para.cause);
    send(ch, MT_RELEASE_COMPLETE, &[]);
    ch.l3.newstate(0);
    up(ch, CcPrim::ReleaseInd);
}

fn release_cnf(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(0);
    up(ch, CcPrim::ReleaseCnf);
}

fn release_complete(ch: &mut Channel, msg: &Msg) {
    ch.para.cause = cause_of(msg).or(ch.para.cause);
    ch.l3.newstate(0);
    up(ch, CcPrim::ReleaseInd);
}

fn status_enquiry(ch: &mut Channel, msg: &Msg) {
    let mut ies = vec![];
    ie::put(&mut ies, IE_CAUSE, &ie::cause_ie(ie::CAUSE_STATUS_ENQUIRY));
    ie::put(&mut ies, IE_CALL_STATE, &[ch.l3.state & 0x3f]);
    send_raw(ch, msg.callref, !msg.flag, MT_STATUS, &ies);
}

const ACTIVE_CALL: u32 =
    sbit(1) | sbit(3) | sbit(4) | sbit(6) | sbit(7) | sbit(8) | sbit(10);
const NOT_IDLE: u32 = ALL_STATES & !sbit(0);

static DOWN: &[DownRow] = &[
    DownRow { states: sbit(0), prim: CcPrim::SetupReq, handler: setup_req },
    DownRow { states: sbit(6), prim: CcPrim::AlertingReq, handler: alerting_req },
    DownRow { states: sbit(6) | sbit(7), prim: CcPrim::SetupRsp, handler: setup_rsp },
    DownRow { states: ACTIVE_CALL, prim: CcPrim::DisconnectReq, handler: disconnect_req },
    DownRow { states: sbit(12), prim: CcPrim::ReleaseReq, handler: release_req },
    DownRow { states: ALL_STATES, prim: CcPrim::Dlrl, handler: reset },
];

static UP: &[UpRow] = &[
    UpRow { states: sbit(0), mt: MT_SETUP, handler: setup },
    UpRow { states: sbit(1), mt: MT_CALL_PROCEEDING, handler: proceeding },
    UpRow { states: sbit(1), mt: MT_SETUP_ACKNOWLEDGE, handler: proceeding },
    UpRow { states: sbit(1) | sbit(3), mt: MT_ALERTING, handler: alerting },
    UpRow { states: sbit(1) | sbit(3) | sbit(4), mt: MT_CONNECT, handler: connect },
    UpRow { states: sbit(8), mt: MT_CONNECT_ACKNOWLEDGE, handler: connect_ack },
    UpRow { states: ACTIVE_CALL, mt: MT_DISCONNECT, handler: disconnect },
    UpRow { states: sbit(19), mt: MT_RELEASE, handler: release_cnf },
    UpRow { states: NOT_IDLE, mt: MT_RELEASE, handler: release },
    UpRow { states: sbit(19), mt: MT_RELEASE_COMPLETE, handler: release_cnf },
    UpRow { states: NOT_IDLE, mt: MT_RELEASE_COMPLETE, handler: release_complete },
    UpRow { states: ALL_STATES, mt: MT_STATUS_ENQUIRY, handler: status_enquiry },
];

impl L3Protocol for Ets {
    fn name(&self) -> &'static str {
        "E-DSS1"
    }
    fn pd(&self) -> u8 {
        PD
    }
    fn down(&self) -> &'static [DownRow] {
        DOWN
    }
    fn up(&self) -> &'static [UpRow] {
        UP
    }
}
