//! German national 1TR6 (N1) message set.
use super::{reset, sbit, send, up, CcPrim, DownRow, L3Protocol, Msg, UpRow, ALL_STATES};
use crate::callc::CcState;
use crate::channel::{CallParams, Channel};
use crate::ie::{
    self, IE_CALLED, IE_CALLING, IE_CAUSE, IE_CHANNEL_ID, IE_CHARGING, IE_FACILITY,
    IE_SERVICE_IND,
};
use log::debug;

pub const PD: u8 = 0x41;

pub const MT_ALERT: u8 = 0x01;
pub const MT_CALL_SENT: u8 = 0x02;
pub const MT_SETUP: u8 = 0x05;
pub const MT_CONN: u8 = 0x07;
pub const MT_SETUP_ACK: u8 = 0x0d;
pub const MT_CONN_ACK: u8 = 0x0f;
pub const MT_DISC: u8 = 0x45;
pub const MT_REL: u8 = 0x4d;
pub const MT_REL_ACK: u8 = 0x5a;
pub const MT_INFO: u8 = 0x6d;

pub struct Tr6;

/// SETUP elements for an outgoing call. A called number starting with
/// 'S' sets up a semi-permanent connection.
#[must_use]
pub fn setup_ies(para: &CallParams) -> Vec<u8> {
    let mut ies = vec![];
    ie::put_channel_any(&mut ies);
    let called = match para.phone.strip_prefix('S') {
        Some(rest) => {
            for fac in ie::spv_facilities(para) {
                ie::put(&mut ies, IE_FACILITY, &fac);
            }
            rest
        }
        None => para.phone.as_str(),
    };
    if !para.eazmsn.is_empty() {
        ie::put_number(&mut ies, IE_CALLING, &para.eazmsn);
    }
    ie::put_number(&mut ies, IE_CALLED, called);
    ie::put_shift(&mut ies, 6);
    ie::put(&mut ies, IE_SERVICE_IND, &[para.si1, para.si2]);
    ies
}

#[must_use]
pub fn parse_setup(ies: &[u8]) -> Option<CallParams> {
    let bchannel = ie::channel_id(ie::find(ies, 0, IE_CHANNEL_ID)?)?;
    let num = |id| {
        ie::find(ies, 0, id)
            .and_then(ie::number)
            .unwrap_or_default()
    };
    let (si1, si2) = match ie::find(ies, 6, IE_SERVICE_IND) {
        Some(&[si1, si2, ..]) => (si1, si2),
        Some(&[si1]) => (si1, 0),
        _ => (0, 0),
    };
    Some(CallParams {
        bchannel,
        si1,
        si2,
        phone: num(IE_CALLING),
        eazmsn: num(IE_CALLED),
        ..CallParams::default()
    })
}

fn cause_of(msg: &Msg) -> Option<u8> {
    ie::find(msg.ies, 0, IE_CAUSE).map(|c| c.first().map_or(0, |c| c & 0x7f))
}

// Charge units only ever go up; anything else is a repeat.
fn charge(ch: &mut Channel, msg: &Msg) {
    let Some(units) = ie::find(msg.ies, 6, IE_CHARGING).and_then(ie::charge) else {
        return;
    };
    if units > ch.para.chargeinfo {
        ch.para.chargeinfo = units;
        up(ch, CcPrim::InfoCharge);
    }
}

fn setup_req(ch: &mut Channel) {
    ch.l3.callref = ch.para.callref;
    ch.l3.orig = true;
    let ies = setup_ies(&ch.para);
    send(ch, MT_SETUP, &ies);
    ch.l3.newstate(1);
}

fn alerting_req(ch: &mut Channel) {
    send(ch, MT_ALERT, &[]);
    ch.l3.newstate(7);
}

fn setup_rsp(ch: &mut Channel) {
    send(ch, MT_CONN, &[]);
    ch.l3.newstate(8);
}

fn disconnect_req(ch: &mut Channel) {
    let mut ies = vec![];
    // Empty cause: normal clearing.
    ie::put(&mut ies, IE_CAUSE, &[]);
    send(ch, MT_DISC, &ies);
    ch.l3.newstate(11);
}

fn release_req(ch: &mut Channel) {
    send(ch, MT_REL, &[]);
    ch.l3.newstate(19);
}

fn setup(ch: &mut Channel, msg: &Msg) {
    if ch.state() != CcState::Null {
        return;
    }
    let Some(mut para) = parse_setup(msg.ies) else {
        debug!("ch{}: SETUP without channel identification", ch.chan);
        return;
    };
    if para.si1 == 1 {
        debug!("ch{}: incoming voice call from {:?}", ch.chan, para.phone);
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

fn alert(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(4);
    up(ch, CcPrim::AlertingInd);
}

fn conn(ch: &mut Channel, msg: &Msg) {
    charge(ch, msg);
    send(ch, MT_CONN_ACK, &[]);
    ch.l3.newstate(10);
    up(ch, CcPrim::SetupCnf);
}

fn conn_ack(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(10);
    up(ch, CcPrim::SetupCompleteInd);
}

fn info(ch: &mut Channel, msg: &Msg) {
    charge(ch, msg);
}

fn disc(ch: &mut Channel, msg: &Msg) {
    charge(ch, msg);
    ch.para.cause = cause_of(msg);
    ch.l3.newstate(12);
    up(ch, CcPrim::DisconnectInd);
}

// Both sides sent DISC.
fn disc_collision(ch: &mut Channel, msg: &Msg) {
    charge(ch, msg);
    send(ch, MT_REL, &[]);
    ch.l3.newstate(19);
}

fn rel(ch: &mut Channel, msg: &Msg) {
    ch.para.cause = cause_of(msg).or(ch.para.cause);
    send(ch, MT_REL_ACK, &[]);
    ch.l3.newstate(0);
    up(ch, CcPrim::ReleaseInd);
}

fn rel_cnf(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(0);
    up(ch, CcPrim::ReleaseCnf);
}

fn rel_ack(ch: &mut Channel, _msg: &Msg) {
    ch.l3.newstate(0);
    up(ch, CcPrim::ReleaseInd);
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
    UpRow { states: sbit(1), mt: MT_SETUP_ACK, handler: proceeding },
    UpRow { states: sbit(1), mt: MT_CALL_SENT, handler: proceeding },
    UpRow { states: sbit(1) | sbit(3), mt: MT_ALERT, handler: alert },
    UpRow { states: sbit(1) | sbit(3) | sbit(4), mt: MT_CONN, handler: conn },
    UpRow { states: sbit(8), mt: MT_CONN_ACK, handler: conn_ack },
    UpRow { states: NOT_IDLE, mt: MT_INFO, handler: info },
    UpRow { states: ACTIVE_CALL, mt: MT_DISC, handler: disc },
    UpRow { states: sbit(11), mt: MT_DISC, handler: disc_collision },
    UpRow { states: sbit(19), mt: MT_REL, handler: rel_cnf },
    UpRow { states: NOT_IDLE, mt: MT_REL, handler: rel },
    UpRow { states: sbit(19), mt: MT_REL_ACK, handler: rel_cnf },
    UpRow { states: NOT_IDLE, mt: MT_REL_ACK, handler: rel_ack },
];

impl L3Protocol for Tr6 {
    fn name(&self) -> &'static str {
        "1TR6"
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
