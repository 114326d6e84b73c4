//! Call signalling layer (Q.931 / 1TR6).
//!
//! Unlike the other layers this one is not a dense state machine: each
//! protocol variant is a short list of rows, searched in order, matching a
//! set of layer 3 states against a call control primitive (downwards) or a
//! message type (upwards). Anything without a row is dropped.
use crate::callc;
use crate::channel::{Channel, StackId};
use crate::config::DProtocol;
use crate::l2::{self, L2Arg, L2Event};
use anyhow::{Error, Result};
use log::debug;

pub mod ets;
pub mod tr6;

pub use ets::Ets;
pub use tr6::Tr6;

/// Primitives between layer 3 and call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcPrim {
    SetupReq,
    SetupInd,
    SetupCnf,
    SetupRsp,
    SetupCompleteInd,
    DisconnectReq,
    DisconnectInd,
    ReleaseReq,
    ReleaseInd,
    ReleaseCnf,
    AlertingReq,
    AlertingInd,
    ProceedingInd,
    InfoCharge,
    /// Data link gone: forget the call.
    Dlrl,
}

/// Bit for layer 3 state `s` in a row's state set.
#[must_use]
pub const fn sbit(s: u8) -> u32 {
    1 << s
}

pub const ALL_STATES: u32 = u32::MAX;

pub struct DownRow {
    pub states: u32,
    pub prim: CcPrim,
    pub handler: fn(&mut Channel),
}

pub struct UpRow {
    pub states: u32,
    pub mt: u8,
    pub handler: fn(&mut Channel, &Msg),
}

/// One signalling protocol.
pub trait L3Protocol: Sync {
    fn name(&self) -> &'static str;
    /// Protocol discriminator.
    fn pd(&self) -> u8;
    fn down(&self) -> &'static [DownRow];
    fn up(&self) -> &'static [UpRow];
}

#[must_use]
pub fn protocol(p: DProtocol) -> &'static dyn L3Protocol {
    match p {
        DProtocol::Ets => &Ets,
        DProtocol::Tr6 => &Tr6,
    }
}

pub struct Layer3 {
    pub state: u8,
    /// Call reference, without the flag bit.
    pub callref: u8,
    /// We allocated the call reference.
    pub orig: bool,
    pub proto: &'static dyn L3Protocol,
    pub debug: bool,
    name: String,
}

impl Layer3 {
    #[must_use]
    pub fn new(name: String, p: DProtocol) -> Self {
        Self {
            state: 0,
            callref: 0,
            orig: false,
            proto: protocol(p),
            debug: false,
            name,
        }
    }

    pub(crate) fn newstate(&mut self, state: u8) {
        if self.debug {
            debug!("{}: newstate {} -> {state}", self.name, self.state);
        }
        self.state = state;
    }
}

/// A received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msg<'a> {
    pub pd: u8,
    /// Call reference, without the flag bit.
    pub callref: u8,
    /// Flag bit: sent by the side that did not allocate the reference.
    pub flag: bool,
    pub mt: u8,
    pub ies: &'a [u8],
}

impl<'a> Msg<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let &[pd, crlen, ..] = bytes else {
            return Err(Error::msg(format!("message too short: {bytes:02x?}")));
        };
        let (callref, flag, at) = match crlen & 0x0f {
            // Dummy call reference.
            0 => (0, false, 2),
            1 => {
                let cr = *bytes
                    .get(2)
                    .ok_or_else(|| Error::msg("message truncated in call reference"))?;
                (cr & 0x7f, cr & 0x80 != 0, 3)
            }
            n => return Err(Error::msg(format!("call reference length {n} not supported"))),
        };
        let mt = *bytes
            .get(at)
            .ok_or_else(|| Error::msg("message has no message type"))?;
        Ok(Self {
            pd,
            callref,
            flag,
            mt,
            ies: &bytes[at + 1..],
        })
    }
}

/// Build a message header and elements.
#[must_use]
pub fn encode(pd: u8, callref: u8, flag: bool, mt: u8, ies: &[u8]) -> Vec<u8> {
    let mut out = vec![pd, 1, (callref & 0x7f) | if flag { 0x80 } else { 0 }, mt];
    out.extend_from_slice(ies);
    out
}

/// Send with an explicit call reference.
pub(crate) fn send_raw(ch: &mut Channel, callref: u8, flag: bool, mt: u8, ies: &[u8]) {
    let bytes = encode(ch.l3.proto.pd(), callref, flag, mt, ies);
    let Some(buf) = ch.pool.get_with("l3", &bytes) else {
        return;
    };
    if !l2::event(ch, StackId::Is, L2Event::DlData, L2Arg::Data(buf)).is_handled() {
        debug!("{}: data link down, message {mt:#04x} dropped", ch.l3.name);
    }
}

/// Send a message for the current call.
pub(crate) fn send(ch: &mut Channel, mt: u8, ies: &[u8]) {
    let (callref, flag) = (ch.l3.callref, !ch.l3.orig);
    send_raw(ch, callref, flag, mt, ies);
}

/// Primitive from call control.
pub fn cc_down(ch: &mut Channel, prim: CcPrim) {
    let proto = ch.l3.proto;
    let state = ch.l3.state;
    match proto
        .down()
        .iter()
        .find(|r| r.prim == prim && r.states & sbit(state) != 0)
    {
        Some(row) => {
            if ch.l3.debug {
                debug!("{}: state {state} {prim:?}", ch.l3.name);
            }
            (row.handler)(ch);
        }
        None => {
            if ch.l3.debug {
                debug!("{}: state {state} {prim:?} unhandled", ch.l3.name);
            }
        }
    }
}

/// Message received from the data link.
pub fn dl_data(ch: &mut Channel, buf: crate::buffer::Buf) {
    let proto = ch.l3.proto;
    let msg = match Msg::parse(&buf) {
        Ok(m) => m,
        Err(e) => {
            debug!("{}: {e}", ch.l3.name);
            return;
        }
    };
    if msg.pd != proto.pd() {
        debug!(
            "{}: protocol discriminator {:#04x} ignored",
            ch.l3.name, msg.pd
        );
        return;
    }
    let state = ch.l3.state;
    // Messages for another call. In the null state only a new call
    // (or an enquiry) gets in.
    if state != 0 && msg.callref != ch.l3.callref {
        debug!("{}: callref {} is not ours", ch.l3.name, msg.callref);
        return;
    }
    match proto
        .up()
        .iter()
        .find(|r| r.mt == msg.mt && r.states & sbit(state) != 0)
    {
        Some(row) => {
            if ch.l3.debug {
                debug!("{}: state {state} mt {:#04x}", ch.l3.name, msg.mt);
            }
            (row.handler)(ch, &msg);
        }
        None => {
            if ch.l3.debug {
                debug!("{}: state {state} mt {:#04x} unhandled", ch.l3.name, msg.mt);
            }
        }
    }
}

/// Shared by both variants.
pub(crate) fn reset(ch: &mut Channel) {
    ch.l3.newstate(0);
}

pub(crate) fn up(ch: &mut Channel, prim: CcPrim) {
    callc::l3_up(ch, prim);
}

/// Helpers for the message set tests.
#[cfg(test)]
pub(crate) mod testutil {
    use crate::channel::testutil::*;
    use crate::channel::{Channel, StackId};

    /// Channel with the signalling link up and room for several frames.
    pub fn linked(chan: usize) -> Channel {
        let mut cfg = config();
        cfg.d_l2.window = 7;
        let mut ch = channel_with(chan, cfg);
        ch.is.l2.fi.change_state(crate::l2::L2State::MultiFrame);
        ch
    }

    /// Layer 3 part of the I frames sent.
    pub fn sent(ch: &mut Channel) -> Vec<Vec<u8>> {
        for _ in 0..ch.is.l2.i_queue.len() {
            ch.ph_pull_ack(StackId::Is);
        }
        sent_frames(ch, StackId::Is)
            .into_iter()
            .filter(|f| f.len() > 4)
            .map(|f| f[4..].to_vec())
            .collect()
    }

    pub fn deliver(ch: &mut Channel, bytes: &[u8]) {
        let b = buf(ch, bytes);
        super::dl_data(ch, b);
    }
}
