//! TEI management entity (Q.921 section 5.3), user side.
//!
//! Messages travel as UI frames on SAPI 63 to the broadcast TEI. An ID
//! request carries a random reference number Ri so the network's answer
//! can be matched to the requesting terminal.
use crate::channel::{Channel, PhReq, StackId};
use crate::frame::{Address, Frame, FrameType, SAPI_TEIMGR, TEI_BROADCAST};
use crate::l2::{self, L2Arg, L2Event};
use crate::timer::FsmTimer;
use log::{debug, info, warn};

/// Management entity identifier.
const TEI_ENTITY: u8 = 0x0f;

pub const ID_REQUEST: u8 = 1;
pub const ID_ASSIGNED: u8 = 2;
pub const ID_DENIED: u8 = 3;
pub const ID_CHECK_REQUEST: u8 = 4;
pub const ID_CHECK_RESPONSE: u8 = 5;
pub const ID_REMOVE: u8 = 6;

pub struct TeiMgr {
    ri: u16,
    pub t202: FsmTimer<()>,
    t202_ms: u64,
    n202: u32,
    retries: u32,
    pending: bool,
}

impl TeiMgr {
    #[must_use]
    pub fn new(t202_ms: u64, n202: u32) -> Self {
        Self {
            ri: 0,
            t202: FsmTimer::new("T202"),
            t202_ms,
            n202,
            retries: 0,
            pending: false,
        }
    }

    /// An ID request is outstanding.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.pending
    }
}

/// Management message body.
#[must_use]
pub fn encode(ri: u16, mt: u8, ai: u8) -> [u8; 5] {
    let [hi, lo] = ri.to_be_bytes();
    [TEI_ENTITY, hi, lo, mt, (ai << 1) | 1]
}

fn send(ch: &mut Channel, mt: u8, ri: u16, ai: u8) {
    let mut bytes = Frame {
        addr: Address::Lapd {
            sapi: SAPI_TEIMGR,
            tei: TEI_BROADCAST,
            cr: false,
        },
        kind: FrameType::Ui { poll: false },
    }
    .serialize(true);
    bytes.extend_from_slice(&encode(ri, mt, ai));
    let Some(buf) = ch.pool.get_with("tei", &bytes) else {
        return;
    };
    ch.is.out.push_back(PhReq::Data(buf));
}

fn send_request(ch: &mut Channel) {
    let now = ch.now;
    let mgr = &mut ch.tei;
    mgr.ri = rand::random();
    mgr.t202.restart(now, mgr.t202_ms, ());
    let ri = mgr.ri;
    debug!("ch{}: TEI ID request ri={ri:#06x}", ch.chan);
    send(ch, ID_REQUEST, ri, TEI_BROADCAST);
}

/// Ask the network for a TEI.
pub fn assign_request(ch: &mut Channel) {
    ch.tei.pending = true;
    ch.tei.retries = 0;
    send_request(ch);
}

/// Stop asking.
pub fn cancel(ch: &mut Channel) {
    ch.tei.pending = false;
    ch.tei.t202.cancel();
}

pub fn t202_expired(ch: &mut Channel) {
    if !ch.tei.pending {
        return;
    }
    if ch.tei.retries >= ch.tei.n202 {
        warn!("ch{}: no TEI assigned after {} requests", ch.chan, ch.tei.retries + 1);
        ch.tei.pending = false;
        l2::event(ch, StackId::Is, L2Event::MdlRemove, L2Arg::None);
        return;
    }
    ch.tei.retries += 1;
    send_request(ch);
}

fn own_tei(ch: &Channel) -> Option<u8> {
    ch.is.l2.tei
}

/// Management message received, UI header already stripped.
pub fn mdl_data(ch: &mut Channel, body: &[u8]) {
    let &[entity, hi, lo, mt, ai, ..] = body else {
        debug!("ch{}: short TEI message {body:02x?}", ch.chan);
        return;
    };
    if entity != TEI_ENTITY {
        return;
    }
    let ri = u16::from_be_bytes([hi, lo]);
    let ai = ai >> 1;
    match mt {
        ID_ASSIGNED => {
            if ch.tei.pending && ri == ch.tei.ri {
                info!("ch{}: TEI {ai} assigned", ch.chan);
                cancel(ch);
                l2::event(ch, StackId::Is, L2Event::MdlAssign, L2Arg::Tei(ai));
            } else if Some(ai) == own_tei(ch) {
                // Someone else got our TEI.
                warn!("ch{}: TEI {ai} assigned twice, removing", ch.chan);
                l2::event(ch, StackId::Is, L2Event::MdlRemove, L2Arg::None);
            }
        }
        ID_DENIED => {
            if ch.tei.pending && ri == ch.tei.ri {
                debug!("ch{}: TEI request denied, retrying on T202", ch.chan);
            }
        }
        ID_CHECK_REQUEST => {
            if let Some(tei) = own_tei(ch) {
                if ai == TEI_BROADCAST || ai == tei {
                    send(ch, ID_CHECK_RESPONSE, rand::random(), tei);
                }
            }
        }
        ID_REMOVE => {
            if ch.cfg.tei.is_some() {
                return;
            }
            if own_tei(ch).is_some_and(|tei| ai == TEI_BROADCAST || ai == tei) {
                info!("ch{}: TEI {ai} removed by network", ch.chan);
                l2::event(ch, StackId::Is, L2Event::MdlRemove, L2Arg::None);
            }
        }
        _ => debug!("ch{}: TEI message type {mt} ignored", ch.chan),
    }
}
