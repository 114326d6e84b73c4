//! Call control.
//!
//! One state machine per channel between the consumer's commands, the
//! signalling layer and the two link connections. Every way out of a call
//! ends in `NULL` with the D and B link connections released and DHUP/BHUP
//! reported once.
use crate::buffer::Buf;
use crate::channel::{CallParams, Channel, LcSide, StatusEvent};
use crate::fsm::{fsm_enum, Dispatch, Fsm, FsmBuilder, FsmInst};
use crate::l3::{self, CcPrim};
use crate::lc::{self, LcEvent, LcState};
use anyhow::{Error, Result};
use log::{debug, info};
use regex::Regex;
use std::sync::Arc;

fsm_enum! {
    pub enum CcState {
        Null => "NULL",
        /// Outgoing, waiting for the D channel.
        OutW => "OUT_W",
        /// SETUP sent.
        Out => "OUT",
        /// Network reported progress.
        OutProceed => "OUT_PROCEED",
        /// Answered, B channel coming up.
        OutEstb => "OUT_ESTB",
        /// Incoming, waiting for the D channel.
        InW => "IN_W",
        /// Ringing.
        In => "IN",
        InSetup => "IN_SETUP",
        InDact => "IN_DACT",
        Active => "ACTIVE",
        /// We hung up, B channel going down.
        BcHangup => "BC_HANGUP",
        /// Peer disconnected, B channel going down.
        BcRel => "BC_REL",
        /// Peer released, B channel going down.
        DiscBcHangup => "DISC_BC_HANGUP",
        /// Waiting for the network to finish clearing.
        Clear => "CLEAR",
        /// D link going down.
        RelW => "REL_W",
        /// Hung up before the D link came up.
        ProW => "PRO_W",
        /// D link lost during a call.
        DErr => "D_ERR",
    }
}

fsm_enum! {
    pub enum CcEvent {
        Dial => "EV_DIAL",
        SetupCnf => "EV_SETUP_CNF",
        AcceptB => "EV_ACCEPTB",
        DisconnectInd => "EV_DISCONNECT_IND",
        ReleaseCnf => "EV_RELEASE_CNF",
        DlEst => "EV_DLEST",
        DlRl => "EV_DLRL",
        SetupInd => "EV_SETUP_IND",
        ReleaseInd => "EV_RELEASE_IND",
        AcceptD => "EV_ACCEPTD",
        SetupCmplInd => "EV_SETUP_CMPL_IND",
        BcEst => "EV_BC_EST",
        WriteBuf => "EV_WRITEBUF",
        DataIn => "EV_DATAIN",
        Hangup => "EV_HANGUP",
        BcRel => "EV_BC_REL",
        Cinf => "EV_CINF",
        Suspend => "EV_SUSPEND",
        Resume => "EV_RESUME",
        ProceedingInd => "EV_PROCEEDING_IND",
        AlertingInd => "EV_ALERTING_IND",
    }
}

#[derive(Debug)]
pub enum CcArg {
    None,
    Dial(DialString),
    /// B channel payload.
    Data(Buf),
}

pub type CcFsm = Fsm<Channel, (), CcState, CcEvent, CcArg>;

/// Parsed `called,calling,si1,si2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialString {
    /// May start with `S` for a 1TR6 semi-permanent connection.
    pub called: String,
    pub calling: String,
    pub si1: u8,
    pub si2: u8,
}

impl DialString {
    pub fn parse(s: &str) -> Result<Self> {
        let re = Regex::new(r"^(S?[0-9*#]{1,32}),([0-9]{0,32}),([0-9]{1,3}),([0-9]{1,3})$")?;
        let Some(c) = re.captures(s.trim()) else {
            return Err(Error::msg(format!(
                "bad dial string {s:?}, want called,calling,si1,si2"
            )));
        };
        Ok(Self {
            called: c[1].to_string(),
            calling: c[2].to_string(),
            si1: c[3].parse()?,
            si2: c[4].parse()?,
        })
    }
}

/// Deliver an event to the channel's call control.
pub fn event(ch: &mut Channel, ev: CcEvent, arg: CcArg) -> Dispatch<CcArg> {
    let defs = Arc::clone(&ch.defs);
    defs.callc.event(ch, (), ev, arg)
}

/// Indication from layer 3.
pub fn l3_up(ch: &mut Channel, prim: CcPrim) {
    let ev = match prim {
        CcPrim::SetupInd => CcEvent::SetupInd,
        CcPrim::SetupCnf => CcEvent::SetupCnf,
        CcPrim::SetupCompleteInd => CcEvent::SetupCmplInd,
        CcPrim::ProceedingInd => CcEvent::ProceedingInd,
        CcPrim::AlertingInd => CcEvent::AlertingInd,
        CcPrim::DisconnectInd => CcEvent::DisconnectInd,
        CcPrim::ReleaseInd => CcEvent::ReleaseInd,
        CcPrim::ReleaseCnf => CcEvent::ReleaseCnf,
        CcPrim::InfoCharge => CcEvent::Cinf,
        other => {
            debug!("ch{}: {other:?} is not an indication", ch.chan);
            return;
        }
    };
    event(ch, ev, CcArg::None);
}

fn newstate(ch: &mut Channel, state: CcState) {
    ch.fi.change_state(state);
}

fn establish(ch: &mut Channel, side: LcSide) {
    if !lc::event(ch, side, LcEvent::Establish).is_handled()
        && ch.lc_state(side) == LcState::Connected
    {
        let ev = match side {
            LcSide::D => CcEvent::DlEst,
            LcSide::B => CcEvent::BcEst,
        };
        event(ch, ev, CcArg::None);
    }
}

// The state must already be changed: a link connection with nothing to
// take down reports back before this returns.
fn release(ch: &mut Channel, side: LcSide) {
    if !lc::event(ch, side, LcEvent::Release).is_handled() && ch.lc_state(side) == LcState::Null
    {
        let ev = match side {
            LcSide::D => CcEvent::DlRl,
            LcSide::B => CcEvent::BcRel,
        };
        event(ch, ev, CcArg::None);
    }
}

fn release_d(ch: &mut Channel) {
    release(ch, LcSide::D);
}

fn release_b(ch: &mut Channel) {
    release(ch, LcSide::B);
}

fn bhup(ch: &mut Channel) {
    if ch.bconn {
        ch.emit(StatusEvent::Bhup);
    }
    ch.bconn = false;
    ch.data_open = false;
}

fn dhup(ch: &mut Channel) {
    if ch.ll_call {
        ch.emit(StatusEvent::Dhup);
    }
    ch.reset_call();
    newstate(ch, CcState::Null);
}

fn dial(ch: &mut Channel, _: (), _ev: CcEvent, arg: CcArg) {
    let CcArg::Dial(d) = arg else {
        return;
    };
    info!("ch{}: dialing {} from {:?} si {}/{}", ch.chan, d.called, d.calling, d.si1, d.si2);
    ch.para = CallParams {
        phone: d.called,
        eazmsn: d.calling,
        si1: d.si1,
        si2: d.si2,
        ..CallParams::default()
    };
    ch.ll_call = true;
    ch.init_ds(true);
    newstate(ch, CcState::OutW);
    establish(ch, LcSide::D);
}

fn out_dl_established(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    ch.para.callref = ch.next_callref();
    newstate(ch, CcState::Out);
    l3::cc_down(ch, CcPrim::SetupReq);
}

fn proceeding(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::OutProceed);
}

fn answered(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::OutEstb);
    establish(ch, LcSide::B);
}

fn setup_ind(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    if !ch.bchannel_matches() {
        debug!(
            "ch{}: call for B channel mask {} is not ours",
            ch.chan, ch.para.bchannel
        );
        newstate(ch, CcState::RelW);
        l3::cc_down(ch, CcPrim::Dlrl);
        release_d(ch);
        return;
    }
    ch.incoming = true;
    newstate(ch, CcState::InW);
    establish(ch, LcSide::D);
}

fn in_dl_established(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    ch.ll_call = true;
    let p = &ch.para;
    let icall = format!("{},{},{},{}", p.phone, p.si1, p.si2, p.eazmsn);
    ch.emit(StatusEvent::Icall(icall));
    newstate(ch, CcState::In);
    l3::cc_down(ch, CcPrim::AlertingReq);
}

fn accept_d(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::InSetup);
    l3::cc_down(ch, CcPrim::SetupRsp);
}

fn setup_complete(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    ch.init_ds(false);
    newstate(ch, CcState::InDact);
    establish(ch, LcSide::B);
}

fn b_established(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    ch.data_open = true;
    ch.bconn = true;
    newstate(ch, CcState::Active);
    ch.emit(StatusEvent::Dconn);
    ch.emit(StatusEvent::Bconn);
}

fn hangup_waiting(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::RelW);
    release_d(ch);
}

fn hangup_signalling(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::Clear);
    l3::cc_down(ch, CcPrim::DisconnectReq);
}

fn hangup_incoming(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::ProW);
}

fn hangup_active(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::BcHangup);
    release_b(ch);
}

// B channel gone, on our request or not: clear the call.
fn b_released_disconnect(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    bhup(ch);
    newstate(ch, CcState::Clear);
    l3::cc_down(ch, CcPrim::DisconnectReq);
}

fn disconnect_signalling(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::Clear);
    l3::cc_down(ch, CcPrim::ReleaseReq);
}

fn disconnect_active(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::BcRel);
    release_b(ch);
}

fn disconnect_hanging_up(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::BcRel);
}

fn b_released_release(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    bhup(ch);
    newstate(ch, CcState::Clear);
    l3::cc_down(ch, CcPrim::ReleaseReq);
}

fn released(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::RelW);
    release_d(ch);
}

fn released_active(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::DiscBcHangup);
    release_b(ch);
}

fn b_released_d(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    bhup(ch);
    newstate(ch, CcState::RelW);
    release_d(ch);
}

fn dl_released(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    l3::cc_down(ch, CcPrim::Dlrl);
    dhup(ch);
}

fn dl_lost_active(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    l3::cc_down(ch, CcPrim::Dlrl);
    newstate(ch, CcState::DErr);
    release_b(ch);
}

// B release already under way.
fn dl_lost_releasing(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    l3::cc_down(ch, CcPrim::Dlrl);
    newstate(ch, CcState::DErr);
}

fn b_released_error(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    bhup(ch);
    dhup(ch);
}

fn late_dl_established(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    newstate(ch, CcState::Clear);
    l3::cc_down(ch, CcPrim::DisconnectReq);
}

fn charge(ch: &mut Channel, _: (), _ev: CcEvent, _arg: CcArg) {
    let units = ch.para.chargeinfo.to_string();
    ch.emit(StatusEvent::Cinf(units));
}

fn write(ch: &mut Channel, _: (), _ev: CcEvent, arg: CcArg) {
    if let CcArg::Data(buf) = arg {
        let bproto = ch.bproto;
        bproto.data_req(ch, buf);
    }
}

fn data_in(ch: &mut Channel, _: (), _ev: CcEvent, arg: CcArg) {
    if let CcArg::Data(buf) = arg {
        ch.rx.link(buf);
    }
}

fn locate(ch: &mut Channel, _: ()) -> &mut FsmInst<CcState> {
    &mut ch.fi
}

pub fn fsm() -> CcFsm {
    use CcEvent as E;
    use CcState as S;
    let signalling = [S::Out, S::OutProceed, S::In, S::InSetup];
    let bearer = [S::Active, S::OutEstb, S::InDact];
    let not_null = &S::ALL[1..];
    FsmBuilder::new("callc", locate)
        .on(&[S::Null], E::Dial, dial)
        .on(&[S::OutW], E::DlEst, out_dl_established)
        .on(&[S::Out], E::ProceedingInd, proceeding)
        .on(&[S::Out, S::OutProceed], E::AlertingInd, proceeding)
        .on(&[S::Out, S::OutProceed], E::SetupCnf, answered)
        .on(&[S::Null], E::SetupInd, setup_ind)
        .on(&[S::InW], E::DlEst, in_dl_established)
        .on(&[S::In], E::AcceptD, accept_d)
        .on(&[S::InSetup], E::SetupCmplInd, setup_complete)
        .on(&[S::OutEstb, S::InDact], E::BcEst, b_established)
        // Hangup by the consumer.
        .on(&[S::OutW], E::Hangup, hangup_waiting)
        .on(&signalling, E::Hangup, hangup_signalling)
        .on(&[S::InW], E::Hangup, hangup_incoming)
        .on(&bearer, E::Hangup, hangup_active)
        .on(&[S::BcHangup], E::BcRel, b_released_disconnect)
        .on(&bearer, E::BcRel, b_released_disconnect)
        // Disconnect by the peer.
        .on(&signalling, E::DisconnectInd, disconnect_signalling)
        .on(&bearer, E::DisconnectInd, disconnect_active)
        .on(&[S::BcHangup], E::DisconnectInd, disconnect_hanging_up)
        .on(&[S::BcRel], E::BcRel, b_released_release)
        // Release by the peer.
        .on(&signalling, E::ReleaseInd, released)
        .on(&[S::Clear], E::ReleaseInd, released)
        .on(&[S::Clear], E::ReleaseCnf, released)
        .on(&bearer, E::ReleaseInd, released_active)
        .on(&[S::BcRel, S::BcHangup], E::ReleaseInd, released_active)
        .on(&[S::DiscBcHangup], E::BcRel, b_released_d)
        // D link gone.
        .on(&[S::RelW], E::DlRl, dl_released)
        .on(&signalling, E::DlRl, dl_released)
        .on(&[S::Clear, S::OutW, S::InW, S::ProW], E::DlRl, dl_released)
        .on(&bearer, E::DlRl, dl_lost_active)
        .on(&[S::BcHangup, S::BcRel, S::DiscBcHangup], E::DlRl, dl_lost_releasing)
        .on(&[S::DErr], E::BcRel, b_released_error)
        .on(&[S::ProW], E::DlEst, late_dl_established)
        .on(not_null, E::Cinf, charge)
        .on(&[S::Active], E::WriteBuf, write)
        .on(&[S::Active], E::DataIn, data_in)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::*;
    use crate::channel::{PhReq, StackId};
    use crate::config::{BProto, Config};
    use crate::fsm::FsmEnum;
    use crate::l2::L2State;
    use crate::l3::testutil::{deliver, sent};
    use crate::l3::encode;

    const IS: StackId = StackId::Is;
    const DS: StackId = StackId::Ds;
    const PD: u8 = 0x08;

    fn cfg() -> Config {
        let mut cfg = config();
        cfg.d_l2.window = 7;
        cfg
    }

    fn dial(ch: &mut Channel, s: &str) -> Result<()> {
        let d = DialString::parse(s)?;
        assert!(event(ch, CcEvent::Dial, CcArg::Dial(d)).is_handled());
        Ok(())
    }

    // Layer 1 answers the activation, the link settles and the network
    // acknowledges the SABME.
    fn d_link_up(ch: &mut Channel) {
        ch.ph_activate(IS);
        let now = ch.now + 40;
        ch.run_timers(now);
        drain(ch, IS);
        let ua = buf(ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Connected);
    }

    fn b_link_up(ch: &mut Channel) {
        ch.ph_activate(DS);
        let now = ch.now + 40;
        ch.run_timers(now);
    }

    fn net(ch: &mut Channel, callref: u8, mt: u8, ies: &[u8]) {
        deliver(ch, &encode(PD, callref, true, mt, ies));
    }

    fn active_x75(ch: &mut Channel) -> Result<()> {
        dial(ch, "12345,,7,0")?;
        d_link_up(ch);
        sent(ch);
        net(ch, 64, crate::l3::ets::MT_CONNECT, &[]);
        b_link_up(ch);
        drain(ch, DS);
        // UA from the answering side.
        let ua = buf(ch, &[0x03, 0x73]);
        ch.ph_data(DS, ua);
        assert_eq!(ch.state(), CcState::Active);
        Ok(())
    }

    #[test]
    fn dial_strings() -> Result<()> {
        let d = DialString::parse("12345,,7,0")?;
        assert_eq!(d.called, "12345");
        assert_eq!(d.calling, "");
        assert_eq!((d.si1, d.si2), (7, 0));
        let d = DialString::parse("S0301234,5,1,1")?;
        assert_eq!(d.called, "S0301234");
        assert_eq!(d.calling, "5");
        assert!(DialString::parse("12345,,7").is_err());
        assert!(DialString::parse("12345,,777,0").is_err());
        assert!(DialString::parse(",,7,0").is_err());
        // Numbers must fit an information element.
        let long = "1".repeat(33);
        assert!(DialString::parse(&format!("{long},,7,0")).is_err());
        assert!(DialString::parse(&format!("1,{long},7,0")).is_err());
        assert!(DialString::parse(&format!("{},{},7,0", &long[1..], &long[1..])).is_ok());
        Ok(())
    }

    #[test]
    fn outgoing_call() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        assert_eq!(ch.l2_protocol, BProto::X75);
        dial(&mut ch, "12345,,7,0")?;
        assert_eq!(ch.state(), CcState::OutW);
        assert_eq!(ch.lc_state(LcSide::D), LcState::ActivateWait);

        d_link_up(&mut ch);
        assert_eq!(ch.state(), CcState::Out);
        assert_eq!(ch.l3_state(), 1);
        let msgs = sent(&mut ch);
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..4], &[PD, 1, 64, crate::l3::ets::MT_SETUP]);

        net(&mut ch, 64, crate::l3::ets::MT_CALL_PROCEEDING, &[]);
        assert_eq!(ch.state(), CcState::OutProceed);
        net(&mut ch, 64, crate::l3::ets::MT_ALERTING, &[]);
        assert_eq!(ch.state(), CcState::OutProceed);

        net(&mut ch, 64, crate::l3::ets::MT_CONNECT, &[]);
        assert_eq!(ch.state(), CcState::OutEstb);
        assert_eq!(ch.lc_state(LcSide::B), LcState::ActivateWait);
        assert!(statuses(&mut ch).is_empty());

        // X.75: the calling side sends SABM once layer 1 is up.
        b_link_up(&mut ch);
        assert_eq!(ch.l2_state(DS), L2State::AwaitingEstablish);
        assert_eq!(sent_frames(&mut ch, DS), vec![vec![0x03, 0x3f]]);
        let ua = buf(&ch, &[0x03, 0x73]);
        ch.ph_data(DS, ua);
        assert_eq!(ch.state(), CcState::Active);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Dconn, StatusEvent::Bconn]);
        assert!(ch.data_open);
        Ok(())
    }

    #[test]
    fn data_path() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        active_x75(&mut ch)?;
        drain(&mut ch, DS);
        let b = buf(&ch, b"hello");
        assert!(event(&mut ch, CcEvent::WriteBuf, CcArg::Data(b)).is_handled());
        ch.ph_pull_ack(DS);
        let frames = sent_frames(&mut ch, DS);
        assert!(frames.iter().any(|f| f.ends_with(b"hello")), "{frames:02x?}");

        // I frame from the peer, N(S)=0 N(R)=1.
        let b = buf(&ch, &[0x01, 0x20, b'h', b'i']);
        ch.ph_data(DS, b);
        assert_eq!(ch.read().as_deref(), Some(&b"hi"[..]));
        assert!(ch.read().is_none());

        // No data path outside a call.
        let mut idle = channel(0);
        let b = buf(&idle, b"x");
        assert!(!event(&mut idle, CcEvent::WriteBuf, CcArg::Data(b)).is_handled());
        Ok(())
    }

    #[test]
    fn hangup_from_active() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        active_x75(&mut ch)?;
        statuses(&mut ch);

        event(&mut ch, CcEvent::Hangup, CcArg::None);
        assert_eq!(ch.state(), CcState::BcHangup);
        assert_eq!(ch.l2_state(DS), L2State::AwaitingRelease);
        let ua = buf(&ch, &[0x03, 0x73]);
        ch.ph_data(DS, ua);
        assert_eq!(ch.state(), CcState::Clear);
        assert_eq!(ch.l3_state(), 11);
        assert_eq!(ch.lc_state(LcSide::B), LcState::Null);

        net(&mut ch, 64, crate::l3::ets::MT_RELEASE, &[]);
        assert_eq!(ch.state(), CcState::RelW);
        assert_eq!(ch.lc_state(LcSide::D), LcState::ReleaseWait);
        let ua = buf(&ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.state(), CcState::Null);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Bhup, StatusEvent::Dhup]);
        assert_eq!(ch.para, CallParams::default());
        Ok(())
    }

    #[test]
    fn peer_disconnects_active_call() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        active_x75(&mut ch)?;
        statuses(&mut ch);

        net(&mut ch, 64, crate::l3::ets::MT_DISCONNECT, &[]);
        assert_eq!(ch.state(), CcState::BcRel);
        let ua = buf(&ch, &[0x03, 0x73]);
        ch.ph_data(DS, ua);
        assert_eq!(ch.state(), CcState::Clear);
        assert_eq!(ch.l3_state(), 19);

        net(&mut ch, 64, crate::l3::ets::MT_RELEASE_COMPLETE, &[]);
        assert_eq!(ch.state(), CcState::RelW);
        let ua = buf(&ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(IS, ua);
        assert_eq!(ch.state(), CcState::Null);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Bhup, StatusEvent::Dhup]);
        Ok(())
    }

    #[test]
    fn d_link_lost_while_active() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        active_x75(&mut ch)?;
        statuses(&mut ch);
        // Network disconnects the data link.
        let disc = buf(&ch, &[0x02, 0x81, 0x53]);
        ch.ph_data(IS, disc);
        assert_eq!(ch.state(), CcState::DErr);
        assert_eq!(ch.l3_state(), 0);
        let ua = buf(&ch, &[0x03, 0x73]);
        ch.ph_data(DS, ua);
        assert_eq!(ch.state(), CcState::Null);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Bhup, StatusEvent::Dhup]);
        Ok(())
    }

    fn setup(bchannel: u8) -> Vec<u8> {
        let mut ies = crate::l3::ets::setup_ies(&CallParams {
            phone: "0301234".into(),
            eazmsn: "5".into(),
            si1: 7,
            ..CallParams::default()
        });
        // Exclusive channel instead of "any".
        let at = ies.iter().position(|&b| b == crate::ie::IE_CHANNEL_ID).unwrap();
        ies[at + 2] = 0x88 | bchannel;
        encode(PD, 3, false, crate::l3::ets::MT_SETUP, &ies)
    }

    #[test]
    fn incoming_call_for_other_channel() {
        let mut cfg = cfg();
        cfg.l2_protocol = BProto::Transparent;
        let mut ch = channel_with(0, cfg);
        ch.lc_d.fi.change_state(LcState::Connected);
        ch.is.l2.fi.change_state(L2State::MultiFrame);
        deliver(&mut ch, &setup(2));
        assert_eq!(ch.state(), CcState::RelW);
        assert_eq!(ch.l3_state(), 0);
        assert_eq!(ch.lc_state(LcSide::D), LcState::ReleaseWait);
        assert!(statuses(&mut ch).is_empty());
        // DISC goes out for the D link.
        let frames = sent_frames(&mut ch, IS);
        assert_eq!(frames.last().unwrap(), &vec![0x00, 0x81, 0x53]);
    }

    #[test]
    fn incoming_call() {
        let mut cfg = cfg();
        cfg.l2_protocol = BProto::Transparent;
        let mut ch = channel_with(0, cfg);
        ch.lc_d.fi.change_state(LcState::Connected);
        ch.is.l2.fi.change_state(L2State::MultiFrame);
        deliver(&mut ch, &setup(1));
        assert_eq!(ch.state(), CcState::In);
        assert_eq!(
            statuses(&mut ch),
            vec![StatusEvent::Icall("5,7,0,0301234".into())]
        );
        assert_eq!(sent(&mut ch), vec![vec![PD, 1, 0x83, crate::l3::ets::MT_ALERTING]]);

        assert!(event(&mut ch, CcEvent::AcceptD, CcArg::None).is_handled());
        assert_eq!(ch.state(), CcState::InSetup);
        assert_eq!(sent(&mut ch), vec![vec![PD, 1, 0x83, crate::l3::ets::MT_CONNECT]]);

        deliver(&mut ch, &encode(PD, 3, false, crate::l3::ets::MT_CONNECT_ACKNOWLEDGE, &[]));
        assert_eq!(ch.state(), CcState::InDact);
        assert_eq!(ch.bproto.name(), "transparent");
        assert!(matches!(
            drain(&mut ch, DS).as_slice(),
            [PhReq::Activate(crate::channel::L1Mode::Transparent)]
        ));
        b_link_up(&mut ch);
        assert_eq!(ch.state(), CcState::Active);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Dconn, StatusEvent::Bconn]);

        // Transparent writes count as sent at once.
        let b = buf(&ch, b"abc");
        event(&mut ch, CcEvent::WriteBuf, CcArg::Data(b));
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Bsent]);
        assert_eq!(sent_frames(&mut ch, DS), vec![b"abc".to_vec()]);
    }

    #[test]
    fn hangup_before_d_link() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        dial(&mut ch, "1,,7,0")?;
        event(&mut ch, CcEvent::Hangup, CcArg::None);
        // Layer 1 was still coming up: straight back to NULL.
        assert_eq!(ch.state(), CcState::Null);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Dhup]);
        Ok(())
    }

    #[test]
    fn hangup_while_ringing_out() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        dial(&mut ch, "1,,7,0")?;
        d_link_up(&mut ch);
        sent(&mut ch);
        event(&mut ch, CcEvent::Hangup, CcArg::None);
        assert_eq!(ch.state(), CcState::Clear);
        assert_eq!(ch.l3_state(), 11);
        let msgs = sent(&mut ch);
        assert_eq!(msgs[0][3], crate::l3::ets::MT_DISCONNECT);
        net(&mut ch, 64, crate::l3::ets::MT_RELEASE, &[]);
        assert_eq!(ch.state(), CcState::RelW);
        Ok(())
    }

    #[test]
    fn charge_info() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        assert!(!event(&mut ch, CcEvent::Cinf, CcArg::None).is_handled());
        dial(&mut ch, "1,,7,0")?;
        ch.para.chargeinfo = 7;
        event(&mut ch, CcEvent::Cinf, CcArg::None);
        assert_eq!(ch.state(), CcState::OutW);
        assert_eq!(statuses(&mut ch), vec![StatusEvent::Cinf("7".into())]);
        Ok(())
    }

    #[test]
    fn unrouted_events() {
        let mut ch = channel(0);
        for ev in [CcEvent::Suspend, CcEvent::Resume, CcEvent::AcceptB] {
            for &state in CcState::ALL {
                ch.fi.change_state(state);
                assert!(!event(&mut ch, ev, CcArg::None).is_handled(), "{}", state.name());
                assert_eq!(ch.state(), state);
            }
        }
        assert!(drain(&mut ch, IS).is_empty());
    }

    #[test]
    fn callrefs_stay_in_range() -> Result<()> {
        let mut ch = channel_with(0, cfg());
        ch.lc_d.fi.change_state(LcState::Connected);
        for i in 0..70u32 {
            dial(&mut ch, "1,,7,0")?;
            assert_eq!(ch.state(), CcState::Out);
            let cr = ch.para.callref;
            assert!((64..128).contains(&cr));
            assert_eq!(u32::from(cr), 64 + i % 64);
            ch.fi.change_state(CcState::Null);
            ch.l3.state = 0;
        }
        Ok(())
    }

    #[test]
    fn names_and_sizes() {
        assert_eq!(CcState::COUNT, 17);
        assert_eq!(CcEvent::COUNT, 21);
        assert_eq!(CcState::DErr.name(), "D_ERR");
    }
}
