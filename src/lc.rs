//! Link connection state machine.
//!
//! Call control does not talk to layers 1 and 2 directly. For each of the D
//! and B channels a link connection brings layer 1 up, waits for it to
//! settle, optionally establishes the data link on top, and reports a
//! single "established" or "released" back to call control.
use crate::callc::{self, CcArg, CcEvent};
use crate::channel::{Channel, L1Mode, LcSide, PhReq};
use crate::config::LcTimings;
use crate::fsm::{fsm_enum, Dispatch, Fsm, FsmBuilder, FsmInst};
use crate::l2::{self, L2Arg, L2Event, L2State};
use crate::timer::FsmTimer;
use log::debug;
use std::sync::Arc;

fsm_enum! {
    pub enum LcState {
        Null => "ST_LC_NULL",
        ActivateWait => "ST_LC_ACTIVATE_WAIT",
        Delay => "ST_LC_DELAY",
        EstablishWait => "ST_LC_ESTABLISH_WAIT",
        Connected => "ST_LC_CONNECTED",
        ReleaseWait => "ST_LC_RELEASE_WAIT",
    }
}

fsm_enum! {
    pub enum LcEvent {
        Establish => "EV_LC_ESTABLISH",
        PhActivate => "EV_LC_PH_ACTIVATE",
        PhDeactivate => "EV_LC_PH_DEACTIVATE",
        DlEstablish => "EV_LC_DL_ESTABLISH",
        Timer => "EV_LC_TIMER",
        DlRelease => "EV_LC_DL_RELEASE",
        Release => "EV_LC_RELEASE",
    }
}

pub type LcFsm = Fsm<Channel, LcSide, LcState, LcEvent, ()>;

pub struct LinkConn {
    pub fi: FsmInst<LcState>,
    pub timer: FsmTimer<LcEvent>,
    /// A data link has to be established on top of layer 1.
    pub l2_establish: bool,
    /// We send the establish request, rather than wait for the peer.
    pub l2_start: bool,
    timings: LcTimings,
}

impl LinkConn {
    #[must_use]
    pub fn new(name: String, timings: &LcTimings) -> Self {
        Self {
            fi: FsmInst::new(name, LcState::Null),
            timer: FsmTimer::new("lc"),
            l2_establish: false,
            l2_start: false,
            timings: timings.clone(),
        }
    }

    fn arm(&mut self, now: u64, delay: u64) {
        // Failure is logged by the timer.
        let _ = self.timer.arm(now, delay, LcEvent::Timer);
    }
}

/// Deliver an event to one of the channel's link connections.
pub fn event(ch: &mut Channel, side: LcSide, ev: LcEvent) -> Dispatch<()> {
    let defs = Arc::clone(&ch.defs);
    defs.lc.event(ch, side, ev, ())
}

fn up_establish(ch: &mut Channel, side: LcSide) {
    let ev = match side {
        LcSide::D => CcEvent::DlEst,
        LcSide::B => CcEvent::BcEst,
    };
    callc::event(ch, ev, CcArg::None);
}

fn up_release(ch: &mut Channel, side: LcSide) {
    let ev = match side {
        LcSide::D => CcEvent::DlRl,
        LcSide::B => CcEvent::BcRel,
    };
    callc::event(ch, ev, CcArg::None);
}

// Every way back to NULL goes through here.
fn to_null(ch: &mut Channel, side: LcSide) {
    let lc = ch.lc_mut(side);
    lc.timer.cancel();
    lc.fi.change_state(LcState::Null);
    ch.stack_mut(side.stack()).out.push_back(PhReq::Deactivate);
    up_release(ch, side);
}

fn to_connected(ch: &mut Channel, side: LcSide) {
    let lc = ch.lc_mut(side);
    lc.timer.cancel();
    lc.fi.change_state(LcState::Connected);
    up_establish(ch, side);
}

fn activate(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    let now = ch.now;
    let mode = match side {
        LcSide::D => L1Mode::DChannel,
        LcSide::B => ch.bproto.l1_mode(),
    };
    let lc = ch.lc_mut(side);
    lc.fi.change_state(LcState::ActivateWait);
    let guard = lc.timings.activate_guard;
    lc.arm(now, guard);
    ch.stack_mut(side.stack()).out.push_back(PhReq::Activate(mode));
}

fn activated(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    let now = ch.now;
    let lc = ch.lc_mut(side);
    lc.timer.cancel();
    lc.fi.change_state(LcState::Delay);
    let settle = lc.timings.settle;
    lc.arm(now, settle);
}

fn activate_timeout(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    debug!("{}: layer 1 did not come up", ch.lc_mut(side).fi.name());
    to_null(ch, side);
}

fn settled(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    let now = ch.now;
    // The peer may have brought the data link up already.
    let up = matches!(
        ch.l2_state(side.stack()),
        L2State::MultiFrame | L2State::TimerRecovery
    );
    let lc = ch.lc_mut(side);
    if !lc.l2_establish || up {
        to_connected(ch, side);
        return;
    }
    lc.fi.change_state(LcState::EstablishWait);
    let guard = lc.timings.establish_guard;
    lc.arm(now, guard);
    if lc.l2_start {
        l2::event(ch, side.stack(), L2Event::DlEstablish, L2Arg::None);
    }
}

fn dl_established(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    to_connected(ch, side);
}

fn dl_released(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    to_null(ch, side);
}

// Take the data link down and wait for it to confirm. A data link that
// can't be released is already down.
fn release_l2(ch: &mut Channel, side: LcSide) {
    let lc = ch.lc_mut(side);
    lc.timer.cancel();
    lc.fi.change_state(LcState::ReleaseWait);
    if !l2::event(ch, side.stack(), L2Event::DlRelease, L2Arg::None).is_handled() {
        to_null(ch, side);
    }
}

fn establish_timeout(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    debug!("{}: data link not established in time", ch.lc_mut(side).fi.name());
    release_l2(ch, side);
}

fn release_establishing(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    release_l2(ch, side);
}

fn release_activating(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    to_null(ch, side);
}

fn release(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    if ch.lc_mut(side).l2_establish {
        release_l2(ch, side);
    } else {
        to_null(ch, side);
    }
}

fn ph_deactivated(ch: &mut Channel, side: LcSide, _ev: LcEvent, _arg: ()) {
    // With a data link on top, its DL_RELEASE does the work.
    if !ch.lc_mut(side).l2_establish {
        to_null(ch, side);
    }
}

fn locate(ch: &mut Channel, side: LcSide) -> &mut FsmInst<LcState> {
    &mut ch.lc_mut(side).fi
}

pub fn fsm() -> LcFsm {
    use LcEvent as E;
    use LcState as S;
    FsmBuilder::new("lc", locate)
        .on(&[S::Null], E::Establish, activate)
        .on(&[S::ActivateWait], E::PhActivate, activated)
        .on(&[S::ActivateWait], E::Timer, activate_timeout)
        .on(&[S::ActivateWait, S::Delay], E::Release, release_activating)
        .on(&[S::Delay], E::PhDeactivate, release_activating)
        .on(&[S::Delay], E::Timer, settled)
        .on(&[S::EstablishWait], E::DlEstablish, dl_established)
        .on(&[S::EstablishWait], E::DlRelease, dl_released)
        .on(&[S::EstablishWait], E::Timer, establish_timeout)
        .on(&[S::EstablishWait], E::Release, release_establishing)
        .on(&[S::Connected], E::Release, release)
        .on(&[S::Connected], E::DlRelease, dl_released)
        .on(&[S::Connected], E::PhDeactivate, ph_deactivated)
        .on(&[S::ReleaseWait], E::DlRelease, dl_released)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::*;
    use crate::channel::StackId;

    fn activations(ch: &mut Channel, id: StackId) -> (usize, usize) {
        let reqs = drain(ch, id);
        let act = reqs.iter().filter(|r| matches!(r, PhReq::Activate(_))).count();
        let deact = reqs.iter().filter(|r| matches!(r, PhReq::Deactivate)).count();
        (act, deact)
    }

    #[test]
    fn transparent_b_connects_after_settle() {
        let mut ch = channel(0);
        ch.lc_b.l2_establish = false;
        event(&mut ch, LcSide::B, LcEvent::Establish);
        assert_eq!(ch.lc_state(LcSide::B), LcState::ActivateWait);
        assert_eq!(activations(&mut ch, StackId::Ds), (1, 0));
        assert_eq!(ch.lc_b.timer.deadline(), Some(1000));

        ch.now = 10;
        ch.ph_activate(StackId::Ds);
        assert_eq!(ch.lc_state(LcSide::B), LcState::Delay);
        assert_eq!(ch.lc_b.timer.deadline(), Some(50));
        ch.run_timers(50);
        assert_eq!(ch.lc_state(LcSide::B), LcState::Connected);
        assert!(!ch.lc_b.timer.is_armed());

        event(&mut ch, LcSide::B, LcEvent::Release);
        assert_eq!(ch.lc_state(LcSide::B), LcState::Null);
        assert_eq!(activations(&mut ch, StackId::Ds), (0, 1));
    }

    #[test]
    fn activation_guard() {
        let mut ch = channel(0);
        event(&mut ch, LcSide::D, LcEvent::Establish);
        ch.run_timers(999);
        assert_eq!(ch.lc_state(LcSide::D), LcState::ActivateWait);
        ch.run_timers(1000);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
        assert_eq!(activations(&mut ch, StackId::Is), (1, 1));
    }

    #[test]
    fn d_channel_establishes_data_link() {
        let mut ch = channel(0);
        event(&mut ch, LcSide::D, LcEvent::Establish);
        ch.ph_activate(StackId::Is);
        drain(&mut ch, StackId::Is);
        ch.run_timers(40);
        assert_eq!(ch.lc_state(LcSide::D), LcState::EstablishWait);
        assert_eq!(ch.l2_state(StackId::Is), L2State::AwaitingEstablish);
        // SABME, P=1, TEI 64, C/R=0.
        assert_eq!(sent_frames(&mut ch, StackId::Is), vec![vec![0x00, 0x81, 0x7f]]);

        // UA, F=1.
        let ua = buf(&ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(StackId::Is, ua);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Connected);
        assert!(!ch.lc_d.timer.is_armed());

        // Release goes through the data link: DISC, then wait for UA.
        event(&mut ch, LcSide::D, LcEvent::Release);
        assert_eq!(ch.lc_state(LcSide::D), LcState::ReleaseWait);
        let frames = sent_frames(&mut ch, StackId::Is);
        assert_eq!(frames.last().unwrap(), &vec![0x00, 0x81, 0x53]);
        let ua = buf(&ch, &[0x00, 0x81, 0x73]);
        ch.ph_data(StackId::Is, ua);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
        assert_eq!(activations(&mut ch, StackId::Is), (0, 1));
    }

    #[test]
    fn establish_guard_releases() {
        let mut ch = channel(0);
        // Wait for the peer instead of sending SABME.
        ch.lc_d.l2_start = false;
        event(&mut ch, LcSide::D, LcEvent::Establish);
        ch.ph_activate(StackId::Is);
        ch.run_timers(40);
        assert_eq!(ch.lc_state(LcSide::D), LcState::EstablishWait);
        assert_eq!(ch.l2_state(StackId::Is), L2State::TeiAssigned);
        ch.run_timers(5040);
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
    }

    #[test]
    fn no_routine_cases() {
        let mut ch = channel(0);
        assert_eq!(event(&mut ch, LcSide::D, LcEvent::Release), Dispatch::Unhandled(()));
        assert_eq!(event(&mut ch, LcSide::D, LcEvent::DlEstablish), Dispatch::Unhandled(()));
        assert_eq!(ch.lc_state(LcSide::D), LcState::Null);
        assert!(drain(&mut ch, StackId::Is).is_empty());
    }
}
