//! Single-shot timers bound to a state machine.
//!
//! Time is a millisecond counter owned by the driver. A timer does not
//! call anything on its own: the owner polls [`FsmTimer::expire`] and feeds
//! the returned event into its state machine.
use anyhow::{Error, Result};
use log::warn;

#[derive(Debug)]
pub struct FsmTimer<E> {
    name: &'static str,
    deadline: Option<u64>,
    event: Option<E>,
}

impl<E: Copy + std::fmt::Debug> FsmTimer<E> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            deadline: None,
            event: None,
        }
    }

    /// Arm the timer to deliver `event` `delay` ms after `now`.
    ///
    /// Arming an armed timer is an error and leaves the running timer alone.
    pub fn arm(&mut self, now: u64, delay: u64, event: E) -> Result<()> {
        if let Some(deadline) = self.deadline {
            warn!(
                "{}: arm {event:?} while already armed for {:?} at {deadline}",
                self.name, self.event
            );
            return Err(Error::msg(format!("timer {} already armed", self.name)));
        }
        self.deadline = Some(now + delay);
        self.event = Some(event);
        Ok(())
    }

    /// Cancel and arm again. Never fails.
    pub fn restart(&mut self, now: u64, delay: u64, event: E) {
        self.cancel();
        self.deadline = Some(now + delay);
        self.event = Some(event);
    }

    /// Disarm. Cancelling an idle timer is fine.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.event = None;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// If the timer is due at `now`, disarm it and return its event.
    ///
    /// A cancelled timer never returns anything, no matter how late this
    /// is called.
    pub fn expire(&mut self, now: u64) -> Option<E> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.event.take()
            }
            _ => None,
        }
    }
}
