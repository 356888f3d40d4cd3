use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::user::UserEvent;
use super::Reactor;
use crate::{Interest, Ready, Token};

// -----------------------------------------------------------------------------
//     - Reaction -
// -----------------------------------------------------------------------------
/// What a handler wants done with its registration after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Keep the registration. A timer is rearmed according to its recurrence.
    Continue,
    /// Timers only: fire again after the given delay. Fd and user event
    /// handlers treat this as `Continue`.
    Reschedule(Duration),
    /// Deregister; the handle becomes dead.
    Stop,
}

/// How a timer computes its next deadline after a `Continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// Fires once; `Continue` is treated as `Stop`.
    Once,
    /// Fires every period, measured from the previous deadline.
    Every(Duration),
    /// The handler decides via `Reaction::Reschedule`; `Continue` reuses the
    /// last delay.
    Controlled,
}

/// Lifecycle of a handle. A `Callback` that has not been activated yet is
/// the unregistered phase; it has no token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Registered,
    Dead,
}

pub type TimerHandler = Box<dyn FnMut(&mut Reactor, Token) -> Reaction>;
pub type FdHandler = Box<dyn FnMut(&mut Reactor, Token, Ready) -> Reaction>;
pub type UserHandler = Box<dyn FnMut(&mut Reactor, Token, UserEvent) -> Reaction>;

// -----------------------------------------------------------------------------
//     - Callback -
//     The handler sits in an `Option` so the reactor can lend itself to the
//     handler while it runs. A handler that kills its own token is simply
//     not put back.
// -----------------------------------------------------------------------------
pub struct Timer {
    pub(crate) delay: Duration,
    pub(crate) recurrence: Recurrence,
    pub(crate) seq: u64,
    pub(crate) handler: Option<TimerHandler>,
}

pub struct FdWatch {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) handler: Option<FdHandler>,
}

pub struct UserWatch {
    pub(crate) tag: u64,
    pub(crate) handler: Option<UserHandler>,
}

/// An unregistered callback. Hand it to `Reactor::activate` to register it.
pub enum Callback {
    Timer(Timer),
    FdEvent(FdWatch),
    UserEvent(UserWatch),
}

impl Callback {
    pub fn timer<F>(delay: Duration, recurrence: Recurrence, handler: F) -> Self
    where
        F: FnMut(&mut Reactor, Token) -> Reaction + 'static,
    {
        Callback::Timer(Timer {
            delay,
            recurrence,
            seq: 0,
            handler: Some(Box::new(handler)),
        })
    }

    pub fn fd<F>(fd: RawFd, interest: Interest, handler: F) -> Self
    where
        F: FnMut(&mut Reactor, Token, Ready) -> Reaction + 'static,
    {
        Callback::FdEvent(FdWatch {
            fd,
            interest,
            handler: Some(Box::new(handler)),
        })
    }

    pub fn user_event<F>(tag: u64, handler: F) -> Self
    where
        F: FnMut(&mut Reactor, Token, UserEvent) -> Reaction + 'static,
    {
        Callback::UserEvent(UserWatch {
            tag,
            handler: Some(Box::new(handler)),
        })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Callback::Timer(_) => "timer",
            Callback::FdEvent(_) => "fd",
            Callback::UserEvent(_) => "user",
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Callback::Timer(t) => write!(f, "<Timer {:?} {:?}>", t.delay, t.recurrence),
            Callback::FdEvent(w) => write!(f, "<FdEvent {} {:?}>", w.fd, w.interest),
            Callback::UserEvent(w) => write!(f, "<UserEvent {}>", w.tag),
        }
    }
}

impl Timer {
    /// Work out the next deadline after a dispatch, `None` means the timer
    /// is done. Updates the stored delay for `Reschedule`.
    pub(crate) fn next_deadline(
        &mut self,
        reaction: Reaction,
        previous: std::time::Instant,
        now: std::time::Instant,
    ) -> Option<std::time::Instant> {
        match (reaction, self.recurrence) {
            (Reaction::Stop, _) => None,
            (Reaction::Reschedule(delay), Recurrence::Every(_)) => {
                self.delay = delay;
                self.recurrence = Recurrence::Every(delay);
                Some(now + delay)
            }
            (Reaction::Reschedule(delay), _) => {
                self.delay = delay;
                Some(now + delay)
            }
            (Reaction::Continue, Recurrence::Once) => None,
            (Reaction::Continue, Recurrence::Every(period)) => {
                // Skip missed periods rather than firing a burst.
                let next = previous + period;
                if next > now {
                    Some(next)
                } else {
                    Some(now + period)
                }
            }
            (Reaction::Continue, Recurrence::Controlled) => Some(now + self.delay),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    fn timer(delay: Duration, recurrence: Recurrence) -> Timer {
        Timer {
            delay,
            recurrence,
            seq: 0,
            handler: None,
        }
    }

    #[test]
    fn once_dies_on_continue() {
        let now = Instant::now();
        let mut t = timer(Duration::from_millis(5), Recurrence::Once);
        assert_eq!(t.next_deadline(Reaction::Continue, now, now), None);

        let ms = Duration::from_millis(7);
        assert_eq!(t.next_deadline(Reaction::Reschedule(ms), now, now), Some(now + ms));
    }

    #[test]
    fn periodic_is_measured_from_the_previous_deadline() {
        let period = Duration::from_millis(100);
        let previous = Instant::now();
        let now = previous + Duration::from_millis(3);
        let mut t = timer(period, Recurrence::Every(period));
        assert_eq!(t.next_deadline(Reaction::Continue, previous, now), Some(previous + period));

        // Far behind: no burst
        let late = previous + Duration::from_millis(450);
        assert_eq!(t.next_deadline(Reaction::Continue, previous, late), Some(late + period));
    }

    #[test]
    fn controlled_keeps_the_last_delay() {
        let now = Instant::now();
        let mut t = timer(Duration::from_millis(10), Recurrence::Controlled);
        let twenty = Duration::from_millis(20);
        assert_eq!(t.next_deadline(Reaction::Reschedule(twenty), now, now), Some(now + twenty));
        assert_eq!(t.next_deadline(Reaction::Continue, now, now), Some(now + twenty));
        assert_eq!(t.next_deadline(Reaction::Stop, now, now), None);
    }
}
