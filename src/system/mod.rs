use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{error, trace};

use crate::Result;

mod epoll;
pub(crate) mod evented;
pub(crate) mod identities;

pub use epoll::{Interest, Ready};
pub(crate) use epoll::ready_from;
pub use identities::Token;
use evented::Evented;

/// Reserved epoll user data for the wake channel. `Identities` never hands
/// out a token that packs to this value.
const WAKE_TOKEN: u64 = u64::MAX;

/// One raw readiness report: the registered user data and the epoll bits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    pub(crate) data: u64,
    pub(crate) events: u32,
}

// -----------------------------------------------------------------------------
//     - Poller -
// -----------------------------------------------------------------------------
/// An epoll instance plus the eventfd that wakes it.
///
/// Each reactor owns exactly one poller; nothing here is global, so several
/// reactors can live on separate threads.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    waker: Arc<Evented>,
}

impl Poller {
    pub(crate) fn new(event_cap: usize) -> Result<Self> {
        let epoll_fd = epoll::create()?;

        let waker = match Evented::new() {
            Ok(w) => w,
            Err(e) => {
                let _ = epoll::close(epoll_fd);
                return Err(e);
            }
        };

        if let Err(e) = epoll::arm(epoll_fd, waker.as_raw_fd(), Interest::READABLE, WAKE_TOKEN) {
            let _ = epoll::close(epoll_fd);
            return Err(e);
        }

        let event_cap = event_cap.max(1);
        let events = (0..event_cap).map(|_| libc::epoll_event { events: 0, u64: 0 }).collect();

        let inst = Self {
            epoll_fd,
            events,
            waker: Arc::new(waker),
        };

        Ok(inst)
    }

    /// The wake channel, shareable with other threads.
    pub(crate) fn waker(&self) -> Arc<Evented> {
        Arc::clone(&self.waker)
    }

    pub(crate) fn arm(&self, fd: RawFd, interest: Interest, token: Token) -> Result<()> {
        epoll::arm(self.epoll_fd, fd, interest, token.to_u64())
    }

    pub(crate) fn rearm(&self, fd: RawFd, interest: Interest, token: Token) -> Result<()> {
        epoll::rearm(self.epoll_fd, fd, interest, token.to_u64())
    }

    pub(crate) fn disarm(&self, fd: RawFd) -> Result<()> {
        epoll::disarm(self.epoll_fd, fd)
    }

    /// Block until something is ready, the wake channel fires or `timeout`
    /// passes. `None` blocks indefinitely.
    ///
    /// Returns whether the wake channel fired.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<RawEvent>) -> io::Result<bool> {
        out.clear();

        let timeout_ms = match timeout {
            None => -1,
            Some(t) => {
                // Round up so a pending deadline is never undershot.
                let mut ms = t.as_millis();
                if Duration::from_millis(ms as u64) < t {
                    ms += 1;
                }
                ms.min(i32::MAX as u128) as i32
            }
        };

        let count = epoll::wait(self.epoll_fd, &mut self.events, timeout_ms)?;
        trace!("epoll returned {} events (timeout {}ms)", count, timeout_ms);

        let mut woken = false;
        for ev in &self.events[..count] {
            // epoll_event is packed on x86_64, copy the fields out.
            let (data, events) = (ev.u64, ev.events);

            if data == WAKE_TOKEN {
                self.waker.consume();
                woken = true;
                continue;
            }

            out.push(RawEvent { data, events });
        }

        Ok(woken)
    }
}

// -----------------------------------------------------------------------------
//     - Drop -
// -----------------------------------------------------------------------------
impl Drop for Poller {
    fn drop(&mut self) {
        if let Err(e) = epoll::close(self.epoll_fd) {
            error!("failed to close epoll descriptor: {}", e);
        }
    }
}
