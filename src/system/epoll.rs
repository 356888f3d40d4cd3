use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;

use crate::{res, Result};

// -----------------------------------------------------------------------------
//     - Epoll abstraction -
//     * epoll_wait         [x]
//     * epoll_ctl          [x]
//     * epoll_create       [x]
//     * close              [x]
//     * flags              [x]
// -----------------------------------------------------------------------------

/// Readiness conditions a watch cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const ERROR: Interest = Interest(0b100);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }

    // EPOLLERR and EPOLLHUP are always reported by the kernel.
    fn to_u32(self) -> u32 {
        let mut events = 0;
        if self.is_readable() {
            events |= Flags::Read as u32 | Flags::RHup as u32;
        }
        if self.is_writable() {
            events |= Flags::Write as u32;
        }
        events
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// The readiness reported for one descriptor in one pass.
pub type Ready = Interest;

/// Translate raw epoll bits into a ready mask.
///
/// Readable and writable are filtered by interest. ERROR is always set on
/// EPOLLERR/EPOLLHUP since a level triggered watch would otherwise report the
/// condition forever without the handler ever seeing it.
pub(crate) fn ready_from(events: u32, interest: Interest) -> Ready {
    let mut ready = Interest::NONE;

    let hup = Flags::contains(events, Flags::Hup) || Flags::contains(events, Flags::RHup);

    if interest.is_readable() && (Flags::contains(events, Flags::Read) || hup) {
        ready = ready | Interest::READABLE;
    }
    if interest.is_writable() && Flags::contains(events, Flags::Write) {
        ready = ready | Interest::WRITABLE;
    }
    if Flags::contains(events, Flags::Error) || Flags::contains(events, Flags::Hup) {
        ready = ready | Interest::ERROR;
    }

    ready
}

// -----------------------------------------------------------------------------
//     - Create / Close -
// -----------------------------------------------------------------------------
pub(crate) fn create() -> Result<RawFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    Ok(res!(fd))
}

pub(crate) fn close(epoll_fd: RawFd) -> Result<()> {
    unsafe { res!(libc::close(epoll_fd)) };
    Ok(())
}

// -----------------------------------------------------------------------------
//     - Epoll control -
//     Watches are level triggered: a descriptor stays armed until it is
//     explicitly disarmed.
// -----------------------------------------------------------------------------
pub(crate) fn arm(epoll_fd: RawFd, fd: RawFd, interest: Interest, user_data: u64) -> Result<()> {
    epoll_control(epoll_fd, fd, interest.to_u32(), user_data, libc::EPOLL_CTL_ADD)
}

pub(crate) fn rearm(epoll_fd: RawFd, fd: RawFd, interest: Interest, user_data: u64) -> Result<()> {
    epoll_control(epoll_fd, fd, interest.to_u32(), user_data, libc::EPOLL_CTL_MOD)
}

pub(crate) fn disarm(epoll_fd: RawFd, fd: RawFd) -> Result<()> {
    // Pre 2.6.9 kernels want a non-null event even for DEL.
    let mut event = libc::epoll_event { events: 0, u64: 0 };
    let status = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) };
    let _ = res!(status);
    Ok(())
}

fn epoll_control(epoll_fd: RawFd, fd: RawFd, events: u32, user_data: u64, op: i32) -> Result<()> {
    let mut event = libc::epoll_event {
        events,
        u64: user_data,
    };

    let status = unsafe { libc::epoll_ctl(epoll_fd, op, fd, &mut event as *mut libc::epoll_event) };
    let _ = res!(status);
    Ok(())
}

// -----------------------------------------------------------------------------
//     - Epoll wait -
//     EINTR is retried here, every other failure goes back to the caller.
// -----------------------------------------------------------------------------
pub(crate) fn wait(epoll_fd: RawFd, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let result = unsafe {
            libc::epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };

        match result {
            -1 => {
                let err = crate::os_err();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            n => return Ok(n as usize),
        }
    }
}

// -----------------------------------------------------------------------------
//     - Flags -
// -----------------------------------------------------------------------------
#[repr(u32)]
pub(crate) enum Flags {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
    Error = libc::EPOLLERR as u32,
    Hup = libc::EPOLLHUP as u32,
    RHup = libc::EPOLLRDHUP as u32,
}

impl Flags {
    pub(crate) fn contains(val: u32, flag: Flags) -> bool {
        let flag = flag as u32;
        0 != (val & flag)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interest_bits() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_error());
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::NONE.contains(Interest::NONE));
    }

    #[test]
    fn ready_is_filtered_by_interest() {
        let events = libc::EPOLLIN as u32 | libc::EPOLLOUT as u32;
        let ready = ready_from(events, Interest::READABLE);
        assert!(ready.is_readable());
        assert!(!ready.is_writable());

        let hup = libc::EPOLLHUP as u32;
        let ready = ready_from(hup, Interest::READABLE);
        assert!(ready.is_readable());
        assert!(ready.is_error());

        let ready = ready_from(libc::EPOLLERR as u32, Interest::WRITABLE);
        assert!(!ready.is_writable());
        assert!(ready.is_error());
    }
}
