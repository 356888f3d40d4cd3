//! Bounded-retry transfers on (usually non-blocking) descriptors.
//!
//! EINTR is always retried. The two "temporarily unavailable" conditions,
//! EAGAIN and EWOULDBLOCK, are retried at most `TRANSFER_RETRIES` times;
//! after that the transfer reports what it moved and stops. Any other error
//! ends the transfer for good.
use std::io;
use std::os::unix::io::RawFd;

/// How many times a transient condition is retried before giving up.
pub const TRANSFER_RETRIES: usize = 5;

#[derive(Debug)]
pub enum Status {
    /// The whole buffer moved.
    Complete,
    /// The descriptor ran dry (read) or full (write); wait for readiness.
    Drained,
    /// End of input, or the reading end went away.
    Closed,
    /// Fatal error, never retried.
    Failed(io::Error),
}

/// The actual number of bytes moved and why the transfer stopped.
#[derive(Debug)]
pub struct Transfer {
    pub moved: usize,
    pub status: Status,
}

impl Transfer {
    /// Short of the requested length.
    pub fn is_short(&self) -> bool {
        !matches!(self.status, Status::Complete)
    }

    /// Nothing more will ever move in this direction.
    pub fn is_final(&self) -> bool {
        matches!(self.status, Status::Closed | Status::Failed(_))
    }
}

fn is_transient(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => code == libc::EAGAIN || code == libc::EWOULDBLOCK,
        None => false,
    }
}

/// Fill `buf` from `fd`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Transfer {
    let mut moved = 0;
    let mut retries = 0;

    while moved < buf.len() {
        let rest = &mut buf[moved..];
        let res = unsafe { libc::read(fd, rest.as_mut_ptr() as *mut libc::c_void, rest.len()) };

        match res {
            0 => return Transfer { moved, status: Status::Closed },
            n if n > 0 => moved += n as usize,
            _ => {
                let err = crate::os_err();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if is_transient(&err) {
                    retries += 1;
                    if retries >= TRANSFER_RETRIES {
                        return Transfer { moved, status: Status::Drained };
                    }
                    continue;
                }
                return Transfer { moved, status: Status::Failed(err) };
            }
        }
    }

    Transfer { moved, status: Status::Complete }
}

/// Write as much of `buf` to `fd` as it will take.
pub fn write(fd: RawFd, buf: &[u8]) -> Transfer {
    let mut moved = 0;
    let mut retries = 0;

    while moved < buf.len() {
        let rest = &buf[moved..];
        let res = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };

        match res {
            n if n > 0 => moved += n as usize,
            0 => return Transfer { moved, status: Status::Closed },
            _ => {
                let err = crate::os_err();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if err.raw_os_error() == Some(libc::EPIPE) {
                    return Transfer { moved, status: Status::Closed };
                }
                if is_transient(&err) {
                    retries += 1;
                    if retries >= TRANSFER_RETRIES {
                        return Transfer { moved, status: Status::Drained };
                    }
                    continue;
                }
                return Transfer { moved, status: Status::Failed(err) };
            }
        }
    }

    Transfer { moved, status: Status::Complete }
}
