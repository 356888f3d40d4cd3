use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::eventfd;

use crate::{res, Result};

/// An eventfd used to knock a blocked `epoll_wait` loose.
///
/// `poke` is safe from any thread; `consume` is called by the reactor once
/// the descriptor reports readable.
#[derive(Debug)]
pub struct Evented {
    fd: RawFd,
}

impl Evented {
    pub fn new() -> Result<Self> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = res!(unsafe { eventfd(0, flags) });
        Ok(Self { fd })
    }

    /// Bump the counter. A full counter (EAGAIN) already guarantees a
    /// pending wake, so it is not an error.
    pub fn poke(&self) -> io::Result<()> {
        let val = 1u64;
        loop {
            let res = unsafe { libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8) };
            if res == 8 {
                return Ok(());
            }

            let err = crate::os_err();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    /// Reset the counter, returning how many pokes were folded together.
    pub fn consume(&self) -> u64 {
        let mut val = 0u64;
        let res = unsafe { libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
        match res {
            8 => val,
            _ => 0,
        }
    }
}

// -----------------------------------------------------------------------------
//     - AsRawFd -
// -----------------------------------------------------------------------------
impl AsRawFd for Evented {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

// -----------------------------------------------------------------------------
//     - Drop -
// -----------------------------------------------------------------------------
impl Drop for Evented {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pokes_fold_together() {
        let evented = Evented::new().unwrap();
        assert_eq!(evented.consume(), 0);
        evented.poke().unwrap();
        evented.poke().unwrap();
        assert_eq!(evented.consume(), 2);
        assert_eq!(evented.consume(), 0);
    }
}
