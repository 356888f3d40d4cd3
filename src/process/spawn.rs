use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use log::{debug, warn};

use super::command::{Command, Stdio, Stream};
use super::transfer::{self, Status};
use super::Classification;
use crate::{Error, Interest, Result};

// -----------------------------------------------------------------------------
//     - Pipes -
//     Parent ends of the child's piped stdio. All non-blocking, closed on
//     drop.
// -----------------------------------------------------------------------------
pub(crate) struct Pipes {
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
    input: Vec<u8>,
    written: usize,
    chunk: usize,
}

impl Pipes {
    pub(crate) fn fd(&self, stream: Stream) -> Option<RawFd> {
        match stream {
            Stream::Stdin => self.stdin,
            Stream::Stdout => self.stdout,
            Stream::Stderr => self.stderr,
        }
    }

    /// Open parent ends, each with the readiness it waits for.
    pub(crate) fn open(&self) -> Vec<(Stream, RawFd, Interest)> {
        let mut open = Vec::with_capacity(3);
        if let Some(fd) = self.stdin {
            open.push((Stream::Stdin, fd, Interest::WRITABLE));
        }
        if let Some(fd) = self.stdout {
            open.push((Stream::Stdout, fd, Interest::READABLE));
        }
        if let Some(fd) = self.stderr {
            open.push((Stream::Stderr, fd, Interest::READABLE));
        }
        open
    }

    pub(crate) fn close(&mut self, stream: Stream) {
        let slot = match stream {
            Stream::Stdin => &mut self.stdin,
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };

        if let Some(fd) = slot.take() {
            unsafe { libc::close(fd) };
        }
    }

    /// Read whatever `stream` has, handing each chunk to `sink`.
    ///
    /// Returns `false` once the stream is finished; the caller closes it.
    pub(crate) fn pump_read(&mut self, stream: Stream, sink: &mut dyn FnMut(Stream, &[u8])) -> bool {
        let fd = match self.fd(stream) {
            Some(fd) => fd,
            None => return false,
        };

        let mut buf = vec![0u8; self.chunk];
        loop {
            let t = transfer::read(fd, &mut buf);
            if t.moved > 0 {
                sink(stream, &buf[..t.moved]);
            }

            match t.status {
                Status::Complete => continue,
                Status::Drained => return true,
                Status::Closed => return false,
                Status::Failed(e) => {
                    warn!("reading child {:?} failed: {}", stream, e);
                    return false;
                }
            }
        }
    }

    /// Feed pending input to stdin.
    ///
    /// Returns `false` once there is nothing more to write; the caller closes
    /// stdin so the child sees end of input.
    pub(crate) fn pump_write(&mut self) -> bool {
        let fd = match self.stdin {
            Some(fd) => fd,
            None => return false,
        };

        if self.written >= self.input.len() {
            return false;
        }

        let t = transfer::write(fd, &self.input[self.written..]);
        self.written += t.moved;

        match t.status {
            Status::Complete => false,
            Status::Drained => true,
            Status::Closed => false,
            Status::Failed(e) => {
                warn!("writing child stdin failed: {}", e);
                false
            }
        }
    }

    /// Read what is left in stdout and stderr without waiting for more.
    pub(crate) fn drain(&mut self, sink: &mut dyn FnMut(Stream, &[u8])) {
        for stream in &[Stream::Stdout, Stream::Stderr] {
            if self.fd(*stream).is_some() {
                self.pump_read(*stream, sink);
            }
        }
    }
}

impl Drop for Pipes {
    fn drop(&mut self) {
        self.close(Stream::Stdin);
        self.close(Stream::Stdout);
        self.close(Stream::Stderr);
    }
}

// -----------------------------------------------------------------------------
//     - Spawn -
// -----------------------------------------------------------------------------
pub(crate) struct Spawned {
    pub(crate) pid: libc::pid_t,
    pub(crate) pipes: Pipes,
}

/// Descriptors created for the child; whatever is left is closed on drop.
#[derive(Default)]
struct Plumbing {
    close_on_drop: Vec<RawFd>,
}

impl Plumbing {
    fn pipe(&mut self) -> Result<(RawFd, RawFd)> {
        let mut fds = [0; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if res == -1 {
            return Err(Error::Spawn(crate::os_err()));
        }
        self.close_on_drop.extend_from_slice(&fds);
        Ok((fds[0], fds[1]))
    }

    fn dev_null(&mut self) -> Result<RawFd> {
        let path = b"/dev/null\0";
        let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDWR | libc::O_CLOEXEC) };
        if fd == -1 {
            return Err(Error::Spawn(crate::os_err()));
        }
        self.close_on_drop.push(fd);
        Ok(fd)
    }

    /// Keep `fd` open past drop; it now belongs to the caller.
    fn release(&mut self, fd: RawFd) -> RawFd {
        self.close_on_drop.retain(|f| *f != fd);
        fd
    }
}

impl Drop for Plumbing {
    fn drop(&mut self) {
        for fd in self.close_on_drop.drain(..) {
            unsafe { libc::close(fd) };
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Spawn(crate::os_err()));
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::Spawn(crate::os_err()));
    }

    Ok(())
}

/// Fork and exec `cmd`.
///
/// Everything the child needs (argv, envp, descriptors) is prepared before
/// the fork; the child itself only calls async-signal-safe functions. A
/// failing exec shows up as the child exiting with status 127.
pub(crate) fn spawn(cmd: &Command, chunk: usize) -> Result<Spawned> {
    cmd.validate()?;

    let argv = cmd.argv()?;
    let envp = cmd.envp()?;

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
    envp_ptrs.push(ptr::null());

    let mut plumbing = Plumbing::default();
    let mut null = None;
    let mut null_fd = |plumbing: &mut Plumbing| -> Result<RawFd> {
        match null {
            Some(fd) => Ok(fd),
            None => {
                let fd = plumbing.dev_null()?;
                null = Some(fd);
                Ok(fd)
            }
        }
    };

    // (child source fd, parent end) per stream; -1 means leave it alone.
    let mut child_fds = [-1; 3];
    let mut parent_fds = [None; 3];

    let plan = [cmd.stdin, cmd.stdout, cmd.stderr];
    for (target, stdio) in plan.iter().enumerate() {
        match stdio {
            Stdio::Inherit | Stdio::JoinStdout => {}
            Stdio::Null => child_fds[target] = null_fd(&mut plumbing)?,
            Stdio::Fd(fd) => child_fds[target] = *fd,
            Stdio::Piped => {
                let (rx, tx) = plumbing.pipe()?;
                let (child, parent) = if target == 0 { (rx, tx) } else { (tx, rx) };
                child_fds[target] = child;
                parent_fds[target] = Some(parent);
            }
        }
    }
    let join_stderr = cmd.stderr == Stdio::JoinStdout;

    for parent in parent_fds.iter().flatten() {
        set_nonblocking(*parent)?;
    }

    let pid = unsafe { libc::fork() };

    if pid == -1 {
        return Err(Error::Spawn(crate::os_err()));
    }

    if pid == 0 {
        // Child. No allocation, no locks, no returning.
        unsafe {
            for (target, src) in child_fds.iter().enumerate() {
                if *src >= 0 && libc::dup2(*src, target as libc::c_int) == -1 {
                    libc::_exit(127);
                }
            }

            if join_stderr && libc::dup2(1, 2) == -1 {
                libc::_exit(127);
            }

            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigprocmask(libc::SIG_SETMASK, &set, ptr::null_mut());
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);

            libc::execvpe(argv_ptrs[0], argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
            libc::_exit(127);
        }
    }

    // Parent: keep our pipe ends, everything else goes with `plumbing`.
    let mut keep = [None; 3];
    for (i, parent) in parent_fds.iter().enumerate() {
        keep[i] = parent.map(|fd| plumbing.release(fd));
    }
    drop(plumbing);

    debug!("spawned {:?} as pid {}", cmd.get_program(), pid);

    let pipes = Pipes {
        stdin: keep[0],
        stdout: keep[1],
        stderr: keep[2],
        input: cmd.input.clone().unwrap_or_default(),
        written: 0,
        chunk: chunk.max(1),
    };

    Ok(Spawned { pid, pipes })
}

// -----------------------------------------------------------------------------
//     - Kill / Reap -
// -----------------------------------------------------------------------------
/// SIGKILL the child. A child that already exited but is not yet reaped
/// answers with ESRCH, which is fine.
pub(crate) fn kill_quietly(pid: libc::pid_t) {
    let res = unsafe { libc::kill(pid, libc::SIGKILL) };
    if res == -1 {
        let err = crate::os_err();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to kill {}: {}", pid, err);
        }
    }
}

/// waitpid on exactly `pid`. `Ok(None)` means still running (only when not
/// blocking).
pub(crate) fn reap(pid: libc::pid_t, block: bool) -> io::Result<Option<libc::c_int>> {
    let flags = if block { 0 } else { libc::WNOHANG };
    let mut status = 0;

    loop {
        let res = unsafe { libc::waitpid(pid, &mut status, flags) };
        match res {
            -1 => {
                let err = crate::os_err();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            0 => return Ok(None),
            _ => {
                debug!("reaped pid {}", pid);
                return Ok(Some(status));
            }
        }
    }
}

/// Kill and wait. Used on every path that gives up on a child.
pub(crate) fn kill_and_reap(pid: libc::pid_t) -> io::Result<libc::c_int> {
    kill_quietly(pid);
    match reap(pid, true)? {
        Some(status) => Ok(status),
        None => Err(io::Error::new(io::ErrorKind::Other, "blocking waitpid returned no child")),
    }
}

pub(crate) fn classify(status: libc::c_int, killed_on_deadline: bool) -> Classification {
    if libc::WIFEXITED(status) {
        return Classification::Exited(libc::WEXITSTATUS(status));
    }

    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        if killed_on_deadline && signal == libc::SIGKILL {
            return Classification::TimedOutAndKilled;
        }
        return Classification::KilledBySignal(signal);
    }

    Classification::SupervisorError(format!("unexpected wait status {:#x}", status))
}
