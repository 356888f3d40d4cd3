use std::io;
use std::time::{Duration, Instant};

use log::{debug, error};

use super::command::Stream;
use super::spawn::{classify, kill_and_reap, reap, Pipes, Spawned};
use super::{Classification, SupervisorConfig};

/// Supervise an already spawned child until it is reaped.
///
/// The deadline check is folded into the loop: every iteration does a
/// non-blocking wait, then kills the child if it is overdue, then waits for
/// pipe readiness for at most one reap interval.
pub(super) fn supervise(
    spawned: Spawned,
    deadline: Option<Duration>,
    config: &SupervisorConfig,
    on_output: &mut dyn FnMut(Stream, &[u8]),
) -> Classification {
    let Spawned { pid, mut pipes } = spawned;
    let deadline = deadline.map(|d| Instant::now() + d);
    let mut timed_out = false;

    let outcome = loop {
        match reap(pid, false) {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            // Nothing left to kill or reap.
            Err(e) => break Err(e),
        }

        let now = Instant::now();
        let mut wait = config.reap_interval;

        if let Some(deadline) = deadline {
            if now >= deadline {
                debug!("pid {} outlived its deadline", pid);
                timed_out = true;
                break kill_and_reap(pid);
            }
            wait = wait.min(deadline - now);
        }

        if let Err(e) = poll_pipes(&mut pipes, wait, on_output) {
            // Still ours to reap; the wait error is what gets reported.
            let _ = kill_and_reap(pid);
            break Err(e);
        }
    };

    match outcome {
        Ok(status) => {
            pipes.drain(on_output);
            classify(status, timed_out)
        }
        Err(e) => {
            error!("supervising pid {} failed: {}", pid, e);
            Classification::SupervisorError(e.to_string())
        }
    }
}

fn poll_pipes(pipes: &mut Pipes, wait: Duration, on_output: &mut dyn FnMut(Stream, &[u8])) -> io::Result<()> {
    let open = pipes.open();

    let mut pollfds: Vec<libc::pollfd> = open
        .iter()
        .map(|(_, fd, interest)| libc::pollfd {
            fd: *fd,
            events: if interest.is_writable() { libc::POLLOUT } else { libc::POLLIN },
            revents: 0,
        })
        .collect();

    // Round up so a sub-millisecond wait doesn't become a busy loop.
    let timeout = wait.as_millis() + u128::from(wait.subsec_nanos() % 1_000_000 != 0);
    let timeout = timeout.min(i32::MAX as u128) as libc::c_int;

    loop {
        let res = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
        if res == -1 {
            let err = crate::os_err();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break;
    }

    for ((stream, _, _), pollfd) in open.iter().zip(&pollfds) {
        if pollfd.revents == 0 {
            continue;
        }

        let still_open = match stream {
            Stream::Stdin => pipes.pump_write(),
            _ => pipes.pump_read(*stream, on_output),
        };

        if !still_open {
            pipes.close(*stream);
        }
    }

    Ok(())
}
