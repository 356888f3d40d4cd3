use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, warn};

use super::command::Stream;
use super::spawn::{classify, kill_and_reap, kill_quietly, reap, Pipes, Spawned};
use super::{Classification, ProcessState, SupervisorConfig};
use crate::reactor::{Reaction, Reactor, Recurrence};
use crate::{Result, Token};

type OutputHandler = Box<dyn FnMut(Stream, &[u8])>;
type CompletionHandler = Box<dyn FnOnce(&mut Reactor, Classification)>;

// -----------------------------------------------------------------------------
//     - Child -
//     Shared by the reaper timer, the deadline timer and the fd watches.
//     Only tokens point back into the reactor, so dropping the reactor drops
//     every closure and with them the child, which then kills and reaps.
// -----------------------------------------------------------------------------
struct Child {
    pid: libc::pid_t,
    pipes: Pipes,
    watches: Vec<Token>,
    deadline: Option<Token>,
    reaper: Option<Token>,
    timed_out: bool,
    reaped: bool,
    failure: Option<String>,
    on_output: OutputHandler,
    on_complete: Option<CompletionHandler>,
    state: Rc<RefCell<ProcessState>>,
}

impl Child {
    /// Supervision can't continue as planned: kill now, report the reason
    /// once reaped.
    fn fail(&mut self, reactor: &mut Reactor, reason: String) {
        warn!("pid {}: {}", self.pid, reason);
        self.failure.get_or_insert(reason);
        kill_quietly(self.pid);

        if let Some(reaper) = self.reaper {
            let _ = reactor.reset_timer(reaper, Duration::from_millis(0));
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }

        debug!("abandoning pid {}", self.pid);
        let classification = match kill_and_reap(self.pid) {
            Ok(_) => Classification::SupervisorError("supervision abandoned".into()),
            Err(e) => Classification::SupervisorError(e.to_string()),
        };
        *self.state.borrow_mut() = ProcessState::Completed(classification);
    }
}

// -----------------------------------------------------------------------------
//     - Child handle -
// -----------------------------------------------------------------------------
/// Returned by `async_exec`. Dropping it does not affect the child.
pub struct ChildHandle {
    pid: libc::pid_t,
    reaper: Token,
    state: Rc<RefCell<ProcessState>>,
}

impl ChildHandle {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// The reactor timer that polls for the child's exit.
    pub fn reaper(&self) -> Token {
        self.reaper
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), ProcessState::Running(_))
    }

    /// SIGKILL the child. Does nothing once it has been reaped.
    pub fn kill(&self) {
        if self.is_running() {
            kill_quietly(self.pid);
        }
    }
}

impl fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<ChildHandle pid: {} {:?}>", self.pid, self.state.borrow())
    }
}

// -----------------------------------------------------------------------------
//     - Supervise -
// -----------------------------------------------------------------------------
pub(super) fn supervise(
    reactor: &mut Reactor,
    spawned: Spawned,
    deadline: Option<Duration>,
    config: &SupervisorConfig,
    state: Rc<RefCell<ProcessState>>,
    on_output: OutputHandler,
    on_complete: CompletionHandler,
) -> Result<ChildHandle> {
    let Spawned { pid, pipes } = spawned;
    let open = pipes.open();

    let child = Rc::new(RefCell::new(Child {
        pid,
        pipes,
        watches: Vec::with_capacity(open.len()),
        deadline: None,
        reaper: None,
        timed_out: false,
        reaped: false,
        failure: None,
        on_output,
        on_complete: Some(on_complete),
        state: state.clone(),
    }));

    // The reaper goes first: without it nothing would ever collect the
    // child. If it can't be registered the child is dropped right here,
    // which kills and reaps it.
    let c = child.clone();
    let reaper = reactor.register_timer(
        move |reactor, _| reap_tick(&c, reactor),
        config.reap_interval,
        Recurrence::Every(config.reap_interval),
    )?;
    child.borrow_mut().reaper = Some(reaper);

    if let Some(deadline) = deadline {
        let c = child.clone();
        let res = reactor.register_timer(
            move |reactor, _| {
                on_deadline(&c, reactor);
                Reaction::Stop
            },
            deadline,
            Recurrence::Once,
        );

        match res {
            Ok(token) => child.borrow_mut().deadline = Some(token),
            Err(e) => child.borrow_mut().fail(reactor, format!("no deadline timer: {}", e)),
        }
    }

    for (stream, fd, interest) in open {
        let c = child.clone();
        let res = reactor.register_fd(fd, interest, move |reactor, me, _| {
            pump(&c, reactor, me, stream);
            Reaction::Continue
        });

        match res {
            Ok(token) => child.borrow_mut().watches.push(token),
            Err(e) => {
                child.borrow_mut().fail(reactor, format!("cannot watch {:?}: {}", stream, e));
                break;
            }
        }
    }

    Ok(ChildHandle { pid, reaper, state })
}

fn pump(child: &Rc<RefCell<Child>>, reactor: &mut Reactor, me: Token, stream: Stream) {
    let mut guard = child.borrow_mut();
    let child = &mut *guard;

    let still_open = match stream {
        Stream::Stdin => child.pipes.pump_write(),
        _ => child.pipes.pump_read(stream, &mut *child.on_output),
    };

    if !still_open {
        // Deregister before closing so the number is never watched after it
        // can be reused.
        reactor.die(me);
        child.watches.retain(|t| *t != me);
        child.pipes.close(stream);
    }
}

fn on_deadline(child: &Rc<RefCell<Child>>, reactor: &mut Reactor) {
    let mut child = child.borrow_mut();
    child.deadline = None;
    if child.reaped {
        return;
    }

    debug!("pid {} outlived its deadline", child.pid);
    child.timed_out = true;
    kill_quietly(child.pid);

    if let Some(reaper) = child.reaper {
        let _ = reactor.reset_timer(reaper, Duration::from_millis(0));
    }
}

fn reap_tick(child: &Rc<RefCell<Child>>, reactor: &mut Reactor) -> Reaction {
    let mut guard = child.borrow_mut();
    let c = &mut *guard;

    let status = match reap(c.pid, false) {
        Ok(None) => return Reaction::Continue,
        Ok(Some(status)) => Ok(status),
        Err(e) => Err(e),
    };
    c.reaped = true;

    c.pipes.drain(&mut *c.on_output);
    for token in c.watches.drain(..) {
        reactor.die(token);
    }
    if let Some(token) = c.deadline.take() {
        reactor.die(token);
    }
    c.pipes.close(Stream::Stdin);
    c.pipes.close(Stream::Stdout);
    c.pipes.close(Stream::Stderr);

    let classification = match (status, c.failure.take()) {
        (Err(e), _) => {
            error!("waiting for pid {} failed: {}", c.pid, e);
            Classification::SupervisorError(e.to_string())
        }
        (Ok(_), Some(reason)) => Classification::SupervisorError(reason),
        (Ok(status), None) => classify(status, c.timed_out),
    };

    debug!("pid {} completed: {:?}", c.pid, classification);
    *c.state.borrow_mut() = ProcessState::Completed(classification.clone());
    c.reaper = None;
    let on_complete = c.on_complete.take();
    drop(guard);

    if let Some(on_complete) = on_complete {
        on_complete(reactor, classification);
    }

    Reaction::Stop
}
