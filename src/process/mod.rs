//! Subprocess supervision.
//!
//! A child is started with fork + exec, its piped stdio is pumped to an
//! output callback, an optional deadline kills it, and it is reaped exactly
//! once no matter how it ends. `sync_exec` does all of that in a blocking
//! loop; `async_exec` hands the same work to a `Reactor` as timers and fd
//! watches so one thread can supervise many children.
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::reactor::Reactor;
use crate::{Error, Result};

mod blocking;
mod command;
mod spawn;
mod supervised;
pub mod transfer;

pub use command::{Command, Stdio, Stream};
pub use supervised::ChildHandle;

/// How a child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Exited(i32),
    KilledBySignal(i32),
    /// Outlived its deadline and was killed by the supervisor.
    TimedOutAndKilled,
    /// Supervision itself broke down. The child is still killed and reaped.
    SupervisorError(String),
}

impl Classification {
    pub fn success(&self) -> bool {
        *self == Classification::Exited(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running(libc::pid_t),
    Completed(Classification),
}

// -----------------------------------------------------------------------------
//     - Supervisor config -
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often a running child is polled with a non-blocking wait.
    pub reap_interval: Duration,
    /// Read buffer size for piped output.
    pub read_chunk: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(10),
            read_chunk: 4096,
        }
    }
}

impl SupervisorConfig {
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size;
        self
    }
}

// -----------------------------------------------------------------------------
//     - Subprocess -
// -----------------------------------------------------------------------------
/// One supervised OS process at a time.
///
/// Running it again is allowed once the previous run has completed.
#[derive(Debug)]
pub struct Subprocess {
    command: Command,
    config: SupervisorConfig,
    state: Rc<RefCell<ProcessState>>,
}

impl Subprocess {
    pub fn new(command: Command) -> Self {
        Self::with_config(command, SupervisorConfig::default())
    }

    pub fn with_config(command: Command, config: SupervisorConfig) -> Self {
        Self {
            command,
            config,
            state: Rc::new(RefCell::new(ProcessState::NotStarted)),
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// The pid of the running child, if there is one.
    pub fn pid(&self) -> Option<libc::pid_t> {
        match *self.state.borrow() {
            ProcessState::Running(pid) => Some(pid),
            _ => None,
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match *self.state.borrow() {
            ProcessState::Running(pid) => Err(Error::AlreadyRunning(pid)),
            _ => Ok(()),
        }
    }

    /// Run the child to completion on the calling thread.
    ///
    /// `on_output` gets every chunk read from a piped stdout or stderr.
    pub fn sync_exec<F>(&mut self, mut on_output: F) -> Result<Classification>
    where
        F: FnMut(Stream, &[u8]),
    {
        self.ensure_idle()?;
        let spawned = spawn::spawn(&self.command, self.config.read_chunk)?;
        self.state = Rc::new(RefCell::new(ProcessState::Running(spawned.pid)));

        let classification = blocking::supervise(spawned, self.command.deadline, &self.config, &mut on_output);
        *self.state.borrow_mut() = ProcessState::Completed(classification.clone());
        Ok(classification)
    }

    /// Start the child and supervise it from `reactor`.
    ///
    /// `on_complete` runs exactly once, on the reactor thread, after the
    /// child has been reaped. The one exception is a reactor dropped while
    /// the child is still running: the child is killed and reaped, its state
    /// becomes `SupervisorError`, and `on_complete` never runs.
    pub fn async_exec<F, C>(&mut self, reactor: &mut Reactor, on_output: F, on_complete: C) -> Result<ChildHandle>
    where
        F: FnMut(Stream, &[u8]) + 'static,
        C: FnOnce(&mut Reactor, Classification) + 'static,
    {
        self.ensure_idle()?;
        let spawned = spawn::spawn(&self.command, self.config.read_chunk)?;
        self.state = Rc::new(RefCell::new(ProcessState::Running(spawned.pid)));

        supervised::supervise(
            reactor,
            spawned,
            self.command.deadline,
            &self.config,
            self.state.clone(),
            Box::new(on_output),
            Box::new(on_complete),
        )
    }
}

/// Run `command` to completion with the default config.
pub fn sync_exec<F>(command: &Command, on_output: F) -> Result<Classification>
where
    F: FnMut(Stream, &[u8]),
{
    Subprocess::new(command.clone()).sync_exec(on_output)
}

/// Start `command` under `reactor` with the default config.
pub fn async_exec<F, C>(reactor: &mut Reactor, command: &Command, on_output: F, on_complete: C) -> Result<ChildHandle>
where
    F: FnMut(Stream, &[u8]) + 'static,
    C: FnOnce(&mut Reactor, Classification) + 'static,
{
    Subprocess::new(command.clone()).async_exec(reactor, on_output, on_complete)
}
