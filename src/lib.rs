//! A single-threaded event pump (timers, fd readiness and cross-thread user
//! events) and a subprocess supervisor built on top of it.
mod errors;
mod signals;
mod system;

pub mod process;
pub mod reactor;

pub use errors::{os_err, Error, Result};
pub use process::{
    async_exec, sync_exec, ChildHandle, Classification, Command, ProcessState, Stdio, Stream, Subprocess,
    SupervisorConfig,
};
pub use reactor::{Callback, HandleState, Payload, Reaction, Reactor, ReactorBuilder, Recurrence, Remote, UserEvent};
pub use signals::Shutdown;
pub use system::{Interest, Ready, Token};

#[macro_export]
macro_rules! res {
    ($e:expr) => {
        match $e {
            -1 => return Err(crate::Error::Io(crate::os_err())),
            val => val
        }
    }
}
