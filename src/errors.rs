use std::io;
use std::os::unix::io::RawFd;

use libc::__errno_location as errno_loc;
use thiserror::Error;

pub fn os_err() -> io::Error {
    let err_num = unsafe { *errno_loc() };
    io::Error::from_raw_os_error(err_num)
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reactor and the process supervisor.
///
/// Expected runtime outcomes (a child timing out, exiting non-zero or being
/// killed) are never reported here; those are `Classification` values.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Negative descriptor handed to `register_fd`.
    #[error("invalid descriptor {0}")]
    InvalidDescriptor(RawFd),

    /// A watch was requested with no readiness condition.
    #[error("empty interest mask for descriptor {0}")]
    EmptyInterest(RawFd),

    /// The descriptor is already watched by a live handle.
    #[error("descriptor {0} is already registered")]
    DescriptorInUse(RawFd),

    /// A live handler already owns this user event tag.
    #[error("user event tag {0} already has a handler")]
    TagInUse(u64),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The registry refused a new handle.
    #[error("registry full ({0} handles)")]
    RegistryFull(usize),

    /// fork(2) or pipe setup failed; no child exists.
    #[error("failed to spawn child: {0}")]
    Spawn(#[source] io::Error),

    /// The subprocess has not reached a terminal state yet.
    #[error("subprocess {0} is still running")]
    AlreadyRunning(libc::pid_t),

    /// A `Remote` outlived its reactor.
    #[error("reactor is gone")]
    ReactorGone,

    /// The OS readiness wait failed with something other than EINTR.
    #[error("reactor wait failed: {0}")]
    Runtime(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidDescriptor(_) => "invalid_descriptor",
            Error::EmptyInterest(_) => "empty_interest",
            Error::DescriptorInUse(_) => "descriptor_in_use",
            Error::TagInUse(_) => "tag_in_use",
            Error::InvalidCommand(_) => "invalid_command",
            Error::RegistryFull(_) => "registry_full",
            Error::Spawn(_) => "spawn_failed",
            Error::AlreadyRunning(_) => "already_running",
            Error::ReactorGone => "reactor_gone",
            Error::Runtime(_) => "runtime_wait_failed",
            Error::Io(_) => "io",
        }
    }

    /// Caller misuse, as opposed to an OS or resource failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidDescriptor(_)
                | Error::EmptyInterest(_)
                | Error::DescriptorInUse(_)
                | Error::TagInUse(_)
                | Error::InvalidCommand(_)
        )
    }
}
