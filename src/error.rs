use std::fmt;
use std::io;
use std::time::Duration;

use nix::errno::Errno;

use crate::control::{Register, Resume};
use crate::Pid;


pub type Result<T> = std::result::Result<T, Error>;

/// Direction of a failed tracee memory or register access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not launch tracee = {path}")]
    Launch {
        path: String,
        source: io::Error,
    },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not resume tracee = {pid} with mode = {mode:?}")]
    Resume { pid: Pid, mode: Resume, source: nix::Error },

    #[error("Could not {access} memory of tracee = {pid} at 0x{addr:x}")]
    MemoryAccess {
        pid: Pid,
        access: Access,
        addr: u64,
        source: nix::Error,
    },

    #[error("Could not {access} register {register:?} of tracee = {pid}")]
    RegisterAccess {
        pid: Pid,
        access: Access,
        register: Register,
        source: nix::Error,
    },

    #[error("Breakpoint already set at 0x{addr:x}")]
    AlreadySet { addr: u64 },

    #[error("No breakpoint set at 0x{addr:x}")]
    NotSet { addr: u64 },

    #[error("Unexpected wait status for tracee = {pid}: 0x{raw:x}")]
    UnexpectedStop { pid: Pid, raw: i32 },

    #[error("Timed out after {timeout:?} waiting for tracee = {pid} to stop")]
    WaitTimeout { pid: Pid, timeout: Duration },

    #[error("Tracee died while stopped, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Return `true` if the error means the tracee no longer exists.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } => true,
            Error::Resume { source, .. } |
            Error::MemoryAccess { source, .. } |
            Error::RegisterAccess { source, .. } => *source == Errno::ESRCH,
            _ => false,
        }
    }

    /// Return `true` for breakpoint bookkeeping misuse, which leaves the tracee untouched.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, Error::AlreadySet { .. } | Error::NotSet { .. })
    }
}

pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(Errno::ESRCH) => Err(Error::TraceeDied { pid, source: Errno::ESRCH }),
            Err(err) => Err(Error::OS(err)),
        }
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

pub(crate) use internal_error;
