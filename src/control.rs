//! The process-tracing capability the rest of the crate is written against.
//!
//! [`ProcessControl`] is deliberately small: it is everything the breakpoint manager,
//! classifier and session need from the operating system, and nothing more. The real
//! implementation is [`Ptracer`](crate::ptracer::Ptracer); tests substitute an in-memory
//! tracee.

use std::fmt;

use crate::cmd::Command;
use crate::error::Result;
use crate::{Pid, Signal};

/// Size in bytes of the unit transferred by [`ProcessControl::peek_word()`] and
/// [`ProcessControl::poke_word()`].
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Handle to a process under trace control.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TraceHandle {
    pid: Pid,
}

impl TraceHandle {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl fmt::Display for TraceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pid)
    }
}

/// Why a tracee stopped, as observed by [`ProcessControl::wait_for_stop()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopEvent {
    /// Executed a trap instruction. The instruction pointer is just past the trap.
    Trapped,

    /// Completed a single-step request.
    SteppedOnce,

    /// About to receive `signal`. It is delivered only if re-injected on resume.
    SignalDelivery(Signal),

    /// Exited normally with the given code.
    Exited(i32),

    /// Killed by a signal.
    Signaled(Signal),

    /// Any other wait status, verbatim.
    Unexpected(i32),
}

impl StopEvent {
    /// Return `true` if the tracee no longer exists after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopEvent::Exited(_) | StopEvent::Signaled(_))
    }
}

/// How a stopped tracee should proceed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    Continue,
    SingleStep,
}

/// Registers addressable through [`ProcessControl::peek_register()`].
///
/// Declared in the order of [`Register::ALL`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(usize)]
pub enum Register {
    Rip,
    Rax,
    OrigRax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    Eflags,
}

impl Register {
    pub const COUNT: usize = 11;

    /// Every register captured by a register dump, in display order.
    pub const ALL: [Register; Register::COUNT] = [
        Register::Rip,
        Register::Rax,
        Register::OrigRax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
        Register::Rbp,
        Register::Rsp,
        Register::Eflags,
    ];

    /// Position in [`Register::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Register::Rip => "rip",
            Register::Rax => "rax",
            Register::OrigRax => "orig_rax",
            Register::Rbx => "rbx",
            Register::Rcx => "rcx",
            Register::Rdx => "rdx",
            Register::Rsi => "rsi",
            Register::Rdi => "rdi",
            Register::Rbp => "rbp",
            Register::Rsp => "rsp",
            Register::Eflags => "eflags",
        }
    }
}

/// Control over a single traced process.
///
/// Every call is a real state change of another process. Failures are returned as
/// [`Error`](crate::Error) values carrying the pid and the failed operation, never panics.
pub trait ProcessControl {
    /// Spawn `cmd` under trace control, stopped before its first instruction.
    fn launch(&mut self, cmd: Command) -> Result<TraceHandle>;

    /// Attach to a running process and wait for it to stop.
    fn attach(&mut self, pid: Pid) -> Result<TraceHandle>;

    /// Block until the tracee changes state.
    fn wait_for_stop(&mut self, handle: TraceHandle) -> Result<StopEvent>;

    /// Resume a stopped tracee, delivering `signal` if given.
    fn resume(&mut self, handle: TraceHandle, mode: Resume, signal: Option<Signal>) -> Result<()>;

    /// Read the machine word at `addr`. `addr` need not be aligned.
    fn peek_word(&self, handle: TraceHandle, addr: u64) -> Result<u64>;

    /// Overwrite the machine word at `addr`. `addr` need not be aligned.
    fn poke_word(&mut self, handle: TraceHandle, addr: u64, word: u64) -> Result<()>;

    fn peek_register(&self, handle: TraceHandle, register: Register) -> Result<u64>;

    fn poke_register(&mut self, handle: TraceHandle, register: Register, value: u64) -> Result<()>;

    /// Ask a running tracee to stop, by sending it `SIGSTOP`. Does not wait.
    ///
    /// The tracee may report other stops first. The request is answered by a
    /// `SignalDelivery(SIGSTOP)` stop, and the `SIGSTOP` should not be re-injected.
    fn interrupt(&mut self, handle: TraceHandle) -> Result<()>;

    /// Stop tracing a stopped tracee and let it run freely.
    fn detach(&mut self, handle: TraceHandle) -> Result<()>;

    /// Kill the tracee and reap it.
    fn kill(&mut self, handle: TraceHandle) -> Result<()>;
}
