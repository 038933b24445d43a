//! Count jumps by single-stepping a process, or stop it at software breakpoints.

pub mod breakpoint;
pub mod classify;
pub mod cmd;
pub mod control;
pub mod error;
pub mod memory;
pub mod registers;
pub mod session;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptracer;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod x86;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

pub use breakpoint::{Breakpoint, BreakpointManager};
pub use classify::{InstructionClassifier, Jump, JumpTable};
pub use cmd::Command;
pub use control::{ProcessControl, Register, Resume, StopEvent, TraceHandle};
pub use error::{Error, Result};
pub use memory::MemoryPatcher;
pub use registers::{RegisterSnapshot, RegisterView};
pub use session::{Cancel, Mode, SessionConfig, Summary, TraceSession, TraceeState};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptracer::Ptracer;
