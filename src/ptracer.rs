//! Linux x86-64 implementation of [`ProcessControl`] over `ptrace(2)`.

use std::collections::BTreeMap;
use std::io;
use std::time::{Duration, Instant};

use nix::{
    errno::Errno,
    sys::{
        ptrace::{self, AddressType, Options},
        signal::{self, Signal},
        wait::WaitStatus,
    },
};
use tracing::{debug, info, trace};

use crate::cmd::Command;
use crate::control::{ProcessControl, Register, Resume, StopEvent, TraceHandle};
use crate::error::{internal_error, Access, Error, Result, ResultExt};
use crate::Pid;

// `si_code` values for `SIGTRAP`, from `include/uapi/asm-generic/siginfo.h`.
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;
const SI_KERNEL: i32 = 0x80;

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Options set on every launched tracee.
///
/// `PTRACE_O_TRACEEXEC` turns an `execve()` by the tracee into a ptrace-event-stop instead
/// of a plain `SIGTRAP`, so it cannot be mistaken for a breakpoint.
const LAUNCH_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_EXITKILL);

/// Options set on every attached tracee.
const ATTACH_OPTIONS: Options = Options::PTRACE_O_TRACEEXEC;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    // Self-attached via a pre-exec `TRACEME` request, expecting the exec `SIGTRAP`.
    Spawned,

    // Attached via `PTRACE_ATTACH`, expecting a `SIGSTOP`.
    Attaching,

    // In ptrace-stop, accepting requests.
    Stopped,

    // Resumed with the given mode.
    Running(Resume),
}

/// Tracer for Linux processes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ptracer {
    /// Time to sleep for before polling the tracee again.
    poll_delay: Duration,

    /// Give up waiting on a tracee after this long.
    wait_timeout: Option<Duration>,

    /// Known tracees, and their state.
    tracees: BTreeMap<i32, State>,
}

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Ptracer {
    pub fn new() -> Self {
        let poll_delay = DEFAULT_POLL_DELAY;
        let wait_timeout = None;
        let tracees = BTreeMap::new();

        Self { poll_delay, wait_timeout, tracees }
    }

    /// Return the initial tracee poll delay.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    /// Set the initial tracee poll delay.
    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    /// Bound every wait on a tracee. `None` waits forever.
    pub fn set_wait_timeout(&mut self, wait_timeout: impl Into<Option<Duration>>) {
        self.wait_timeout = wait_timeout.into();
    }

    // Poll `pid` for a `wait(2)` status change with exponential backoff, returning the
    // decoded status and the raw status word.
    fn wait_status(&mut self, pid: Pid) -> Result<(WaitStatus, i32)> {
        let started = Instant::now();
        let mut poll_delay = self.poll_delay;

        loop {
            let mut raw = 0;

            let res = unsafe {
                libc::waitpid(pid.as_raw(), &mut raw, libc::__WALL | libc::WNOHANG)
            };

            match Errno::result(res) {
                Ok(0) => {
                    // Alive, no state change.
                },
                Ok(_) => {
                    let status = WaitStatus::from_raw(pid, raw)?;
                    trace!(pid = pid.as_raw(), ?status, raw, "tracee changed state");
                    return Ok((status, raw));
                },
                Err(Errno::ECHILD) => {
                    self.remove_tracee(pid);
                    return Err(Error::TraceeDied { pid, source: Errno::ECHILD });
                },
                Err(err) => {
                    return Err(err.into());
                },
            }

            if let Some(timeout) = self.wait_timeout {
                if started.elapsed() >= timeout {
                    return Err(Error::WaitTimeout { pid, timeout });
                }
            }

            std::thread::sleep(poll_delay);

            // Back off before next attempt.
            poll_delay = (poll_delay * 2).min(MAX_POLL_DELAY);
        }
    }

    // Disambiguate a `SIGTRAP` signal-delivery-stop using its `si_code`.
    fn sigtrap_event(&self, pid: Pid) -> Result<StopEvent> {
        let info = ptrace::getsiginfo(pid).died_if_esrch(pid)?;
        let stepping = self.tracee_state(pid) == Some(State::Running(Resume::SingleStep));

        let event = match info.si_code {
            // Executed `int3`.
            SI_KERNEL => StopEvent::Trapped,
            TRAP_TRACE => StopEvent::SteppedOnce,
            // A single-step across a `syscall` instruction is reported as `TRAP_BRKPT`.
            TRAP_BRKPT if stepping => StopEvent::SteppedOnce,
            TRAP_BRKPT => StopEvent::Trapped,
            // Sent by a process, e.g. `kill(2)`.
            _ => StopEvent::SignalDelivery(Signal::SIGTRAP),
        };

        debug!(pid = pid.as_raw(), si_code = info.si_code, stepping, ?event, "classified SIGTRAP");

        Ok(event)
    }

    fn tracee_state(&self, pid: Pid) -> Option<State> {
        self.tracees.get(&pid.as_raw()).copied()
    }

    fn try_tracee_state(&self, pid: Pid) -> Result<State> {
        self.tracee_state(pid).ok_or_else(|| Error::Internal("no tracee state".into()))
    }

    fn set_tracee_state(&mut self, pid: Pid, state: State) {
        trace!(pid = pid.as_raw(), ?state, "setting tracee state");

        self.tracees.insert(pid.as_raw(), state);
    }

    fn remove_tracee(&mut self, pid: Pid) -> Option<State> {
        info!(pid = pid.as_raw(), "removing tracee");
        self.tracees.remove(&pid.as_raw())
    }

    fn expect_stopped(&self, pid: Pid) -> Result<()> {
        match self.try_tracee_state(pid)? {
            State::Stopped => Ok(()),
            _ => internal_error!("request for tracee that is not stopped"),
        }
    }
}

impl ProcessControl for Ptracer {
    fn launch(&mut self, cmd: Command) -> Result<TraceHandle> {
        let path = cmd.program().display().to_string();

        let child = cmd
            .into_std()
            .spawn()
            .map_err(|source| Error::Launch { path: path.clone(), source })?;

        // We reap the child ourselves via `waitpid()`, so the `Child` is not needed.
        let pid = Pid::from_raw(child.id() as i32);
        self.set_tracee_state(pid, State::Spawned);

        // The tracee requested `PTRACE_TRACEME` pre-exec, so a successful `execve()` stops
        // it with a `SIGTRAP` before the new program runs its first instruction.
        match self.wait_status(pid)? {
            (WaitStatus::Stopped(_, Signal::SIGTRAP), _) => {},
            (status, raw) => {
                self.remove_tracee(pid);
                let source = io::Error::new(
                    io::ErrorKind::Other,
                    format!("expected exec stop, saw {status:?} (raw = 0x{raw:x})"),
                );
                return Err(Error::Launch { path, source });
            },
        }

        ptrace::setoptions(pid, LAUNCH_OPTIONS).died_if_esrch(pid)?;
        self.set_tracee_state(pid, State::Stopped);

        info!(pid = pid.as_raw(), %path, "launched tracee");

        Ok(TraceHandle::new(pid))
    }

    fn attach(&mut self, pid: Pid) -> Result<TraceHandle> {
        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;
        self.set_tracee_state(pid, State::Attaching);

        // Other signals may be reported before the attach `SIGSTOP`. Pass them on, except for
        // the `SIGTRAP` of an `execve()` that completed just as we attached. Delivering that
        // would kill the tracee.
        loop {
            match self.wait_status(pid)? {
                (WaitStatus::Stopped(_, Signal::SIGSTOP), _) => break,
                (WaitStatus::Stopped(_, Signal::SIGTRAP), _) => {
                    debug!(pid = pid.as_raw(), "suppressing SIGTRAP seen before attach-stop");
                    ptrace::cont(pid, None::<Signal>).map_err(|source| Error::Attach { pid, source })?;
                },
                (WaitStatus::Stopped(_, signal), _) => {
                    debug!(pid = pid.as_raw(), ?signal, "forwarding signal seen before attach-stop");
                    ptrace::cont(pid, signal).map_err(|source| Error::Attach { pid, source })?;
                },
                (status, _) => {
                    debug!(pid = pid.as_raw(), ?status, "tracee did not survive attach");
                    self.remove_tracee(pid);
                    return Err(Error::Attach { pid, source: Errno::ESRCH });
                },
            }
        }

        // No `EXITKILL`: an attached tracee outlives us.
        ptrace::setoptions(pid, ATTACH_OPTIONS).map_err(|source| Error::Attach { pid, source })?;
        self.set_tracee_state(pid, State::Stopped);

        info!(pid = pid.as_raw(), "attached to tracee");

        Ok(TraceHandle::new(pid))
    }

    fn wait_for_stop(&mut self, handle: TraceHandle) -> Result<StopEvent> {
        let pid = handle.pid();

        if let State::Stopped = self.try_tracee_state(pid)? {
            internal_error!("wait on tracee that was never resumed");
        }

        let (status, raw) = self.wait_status(pid)?;

        let event = match status {
            WaitStatus::Exited(_, exit_code) => {
                self.remove_tracee(pid);
                StopEvent::Exited(exit_code)
            },
            WaitStatus::Signaled(_, signal, _) => {
                self.remove_tracee(pid);
                StopEvent::Signaled(signal)
            },
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let event = self.sigtrap_event(pid)?;
                self.set_tracee_state(pid, State::Stopped);
                event
            },
            WaitStatus::Stopped(_, signal) => {
                self.set_tracee_state(pid, State::Stopped);
                StopEvent::SignalDelivery(signal)
            },
            _ => {
                // Ptrace-event-stops, including exec. Still a ptrace-stop, so the tracee
                // can be killed or detached.
                self.set_tracee_state(pid, State::Stopped);
                StopEvent::Unexpected(raw)
            },
        };

        Ok(event)
    }

    fn resume(&mut self, handle: TraceHandle, mode: Resume, signal: Option<Signal>) -> Result<()> {
        let pid = handle.pid();
        self.expect_stopped(pid)?;

        let res = match mode {
            Resume::SingleStep => ptrace::step(pid, signal),
            Resume::Continue => ptrace::cont(pid, signal),
        };

        res.map_err(|source| Error::Resume { pid, mode, source })?;
        self.set_tracee_state(pid, State::Running(mode));

        Ok(())
    }

    fn peek_word(&self, handle: TraceHandle, addr: u64) -> Result<u64> {
        let pid = handle.pid();

        let word = ptrace::read(pid, addr as AddressType)
            .map_err(|source| Error::MemoryAccess { pid, access: Access::Read, addr, source })?;

        Ok(word as u64)
    }

    fn poke_word(&mut self, handle: TraceHandle, addr: u64, word: u64) -> Result<()> {
        let pid = handle.pid();

        // SAFETY: `data` is passed by value as the word to store, and is never dereferenced
        // in this process.
        unsafe { ptrace::write(pid, addr as AddressType, word as AddressType) }
            .map_err(|source| Error::MemoryAccess { pid, access: Access::Write, addr, source })
    }

    fn peek_register(&self, handle: TraceHandle, register: Register) -> Result<u64> {
        let pid = handle.pid();

        // `PTRACE_PEEKUSER` returns the data, so `-1` is ambiguous without `errno`.
        Errno::clear();

        // SAFETY: the offset is not used as a pointer by the kernel, only range-checked
        // against the size of `struct user`.
        let data = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                pid.as_raw(),
                register.user_offset() as AddressType,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };

        if data == -1 {
            match Errno::last() {
                Errno::UnknownErrno => {},
                source => return Err(Error::RegisterAccess { pid, access: Access::Read, register, source }),
            }
        }

        Ok(data as u64)
    }

    fn poke_register(&mut self, handle: TraceHandle, register: Register, value: u64) -> Result<()> {
        let pid = handle.pid();

        // SAFETY: as for `peek_register()`; `value` is stored, not dereferenced.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                pid.as_raw(),
                register.user_offset() as AddressType,
                value as AddressType,
            )
        };

        Errno::result(res)
            .map(drop)
            .map_err(|source| Error::RegisterAccess { pid, access: Access::Write, register, source })
    }

    fn interrupt(&mut self, handle: TraceHandle) -> Result<()> {
        let pid = handle.pid();

        if let State::Stopped = self.try_tracee_state(pid)? {
            internal_error!("interrupt of tracee that is already stopped");
        }

        signal::kill(pid, Signal::SIGSTOP).died_if_esrch(pid)?;

        debug!(pid = pid.as_raw(), "sent SIGSTOP to running tracee");

        Ok(())
    }

    fn detach(&mut self, handle: TraceHandle) -> Result<()> {
        let pid = handle.pid();
        self.expect_stopped(pid)?;

        ptrace::detach(pid, None::<Signal>).died_if_esrch(pid)?;
        self.remove_tracee(pid);

        info!(pid = pid.as_raw(), "detached from tracee");

        Ok(())
    }

    fn kill(&mut self, handle: TraceHandle) -> Result<()> {
        let pid = handle.pid();

        signal::kill(pid, Signal::SIGKILL).died_if_esrch(pid)?;

        // Reap, skipping any ptrace-stops reported before the kill lands.
        loop {
            let (status, _) = self.wait_status(pid)?;

            if let WaitStatus::Exited(..) | WaitStatus::Signaled(..) = status {
                break;
            }

            debug!(pid = pid.as_raw(), ?status, "stop while waiting on killed tracee");
        }

        self.remove_tracee(pid);

        info!(pid = pid.as_raw(), "killed tracee");

        Ok(())
    }
}
