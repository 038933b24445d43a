//! The trace event loop: launch, wait, dispatch, resume, until the tracee is gone.

use std::fmt;
use std::io::{self, Read, Write};

use tracing::{debug, info, trace, warn};

use crate::breakpoint::{Breakpoint, BreakpointManager};
use crate::classify::{InstructionClassifier, Jump, JumpTable};
use crate::cmd::Command;
use crate::control::{ProcessControl, Resume, StopEvent, TraceHandle};
use crate::error::{internal_error, Error, Result};
use crate::registers::{RegisterSnapshot, RegisterView};
use crate::{Pid, Signal};

/// What the session does between stops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Single-step every instruction, counting jumps.
    FullTrace,

    /// Run freely, stopping only at breakpoints.
    Breakpoints,

    /// Single-step every instruction, reporting whenever `address` is reached. No code is
    /// patched.
    Watch { address: u64 },
}

impl Mode {
    pub fn single_steps(&self) -> bool {
        !matches!(self, Mode::Breakpoints)
    }
}

/// Lifecycle of the traced process, as last observed by the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceeState {
    Launching,
    Running,
    StoppedAtTrap,
    StoppedAtStep,
    StoppedAtSignal(Signal),
    Exited(i32),
    Terminated(Signal),
}

impl TraceeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceeState::Exited(_) | TraceeState::Terminated(_))
    }
}

/// The process a session controls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TracedProcess {
    handle: TraceHandle,
    state: TraceeState,
}

impl TracedProcess {
    pub fn handle(&self) -> TraceHandle {
        self.handle
    }

    pub fn pid(&self) -> Pid {
        self.handle.pid()
    }

    pub fn state(&self) -> TraceeState {
        self.state
    }
}

/// Count of jump instructions seen since the session started. Never decreases.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JumpTally {
    count: u64,
}

impl JumpTally {
    pub fn record(&mut self, jump: Jump) {
        if jump.is_jump() {
            self.count += 1;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    mode: Mode,
    breakpoints: Vec<u64>,
    interactive: bool,
    jump_table: JumpTable,
}

impl SessionConfig {
    pub fn new(mode: Mode) -> Self {
        let breakpoints = vec![];
        let interactive = false;
        let jump_table = JumpTable::default();

        Self { mode, breakpoints, interactive, jump_table }
    }

    /// Install a breakpoint at `addr` before the tracee first runs.
    pub fn breakpoint(mut self, addr: u64) -> Self {
        self.breakpoints.push(addr);
        self
    }

    /// Wait on the resume trigger after each breakpoint or watch hit.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn jump_table(mut self, jump_table: JumpTable) -> Self {
        self.jump_table = jump_table;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }
}

/// How the tracee ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Exited(i32),
    Terminated(Signal),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exited(code) => write!(f, "exited with status {code}"),
            Outcome::Terminated(signal) => write!(f, "terminated by {signal}"),
        }
    }
}

/// Totals for a finished session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Summary {
    pub outcome: Outcome,
    pub jumps: u64,
    pub steps: u64,
    pub breakpoint_hits: u64,
    pub anomalous_traps: u64,
}

impl Summary {
    /// Exit status for the tracer: `0` when the tracee exited on its own, `128 + signo` when
    /// a signal killed it.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Exited(_) => 0,
            Outcome::Terminated(signal) => 128 + signal as i32,
        }
    }
}

/// Receives the human-readable side of a session.
pub trait Report {
    fn breakpoint_hit(&mut self, addr: u64, regs: &RegisterSnapshot) -> Result<()>;

    fn watch_hit(&mut self, addr: u64, regs: &RegisterSnapshot) -> Result<()>;

    /// A trap that no breakpoint accounts for.
    fn anomalous_trap(&mut self, ip: u64) -> Result<()>;

    fn signal(&mut self, _signal: Signal) -> Result<()> {
        Ok(())
    }

    fn unexpected_stop(&mut self, raw: i32) -> Result<()>;

    fn finished(&mut self, mode: Mode, summary: &Summary) -> Result<()>;
}

/// Writes reports as plain text.
#[derive(Debug)]
pub struct Printer<W> {
    out: W,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl Printer<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> Report for Printer<W> {
    fn breakpoint_hit(&mut self, addr: u64, regs: &RegisterSnapshot) -> Result<()> {
        writeln!(self.out, "Breakpoint hit at 0x{addr:x}")?;
        write!(self.out, "{regs}")?;
        self.out.flush()?;
        Ok(())
    }

    fn watch_hit(&mut self, addr: u64, regs: &RegisterSnapshot) -> Result<()> {
        writeln!(self.out, "Reached 0x{addr:x}")?;
        write!(self.out, "{regs}")?;
        self.out.flush()?;
        Ok(())
    }

    fn anomalous_trap(&mut self, ip: u64) -> Result<()> {
        writeln!(self.out, "Trap at 0x{ip:x} with no breakpoint set, ignoring")?;
        Ok(())
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        writeln!(self.out, "Tracee received {signal}")?;
        Ok(())
    }

    fn unexpected_stop(&mut self, raw: i32) -> Result<()> {
        writeln!(self.out, "Tracee stopped with unexpected status 0x{raw:x}")?;
        Ok(())
    }

    fn finished(&mut self, mode: Mode, summary: &Summary) -> Result<()> {
        if let Mode::FullTrace = mode {
            writeln!(self.out)?;
            writeln!(self.out, "=> {} jumps in {} instructions", summary.jumps, summary.steps)?;
        }

        self.out.flush()?;
        Ok(())
    }
}

/// Gates resumption after a hit in interactive mode.
pub trait ResumeTrigger {
    fn wait_for_resume(&mut self) -> Result<()>;
}

/// Resume as soon as asked.
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl ResumeTrigger for Immediate {
    fn wait_for_resume(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Resume after reading one byte of input, or at end of input.
#[derive(Debug)]
pub struct KeyPress<R> {
    input: R,
}

impl<R: Read> KeyPress<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

impl KeyPress<io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(io::stdin())
    }
}

impl<R: Read> ResumeTrigger for KeyPress<R> {
    fn wait_for_resume(&mut self) -> Result<()> {
        let mut byte = [0; 1];
        self.input.read(&mut byte)?;
        Ok(())
    }
}

/// How to let go of a tracee before it finishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cancel {
    /// Restore all breakpoints and let the tracee continue untraced.
    Detach,

    /// Kill the tracee. Breakpoints are left in place.
    Kill,
}

// What to do after handling a stop.
enum Next {
    Resume(Option<Signal>),
    Finish(Outcome),
}

/// Drives one tracee from launch to exit.
pub struct TraceSession<C> {
    control: C,
    process: TracedProcess,
    breakpoints: BreakpointManager,
    classifier: InstructionClassifier,
    mode: Mode,
    interactive: bool,
    tally: JumpTally,
    steps: u64,
    breakpoint_hits: u64,
    anomalous_traps: u64,
    report: Box<dyn Report>,
    trigger: Box<dyn ResumeTrigger>,
}

impl<C: ProcessControl> TraceSession<C> {
    /// Launch `cmd` under `control`, installing the configured breakpoints.
    pub fn launch(mut control: C, cmd: Command, config: SessionConfig) -> Result<Self> {
        let handle = control.launch(cmd)?;
        Self::new(control, handle, config)
    }

    /// Attach to `pid` under `control`, installing the configured breakpoints.
    pub fn attach(mut control: C, pid: Pid, config: SessionConfig) -> Result<Self> {
        let handle = control.attach(pid)?;
        Self::new(control, handle, config)
    }

    fn new(control: C, handle: TraceHandle, config: SessionConfig) -> Result<Self> {
        let SessionConfig { mode, breakpoints, interactive, jump_table } = config;

        let mut session = Self {
            control,
            process: TracedProcess { handle, state: TraceeState::Launching },
            breakpoints: BreakpointManager::new(),
            classifier: InstructionClassifier::new(jump_table),
            mode,
            interactive,
            tally: JumpTally::default(),
            steps: 0,
            breakpoint_hits: 0,
            anomalous_traps: 0,
            report: Box::new(Printer::stdout()),
            trigger: Box::new(Immediate),
        };

        for addr in breakpoints {
            session.set_breakpoint(addr)?;
        }

        Ok(session)
    }

    pub fn with_report(mut self, report: impl Report + 'static) -> Self {
        self.report = Box::new(report);
        self
    }

    pub fn with_trigger(mut self, trigger: impl ResumeTrigger + 'static) -> Self {
        self.trigger = Box::new(trigger);
        self
    }

    pub fn handle(&self) -> TraceHandle {
        self.process.handle
    }

    pub fn process(&self) -> &TracedProcess {
        &self.process
    }

    pub fn state(&self) -> TraceeState {
        self.process.state
    }

    pub fn tally(&self) -> JumpTally {
        self.tally
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn into_control(self) -> C {
        self.control
    }

    pub fn instruction_pointer(&self) -> Result<u64> {
        self.control.instruction_pointer(self.handle())
    }

    pub fn set_breakpoint(&mut self, addr: u64) -> Result<()> {
        let handle = self.handle();
        self.breakpoints.set_breakpoint(&mut self.control, handle, addr)
    }

    pub fn remove_breakpoint(&mut self, addr: u64) -> Result<Breakpoint> {
        let handle = self.handle();
        self.breakpoints.remove_breakpoint(&mut self.control, handle, addr)
    }

    /// Run the tracee until it exits or is killed.
    ///
    /// An unrecognized stop is reported and returned as [`Error::UnexpectedStop`]; the
    /// tracee is then still stopped and can be cancelled.
    pub fn run(&mut self) -> Result<Summary> {
        if self.process.state.is_terminal() {
            internal_error!("session already finished");
        }

        let handle = self.handle();
        let mut signal = None;

        info!(pid = handle.pid().as_raw(), mode = ?self.mode, "starting trace");

        loop {
            let resume = if self.mode.single_steps() {
                // A signal-delivery-stop comes before the instruction runs, so it has already
                // been looked at.
                if !matches!(self.process.state, TraceeState::StoppedAtSignal(_)) {
                    self.before_step()?;
                }

                Resume::SingleStep
            } else {
                Resume::Continue
            };

            self.control.resume(handle, resume, signal.take())?;
            self.process.state = TraceeState::Running;

            let event = self.control.wait_for_stop(handle)?;

            match self.dispatch(event)? {
                Next::Resume(pending) => signal = pending,
                Next::Finish(outcome) => return self.finish(outcome),
            }
        }
    }

    /// Stop tracing before the tracee finishes.
    ///
    /// A tracee left running by a failed wait is stopped before it is detached from, so its
    /// code can be restored.
    pub fn cancel(mut self, how: Cancel) -> Result<C> {
        let handle = self.handle();

        if self.process.state.is_terminal() {
            return Ok(self.control);
        }

        match how {
            Cancel::Detach => {
                if let TraceeState::Running = self.process.state {
                    if !self.stop_for_detach()? {
                        info!(pid = handle.pid().as_raw(), state = ?self.process.state, "tracee finished while stopping it");
                        return Ok(self.control);
                    }
                }

                self.breakpoints.restore_all(&mut self.control, handle)?;
                self.control.detach(handle)?;
            },
            Cancel::Kill => {
                self.control.kill(handle)?;
            },
        }

        info!(pid = handle.pid().as_raw(), ?how, "cancelled trace");

        Ok(self.control)
    }

    // Interrupt a running tracee and wait until the interrupt is what stopped it, restoring
    // all code on the way. Returns `false` if the tracee finished instead.
    fn stop_for_detach(&mut self) -> Result<bool> {
        let handle = self.handle();

        self.control.interrupt(handle)?;

        loop {
            let event = self.control.wait_for_stop(handle)?;

            debug!(?event, "tracee stopped for detach");

            // Hit a breakpoint before the interrupt landed. Rewind so the real instruction runs
            // once the code is restored.
            if let StopEvent::Trapped = event {
                let ip = self.control.instruction_pointer(handle)?;

                if let Some(addr) = self.breakpoints.hit_at(ip).map(Breakpoint::address) {
                    self.control.set_instruction_pointer(handle, addr)?;
                }
            }

            let signal = match event {
                StopEvent::SignalDelivery(Signal::SIGSTOP) => {
                    self.process.state = TraceeState::StoppedAtSignal(Signal::SIGSTOP);
                    return Ok(true);
                },
                StopEvent::Exited(code) => {
                    self.process.state = TraceeState::Exited(code);
                    return Ok(false);
                },
                StopEvent::Signaled(signal) => {
                    self.process.state = TraceeState::Terminated(signal);
                    return Ok(false);
                },
                StopEvent::SignalDelivery(signal) => Some(signal),
                _ => None,
            };

            self.breakpoints.restore_all(&mut self.control, handle)?;
            self.control.resume(handle, Resume::Continue, signal)?;
        }
    }

    // Work done at the current instruction before single-stepping it.
    fn before_step(&mut self) -> Result<()> {
        let handle = self.handle();
        let ip = self.control.instruction_pointer(handle)?;

        match self.mode {
            Mode::FullTrace => {
                let jump = self.classifier.classify_shadowed(&self.control, handle, ip, &self.breakpoints)?;

                if jump.is_jump() {
                    trace!(ip = %format!("0x{ip:x}"), ?jump, "jump");
                }

                self.tally.record(jump);
            },
            Mode::Watch { address } if ip == address => {
                let regs = self.control.dump(handle)?;
                self.report.watch_hit(address, &regs)?;

                if self.interactive {
                    self.trigger.wait_for_resume()?;
                }
            },
            _ => {},
        }

        Ok(())
    }

    fn dispatch(&mut self, event: StopEvent) -> Result<Next> {
        trace!(?event, "tracee stopped");

        let next = match event {
            StopEvent::SteppedOnce => {
                self.process.state = TraceeState::StoppedAtStep;
                self.steps += 1;
                Next::Resume(None)
            },
            StopEvent::Trapped => {
                self.process.state = TraceeState::StoppedAtTrap;
                return self.on_trap();
            },
            StopEvent::SignalDelivery(signal) => {
                self.process.state = TraceeState::StoppedAtSignal(signal);
                debug!(?signal, "forwarding signal to tracee");
                self.report.signal(signal)?;
                Next::Resume(Some(signal))
            },
            StopEvent::Exited(code) => {
                self.process.state = TraceeState::Exited(code);
                Next::Finish(Outcome::Exited(code))
            },
            StopEvent::Signaled(signal) => {
                self.process.state = TraceeState::Terminated(signal);
                Next::Finish(Outcome::Terminated(signal))
            },
            StopEvent::Unexpected(raw) => {
                warn!(raw, "unexpected stop");
                self.report.unexpected_stop(raw)?;
                let pid = self.process.pid();
                return Err(Error::UnexpectedStop { pid, raw });
            },
        };

        Ok(next)
    }

    fn on_trap(&mut self) -> Result<Next> {
        let handle = self.handle();
        let ip = self.control.instruction_pointer(handle)?;

        let addr = match self.breakpoints.hit_at(ip) {
            Some(bp) => bp.address(),
            None => {
                warn!(ip = %format!("0x{ip:x}"), "trap without breakpoint");
                self.anomalous_traps += 1;
                self.report.anomalous_trap(ip)?;
                return Ok(Next::Resume(None));
            },
        };

        self.breakpoint_hits += 1;

        // Report the registers as of the breakpoint address, not just past the trap.
        self.control.set_instruction_pointer(handle, addr)?;
        let regs = self.control.dump(handle)?;
        self.report.breakpoint_hit(addr, &regs)?;

        if self.interactive {
            self.trigger.wait_for_resume()?;
        }

        match self.breakpoints.step_over_and_rearm(&mut self.control, handle, addr)? {
            StopEvent::SteppedOnce => {
                self.process.state = TraceeState::StoppedAtStep;
                self.steps += 1;
                Ok(Next::Resume(None))
            },
            event => self.dispatch(event),
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Result<Summary> {
        let summary = Summary {
            outcome,
            jumps: self.tally.count(),
            steps: self.steps,
            breakpoint_hits: self.breakpoint_hits,
            anomalous_traps: self.anomalous_traps,
        };

        info!(pid = self.process.pid().as_raw(), %outcome, jumps = summary.jumps, "trace finished");

        self.report.finished(self.mode, &summary)?;

        Ok(summary)
    }
}
