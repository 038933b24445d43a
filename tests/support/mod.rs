#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use jumptrace::error::Access;
use jumptrace::session::{Mode, Report};
use jumptrace::{
    Command, Error, Pid, ProcessControl, Register, RegisterSnapshot, Resume, Result, Signal,
    StopEvent, Summary, TraceHandle,
};
use nix::errno::Errno;

pub const FAKE_PID: i32 = 4242;

pub const TRAP: u8 = 0xcc;

/// In-memory tracee.
///
/// Memory is sparse and mapped in aligned words, the way the kernel maps whole pages;
/// touching an unmapped word fails like `EIO` would.
/// Execution follows `path`: each executed instruction moves the instruction pointer to the
/// next address in it, and the tracee exits when it runs out. A trap byte at the instruction
/// pointer is executed instead, advancing the instruction pointer by one, without consuming
/// the path.
#[derive(Debug, Default)]
pub struct FakeTracee {
    pub memory: BTreeMap<u64, u8>,
    pub registers: BTreeMap<Register, u64>,
    pub path: VecDeque<u64>,
    pub exit_code: i32,

    /// Stops to report instead of executing, keyed by the index of the resume they answer.
    pub injected: BTreeMap<usize, StopEvent>,

    /// Number of upcoming waits that time out, leaving the tracee running.
    pub timeouts: usize,

    /// An interrupt is pending, and answers the next resume.
    pub interrupted: bool,

    /// Every resume request, in order.
    pub resumes: Vec<(Resume, Option<Signal>)>,
    pub waits: usize,
    pub detached: bool,
    pub killed: bool,

    pending: Option<StopEvent>,
    gone: bool,
}

impl FakeTracee {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `code` at `addr`, and start execution there.
    pub fn with_code(mut self, addr: u64, code: &[u8]) -> Self {
        self.map(addr, code);
        self.registers.insert(Register::Rip, addr);
        self
    }

    pub fn with_path(mut self, path: impl IntoIterator<Item = u64>) -> Self {
        self.path.extend(path);
        self
    }

    /// Answer the first resume not yet answered by an injected stop with `event`.
    pub fn inject(self, event: StopEvent) -> Self {
        let index = (0..).find(|i| !self.injected.contains_key(i)).unwrap();
        self.inject_at(index, event)
    }

    /// Answer resume number `index`, counting from zero, with `event`.
    pub fn inject_at(mut self, index: usize, event: StopEvent) -> Self {
        self.injected.insert(index, event);
        self
    }

    pub fn with_timeouts(mut self, timeouts: usize) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Write `bytes` at `addr`, mapping (as zeros) the rest of every word they touch.
    pub fn map(&mut self, addr: u64, bytes: &[u8]) {
        let first = addr & !7;
        let last = (addr + bytes.len() as u64 + 7) & !7;

        for at in first..last {
            self.memory.entry(at).or_insert(0);
        }

        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *byte);
        }
    }

    pub fn byte(&self, addr: u64) -> u8 {
        self.memory[&addr]
    }

    pub fn ip(&self) -> u64 {
        self.registers.get(&Register::Rip).copied().unwrap_or_default()
    }

    fn set_ip(&mut self, ip: u64) {
        self.registers.insert(Register::Rip, ip);
    }

    fn handle() -> TraceHandle {
        TraceHandle::new(Pid::from_raw(FAKE_PID))
    }

    fn check(&self, handle: TraceHandle) -> Result<()> {
        if self.gone {
            return Err(Error::TraceeDied { pid: handle.pid(), source: Errno::ESRCH });
        }

        Ok(())
    }

    // Execute one instruction, returning the resulting stop if it is not a plain step.
    fn execute(&mut self) -> Option<StopEvent> {
        let ip = self.ip();

        if self.memory.get(&ip) == Some(&TRAP) {
            self.set_ip(ip + 1);
            return Some(StopEvent::Trapped);
        }

        match self.path.pop_front() {
            Some(next) => {
                self.set_ip(next);
                None
            },
            None => Some(StopEvent::Exited(self.exit_code)),
        }
    }
}

impl ProcessControl for FakeTracee {
    fn launch(&mut self, _cmd: Command) -> Result<TraceHandle> {
        Ok(Self::handle())
    }

    fn attach(&mut self, pid: Pid) -> Result<TraceHandle> {
        Ok(TraceHandle::new(pid))
    }

    fn wait_for_stop(&mut self, handle: TraceHandle) -> Result<StopEvent> {
        self.check(handle)?;
        self.waits += 1;

        if self.timeouts > 0 {
            self.timeouts -= 1;
            return Err(Error::WaitTimeout { pid: handle.pid(), timeout: Duration::from_millis(1) });
        }

        let event = match self.pending.take() {
            Some(event) => event,
            None => return Err(Error::Internal("wait on stopped fake tracee".into())),
        };

        if event.is_terminal() {
            self.gone = true;
        }

        Ok(event)
    }

    fn resume(&mut self, handle: TraceHandle, mode: Resume, signal: Option<Signal>) -> Result<()> {
        self.check(handle)?;
        self.resumes.push((mode, signal));

        if self.interrupted {
            self.interrupted = false;
            self.pending = Some(StopEvent::SignalDelivery(Signal::SIGSTOP));
            return Ok(());
        }

        if let Some(event) = self.injected.remove(&(self.resumes.len() - 1)) {
            self.pending = Some(event);
            return Ok(());
        }

        let event = match mode {
            Resume::SingleStep => self.execute().unwrap_or(StopEvent::SteppedOnce),
            Resume::Continue => loop {
                if let Some(event) = self.execute() {
                    break event;
                }
            },
        };

        self.pending = Some(event);

        Ok(())
    }

    fn peek_word(&self, handle: TraceHandle, addr: u64) -> Result<u64> {
        self.check(handle)?;

        let mut bytes = [0; 8];

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = *self.memory.get(&(addr + i as u64)).ok_or(Error::MemoryAccess {
                pid: handle.pid(),
                access: Access::Read,
                addr,
                source: Errno::EIO,
            })?;
        }

        Ok(u64::from_le_bytes(bytes))
    }

    fn poke_word(&mut self, handle: TraceHandle, addr: u64, word: u64) -> Result<()> {
        self.check(handle)?;

        let mapped = (0..8).all(|i| self.memory.contains_key(&(addr + i)));

        if !mapped {
            return Err(Error::MemoryAccess {
                pid: handle.pid(),
                access: Access::Write,
                addr,
                source: Errno::EIO,
            });
        }

        self.map(addr, &word.to_le_bytes());

        Ok(())
    }

    fn peek_register(&self, handle: TraceHandle, register: Register) -> Result<u64> {
        self.check(handle)?;
        Ok(self.registers.get(&register).copied().unwrap_or_default())
    }

    fn poke_register(&mut self, handle: TraceHandle, register: Register, value: u64) -> Result<()> {
        self.check(handle)?;
        self.registers.insert(register, value);
        Ok(())
    }

    // The tracee already ran to its pending stop, so the interrupt lands on the next resume.
    fn interrupt(&mut self, handle: TraceHandle) -> Result<()> {
        self.check(handle)?;
        self.interrupted = true;
        Ok(())
    }

    fn detach(&mut self, handle: TraceHandle) -> Result<()> {
        self.check(handle)?;
        self.detached = true;
        self.gone = true;
        Ok(())
    }

    fn kill(&mut self, handle: TraceHandle) -> Result<()> {
        self.check(handle)?;
        self.killed = true;
        self.gone = true;
        Ok(())
    }
}

/// A report, as seen by [`Recorder`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reported {
    BreakpointHit { addr: u64, rip: u64 },
    WatchHit { addr: u64, rip: u64 },
    AnomalousTrap { ip: u64 },
    Signal(Signal),
    Unexpected(i32),
    Finished(Summary),
}

/// Records reports for inspection after the session is done with them.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    reports: Rc<RefCell<Vec<Reported>>>,
}

impl Recorder {
    pub fn reports(&self) -> Vec<Reported> {
        self.reports.borrow().clone()
    }

    fn push(&self, reported: Reported) -> Result<()> {
        self.reports.borrow_mut().push(reported);
        Ok(())
    }
}

impl Report for Recorder {
    fn breakpoint_hit(&mut self, addr: u64, regs: &RegisterSnapshot) -> Result<()> {
        self.push(Reported::BreakpointHit { addr, rip: regs.instruction_pointer() })
    }

    fn watch_hit(&mut self, addr: u64, regs: &RegisterSnapshot) -> Result<()> {
        self.push(Reported::WatchHit { addr, rip: regs.instruction_pointer() })
    }

    fn anomalous_trap(&mut self, ip: u64) -> Result<()> {
        self.push(Reported::AnomalousTrap { ip })
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        self.push(Reported::Signal(signal))
    }

    fn unexpected_stop(&mut self, raw: i32) -> Result<()> {
        self.push(Reported::Unexpected(raw))
    }

    fn finished(&mut self, _mode: Mode, summary: &Summary) -> Result<()> {
        self.push(Reported::Finished(*summary))
    }
}

/// A counted loop: `nop` at `0x1000`, a conditional jump back at `0x1001`, `ret` at `0x1007`,
/// the last byte mapped.
///
/// Returns the tracee and the loop entry address. Executing it takes `iterations` passes
/// through the conditional jump.
pub fn counted_loop(iterations: usize) -> (FakeTracee, u64) {
    const ENTRY: u64 = 0x1000;
    const JUMP: u64 = 0x1001;
    const RET: u64 = 0x1007;

    let code = [
        0x90, // nop
        0x0f, 0x8c, 0xf9, 0xff, 0xff, 0xff, // jl entry
        0xc3, // ret
    ];

    let mut path = vec![];

    for i in 0..iterations {
        path.push(JUMP);

        if i + 1 < iterations {
            path.push(ENTRY);
        }
    }

    path.push(RET);

    let tracee = FakeTracee::new().with_code(ENTRY, &code).with_path(path);

    (tracee, ENTRY)
}
