//! Software breakpoints, installed by patching a trap opcode over tracee code.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::{debug, warn};

use crate::control::{ProcessControl, Resume, StopEvent, TraceHandle};
use crate::error::{Error, Result};
use crate::memory::MemoryPatcher;
use crate::registers::RegisterView;

/// Trap instruction (`int3`) patched in for software breakpoints.
pub const TRAP_OPCODE: [u8; 1] = [0xcc];

/// Number of bytes replaced by a breakpoint, and by which a trap advances the instruction
/// pointer.
pub const TRAP_LEN: usize = TRAP_OPCODE.len();

/// A software breakpoint and the code bytes it displaced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    address: u64,
    original: [u8; TRAP_LEN],
    installed: bool,
}

impl Breakpoint {
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Bytes present at the address before the trap was written.
    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Owns every breakpoint of one tracee, keyed by address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BreakpointManager {
    breakpoints: BTreeMap<u64, Breakpoint>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the code at `addr` and patch a trap over it.
    pub fn set_breakpoint<C>(&mut self, control: &mut C, handle: TraceHandle, addr: u64) -> Result<()>
    where
        C: ProcessControl + ?Sized,
    {
        let entry = match self.breakpoints.entry(addr) {
            Entry::Occupied(_) => return Err(Error::AlreadySet { addr }),
            Entry::Vacant(entry) => entry,
        };

        let mut original = [0; TRAP_LEN];
        original.copy_from_slice(&control.read_bytes(handle, addr, TRAP_LEN)?);

        control.write_bytes(handle, addr, &TRAP_OPCODE)?;

        debug!(addr = %format!("0x{addr:x}"), ?original, "set breakpoint");

        entry.insert(Breakpoint { address: addr, original, installed: true });

        Ok(())
    }

    /// Write the saved code back at `addr` and forget the breakpoint.
    ///
    /// The record is kept if the restore fails, so it can be retried.
    pub fn remove_breakpoint<C>(&mut self, control: &mut C, handle: TraceHandle, addr: u64) -> Result<Breakpoint>
    where
        C: ProcessControl + ?Sized,
    {
        let bp = self.breakpoints.get_mut(&addr).ok_or(Error::NotSet { addr })?;

        if bp.installed {
            control.write_bytes(handle, addr, &bp.original)?;
            bp.installed = false;
        }

        debug!(addr = %format!("0x{addr:x}"), "removed breakpoint");

        self.breakpoints.remove(&addr).ok_or(Error::NotSet { addr })
    }

    /// Execute the instruction displaced by the breakpoint at `addr` exactly once, then
    /// re-install the trap.
    ///
    /// Must be called while the tracee is stopped on the trap at `addr`. The steps are, in
    /// order: restore the original code, rewind the instruction pointer to `addr`, single-step,
    /// re-install the trap. Any stop observed between restore and re-install belongs to the
    /// forced step. A signal that arrives before the instruction runs is re-injected with
    /// another single-step, with the trap still removed.
    ///
    /// Returns the stop that ended the step. If the tracee died during the step, the trap is
    /// not re-installed and the record is left uninstalled.
    pub fn step_over_and_rearm<C>(&mut self, control: &mut C, handle: TraceHandle, addr: u64) -> Result<StopEvent>
    where
        C: ProcessControl + ?Sized,
    {
        let bp = self.breakpoints.get_mut(&addr).ok_or(Error::NotSet { addr })?;

        if bp.installed {
            control.write_bytes(handle, addr, &bp.original)?;
            bp.installed = false;
        }

        control.set_instruction_pointer(handle, addr)?;

        let mut signal = None;

        let event = loop {
            control.resume(handle, Resume::SingleStep, signal.take())?;

            match control.wait_for_stop(handle)? {
                StopEvent::Trapped => break StopEvent::SteppedOnce,
                StopEvent::SignalDelivery(pending) => {
                    debug!(addr = %format!("0x{addr:x}"), ?pending, "signal during step over breakpoint");
                    signal = Some(pending);
                },
                event => break event,
            }
        };

        match event {
            StopEvent::SteppedOnce => {
                control.write_bytes(handle, addr, &TRAP_OPCODE)?;
                bp.installed = true;
            },
            _ => {
                warn!(addr = %format!("0x{addr:x}"), ?event, "breakpoint left uninstalled after step");
            },
        }

        debug!(addr = %format!("0x{addr:x}"), ?event, "stepped over breakpoint");

        Ok(event)
    }

    /// Restore the original code under every installed breakpoint, keeping the records.
    ///
    /// Used before letting the tracee run untraced.
    pub fn restore_all<C>(&mut self, control: &mut C, handle: TraceHandle) -> Result<()>
    where
        C: ProcessControl + ?Sized,
    {
        for bp in self.breakpoints.values_mut().filter(|bp| bp.installed) {
            control.write_bytes(handle, bp.address, &bp.original)?;
            bp.installed = false;
        }

        Ok(())
    }

    /// Return the breakpoint whose trap was just executed, given the instruction pointer
    /// reported at a trap stop.
    pub fn hit_at(&self, ip: u64) -> Option<&Breakpoint> {
        let addr = ip.checked_sub(TRAP_LEN as u64)?;

        self.breakpoints.get(&addr).filter(|bp| bp.installed)
    }

    /// Replace any trap opcodes in `bytes`, read from `addr`, with the code they displaced.
    pub fn shadow(&self, addr: u64, bytes: &mut [u8]) {
        let end = addr.saturating_add(bytes.len() as u64);
        let first = addr.saturating_sub(TRAP_LEN as u64 - 1);

        for bp in self.breakpoints.range(first..end).map(|(_, bp)| bp) {
            if !bp.installed {
                continue;
            }

            for (i, byte) in bp.original.iter().enumerate() {
                let at = bp.address + i as u64;

                if at >= addr && at < end {
                    bytes[(at - addr) as usize] = *byte;
                }
            }
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.breakpoints.contains_key(&addr)
    }

    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}
