use std::fmt;

use crate::control::{ProcessControl, Register, TraceHandle};
use crate::error::Result;

/// Semantic register accessors for a stopped tracee.
///
/// Blanket-implemented for every [`ProcessControl`]. Nothing is cached: registers are
/// volatile once the tracee resumes, so every call reads through.
pub trait RegisterView: ProcessControl {
    fn instruction_pointer(&self, handle: TraceHandle) -> Result<u64> {
        self.peek_register(handle, Register::Rip)
    }

    fn set_instruction_pointer(&mut self, handle: TraceHandle, addr: u64) -> Result<()> {
        self.poke_register(handle, Register::Rip, addr)
    }

    /// Capture the registers of the tracee at its current stop.
    fn dump(&self, handle: TraceHandle) -> Result<RegisterSnapshot> {
        let mut values = [0; Register::COUNT];

        for (value, register) in values.iter_mut().zip(Register::ALL) {
            *value = self.peek_register(handle, register)?;
        }

        Ok(RegisterSnapshot { values })
    }
}

impl<C: ProcessControl + ?Sized> RegisterView for C {}

/// Point-in-time copy of the general-purpose registers of a stopped tracee.
///
/// Only meaningful for the stop it was read at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterSnapshot {
    values: [u64; Register::COUNT],
}

impl RegisterSnapshot {
    pub fn get(&self, register: Register) -> u64 {
        self.values[register.index()]
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.get(Register::Rip)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        Register::ALL.iter().copied().zip(self.values.iter().copied())
    }
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (register, value) in self.iter() {
            writeln!(f, "{:>8} = {:016x}", register.name().to_uppercase(), value)?;
        }

        Ok(())
    }
}
