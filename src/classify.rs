//! Best-effort recognition of jump instructions from their leading opcode bytes.
//!
//! This is not a decoder. It only answers whether the bytes at an address begin a
//! conditional jump, using fixed opcode ranges, and does not look at operands, prefixes or
//! targets. Unconditional, indirect and prefixed jumps are not counted.

use std::ops::RangeInclusive;

use crate::breakpoint::BreakpointManager;
use crate::control::{ProcessControl, TraceHandle};
use crate::error::Result;
use crate::memory::MemoryPatcher;

/// Classification of the instruction at an address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Jump {
    NotAJump,

    /// One-byte opcode form.
    ShortJump,

    /// Escape byte followed by a second opcode byte.
    ExtendedJump,
}

impl Jump {
    pub fn is_jump(&self) -> bool {
        !matches!(self, Jump::NotAJump)
    }
}

/// Opcode ranges identifying jumps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JumpTable {
    /// First bytes of short jumps.
    pub short: RangeInclusive<u8>,

    /// First byte of extended jumps.
    pub escape: u8,

    /// Second bytes of extended jumps.
    pub extended: RangeInclusive<u8>,
}

impl JumpTable {
    /// x86-64 `Jcc rel8` (`70`–`7f`) and `Jcc rel32` (`0f 80`–`0f 8f`).
    pub const X86_64: JumpTable = JumpTable {
        short: 0x70..=0x7f,
        escape: 0x0f,
        extended: 0x80..=0x8f,
    };

    /// Like [`JumpTable::X86_64`], but only recognizing `0f 83`–`0f 87` as extended jumps.
    ///
    /// Matches the counts of older single-step jump counters.
    pub const LEGACY: JumpTable = JumpTable {
        short: 0x70..=0x7f,
        escape: 0x0f,
        extended: 0x83..=0x87,
    };

    /// Classify the instruction beginning at `bytes[0]`.
    pub fn classify(&self, bytes: &[u8]) -> Jump {
        match bytes {
            [first, ..] if self.short.contains(first) => Jump::ShortJump,
            [first, second, ..] if *first == self.escape && self.extended.contains(second) => Jump::ExtendedJump,
            _ => Jump::NotAJump,
        }
    }
}

impl Default for JumpTable {
    fn default() -> Self {
        JumpTable::X86_64
    }
}

/// Classifies tracee instructions in place.
///
/// Only the bytes the table needs are read: the second byte is fetched only after an escape
/// byte, so a one-byte instruction at the very end of a mapping can still be classified.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstructionClassifier {
    table: JumpTable,
}

impl InstructionClassifier {
    pub fn new(table: JumpTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &JumpTable {
        &self.table
    }

    /// Classify the instruction at `addr` in the tracee.
    pub fn classify_at<C>(&self, control: &C, handle: TraceHandle, addr: u64) -> Result<Jump>
    where
        C: ProcessControl + ?Sized,
    {
        let bytes = self.opcode(control, handle, addr, None)?;

        Ok(self.table.classify(&bytes))
    }

    /// Classify the instruction at `addr`, seeing through any installed breakpoints.
    pub fn classify_shadowed<C>(
        &self,
        control: &C,
        handle: TraceHandle,
        addr: u64,
        breakpoints: &BreakpointManager,
    ) -> Result<Jump>
    where
        C: ProcessControl + ?Sized,
    {
        let bytes = self.opcode(control, handle, addr, Some(breakpoints))?;

        Ok(self.table.classify(&bytes))
    }

    fn opcode<C>(
        &self,
        control: &C,
        handle: TraceHandle,
        addr: u64,
        breakpoints: Option<&BreakpointManager>,
    ) -> Result<Vec<u8>>
    where
        C: ProcessControl + ?Sized,
    {
        let mut bytes = vec![];

        for at in [addr, addr.wrapping_add(1)] {
            let mut byte = control.read_bytes(handle, at, 1)?;

            if let Some(breakpoints) = breakpoints {
                breakpoints.shadow(at, &mut byte);
            }

            bytes.extend(byte);

            if bytes[0] != self.table.escape {
                break;
            }
        }

        Ok(bytes)
    }
}
