use memoffset::offset_of;

use crate::control::Register;

impl Register {
    /// Return the offset of the register in the virtual `user` struct, for use with
    /// `PTRACE_PEEKUSER` and `PTRACE_POKEUSER`.
    pub(crate) fn user_offset(self) -> u64 {
        let field = match self {
            Register::Rip => offset_of!(libc::user_regs_struct, rip),
            Register::Rax => offset_of!(libc::user_regs_struct, rax),
            Register::OrigRax => offset_of!(libc::user_regs_struct, orig_rax),
            Register::Rbx => offset_of!(libc::user_regs_struct, rbx),
            Register::Rcx => offset_of!(libc::user_regs_struct, rcx),
            Register::Rdx => offset_of!(libc::user_regs_struct, rdx),
            Register::Rsi => offset_of!(libc::user_regs_struct, rsi),
            Register::Rdi => offset_of!(libc::user_regs_struct, rdi),
            Register::Rbp => offset_of!(libc::user_regs_struct, rbp),
            Register::Rsp => offset_of!(libc::user_regs_struct, rsp),
            Register::Eflags => offset_of!(libc::user_regs_struct, eflags),
        };

        (offset_of!(libc::user, regs) + field) as u64
    }
}
