//! x86-64 register state as seen by the trap handler.

use iced_x86::Register;

/// `EFLAGS.TF`: raise a debug trap after every retired instruction.
pub const TRAP_FLAG: u64 = 0x100;

/// General-purpose registers, in encoding order (`rax`, `rcx`, `rdx`, `rbx`, `rsp`,
/// `rbp`, `rsi`, `rdi`, `r8`..`r15`), and the instruction pointer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RegisterContext {
    pub gprs: [u64; 16],
    pub rip: u64,
}

impl RegisterContext {
    pub fn new(rip: u64) -> Self {
        Self { gprs: [0; 16], rip }
    }

    /// Set a 64-bit general-purpose register.
    pub fn set(&mut self, reg: Register, value: u64) {
        if reg.is_gpr64() {
            self.gprs[reg.number()] = value;
        } else if reg == Register::RIP {
            self.rip = value;
        }
    }

    /// Value of a register used in address computation.
    ///
    /// The flat segments have a zero base. `fs` and `gs` are `None`: their bases are not
    /// part of the signal context.
    pub fn value(&self, reg: Register) -> Option<u64> {
        match reg {
            Register::ES | Register::CS | Register::SS | Register::DS => Some(0),
            Register::RIP => Some(self.rip),
            Register::EIP => Some(self.rip & 0xffff_ffff),
            r if r.is_gpr64() => Some(self.gprs[r.number()]),
            r if r.is_gpr32() => Some(self.gprs[r.full_register().number()] & 0xffff_ffff),
            _ => None,
        }
    }

    /// Capture the interrupted thread's registers from a signal context.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn from_ucontext(context: &libc::ucontext_t) -> Self {
        let gregs = &context.uc_mcontext.gregs;
        let reg = |index: libc::c_int| gregs[index as usize] as u64;

        Self {
            gprs: [
                reg(libc::REG_RAX),
                reg(libc::REG_RCX),
                reg(libc::REG_RDX),
                reg(libc::REG_RBX),
                reg(libc::REG_RSP),
                reg(libc::REG_RBP),
                reg(libc::REG_RSI),
                reg(libc::REG_RDI),
                reg(libc::REG_R8),
                reg(libc::REG_R9),
                reg(libc::REG_R10),
                reg(libc::REG_R11),
                reg(libc::REG_R12),
                reg(libc::REG_R13),
                reg(libc::REG_R14),
                reg(libc::REG_R15),
            ],
            rip: reg(libc::REG_RIP),
        }
    }
}

/// Clear the trap flag that will be restored when the handler returns.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn clear_trap_flag(context: &mut libc::ucontext_t) {
    let eflags = &mut context.uc_mcontext.gregs[libc::REG_EFL as usize];
    *eflags &= !(TRAP_FLAG as libc::greg_t);
}

/// Offset of `eflags` in the virtual `user` struct read by `PTRACE_PEEKUSER`.
#[cfg(target_arch = "x86_64")]
pub(crate) fn eflags_user_offset() -> u64 {
    (memoffset::offset_of!(libc::user, regs) + memoffset::offset_of!(libc::user_regs_struct, eflags)) as u64
}
