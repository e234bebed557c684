use core::fmt::Debug;

use gimli::{Register, X86_64};

use crate::display_utils::MaybeHexNum;
use crate::unwindregs::{DwarfUnwindRegs, RegisterSet};

/// The general purpose registers rax..r15 and the instruction pointer,
/// indexed by DWARF register number (the instruction pointer sits in the
/// return address column 16).
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindRegsX86_64 {
    regs: RegisterSet<17>,
}

impl UnwindRegsX86_64 {
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        let mut regs = RegisterSet::new();
        regs.set(X86_64::RA.0 as usize, ip);
        regs.set(X86_64::RSP.0 as usize, sp);
        regs.set(X86_64::RBP.0 as usize, bp);
        Self { regs }
    }

    /// All registers known, in DWARF order.
    pub fn from_values(values: [u64; 17]) -> Self {
        Self {
            regs: RegisterSet::from_values(values),
        }
    }

    #[inline(always)]
    pub fn ip(&self) -> u64 {
        self.regs.get(X86_64::RA.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_ip(&mut self, ip: u64) {
        self.regs.set(X86_64::RA.0 as usize, ip);
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.regs.get(X86_64::RSP.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_sp(&mut self, sp: u64) {
        self.regs.set(X86_64::RSP.0 as usize, sp);
    }

    #[inline(always)]
    pub fn bp(&self) -> u64 {
        self.regs.get(X86_64::RBP.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_bp(&mut self, bp: u64) {
        self.regs.set(X86_64::RBP.0 as usize, bp);
    }
}

impl DwarfUnwindRegs for UnwindRegsX86_64 {
    fn get(&self, register: Register) -> Option<u64> {
        self.regs.get(register.0 as usize)
    }

    fn set(&mut self, register: Register, value: u64) -> bool {
        self.regs.set(register.0 as usize, value)
    }

    fn clear(&mut self, register: Register) {
        self.regs.clear(register.0 as usize)
    }
}

#[cfg(target_arch = "x86_64")]
pub type UnwindRegsNative = UnwindRegsX86_64;

impl Debug for UnwindRegsX86_64 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let get = |r: Register| MaybeHexNum(self.regs.get(r.0 as usize));
        f.debug_struct("UnwindRegsX86_64")
            .field("ip", &get(X86_64::RA))
            .field("sp", &get(X86_64::RSP))
            .field("bp", &get(X86_64::RBP))
            .field("bx", &get(X86_64::RBX))
            .field("r12", &get(X86_64::R12))
            .field("r13", &get(X86_64::R13))
            .field("r14", &get(X86_64::R14))
            .field("r15", &get(X86_64::R15))
            .finish()
    }
}
