use core::fmt::Debug;

use gimli::{AArch64, Register};

use super::arch::PC;
use crate::display_utils::MaybeHexNum;
use crate::unwindregs::{DwarfUnwindRegs, RegisterSet};

/// x0..x30, sp and pc, indexed by DWARF register number (pc in slot 32).
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct UnwindRegsAarch64 {
    regs: RegisterSet<33>,
}

/// With pointer authentication, the high bits of a signed return address are
/// a hash rather than address bits. `mask` has those bits set; the cursor
/// gets it from the address space or from the client.
#[inline(always)]
pub fn strip_ptr_auth(ptr: u64, mask: u64) -> u64 {
    ptr & !mask
}

impl UnwindRegsAarch64 {
    pub fn new(pc: u64, lr: u64, sp: u64, fp: u64) -> Self {
        let mut regs = RegisterSet::new();
        regs.set(PC.0 as usize, pc);
        regs.set(AArch64::X30.0 as usize, lr);
        regs.set(AArch64::SP.0 as usize, sp);
        regs.set(AArch64::X29.0 as usize, fp);
        Self { regs }
    }

    /// All registers known: x0..x30, sp, pc.
    pub fn from_values(values: [u64; 33]) -> Self {
        Self {
            regs: RegisterSet::from_values(values),
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.regs.get(PC.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_pc(&mut self, pc: u64) {
        self.regs.set(PC.0 as usize, pc);
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.regs.get(AArch64::SP.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_sp(&mut self, sp: u64) {
        self.regs.set(AArch64::SP.0 as usize, sp);
    }

    #[inline(always)]
    pub fn fp(&self) -> u64 {
        self.regs.get(AArch64::X29.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_fp(&mut self, fp: u64) {
        self.regs.set(AArch64::X29.0 as usize, fp);
    }

    #[inline(always)]
    pub fn lr(&self) -> u64 {
        self.regs.get(AArch64::X30.0 as usize).unwrap_or(0)
    }
    #[inline(always)]
    pub fn set_lr(&mut self, lr: u64) {
        self.regs.set(AArch64::X30.0 as usize, lr);
    }
}

impl DwarfUnwindRegs for UnwindRegsAarch64 {
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

#[cfg(target_arch = "aarch64")]
pub type UnwindRegsNative = UnwindRegsAarch64;

impl Debug for UnwindRegsAarch64 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let get = |r: Register| MaybeHexNum(self.regs.get(r.0 as usize));
        f.debug_struct("UnwindRegsAarch64")
            .field("pc", &get(PC))
            .field("lr", &get(AArch64::X30))
            .field("sp", &get(AArch64::SP))
            .field("fp", &get(AArch64::X29))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_strip_ptr_auth() {
        let mask = 0xff7f_0000_0000_0000;
        assert_eq!(strip_ptr_auth(0x002a_0000_0040_1234, mask), 0x40_1234);
        assert_eq!(strip_ptr_auth(0x40_1234, mask), 0x40_1234);
        assert_eq!(strip_ptr_auth(0x002a_0000_0040_1234, 0), 0x002a_0000_0040_1234);
    }

    #[test]
    fn test_named_registers() {
        let mut regs = UnwindRegsAarch64::new(0x1000, 0x2000, 0x3000, 0x4000);
        assert_eq!(regs.get(Register(32)), Some(0x1000));
        assert_eq!(regs.get(AArch64::X30), Some(0x2000));
        assert_eq!(regs.get(AArch64::SP), Some(0x3000));
        assert_eq!(regs.get(AArch64::X29), Some(0x4000));
        assert_eq!(regs.get(AArch64::X19), None);
        regs.set_lr(0x2222);
        assert_eq!(regs.lr(), 0x2222);
        assert!(!regs.set(Register(33), 1));
    }
}
