use core::arch::asm;

use super::unwindregs::UnwindRegsAarch64;

/// Captures the registers of the function this is inlined into. The
/// program counter is exact and points into that function.
#[inline(always)]
pub fn capture_context() -> UnwindRegsAarch64 {
    let mut values = [0u64; 33];
    // The asm only stores into `values`, which is large enough for every
    // slot written.
    unsafe {
        asm!(
            "stp x0, x1, [{regs}, #0x00]",
            "stp x2, x3, [{regs}, #0x10]",
            "stp x4, x5, [{regs}, #0x20]",
            "stp x6, x7, [{regs}, #0x30]",
            "stp x8, x9, [{regs}, #0x40]",
            "stp x10, x11, [{regs}, #0x50]",
            "stp x12, x13, [{regs}, #0x60]",
            "stp x14, x15, [{regs}, #0x70]",
            "stp x16, x17, [{regs}, #0x80]",
            "stp x18, x19, [{regs}, #0x90]",
            "stp x20, x21, [{regs}, #0xa0]",
            "stp x22, x23, [{regs}, #0xb0]",
            "stp x24, x25, [{regs}, #0xc0]",
            "stp x26, x27, [{regs}, #0xd0]",
            "stp x28, x29, [{regs}, #0xe0]",
            "str x30, [{regs}, #0xf0]",
            "mov {tmp}, sp",
            "str {tmp}, [{regs}, #0xf8]",
            "adr {tmp}, #0",
            "str {tmp}, [{regs}, #0x100]",
            regs = in(reg) values.as_mut_ptr(),
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
    UnwindRegsAarch64::from_values(values)
}
