use core::arch::asm;

use super::unwindregs::UnwindRegsX86_64;

/// Captures the registers of the function this is inlined into. The
/// instruction pointer is exact and points into that function.
#[inline(always)]
pub fn capture_context() -> UnwindRegsX86_64 {
    let mut values = [0u64; 17];
    // The asm only stores into `values`, which is large enough for every
    // slot written.
    unsafe {
        asm!(
            "mov [{regs} + 0*8], rax",
            "mov [{regs} + 1*8], rdx",
            "mov [{regs} + 2*8], rcx",
            "mov [{regs} + 3*8], rbx",
            "mov [{regs} + 4*8], rsi",
            "mov [{regs} + 5*8], rdi",
            "mov [{regs} + 6*8], rbp",
            "mov [{regs} + 7*8], rsp",
            "mov [{regs} + 8*8], r8",
            "mov [{regs} + 9*8], r9",
            "mov [{regs} + 10*8], r10",
            "mov [{regs} + 11*8], r11",
            "mov [{regs} + 12*8], r12",
            "mov [{regs} + 13*8], r13",
            "mov [{regs} + 14*8], r14",
            "mov [{regs} + 15*8], r15",
            "lea {tmp}, [rip + 0]",
            "mov [{regs} + 16*8], {tmp}",
            regs = in(reg) values.as_mut_ptr(),
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
    UnwindRegsX86_64::from_values(values)
}
