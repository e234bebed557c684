use gimli::{AArch64, Register};

use super::arch::{ArchAarch64, PC};
use super::unwindregs::UnwindRegsAarch64;
use crate::add_signed::offset_address;
use crate::code_address::CodeAddress;
use crate::error::Error;
use crate::special_frames::SpecialFrameUnwinding;
use crate::unwindregs::DwarfUnwindRegs;

/// `sizeof(siginfo_t)` plus the offset of `uc_mcontext` in the kernel's
/// `ucontext`; the stack pointer points at the `rt_sigframe` when the handler
/// has returned into `__kernel_rt_sigreturn`.
const SIGCONTEXT: i64 = 128 + 0xb0;
const SIGCONTEXT_REGS: i64 = 0x8;
const SIGCONTEXT_SP: i64 = 0x100;
const SIGCONTEXT_PC: i64 = 0x108;

impl SpecialFrameUnwinding for ArchAarch64 {
    fn unwind_plt_stub<F>(
        _position: usize,
        regs: &mut UnwindRegsAarch64,
        _read_word: &mut F,
    ) -> Result<CodeAddress, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>,
    {
        // The stub doesn't touch the stack or the link register.
        let lr = regs
            .get(AArch64::X30)
            .ok_or(Error::RegisterUnavailable(AArch64::X30.0))?;
        regs.set_pc(lr);
        Ok(CodeAddress::ReturnAddress(lr))
    }

    fn unwind_signal_frame<F>(
        regs: &mut UnwindRegsAarch64,
        read_word: &mut F,
    ) -> Result<CodeAddress, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>,
    {
        let sp = regs
            .get(AArch64::SP)
            .ok_or(Error::RegisterUnavailable(AArch64::SP.0))?;
        let sc = offset_address(sp, SIGCONTEXT)?;
        let mut restored = UnwindRegsAarch64::default();
        for n in 0..=30u16 {
            let value = read_word(offset_address(sc, SIGCONTEXT_REGS + 8 * i64::from(n))?)?;
            restored.set(Register(n), value);
        }
        restored.set(AArch64::SP, read_word(offset_address(sc, SIGCONTEXT_SP)?)?);
        restored.set(PC, read_word(offset_address(sc, SIGCONTEXT_PC)?)?);
        *regs = restored;
        Ok(CodeAddress::InstructionPointer(regs.pc()))
    }
}
