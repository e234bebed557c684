use gimli::{Register, X86_64};

use super::arch::ArchX86_64;
use super::unwindregs::UnwindRegsX86_64;
use crate::add_signed::offset_address;
use crate::code_address::CodeAddress;
use crate::error::Error;
use crate::special_frames::SpecialFrameUnwinding;
use crate::unwindregs::DwarfUnwindRegs;

/// Offset of `uc_mcontext.gregs` in the kernel's `ucontext`, which the stack
/// pointer points at when the handler has returned into `__restore_rt`.
const UCONTEXT_GREGS: i64 = 0x28;

/// `gregs` slots in kernel order, as DWARF registers.
const GREGS: [Register; 17] = [
    X86_64::R8,
    X86_64::R9,
    X86_64::R10,
    X86_64::R11,
    X86_64::R12,
    X86_64::R13,
    X86_64::R14,
    X86_64::R15,
    X86_64::RDI,
    X86_64::RSI,
    X86_64::RBP,
    X86_64::RBX,
    X86_64::RDX,
    X86_64::RAX,
    X86_64::RCX,
    X86_64::RSP,
    X86_64::RA,
];

impl SpecialFrameUnwinding for ArchX86_64 {
    fn unwind_plt_stub<F>(
        position: usize,
        regs: &mut UnwindRegsX86_64,
        read_word: &mut F,
    ) -> Result<CodeAddress, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>,
    {
        let sp = regs.get(X86_64::RSP).ok_or(Error::RegisterUnavailable(X86_64::RSP.0))?;
        // The last instruction runs after `push $n`.
        let return_address_offset = if position == 2 { 8 } else { 0 };
        let return_address_address = offset_address(sp, return_address_offset)?;
        let return_address = read_word(return_address_address)?;
        regs.set_sp(offset_address(return_address_address, 8)?);
        regs.set_ip(return_address);
        Ok(CodeAddress::ReturnAddress(return_address))
    }

    fn unwind_signal_frame<F>(
        regs: &mut UnwindRegsX86_64,
        read_word: &mut F,
    ) -> Result<CodeAddress, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>,
    {
        let sp = regs.get(X86_64::RSP).ok_or(Error::RegisterUnavailable(X86_64::RSP.0))?;
        let gregs = offset_address(sp, UCONTEXT_GREGS)?;
        let mut restored = UnwindRegsX86_64::default();
        for (slot, register) in (0i64..).zip(GREGS) {
            let value = read_word(offset_address(gregs, slot * 8)?)?;
            restored.set(register, value);
        }
        *regs = restored;
        Ok(CodeAddress::InstructionPointer(regs.ip()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stack_reader(base: u64, stack: &[u64]) -> impl FnMut(u64) -> Result<u64, Error> + '_ {
        move |address| {
            address
                .checked_sub(base)
                .filter(|offset| offset % 8 == 0)
                .and_then(|offset| stack.get((offset / 8) as usize))
                .cloned()
                .ok_or(Error::UnreadableMemory(address))
        }
    }

    #[test]
    fn test_plt_stub_before_and_after_push() {
        let stack = [0x401234, 0x555, 0x0];
        let mut read_word = stack_reader(0x7000, &stack);
        for position in [0, 1] {
            let mut regs = UnwindRegsX86_64::new(0x1030, 0x7000, 0x7100);
            let ra = ArchX86_64::unwind_plt_stub(position, &mut regs, &mut read_word).unwrap();
            assert_eq!(ra, CodeAddress::ReturnAddress(0x401234));
            assert_eq!(regs.sp(), 0x7008);
            assert_eq!(regs.ip(), 0x401234);
            assert_eq!(regs.bp(), 0x7100);
        }

        // `push $0` has executed, the index sits below the return address.
        let stack = [0x0, 0x401234, 0x0];
        let mut read_word = stack_reader(0x7000, &stack);
        let mut regs = UnwindRegsX86_64::new(0x103b, 0x7000, 0x7100);
        let ra = ArchX86_64::unwind_plt_stub(2, &mut regs, &mut read_word).unwrap();
        assert_eq!(ra, CodeAddress::ReturnAddress(0x401234));
        assert_eq!(regs.sp(), 0x7010);
    }

    #[test]
    fn test_signal_frame() {
        // uc_flags, uc_link, uc_stack (3 words), then gregs.
        let mut stack = [0u64; 5 + 23];
        for (i, slot) in stack[5..22].iter_mut().enumerate() {
            *slot = 0x1000 + i as u64;
        }
        stack[5 + 15] = 0x7ff0_0000; // rsp
        stack[5 + 16] = 0x40_5000; // rip
        let mut read_word = stack_reader(0x9000, &stack);
        let mut regs = UnwindRegsX86_64::new(0x7f00_1230, 0x9000, 0);
        let ip = ArchX86_64::unwind_signal_frame(&mut regs, &mut read_word).unwrap();
        assert_eq!(ip, CodeAddress::InstructionPointer(0x40_5000));
        assert_eq!(regs.sp(), 0x7ff0_0000);
        assert_eq!(regs.get(X86_64::R8), Some(0x1000));
        assert_eq!(regs.get(X86_64::R15), Some(0x1007));
        assert_eq!(regs.get(X86_64::RDI), Some(0x1008));
        assert_eq!(regs.bp(), 0x100a);
        assert_eq!(regs.get(X86_64::RBX), Some(0x100b));
        assert_eq!(regs.get(X86_64::RAX), Some(0x100d));
        assert_eq!(regs.get(X86_64::RCX), Some(0x100e));
    }

    #[test]
    fn test_signal_frame_unreadable() {
        let stack = [0u64; 8];
        let mut read_word = stack_reader(0x9000, &stack);
        let mut regs = UnwindRegsX86_64::new(0x7f00_1230, 0x9000, 0x42);
        assert_eq!(
            ArchX86_64::unwind_signal_frame(&mut regs, &mut read_word),
            Err(Error::UnreadableMemory(0x9040))
        );
        // Nothing was modified.
        assert_eq!(regs.bp(), 0x42);
    }
}
