use super::arch::ArchX86_64;
use crate::address_space::ByteOrder;
use crate::error::Error;
use crate::instruction_analysis::{match_window, InstructionAnalysis};

/// `jmp *disp32(%rip); push $imm32; jmp rel32`
const PLT_STUB_OFFSETS: [u64; 3] = [0, 6, 11];
const PLT_STUB_LEN: usize = 16;

/// `__restore_rt`: `mov $15, %rax; syscall` (rt_sigreturn)
const SIGRETURN: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];
const SIGRETURN_OFFSETS: [u64; 2] = [0, 7];

fn is_plt_stub(bytes: &[u8; PLT_STUB_LEN]) -> bool {
    bytes[0] == 0xff && bytes[1] == 0x25 && bytes[6] == 0x68 && bytes[11] == 0xe9
}

impl InstructionAnalysis for ArchX86_64 {
    fn plt_stub_position<F>(
        ip: u64,
        byte_order: ByteOrder,
        read_word: &mut F,
    ) -> Result<Option<usize>, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>,
    {
        if byte_order != ByteOrder::Little {
            return Err(Error::UnsupportedByteOrder);
        }
        Ok(match_window(
            ip,
            &PLT_STUB_OFFSETS,
            byte_order,
            read_word,
            is_plt_stub,
        ))
    }

    fn signal_trampoline_position<F>(
        ip: u64,
        byte_order: ByteOrder,
        read_word: &mut F,
    ) -> Result<Option<usize>, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>,
    {
        if byte_order != ByteOrder::Little {
            return Err(Error::UnsupportedByteOrder);
        }
        Ok(match_window(
            ip,
            &SIGRETURN_OFFSETS,
            byte_order,
            read_word,
            |bytes: &[u8; 9]| *bytes == SIGRETURN,
        ))
    }
}
