use super::arch::ArchAarch64;
use crate::address_space::ByteOrder;
use crate::error::Error;
use crate::instruction_analysis::{match_window, InstructionAnalysis};

/// `(mask, value)` for each instruction of a PLT entry:
///
/// ```text
/// adrp x16, #page
/// ldr  x17, [x16, #pageoff]
/// add  x16, x16, #pageoff
/// br   x17
/// ```
///
/// The masks keep the opcode and register fields and drop the immediates.
const PLT_STUB: [(u32, u32); 4] = [
    (0x9f00_001f, 0x9000_0010),
    (0xffc0_03ff, 0xf940_0211),
    (0xff80_03ff, 0x9100_0210),
    (0xffff_ffff, 0xd61f_0220),
];
const PLT_STUB_OFFSETS: [u64; 4] = [0, 4, 8, 12];

/// `__kernel_rt_sigreturn`: `mov x8, #139; svc #0`
const SIGRETURN: [u32; 2] = [0xd280_1168, 0xd400_0001];
const SIGRETURN_OFFSETS: [u64; 2] = [0, 4];

fn instruction(bytes: &[u8], index: usize) -> u32 {
    let i = index * 4;
    u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
}

fn is_plt_stub(bytes: &[u8; 16]) -> bool {
    PLT_STUB
        .iter()
        .enumerate()
        .all(|(i, &(mask, value))| instruction(bytes, i) & mask == value)
}

fn is_sigreturn(bytes: &[u8; 8]) -> bool {
    instruction(bytes, 0) == SIGRETURN[0] && instruction(bytes, 1) == SIGRETURN[1]
}

impl InstructionAnalysis for ArchAarch64 {
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
        if ip % 4 != 0 {
            return Ok(None);
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
        if ip % 4 != 0 {
            return Ok(None);
        }
        Ok(match_window(
            ip,
            &SIGRETURN_OFFSETS,
            byte_order,
            read_word,
            is_sigreturn,
        ))
    }
}
