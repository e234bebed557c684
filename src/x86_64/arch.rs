use gimli::Register;

use super::unwindregs::UnwindRegsX86_64;
use crate::arch::Arch;

pub struct ArchX86_64;
impl Arch for ArchX86_64 {
    type UnwindRegs = UnwindRegsX86_64;

    const NAME: &'static str = "x86_64";
    const REGISTER_COUNT: u16 = 17;
    const SP: Register = gimli::X86_64::RSP;
    const IP: Register = gimli::X86_64::RA;
    const RETURN_ADDRESS: Register = gimli::X86_64::RA;
}
