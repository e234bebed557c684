use gimli::{AArch64, Register, Vendor};

use super::unwindregs::{strip_ptr_auth, UnwindRegsAarch64};
use crate::arch::Arch;

pub struct ArchAarch64;
impl Arch for ArchAarch64 {
    type UnwindRegs = UnwindRegsAarch64;

    const NAME: &'static str = "aarch64";
    const REGISTER_COUNT: u16 = 33;
    const SP: Register = AArch64::SP;
    const IP: Register = PC;
    const RETURN_ADDRESS: Register = AArch64::X30;
    const VENDOR: Vendor = Vendor::AArch64;

    fn strip_return_address(address: u64, ptr_auth_mask: u64) -> u64 {
        strip_ptr_auth(address, ptr_auth_mask)
    }
}

/// The register file slot for the program counter. DWARF has no rule column
/// for it; it is set from the return address column when unwinding.
pub const PC: Register = Register(32);
