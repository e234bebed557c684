use core::fmt::Debug;

use gimli::{Register, Vendor};

use crate::unwindregs::DwarfUnwindRegs;

/// Everything the architecture-independent parts of the unwinder need to
/// know about a target architecture's registers.
///
/// Register numbers are DWARF register numbers throughout.
pub trait Arch {
    type UnwindRegs: DwarfUnwindRegs + Clone + Debug + Default + PartialEq;

    const NAME: &'static str;

    /// Registers `0..REGISTER_COUNT` are part of the register file.
    const REGISTER_COUNT: u16;

    const SP: Register;

    /// The register file slot that holds the instruction pointer.
    const IP: Register;

    /// The return address column used by compilers for this architecture.
    const RETURN_ADDRESS: Register;

    /// How vendor-specific CFA opcodes are decoded.
    const VENDOR: Vendor = Vendor::Default;

    /// Registers that must be readable when a cursor is bound.
    fn required_registers() -> [Register; 2] {
        [Self::IP, Self::SP]
    }

    /// Removes pointer authentication bits from a signed return address.
    fn strip_return_address(address: u64, _ptr_auth_mask: u64) -> u64 {
        address
    }
}
