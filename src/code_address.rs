/// The instruction pointer of a frame, together with how it was obtained.
///
/// For every frame but the innermost one, and except right after a signal
/// frame, the address is a return address: it points after the call
/// instruction, possibly at the first instruction of a different function or
/// outside any CFI range. Lookups therefore use the address minus one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeAddress {
    /// The exact address of the instruction that was executing or is about
    /// to execute.
    InstructionPointer(u64),
    /// An address that a call returns to.
    ReturnAddress(u64),
}

impl CodeAddress {
    pub fn address(self) -> u64 {
        match self {
            CodeAddress::InstructionPointer(address) => address,
            CodeAddress::ReturnAddress(address) => address,
        }
    }

    pub fn address_for_lookup(self) -> u64 {
        match self {
            CodeAddress::InstructionPointer(address) => address,
            CodeAddress::ReturnAddress(address) => address.saturating_sub(1),
        }
    }

    pub fn is_return_address(self) -> bool {
        matches!(self, CodeAddress::ReturnAddress(_))
    }
}
