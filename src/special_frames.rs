use crate::arch::Arch;
use crate::code_address::CodeAddress;
use crate::error::Error;

/// Hard-coded register transfers for the frames that
/// [`InstructionAnalysis`](crate::InstructionAnalysis) recognizes.
///
/// Both functions update `regs` in place to the caller's registers and
/// return the caller's code address.
pub trait SpecialFrameUnwinding: Arch {
    /// `position` is the index of the stub instruction that is about to
    /// execute.
    fn unwind_plt_stub<F>(
        position: usize,
        regs: &mut Self::UnwindRegs,
        read_word: &mut F,
    ) -> Result<CodeAddress, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>;

    /// Restores the interrupted registers from the signal frame on the stack.
    /// The returned address is exact: the interrupted instruction had not
    /// executed yet.
    fn unwind_signal_frame<F>(
        regs: &mut Self::UnwindRegs,
        read_word: &mut F,
    ) -> Result<CodeAddress, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>;
}
