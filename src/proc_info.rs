use core::fmt::Debug;
use core::ops::Range;

use gimli::BaseAddresses;

use crate::display_utils::HexNum;

/// Which kind of section a CFI program lives in. The two differ in how CIE
/// pointers and augmentations are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfiSectionKind {
    EhFrame,
    DebugFrame,
}

/// The location of one FDE: the section bytes, the addresses needed to
/// decode pointers in it, and the FDE's offset within the section.
#[derive(Clone, PartialEq, Eq)]
pub struct CfiProgram<'a> {
    pub section: &'a [u8],
    pub kind: CfiSectionKind,
    pub bases: BaseAddresses,
    pub fde_offset: usize,
}

impl<'a> Debug for CfiProgram<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CfiProgram")
            .field("kind", &self.kind)
            .field("section_len", &self.section.len())
            .field("fde_offset", &HexNum(self.fde_offset))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindInfo<'a> {
    /// The routine is described by DWARF CFI.
    Cfi(CfiProgram<'a>),
    /// An index table marks the routine as not unwindable, e.g. a leaf
    /// without CFI. Unwinding stops here with `Error::StopUnwind`.
    CantUnwind,
}

/// The unwind information covering one routine.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcInfo<'a> {
    pub start_ip: u64,
    pub end_ip: u64,
    /// The personality routine, or 0.
    pub handler: u64,
    /// The language-specific data area, or 0.
    pub lsda: u64,
    /// The global pointer. Always 0 on x86_64 and aarch64.
    pub gp: u64,
    pub unwind_info: UnwindInfo<'a>,
}

impl<'a> ProcInfo<'a> {
    pub fn range(&self) -> Range<u64> {
        self.start_ip..self.end_ip
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start_ip <= address && address < self.end_ip
    }

    pub fn cfi_program(&self) -> Option<&CfiProgram<'a>> {
        match &self.unwind_info {
            UnwindInfo::Cfi(program) => Some(program),
            UnwindInfo::CantUnwind => None,
        }
    }
}

impl<'a> Debug for ProcInfo<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcInfo")
            .field("start_ip", &HexNum(self.start_ip))
            .field("end_ip", &HexNum(self.end_ip))
            .field("handler", &HexNum(self.handler))
            .field("lsda", &HexNum(self.lsda))
            .field("gp", &HexNum(self.gp))
            .field("unwind_info", &self.unwind_info)
            .finish()
    }
}
