use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;
use core::ops::Range;

use gimli::{BaseAddresses, EhFrameHdr, Pointer};
use tracing::{trace, warn};

use crate::address_space::{ByteOrder, ProcName};
use crate::cfi::parse_fde;
use crate::display_utils::HexNum;
use crate::dwarf::{base_addresses_for_sections, CfiIndex};
use crate::error::Error;
use crate::proc_info::{CfiProgram, CfiSectionKind, ProcInfo, UnwindInfo};

/// The runtime addresses of the sections that DWARF pointer encodings can be
/// relative to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionAddresses {
    pub text: u64,
    pub eh_frame: u64,
    pub eh_frame_hdr: u64,
    pub got: u64,
}

/// The unwind sections of a module, borrowed from wherever the client keeps
/// them.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum UnwindData<'a> {
    /// `.eh_frame_hdr` followed by `.eh_frame`. The header's binary search
    /// table is used for lookups.
    EhFrameHdrAndEhFrame(&'a [u8], &'a [u8]),
    /// `.eh_frame` only. An index is built when the module is added.
    EhFrame(&'a [u8]),
    /// `.debug_frame` only. An index is built when the module is added.
    DebugFrame(&'a [u8]),
    /// The whole module is marked as not unwindable.
    CantUnwind,
    None,
}

impl<'a> Debug for UnwindData<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UnwindData::EhFrameHdrAndEhFrame(hdr, eh_frame) => {
                write!(f, "EhFrameHdrAndEhFrame({}, {})", hdr.len(), eh_frame.len())
            }
            UnwindData::EhFrame(data) => write!(f, "EhFrame({})", data.len()),
            UnwindData::DebugFrame(data) => write!(f, "DebugFrame({})", data.len()),
            UnwindData::CantUnwind => write!(f, "CantUnwind"),
            UnwindData::None => write!(f, "None"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'a> {
    pub address: u64,
    /// 0 if unknown, in which case the symbol extends to the next one.
    pub size: u64,
    pub name: &'a str,
}

impl<'a> Debug for Symbol<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} @ {:?} ({})", self.name, HexNum(self.address), self.size)
    }
}

/// One mapped object: its address range, its unwind sections and,
/// optionally, its symbols.
///
/// All addresses are runtime addresses, i.e. the FDEs' initial locations
/// must match the addresses at which the code is mapped.
pub struct Module<'a> {
    name: String,
    address_range: Range<u64>,
    base_address: u64,
    sections: SectionAddresses,
    unwind_data: UnwindData<'a>,
    symbols: Vec<Symbol<'a>>,
    index: Option<CfiIndex>,
}

impl<'a> Debug for Module<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("address_range", &self.address_range)
            .field("base_address", &HexNum(self.base_address))
            .field("unwind_data", &self.unwind_data)
            .field("symbols", &self.symbols.len())
            .field("indexed", &self.index.is_some())
            .finish()
    }
}

impl<'a> Module<'a> {
    pub fn new(
        name: String,
        address_range: Range<u64>,
        base_address: u64,
        sections: SectionAddresses,
        unwind_data: UnwindData<'a>,
    ) -> Self {
        Self {
            name,
            address_range,
            base_address,
            sections,
            unwind_data,
            symbols: Vec::new(),
            index: None,
        }
    }

    pub fn with_symbols(mut self, mut symbols: Vec<Symbol<'a>>) -> Self {
        symbols.sort_by_key(|symbol| symbol.address);
        self.symbols = symbols;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_range(&self) -> Range<u64> {
        self.address_range.clone()
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn unwind_data(&self) -> UnwindData<'a> {
        self.unwind_data
    }

    fn bases(&self) -> BaseAddresses {
        base_addresses_for_sections(&self.sections)
    }

    /// Build the FDE index for modules without a usable `.eh_frame_hdr`.
    fn prepare(&mut self, byte_order: ByteOrder) {
        let bases = self.bases();
        let (section, kind) = match self.unwind_data {
            UnwindData::EhFrameHdrAndEhFrame(hdr, eh_frame) => {
                if has_search_table(hdr, byte_order, &bases) {
                    return;
                }
                warn!(
                    "Module {} has an .eh_frame_hdr without a search table, indexing .eh_frame",
                    self.name
                );
                (eh_frame, CfiSectionKind::EhFrame)
            }
            UnwindData::EhFrame(eh_frame) => (eh_frame, CfiSectionKind::EhFrame),
            UnwindData::DebugFrame(debug_frame) => (debug_frame, CfiSectionKind::DebugFrame),
            UnwindData::CantUnwind | UnwindData::None => return,
        };
        match CfiIndex::build(section, kind, byte_order, &bases, self.base_address) {
            Ok(index) => {
                trace!("Indexed {} FDEs in module {}", index.len(), self.name);
                self.index = Some(index);
            }
            Err(e) => warn!("Could not index the CFI of module {}: {}", self.name, e),
        }
    }

    fn indexed_fde_offset(&self, ip: u64) -> Option<usize> {
        let index = self.index.as_ref()?;
        let relative_ip = u32::try_from(ip.checked_sub(self.base_address)?).ok()?;
        index.lookup(relative_ip)
    }

    pub fn find_proc_info(&self, ip: u64, byte_order: ByteOrder) -> Result<ProcInfo<'a>, Error> {
        let bases = self.bases();
        let (section, kind, fde_offset) = match self.unwind_data {
            UnwindData::EhFrameHdrAndEhFrame(hdr, eh_frame) => {
                let fde_offset = match self.index {
                    Some(_) => self.indexed_fde_offset(ip),
                    None => fde_offset_from_hdr(hdr, byte_order, &bases, ip),
                };
                (eh_frame, CfiSectionKind::EhFrame, fde_offset)
            }
            UnwindData::EhFrame(eh_frame) => (
                eh_frame,
                CfiSectionKind::EhFrame,
                self.indexed_fde_offset(ip),
            ),
            UnwindData::DebugFrame(debug_frame) => (
                debug_frame,
                CfiSectionKind::DebugFrame,
                self.indexed_fde_offset(ip),
            ),
            UnwindData::CantUnwind => {
                return Ok(ProcInfo {
                    start_ip: self.address_range.start,
                    end_ip: self.address_range.end,
                    handler: 0,
                    lsda: 0,
                    gp: 0,
                    unwind_info: UnwindInfo::CantUnwind,
                })
            }
            UnwindData::None => return Err(Error::NoUnwindInfo(ip)),
        };
        let fde_offset = fde_offset.ok_or(Error::NoUnwindInfo(ip))?;
        let program = CfiProgram {
            section,
            kind,
            bases,
            fde_offset,
        };
        let fde = parse_fde(&program, byte_order)?;
        if !fde.contains(ip) {
            return Err(Error::NoUnwindInfo(ip));
        }
        let start_ip = fde.initial_address();
        let end_ip = start_ip.saturating_add(fde.len());
        Ok(ProcInfo {
            start_ip,
            end_ip,
            handler: fde.personality().map_or(0, pointer_value),
            lsda: fde.lsda().map_or(0, pointer_value),
            gp: 0,
            unwind_info: UnwindInfo::Cfi(program),
        })
    }

    /// Write the name of the symbol covering `ip` into `buf`.
    pub fn proc_name(&self, ip: u64, buf: &mut [u8]) -> Result<ProcName, Error> {
        let i = match self.symbols.binary_search_by_key(&ip, |s| s.address) {
            Ok(i) => i,
            Err(0) => return Err(Error::NoProcName(ip)),
            Err(i) => i - 1,
        };
        let symbol = &self.symbols[i];
        if symbol.size != 0 && ip - symbol.address >= symbol.size {
            return Err(Error::NoProcName(ip));
        }
        Ok(copy_name(symbol.name.as_bytes(), ip - symbol.address, buf))
    }
}

/// Copies as much of `name` as fits into `buf`.
pub(crate) fn copy_name(name: &[u8], offset: u64, buf: &mut [u8]) -> ProcName {
    let len = name.len().min(buf.len());
    buf[..len].copy_from_slice(&name[..len]);
    ProcName {
        len,
        offset,
        truncated: len < name.len(),
    }
}

/// The personality routine and LSDA pointers. An indirect pointer is
/// reported as the address of the slot that holds the real value.
fn pointer_value(pointer: Pointer) -> u64 {
    match pointer {
        Pointer::Direct(address) | Pointer::Indirect(address) => address,
    }
}

fn has_search_table(hdr: &[u8], byte_order: ByteOrder, bases: &BaseAddresses) -> bool {
    match EhFrameHdr::new(hdr, byte_order.gimli()).parse(bases, 8) {
        Ok(parsed) => parsed.table().is_some(),
        Err(_) => false,
    }
}

fn fde_offset_from_hdr(
    hdr: &[u8],
    byte_order: ByteOrder,
    bases: &BaseAddresses,
    ip: u64,
) -> Option<usize> {
    let hdr = EhFrameHdr::new(hdr, byte_order.gimli()).parse(bases, 8).ok()?;
    let table = hdr.table()?;
    let fde_ptr = table.lookup(ip, bases).ok()?;
    let fde_offset = table.pointer_to_offset(fde_ptr).ok()?;
    Some(fde_offset.0)
}

/// All modules of an address space, sorted by start address.
#[derive(Default)]
pub struct ModuleTable<'a> {
    modules: Vec<Module<'a>>,
}

impl<'a> Debug for ModuleTable<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.modules.iter()).finish()
    }
}

impl<'a> ModuleTable<'a> {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn add_module(&mut self, mut module: Module<'a>, byte_order: ByteOrder) {
        module.prepare(byte_order);
        let insertion_index = match self
            .modules
            .binary_search_by_key(&module.address_range.start, |module| {
                module.address_range.start
            }) {
            Ok(i) => {
                warn!(
                    "Now we have two modules at the same start address 0x{:x}. This can't be good.",
                    module.address_range.start
                );
                i
            }
            Err(i) => i,
        };
        self.modules.insert(insertion_index, module);
    }

    pub fn remove_module(&mut self, module_address_range_start: u64) -> Option<Module<'a>> {
        let index = self
            .modules
            .binary_search_by_key(&module_address_range_start, |module| {
                module.address_range.start
            })
            .ok()?;
        Some(self.modules.remove(index))
    }

    pub fn find_module(&self, address: u64) -> Option<&Module<'a>> {
        let i = match self
            .modules
            .binary_search_by_key(&address, |m| m.address_range.start)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let module = &self.modules[i];
        if module.address_range.end <= address {
            return None;
        }
        Some(module)
    }

    pub fn find_proc_info(&self, ip: u64, byte_order: ByteOrder) -> Result<ProcInfo<'a>, Error> {
        self.find_module(ip)
            .ok_or(Error::NoUnwindInfo(ip))?
            .find_proc_info(ip, byte_order)
    }

    pub fn proc_name(&self, ip: u64, buf: &mut [u8]) -> Result<ProcName, Error> {
        self.find_module(ip)
            .ok_or(Error::NoProcName(ip))?
            .proc_name(ip, buf)
    }
}
