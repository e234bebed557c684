//! Unwinding the calling process.
//!
//! Memory is read by dereferencing addresses directly, after checking with
//! `msync` that the page is mapped. Registers come from a snapshot, usually
//! taken with `capture_context()`. Nothing on the read path allocates or
//! takes a lock, so a local cursor can be used from a signal handler once
//! the address space has been created.

use core::ffi::CStr;

use once_cell::sync::OnceCell;
use tracing::trace;

use crate::address_space::{
    from_modules, unsupported, Accessors, AddressSpace, AddressSpaceKind, ByteOrder, ProcName,
};
use crate::arch::Arch;
use crate::cursor::{Cursor, Unwinding};
use crate::error::Error;
use crate::module::{copy_name, ModuleTable};
use crate::unwindregs::DwarfUnwindRegs;
use gimli::Register;

/// The per-cursor state of a local address space.
pub struct LocalArg<A: Arch> {
    /// The registers of the innermost frame.
    pub regs: A::UnwindRegs,
    /// Check that memory is mapped before dereferencing it. Turning this off
    /// makes reads faster but a bad CFI rule can then crash the process.
    pub validate: bool,
    last_good_page: u64,
}

impl<A: Arch> LocalArg<A> {
    pub fn new(regs: A::UnwindRegs) -> Self {
        Self {
            regs,
            validate: true,
            last_good_page: 0,
        }
    }
}

pub type LocalAddressSpace<'a, A> = AddressSpace<'a, A, LocalArg<A>>;

struct LocalTables {
    page_size: u64,
    ptr_auth_mask: u64,
}

static TABLES: OnceCell<LocalTables> = OnceCell::new();

fn tables() -> &'static LocalTables {
    TABLES.get_or_init(|| {
        let tables = LocalTables {
            page_size: query_page_size(),
            ptr_auth_mask: query_ptr_auth_mask(),
        };
        trace!(
            "Local tables: page size {}, pointer authentication mask 0x{:x}",
            tables.page_size,
            tables.ptr_auth_mask
        );
        tables
    })
}

fn query_page_size() -> u64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    match u64::try_from(page_size) {
        Ok(size) if size.is_power_of_two() => size,
        _ => 4096,
    }
}

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "android")))]
fn query_ptr_auth_mask() -> u64 {
    const HWCAP_PACA: u64 = 1 << 30;
    let hwcap = unsafe { libc::getauxval(libc::AT_HWCAP) } as u64;
    if hwcap & HWCAP_PACA != 0 {
        // Bits 48..=54 and 56..=63; bit 55 selects the address range.
        0xff7f_0000_0000_0000
    } else {
        0
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn query_ptr_auth_mask() -> u64 {
    // arm64e: 24 bits of hash, 40 bits of pointer.
    !((1 << 40) - 1)
}

#[cfg(not(all(
    target_arch = "aarch64",
    any(target_os = "linux", target_os = "android", target_os = "macos")
)))]
fn query_ptr_auth_mask() -> u64 {
    0
}

impl<'a, A: Arch> AddressSpace<'a, A, LocalArg<A>> {
    /// The address space of the calling process.
    ///
    /// Initializes the process-wide tables, so this should be called before
    /// any signal handler that unwinds can run.
    pub fn local(modules: ModuleTable<'a>) -> Self {
        let tables = tables();
        let mut space = Self::new(
            AddressSpaceKind::Local,
            ByteOrder::native(),
            accessors(),
            modules,
        );
        space.set_ptr_auth_mask(tables.ptr_auth_mask);
        space
    }
}

impl<'s, 'a, A: Unwinding> Cursor<'s, 'a, A, LocalArg<A>> {
    /// Binds a cursor to the register snapshot in `arg`.
    pub fn init_local(
        space: &'s LocalAddressSpace<'a, A>,
        arg: &'s mut LocalArg<A>,
    ) -> Result<Self, Error> {
        if !space.is_local() {
            return Err(Error::InvalidArgument);
        }
        Self::bind(space, arg)
    }
}

/// The accessors of the local address space.
pub fn accessors<'a, A: Arch>() -> Accessors<'a, A, LocalArg<A>> {
    Accessors {
        find_proc_info: from_modules::find_proc_info,
        access_mem,
        access_reg,
        access_fpreg: unsupported::access_fpreg,
        resume: unsupported::resume,
        get_proc_name,
    }
}

fn access_mem<A: Arch>(
    _space: &LocalAddressSpace<'_, A>,
    address: u64,
    value: &mut u64,
    write: bool,
    arg: &mut LocalArg<A>,
) -> Result<(), Error> {
    if write {
        return Err(Error::InvalidArgument);
    }
    if address == 0 || (arg.validate && !is_readable(address, arg)) {
        return Err(Error::UnreadableMemory(address));
    }
    let ptr = usize::try_from(address).map_err(|_| Error::UnreadableMemory(address))? as *const u64;
    // The pages were checked above, or the caller turned validation off.
    *value = unsafe { ptr.read_unaligned() };
    Ok(())
}

/// Whether the 8 bytes at `address` are mapped.
fn is_readable<A: Arch>(address: u64, arg: &mut LocalArg<A>) -> bool {
    let page_mask = !(tables().page_size - 1);
    let Some(last) = address.checked_add(7) else {
        return false;
    };
    let first_page = address & page_mask;
    let last_page = last & page_mask;
    is_mapped(first_page, arg) && (last_page == first_page || is_mapped(last_page, arg))
}

fn is_mapped<A: Arch>(page: u64, arg: &mut LocalArg<A>) -> bool {
    if page == 0 {
        return false;
    }
    if page == arg.last_good_page {
        return true;
    }
    let Ok(page_ptr) = usize::try_from(page) else {
        return false;
    };
    let mapped = unsafe { libc::msync(page_ptr as *mut libc::c_void, 1, libc::MS_ASYNC) } == 0;
    if mapped {
        arg.last_good_page = page;
    }
    mapped
}

fn access_reg<A: Arch>(
    _space: &LocalAddressSpace<'_, A>,
    register: Register,
    value: &mut u64,
    write: bool,
    arg: &mut LocalArg<A>,
) -> Result<(), Error> {
    if write {
        if arg.regs.set(register, *value) {
            Ok(())
        } else {
            Err(Error::UnsupportedRegister(register.0))
        }
    } else {
        *value = arg
            .regs
            .get(register)
            .ok_or(Error::UnsupportedRegister(register.0))?;
        Ok(())
    }
}

/// Names come from the module symbols only; the dynamic loader is never
/// consulted on this path.
fn get_proc_name<A: Arch>(
    space: &LocalAddressSpace<'_, A>,
    ip: u64,
    buf: &mut [u8],
    _arg: &mut LocalArg<A>,
) -> Result<ProcName, Error> {
    space.modules().proc_name(ip, buf)
}

/// Asks the dynamic loader for the symbol covering `ip`.
///
/// This finds symbols that the module table does not know about, but
/// `dladdr` takes the loader's lock. It is not async-signal-safe and must not
/// be called while unwinding from a signal handler.
pub fn loader_proc_name(ip: u64, buf: &mut [u8]) -> Result<ProcName, Error> {
    let address = usize::try_from(ip).map_err(|_| Error::NoProcName(ip))?;
    let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
    let found = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } != 0;
    if !found || info.dli_sname.is_null() {
        return Err(Error::NoProcName(ip));
    }
    // dladdr returned a nul-terminated string owned by the dynamic loader.
    let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_bytes();
    let offset = ip.wrapping_sub(info.dli_saddr as usize as u64);
    Ok(copy_name(name, offset, buf))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::loaded::loaded_modules;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod loaded {
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::ops::Range;

    use gimli::{BaseAddresses, EhFrameHdr, NativeEndian};

    use super::*;
    use crate::module::{Module, SectionAddresses, Symbol, UnwindData};

    /// Builds a module table from the objects loaded into this process,
    /// using each object's `PT_GNU_EH_FRAME` segment. Function symbols are
    /// taken from each object's dynamic symbol table.
    ///
    /// # Safety
    ///
    /// The table borrows the objects' mapped sections. It must not be used
    /// after any of the objects is unloaded with `dlclose`.
    pub unsafe fn loaded_modules() -> ModuleTable<'static> {
        let mut modules: Vec<Module<'static>> = Vec::new();
        libc::dl_iterate_phdr(
            Some(collect_module),
            &mut modules as *mut Vec<Module<'static>> as *mut libc::c_void,
        );
        let mut table = ModuleTable::new();
        for module in modules {
            table.add_module(module, ByteOrder::native());
        }
        table
    }

    unsafe extern "C" fn collect_module(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let modules = &mut *(data as *mut Vec<Module<'static>>);
        let info = &*info;
        if info.dlpi_phdr.is_null() {
            return 0;
        }
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let bias = info.dlpi_addr as u64;
        let mut text: Option<Range<u64>> = None;
        let mut eh_frame_hdr: Option<Range<u64>> = None;
        let mut dynamic = None;
        let mut loads = Vec::new();
        for phdr in phdrs {
            let start = bias.wrapping_add(phdr.p_vaddr as u64);
            let range = start..start.wrapping_add(phdr.p_memsz as u64);
            match phdr.p_type {
                libc::PT_LOAD => {
                    if text.is_none() && phdr.p_flags & libc::PF_X != 0 {
                        text = Some(range.clone());
                    }
                    loads.push(range);
                }
                libc::PT_GNU_EH_FRAME => eh_frame_hdr = Some(range),
                libc::PT_DYNAMIC => dynamic = Some(range.start),
                _ => {}
            }
        }
        let (Some(text), Some(hdr_range)) = (text, eh_frame_hdr) else {
            return 0;
        };
        let hdr = core::slice::from_raw_parts(
            hdr_range.start as usize as *const u8,
            (hdr_range.end - hdr_range.start) as usize,
        );
        let bases = BaseAddresses::default().set_eh_frame_hdr(hdr_range.start);
        let Ok(parsed) = EhFrameHdr::new(hdr, NativeEndian).parse(&bases, 8) else {
            return 0;
        };
        let Ok(eh_frame_address) = parsed.eh_frame_ptr().direct() else {
            return 0;
        };
        // .eh_frame has no size of its own; it ends with a zero terminator
        // somewhere in the same segment.
        let Some(segment) = loads.iter().find(|r| r.contains(&eh_frame_address)) else {
            return 0;
        };
        let eh_frame = core::slice::from_raw_parts(
            eh_frame_address as usize as *const u8,
            (segment.end - eh_frame_address) as usize,
        );
        let name = if info.dlpi_name.is_null() {
            String::new()
        } else {
            String::from(CStr::from_ptr(info.dlpi_name).to_string_lossy())
        };
        let sections = SectionAddresses {
            text: text.start,
            eh_frame: eh_frame_address,
            eh_frame_hdr: hdr_range.start,
            got: 0,
        };
        let symbols = match dynamic {
            Some(dynamic) => dynamic_symbols(dynamic, bias, &text),
            None => Vec::new(),
        };
        trace!("Module {:?}: {} dynamic symbols", name, symbols.len());
        modules.push(
            Module::new(
                name,
                text.clone(),
                text.start,
                sections,
                UnwindData::EhFrameHdrAndEhFrame(hdr, eh_frame),
            )
            .with_symbols(symbols),
        );
        0
    }

    const DT_NULL: i64 = 0;
    const DT_HASH: i64 = 4;
    const DT_STRTAB: i64 = 5;
    const DT_SYMTAB: i64 = 6;
    const DT_STRSZ: i64 = 10;
    const DT_GNU_HASH: i64 = 0x6fff_fef5;

    const STT_FUNC: u8 = 2;
    const SHN_UNDEF: u16 = 0;

    #[repr(C)]
    struct Elf64Dyn {
        tag: i64,
        value: u64,
    }

    #[repr(C)]
    struct Elf64Sym {
        name: u32,
        info: u8,
        _other: u8,
        shndx: u16,
        value: u64,
        size: u64,
    }

    /// The defined functions of the object's `.dynsym` that lie in `text`.
    ///
    /// # Safety
    ///
    /// `dynamic` must be the mapped `PT_DYNAMIC` segment of a loaded object.
    #[cfg(target_pointer_width = "64")]
    unsafe fn dynamic_symbols(
        dynamic: u64,
        bias: u64,
        text: &Range<u64>,
    ) -> Vec<Symbol<'static>> {
        let (mut symtab, mut strtab, mut strsz) = (0, 0, 0);
        let (mut hash, mut gnu_hash) = (0, 0);
        let mut entry = dynamic as usize as *const Elf64Dyn;
        while (*entry).tag != DT_NULL {
            let value = (*entry).value;
            match (*entry).tag {
                DT_SYMTAB => symtab = value,
                DT_STRTAB => strtab = value,
                DT_STRSZ => strsz = value,
                DT_HASH => hash = value,
                DT_GNU_HASH => gnu_hash = value,
                _ => {}
            }
            entry = entry.add(1);
        }
        if symtab == 0 || strtab == 0 {
            return Vec::new();
        }
        // The loader relocates these in place, except in objects it did not
        // relocate itself, such as the vDSO.
        let relocate = |address: u64| {
            if address < bias {
                bias.wrapping_add(address)
            } else {
                address
            }
        };
        let count = match (gnu_hash, hash) {
            (0, 0) => return Vec::new(),
            (0, hash) => *((relocate(hash) as usize as *const u32).add(1)) as usize,
            (gnu_hash, _) => gnu_hash_symbol_count(relocate(gnu_hash) as usize as *const u32),
        };
        let symtab = relocate(symtab) as usize as *const Elf64Sym;
        let symtab = core::slice::from_raw_parts(symtab, count);
        let strtab = relocate(strtab) as usize as *const u8;
        let strtab = core::slice::from_raw_parts(strtab, strsz as usize);

        let mut symbols = Vec::new();
        for sym in symtab {
            if sym.info & 0xf != STT_FUNC || sym.shndx == SHN_UNDEF || sym.value == 0 {
                continue;
            }
            let address = bias.wrapping_add(sym.value);
            if !text.contains(&address) {
                continue;
            }
            let Some(name) = strtab.get(sym.name as usize..) else {
                continue;
            };
            let Ok(name) = CStr::from_bytes_until_nul(name) else {
                continue;
            };
            let Ok(name) = name.to_str() else {
                continue;
            };
            symbols.push(Symbol {
                address,
                size: sym.size,
                name,
            });
        }
        symbols
    }

    #[cfg(not(target_pointer_width = "64"))]
    unsafe fn dynamic_symbols(
        _dynamic: u64,
        _bias: u64,
        _text: &Range<u64>,
    ) -> Vec<Symbol<'static>> {
        Vec::new()
    }

    /// `DT_GNU_HASH` does not record the number of symbols. The highest
    /// symbol index is found at the end of the longest chain.
    #[cfg(target_pointer_width = "64")]
    unsafe fn gnu_hash_symbol_count(table: *const u32) -> usize {
        let bucket_count = *table as usize;
        let symbol_offset = *table.add(1) as usize;
        let bloom_size = *table.add(2) as usize;
        let buckets = (table.add(4) as *const u64).add(bloom_size) as *const u32;
        let chains = buckets.add(bucket_count);
        let last = (0..bucket_count)
            .map(|i| *buckets.add(i) as usize)
            .max()
            .unwrap_or(0);
        if last < symbol_offset {
            return symbol_offset;
        }
        let mut index = last;
        while *chains.add(index - symbol_offset) & 1 == 0 {
            index += 1;
        }
        index + 1
    }
}
