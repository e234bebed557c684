use core::fmt::Debug;

use gimli::{Register, RunTimeEndian};

use crate::arch::Arch;
use crate::display_utils::HexNum;
use crate::error::Error;
use crate::module::{Module, ModuleTable};
use crate::proc_info::ProcInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn gimli(self) -> RunTimeEndian {
        match self {
            ByteOrder::Little => RunTimeEndian::Little,
            ByteOrder::Big => RunTimeEndian::Big,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpaceKind {
    /// The memory and registers of the calling process.
    Local,
    /// Another process, thread or core image, reached through accessors.
    Remote,
}

/// The raw contents of a floating-point or vector register.
pub type FpValue = [u8; 16];

/// Where a name was found for an instruction address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcName {
    /// Number of bytes written into the caller's buffer.
    pub len: usize,
    /// Byte offset of the instruction address from the start of the routine.
    pub offset: u64,
    /// The buffer was too small for the full name.
    pub truncated: bool,
}

pub type FindProcInfoFn<'a, A, T> =
    fn(&AddressSpace<'a, A, T>, u64, &mut T) -> Result<ProcInfo<'a>, Error>;
pub type AccessMemFn<'a, A, T> =
    fn(&AddressSpace<'a, A, T>, u64, &mut u64, bool, &mut T) -> Result<(), Error>;
pub type AccessRegFn<'a, A, T> =
    fn(&AddressSpace<'a, A, T>, Register, &mut u64, bool, &mut T) -> Result<(), Error>;
pub type AccessFpRegFn<'a, A, T> =
    fn(&AddressSpace<'a, A, T>, Register, &mut FpValue, bool, &mut T) -> Result<(), Error>;
pub type ResumeFn<'a, A, T> = fn(
    &AddressSpace<'a, A, T>,
    &<A as Arch>::UnwindRegs,
    &mut T,
) -> Result<(), Error>;
pub type GetProcNameFn<'a, A, T> =
    fn(&AddressSpace<'a, A, T>, u64, &mut [u8], &mut T) -> Result<ProcName, Error>;

/// The capability table of an address space.
///
/// Every function receives the address space first and the caller's opaque
/// argument last. Memory and register accessors take a `write` flag: when it
/// is false the accessor fills in the value, when it is true it stores the
/// value into the target.
pub struct Accessors<'a, A: Arch, T: ?Sized> {
    pub find_proc_info: FindProcInfoFn<'a, A, T>,
    pub access_mem: AccessMemFn<'a, A, T>,
    pub access_reg: AccessRegFn<'a, A, T>,
    pub access_fpreg: AccessFpRegFn<'a, A, T>,
    pub resume: ResumeFn<'a, A, T>,
    pub get_proc_name: GetProcNameFn<'a, A, T>,
}

impl<'a, A: Arch, T: ?Sized> Clone for Accessors<'a, A, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, A: Arch, T: ?Sized> Copy for Accessors<'a, A, T> {}

/// A target whose frames can be unwound: its byte order, its capability
/// table, and the unwind sections known for it.
///
/// Created once per target and shared by every cursor bound to it. The
/// opaque argument `T` is not stored here; each cursor borrows its own.
pub struct AddressSpace<'a, A: Arch, T: ?Sized> {
    kind: AddressSpaceKind,
    byte_order: ByteOrder,
    accessors: Accessors<'a, A, T>,
    modules: ModuleTable<'a>,
    ptr_auth_mask: u64,
}

impl<'a, A: Arch, T: ?Sized> AddressSpace<'a, A, T> {
    pub fn new(
        kind: AddressSpaceKind,
        byte_order: ByteOrder,
        accessors: Accessors<'a, A, T>,
        modules: ModuleTable<'a>,
    ) -> Self {
        Self {
            kind,
            byte_order,
            accessors,
            modules,
            ptr_auth_mask: 0,
        }
    }

    /// An address space whose capabilities all forward to `accessors`.
    pub fn remote(byte_order: ByteOrder, accessors: Accessors<'a, A, T>) -> Self {
        Self::new(
            AddressSpaceKind::Remote,
            byte_order,
            accessors,
            ModuleTable::new(),
        )
    }

    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == AddressSpaceKind::Local
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn accessors(&self) -> &Accessors<'a, A, T> {
        &self.accessors
    }

    pub fn modules(&self) -> &ModuleTable<'a> {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleTable<'a> {
        &mut self.modules
    }

    /// Registers a module's unwind sections and symbols.
    pub fn add_module(&mut self, module: Module<'a>) {
        self.modules.add_module(module, self.byte_order);
    }

    /// The bits of a return address that hold a pointer authentication code
    /// on this target. Cursors start out with this mask.
    pub fn ptr_auth_mask(&self) -> u64 {
        self.ptr_auth_mask
    }

    pub fn set_ptr_auth_mask(&mut self, mask: u64) {
        self.ptr_auth_mask = mask;
    }

    pub fn read_word(&self, address: u64, arg: &mut T) -> Result<u64, Error> {
        let mut value = 0;
        (self.accessors.access_mem)(self, address, &mut value, false, arg)?;
        Ok(value)
    }

    pub fn write_word(&self, address: u64, value: u64, arg: &mut T) -> Result<(), Error> {
        let mut value = value;
        (self.accessors.access_mem)(self, address, &mut value, true, arg)
    }

    pub fn read_reg(&self, register: Register, arg: &mut T) -> Result<u64, Error> {
        let mut value = 0;
        (self.accessors.access_reg)(self, register, &mut value, false, arg)?;
        Ok(value)
    }

    pub fn write_reg(&self, register: Register, value: u64, arg: &mut T) -> Result<(), Error> {
        let mut value = value;
        (self.accessors.access_reg)(self, register, &mut value, true, arg)
    }

    pub fn read_fp_reg(&self, register: Register, arg: &mut T) -> Result<FpValue, Error> {
        let mut value = FpValue::default();
        (self.accessors.access_fpreg)(self, register, &mut value, false, arg)?;
        Ok(value)
    }

    pub fn write_fp_reg(
        &self,
        register: Register,
        value: FpValue,
        arg: &mut T,
    ) -> Result<(), Error> {
        let mut value = value;
        (self.accessors.access_fpreg)(self, register, &mut value, true, arg)
    }

    pub fn find_proc_info(&self, ip: u64, arg: &mut T) -> Result<ProcInfo<'a>, Error> {
        (self.accessors.find_proc_info)(self, ip, arg)
    }

    pub fn proc_name(&self, ip: u64, buf: &mut [u8], arg: &mut T) -> Result<ProcName, Error> {
        (self.accessors.get_proc_name)(self, ip, buf, arg)
    }

    pub fn resume(&self, regs: &A::UnwindRegs, arg: &mut T) -> Result<(), Error> {
        (self.accessors.resume)(self, regs, arg)
    }
}

impl<'a, A: Arch, T: ?Sized> Debug for AddressSpace<'a, A, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("arch", &A::NAME)
            .field("kind", &self.kind)
            .field("byte_order", &self.byte_order)
            .field("modules", &self.modules)
            .field("ptr_auth_mask", &HexNum(self.ptr_auth_mask))
            .finish()
    }
}

/// Accessor implementations that give up, for address spaces that only
/// provide part of the capability set.
pub mod unsupported {
    use super::*;

    pub fn find_proc_info<'a, A: Arch, T: ?Sized>(
        _space: &AddressSpace<'a, A, T>,
        ip: u64,
        _arg: &mut T,
    ) -> Result<ProcInfo<'a>, Error> {
        Err(Error::NoUnwindInfo(ip))
    }

    pub fn access_fpreg<'a, A: Arch, T: ?Sized>(
        _space: &AddressSpace<'a, A, T>,
        register: Register,
        _value: &mut FpValue,
        _write: bool,
        _arg: &mut T,
    ) -> Result<(), Error> {
        Err(Error::UnsupportedRegister(register.0))
    }

    pub fn resume<'a, A: Arch, T: ?Sized>(
        _space: &AddressSpace<'a, A, T>,
        _regs: &A::UnwindRegs,
        _arg: &mut T,
    ) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    pub fn get_proc_name<'a, A: Arch, T: ?Sized>(
        _space: &AddressSpace<'a, A, T>,
        ip: u64,
        _buf: &mut [u8],
        _arg: &mut T,
    ) -> Result<ProcName, Error> {
        Err(Error::NoProcName(ip))
    }
}

/// Looks up unwind info and names in the address space's module table.
/// Remote accessor tables can use these when the client has registered the
/// target's unwind sections.
pub mod from_modules {
    use super::*;

    pub fn find_proc_info<'a, A: Arch, T: ?Sized>(
        space: &AddressSpace<'a, A, T>,
        ip: u64,
        _arg: &mut T,
    ) -> Result<ProcInfo<'a>, Error> {
        space.modules().find_proc_info(ip, space.byte_order())
    }

    pub fn get_proc_name<'a, A: Arch, T: ?Sized>(
        space: &AddressSpace<'a, A, T>,
        ip: u64,
        buf: &mut [u8],
        _arg: &mut T,
    ) -> Result<ProcName, Error> {
        space.modules().proc_name(ip, buf)
    }
}
