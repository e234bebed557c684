//! Call-frame unwinding for x86_64 and aarch64, driven by DWARF CFI.
//!
//! A [`Cursor`] starts at the innermost frame of a thread and moves to the
//! caller with each [`Cursor::step`]. The target is described by an
//! [`AddressSpace`]: either the calling process ([`AddressSpace::local`]) or
//! any other process, thread or core image reached through a table of
//! [`Accessors`].
//!
//! ```no_run
//! # #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
//! # fn main() -> Result<(), framestep::Error> {
//! use framestep::{capture_context, AddressSpace, Cursor, LocalArg, NativeArch, Step};
//!
//! let modules = unsafe { framestep::loaded_modules() };
//! let space = AddressSpace::<NativeArch, _>::local(modules);
//! let mut arg = LocalArg::new(capture_context());
//! let mut cursor = Cursor::init_local(&space, &mut arg)?;
//! while cursor.step()? == Step::HasMore {
//!     println!("0x{:x}", cursor.ip());
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
//! # fn main() {}
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod add_signed;
mod address_space;
mod arch;
mod cfi;
mod code_address;
mod cursor;
mod display_utils;
mod dwarf;
mod error;
mod instruction_analysis;
#[cfg(all(
    feature = "std",
    any(target_os = "linux", target_os = "android", target_os = "macos")
))]
mod local;
mod module;
mod proc_info;
mod special_frames;
mod unwindregs;

pub mod aarch64;
pub mod x86_64;

pub use address_space::{
    from_modules, unsupported, AccessFpRegFn, AccessMemFn, AccessRegFn, Accessors, AddressSpace,
    AddressSpaceKind, ByteOrder, FindProcInfoFn, FpValue, GetProcNameFn, ProcName, ResumeFn,
};
pub use arch::Arch;
pub use cfi::{
    unwind_row_for_address, CfaRule, CfiReader, CieCache, RegisterRule, RuleRow, UnwindRow,
    MAX_REGISTER_COLUMNS, REMEMBER_STACK_DEPTH,
};
pub use code_address::CodeAddress;
pub use cursor::{Cursor, CursorState, Step, Unwinding};
pub use dwarf::{apply_unwind_row, CallerFrame, CfiIndex, CfiIndexError};
pub use error::{CfiError, Error, ErrorCode};
pub use gimli::Register;
pub use instruction_analysis::{classify, read_code, FrameKind, InstructionAnalysis};
#[cfg(all(
    feature = "std",
    any(target_os = "linux", target_os = "android", target_os = "macos")
))]
pub use local::{accessors as local_accessors, loader_proc_name, LocalAddressSpace, LocalArg};
#[cfg(all(feature = "std", any(target_os = "linux", target_os = "android")))]
pub use local::loaded_modules;
pub use module::{Module, ModuleTable, SectionAddresses, Symbol, UnwindData};
pub use proc_info::{CfiProgram, CfiSectionKind, ProcInfo, UnwindInfo};
pub use special_frames::SpecialFrameUnwinding;
pub use unwindregs::{DwarfUnwindRegs, RegisterSet};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type NativeArch = x86_64::ArchX86_64;
        pub use x86_64::{capture_context, UnwindRegsNative};
    } else if #[cfg(target_arch = "aarch64")] {
        pub type NativeArch = aarch64::ArchAarch64;
        pub use aarch64::{capture_context, UnwindRegsNative};
    }
}
