use core::fmt::Debug;

use gimli::Register;
use tracing::{debug, trace};

use crate::address_space::{AddressSpace, FpValue, ProcName};
use crate::arch::Arch;
use crate::cfi::{unwind_row_for_address, CfiReader, CieCache};
use crate::code_address::CodeAddress;
use crate::display_utils::HexNum;
use crate::dwarf::apply_unwind_row;
use crate::error::Error;
use crate::instruction_analysis::{classify, FrameKind, InstructionAnalysis};
use crate::proc_info::{ProcInfo, UnwindInfo};
use crate::special_frames::SpecialFrameUnwinding;
use crate::unwindregs::DwarfUnwindRegs;

/// An architecture the cursor can step through.
pub trait Unwinding: Arch + InstructionAnalysis + SpecialFrameUnwinding {}
impl<A: Arch + InstructionAnalysis + SpecialFrameUnwinding> Unwinding for A {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    /// Bound to the innermost frame, not stepped yet.
    Initialized,
    /// The last step found a caller frame.
    HasMore,
    /// The outermost frame was reached. Further steps return
    /// `Ok(Step::Terminated)`.
    Terminated,
    /// A step failed. Further steps return the same error.
    Failed(Error),
}

/// The successful outcome of [`Cursor::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    HasMore,
    Terminated,
}

impl Step {
    /// `1` for `HasMore`, `0` for `Terminated`. Failures are reported with
    /// [`Error::code`], which is always negative.
    pub fn code(self) -> i32 {
        match self {
            Step::HasMore => 1,
            Step::Terminated => 0,
        }
    }
}

/// Walks the frames of one thread of an address space, from the innermost
/// frame outwards.
///
/// The cursor borrows the address space and exclusively borrows the
/// caller's argument, which every accessor call receives.
pub struct Cursor<'s, 'a, A: Arch, T: ?Sized> {
    space: &'s AddressSpace<'a, A, T>,
    arg: &'s mut T,
    regs: A::UnwindRegs,
    ip: CodeAddress,
    frame_kind: Option<FrameKind>,
    proc_info: Option<ProcInfo<'a>>,
    cie_cache: CieCache<CfiReader<'a>>,
    ptr_auth_mask: u64,
    frame_index: usize,
    state: CursorState,
}

impl<'s, 'a, A: Unwinding, T: ?Sized> Cursor<'s, 'a, A, T> {
    /// Binds a cursor to the current state of a remote target.
    ///
    /// Fails with `Error::InvalidArgument` when the crate is built with the
    /// `local-only` feature.
    pub fn init_remote(space: &'s AddressSpace<'a, A, T>, arg: &'s mut T) -> Result<Self, Error> {
        if cfg!(feature = "local-only") {
            return Err(Error::InvalidArgument);
        }
        Self::bind(space, arg)
    }

    /// Reads all registers of the architecture through the register
    /// accessor. Only the instruction pointer and the stack pointer are
    /// required to be available.
    pub(crate) fn bind(space: &'s AddressSpace<'a, A, T>, arg: &'s mut T) -> Result<Self, Error> {
        let mut regs = A::UnwindRegs::default();
        for i in 0..A::REGISTER_COUNT {
            let register = Register(i);
            match space.read_reg(register, arg) {
                Ok(value) => {
                    regs.set(register, value);
                }
                Err(e) if A::required_registers().contains(&register) => {
                    debug!("Could not read required register {}: {}", i, e);
                    return Err(e);
                }
                Err(_) => {}
            }
        }
        let ip = regs
            .get(A::IP)
            .ok_or(Error::RegisterUnavailable(A::IP.0))?;
        trace!("Bound {} cursor at ip {:?}", A::NAME, HexNum(ip));
        Ok(Self {
            space,
            arg,
            regs,
            ip: CodeAddress::InstructionPointer(ip),
            frame_kind: None,
            proc_info: None,
            cie_cache: CieCache::new(),
            ptr_auth_mask: space.ptr_auth_mask(),
            frame_index: 0,
            state: CursorState::Initialized,
        })
    }

    pub fn address_space(&self) -> &'s AddressSpace<'a, A, T> {
        self.space
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// 0 for the innermost frame.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn ip(&self) -> u64 {
        self.ip.address()
    }

    pub fn code_address(&self) -> CodeAddress {
        self.ip
    }

    pub fn sp(&self) -> u64 {
        self.regs.get(A::SP).unwrap_or(0)
    }

    pub fn regs(&self) -> &A::UnwindRegs {
        &self.regs
    }

    pub fn set_ptr_auth_mask(&mut self, mask: u64) {
        self.ptr_auth_mask = mask;
    }

    pub fn ptr_auth_mask(&self) -> u64 {
        self.ptr_auth_mask
    }

    /// The value of `register` in the current frame.
    pub fn reg(&self, register: Register) -> Result<u64, Error> {
        if register.0 >= A::REGISTER_COUNT {
            return Err(Error::UnsupportedRegister(register.0));
        }
        self.regs
            .get(register)
            .ok_or(Error::RegisterUnavailable(register.0))
    }

    /// Changes the value of `register` in the current frame. In the
    /// innermost frame the new value is also written to the target.
    pub fn set_reg(&mut self, register: Register, value: u64) -> Result<(), Error> {
        if register.0 >= A::REGISTER_COUNT {
            return Err(Error::UnsupportedRegister(register.0));
        }
        if self.frame_index == 0 {
            self.space.write_reg(register, value, self.arg)?;
        }
        self.regs.set(register, value);
        if register == A::IP {
            self.ip = CodeAddress::InstructionPointer(value);
            self.frame_kind = None;
        }
        Ok(())
    }

    /// Floating-point and vector registers are only known in the innermost
    /// frame.
    pub fn fp_reg(&mut self, register: Register) -> Result<FpValue, Error> {
        if self.frame_index != 0 {
            return Err(Error::RegisterUnavailable(register.0));
        }
        self.space.read_fp_reg(register, self.arg)
    }

    /// The unwind info covering the current frame.
    pub fn proc_info(&mut self) -> Result<&ProcInfo<'a>, Error> {
        let lookup = self.ip.address_for_lookup();
        if !matches!(&self.proc_info, Some(pi) if pi.contains(lookup)) {
            let pi = self.space.find_proc_info(lookup, self.arg)?;
            trace!("ProcInfo for {:?}: {:?}", HexNum(lookup), pi);
            self.proc_info = Some(pi);
        }
        self.proc_info
            .as_ref()
            .ok_or(Error::NoUnwindInfo(lookup))
    }

    /// Writes the name of the routine containing the current ip into `buf`.
    pub fn proc_name(&mut self, buf: &mut [u8]) -> Result<ProcName, Error> {
        self.space.proc_name(self.ip.address(), buf, self.arg)
    }

    pub fn frame_kind(&mut self) -> FrameKind {
        if let Some(kind) = self.frame_kind {
            return kind;
        }
        let space = self.space;
        let byte_order = space.byte_order();
        let arg = &mut *self.arg;
        let mut read_word = |address| space.read_word(address, arg);
        let kind = match classify::<A, _>(self.ip.address(), byte_order, &mut read_word) {
            Ok(kind) => kind,
            Err(e) => {
                trace!("Classifier declined: {}", e);
                FrameKind::Normal
            }
        };
        let kind = match kind {
            FrameKind::Normal => match self.proc_info() {
                Ok(pi) if pi.unwind_info == UnwindInfo::CantUnwind => FrameKind::IndexTableStop,
                _ => FrameKind::Normal,
            },
            kind => kind,
        };
        self.frame_kind = Some(kind);
        kind
    }

    pub fn is_plt_entry(&mut self) -> bool {
        matches!(self.frame_kind(), FrameKind::PltStub(_))
    }

    pub fn is_signal_frame(&mut self) -> bool {
        self.frame_kind() == FrameKind::SignalTrampoline
    }

    /// Installs the current frame's registers in the target and lets it
    /// continue there.
    pub fn resume(&mut self) -> Result<(), Error> {
        self.space.resume(&self.regs, self.arg)
    }

    /// Moves the cursor to the caller of the current frame.
    pub fn step(&mut self) -> Result<Step, Error> {
        match self.state {
            CursorState::Terminated => return Ok(Step::Terminated),
            CursorState::Failed(e) => return Err(e),
            CursorState::Initialized | CursorState::HasMore => {}
        }
        let result = self.step_frame();
        self.state = match result {
            Ok(Step::HasMore) => CursorState::HasMore,
            Ok(Step::Terminated) => {
                debug!("Reached the outermost frame at {:?}", HexNum(self.ip()));
                CursorState::Terminated
            }
            Err(e) => {
                debug!("Step from {:?} failed: {}", HexNum(self.ip()), e);
                CursorState::Failed(e)
            }
        };
        result
    }

    fn step_frame(&mut self) -> Result<Step, Error> {
        match self.frame_kind() {
            FrameKind::PltStub(position) => {
                let mut regs = self.regs.clone();
                let space = self.space;
                let arg = &mut *self.arg;
                let mut read_word = |address| space.read_word(address, arg);
                let next = A::unwind_plt_stub(position, &mut regs, &mut read_word)?;
                trace!("PLT stub at position {}, caller {:?}", position, next);
                self.advance(regs, next, true)
            }
            FrameKind::SignalTrampoline => {
                let mut regs = self.regs.clone();
                let space = self.space;
                let arg = &mut *self.arg;
                let mut read_word = |address| space.read_word(address, arg);
                let next = A::unwind_signal_frame(&mut regs, &mut read_word)?;
                trace!("Signal frame, interrupted at {:?}", next);
                self.advance(regs, next, false)
            }
            FrameKind::IndexTableStop => Err(Error::StopUnwind),
            FrameKind::Normal => self.step_with_cfi(),
        }
    }

    fn step_with_cfi(&mut self) -> Result<Step, Error> {
        let lookup = self.ip.address_for_lookup();
        let program = match &self.proc_info()?.unwind_info {
            UnwindInfo::Cfi(program) => program.clone(),
            UnwindInfo::CantUnwind => return Err(Error::StopUnwind),
        };
        let space = self.space;
        let byte_order = space.byte_order();
        let row =
            unwind_row_for_address(&program, byte_order, A::VENDOR, lookup, &mut self.cie_cache)?;
        let arg = &mut *self.arg;
        let mut read_word = |address| space.read_word(address, arg);
        let caller = apply_unwind_row::<A, _, _>(&row, &self.regs, byte_order, &mut read_word)?;
        trace!(
            "CFA {:?}, return address {:?}",
            HexNum(caller.cfa),
            caller.return_address.map(HexNum)
        );

        if caller.cfa == 0 {
            return Ok(Step::Terminated);
        }
        let Some(mut return_address) = caller.return_address else {
            return Ok(Step::Terminated);
        };
        if row.row.is_ra_signed() {
            return_address = A::strip_return_address(return_address, self.ptr_auth_mask);
        }
        let next = if row.is_signal_trampoline {
            CodeAddress::InstructionPointer(return_address)
        } else {
            CodeAddress::ReturnAddress(return_address)
        };
        let mut regs = caller.regs;
        regs.set(A::IP, return_address);
        self.advance(regs, next, !row.is_signal_trampoline)
    }

    /// Moves to the caller frame described by `regs` and `next`.
    fn advance(
        &mut self,
        regs: A::UnwindRegs,
        next: CodeAddress,
        check_progress: bool,
    ) -> Result<Step, Error> {
        if next.address() == 0 {
            return Ok(Step::Terminated);
        }
        let new_sp = regs
            .get(A::SP)
            .ok_or(Error::RegisterUnavailable(A::SP.0))?;
        if check_progress {
            let sp = self.sp();
            if new_sp < sp || (new_sp == sp && next.address() == self.ip.address()) {
                return Err(Error::NoProgress);
            }
        }
        self.regs = regs;
        self.ip = next;
        self.frame_kind = None;
        self.frame_index += 1;
        Ok(Step::HasMore)
    }
}

impl<'s, 'a, A: Arch, T: ?Sized> Debug for Cursor<'s, 'a, A, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cursor")
            .field("arch", &A::NAME)
            .field("frame_index", &self.frame_index)
            .field("ip", &self.ip)
            .field("regs", &self.regs)
            .field("state", &self.state)
            .finish()
    }
}
