use arrayvec::ArrayVec;
use gimli::{
    BaseAddresses, CallFrameInstruction, CommonInformationEntry, DebugFrame, EhFrame, Encoding,
    EndianSlice, Expression, FrameDescriptionEntry, Reader, Register, RunTimeEndian,
    UnwindSection, Vendor,
};
use tracing::trace;

use crate::address_space::ByteOrder;
use crate::error::{CfiError, Error};
use crate::proc_info::{CfiProgram, CfiSectionKind};

/// Rules are tracked for DWARF register columns below this number. Rules for
/// higher columns (vector registers) are skipped.
pub const MAX_REGISTER_COLUMNS: usize = 33;

/// Maximum nesting of DW_CFA_remember_state.
pub const REMEMBER_STACK_DEPTH: usize = 8;

pub type CfiReader<'a> = EndianSlice<'a, RunTimeEndian>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CfaRule<R: Reader> {
    RegisterAndOffset { register: Register, offset: i64 },
    Expression(Expression<R>),
}

/// Where the caller's value of a register can be found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterRule<R: Reader> {
    /// No rule; the register keeps its value.
    Unspecified,
    Undefined,
    SameValue,
    /// Saved at CFA + offset.
    Offset(i64),
    /// The value is CFA + offset.
    ValOffset(i64),
    /// The value is in another register of the callee.
    Register(Register),
    /// Saved at the address computed by the expression.
    Expression(Expression<R>),
    /// The value is computed by the expression.
    ValExpression(Expression<R>),
}

/// The rules in force at one instruction address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleRow<R: Reader> {
    cfa: Option<CfaRule<R>>,
    registers: [RegisterRule<R>; MAX_REGISTER_COLUMNS],
    ra_signed: bool,
    args_size: u64,
}

impl<R: Reader> Default for RuleRow<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Reader> RuleRow<R> {
    pub fn new() -> Self {
        Self {
            cfa: None,
            registers: core::array::from_fn(|_| RegisterRule::Unspecified),
            ra_signed: false,
            args_size: 0,
        }
    }

    pub fn cfa(&self) -> Option<&CfaRule<R>> {
        self.cfa.as_ref()
    }

    pub fn register(&self, register: Register) -> RegisterRule<R> {
        match self.registers.get(register.0 as usize) {
            Some(rule) => rule.clone(),
            None => RegisterRule::Unspecified,
        }
    }

    /// Whether the return address was signed with pointer authentication
    /// (DW_CFA_AARCH64_negate_ra_state).
    pub fn is_ra_signed(&self) -> bool {
        self.ra_signed
    }

    pub fn args_size(&self) -> u64 {
        self.args_size
    }

    fn set_register(&mut self, register: Register, rule: RegisterRule<R>) {
        match self.registers.get_mut(register.0 as usize) {
            Some(slot) => *slot = rule,
            None => trace!("Ignoring CFI rule for register {}", register.0),
        }
    }
}

/// The rule row for one address, and what the step driver needs to know
/// about the FDE it came from.
#[derive(Clone, Debug)]
pub struct UnwindRow<R: Reader> {
    pub row: RuleRow<R>,
    pub return_address_register: Register,
    pub encoding: Encoding,
    pub is_signal_trampoline: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CieKey {
    section_start: usize,
    section_len: usize,
    cie_offset: usize,
    byte_order: ByteOrder,
}

/// Remembers the initial rules of the most recently used CIE.
///
/// The key is the section's bytes and the CIE's offset in them, so two
/// `ProcInfo`s that share a CIE share the entry.
pub struct CieCache<R: Reader> {
    entry: Option<(CieKey, RuleRow<R>)>,
    misses: u64,
}

impl<R: Reader> Default for CieCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Reader> CieCache<R> {
    pub fn new() -> Self {
        Self {
            entry: None,
            misses: 0,
        }
    }

    /// How often CIE instructions had to be interpreted.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    fn initial_rules<F>(&mut self, key: CieKey, compute: F) -> Result<&RuleRow<R>, Error>
    where
        F: FnOnce() -> Result<RuleRow<R>, Error>,
    {
        if !matches!(&self.entry, Some((k, _)) if *k == key) {
            let row = compute()?;
            self.misses += 1;
            self.entry = Some((key, row));
        }
        self.entry
            .as_ref()
            .map(|(_, row)| row)
            .ok_or(Error::BadUnwindInfo(CfiError::CfaUndefined))
    }
}

/// Parse the FDE that `program` points to.
pub fn parse_fde<'a>(
    program: &CfiProgram<'a>,
    byte_order: ByteOrder,
) -> Result<FrameDescriptionEntry<CfiReader<'a>>, Error> {
    let data = EndianSlice::new(program.section, byte_order.gimli());
    let fde = match program.kind {
        CfiSectionKind::EhFrame => {
            let mut eh_frame = EhFrame::from(data);
            eh_frame.set_address_size(8);
            fde_at_offset(&eh_frame, &program.bases, program.fde_offset)
        }
        CfiSectionKind::DebugFrame => {
            let mut debug_frame = DebugFrame::from(data);
            debug_frame.set_address_size(8);
            fde_at_offset(&debug_frame, &program.bases, program.fde_offset)
        }
    };
    Ok(fde?)
}

fn fde_at_offset<R, US>(
    section: &US,
    bases: &BaseAddresses,
    fde_offset: usize,
) -> gimli::Result<FrameDescriptionEntry<R>>
where
    R: Reader<Offset = usize>,
    US: UnwindSection<R>,
{
    section.fde_from_offset(bases, US::Offset::from(fde_offset), |section, bases, offset| {
        section.cie_from_offset(bases, offset)
    })
}

/// Interpret the CFI program of `program` up to `address` and return the
/// rules in force at that address.
///
/// `vendor` selects the meaning of vendor-specific opcodes such as
/// `DW_CFA_AARCH64_negate_ra_state`.
pub fn unwind_row_for_address<'a>(
    program: &CfiProgram<'a>,
    byte_order: ByteOrder,
    vendor: Vendor,
    address: u64,
    cache: &mut CieCache<CfiReader<'a>>,
) -> Result<UnwindRow<CfiReader<'a>>, Error> {
    let data = EndianSlice::new(program.section, byte_order.gimli());
    let key = CieKey {
        section_start: program.section.as_ptr() as usize,
        section_len: program.section.len(),
        cie_offset: 0,
        byte_order,
    };
    match program.kind {
        CfiSectionKind::EhFrame => {
            let mut eh_frame = EhFrame::from(data);
            eh_frame.set_address_size(8);
            eh_frame.set_vendor(vendor);
            row_for_fde(&eh_frame, program, key, address, cache)
        }
        CfiSectionKind::DebugFrame => {
            let mut debug_frame = DebugFrame::from(data);
            debug_frame.set_address_size(8);
            debug_frame.set_vendor(vendor);
            row_for_fde(&debug_frame, program, key, address, cache)
        }
    }
}

fn row_for_fde<R, US>(
    section: &US,
    program: &CfiProgram<'_>,
    key: CieKey,
    address: u64,
    cache: &mut CieCache<R>,
) -> Result<UnwindRow<R>, Error>
where
    R: Reader<Offset = usize>,
    US: UnwindSection<R>,
{
    let bases = &program.bases;
    let fde = fde_at_offset(section, bases, program.fde_offset)?;
    if !fde.contains(address) {
        return Err(Error::NoUnwindInfo(address));
    }
    let cie = fde.cie();
    let key = CieKey {
        cie_offset: cie.offset(),
        ..key
    };
    let initial = cache.initial_rules(key, || initial_row(section, bases, cie))?;

    let start = fde.initial_address();
    let end = start.checked_add(fde.len()).ok_or(CfiError::OffsetOverflow)?;
    let mut interpreter = Interpreter::new(initial.clone(), Some(initial), cie);
    let mut instructions = fde.instructions(section, bases);
    let location = LocationRange {
        current: start,
        end,
        target: address,
    };
    interpreter.run(section, Some(location), || instructions.next())?;

    Ok(UnwindRow {
        row: interpreter.row,
        return_address_register: cie.return_address_register(),
        encoding: cie.encoding(),
        is_signal_trampoline: fde.is_signal_trampoline(),
    })
}

fn initial_row<R, US>(
    section: &US,
    bases: &BaseAddresses,
    cie: &CommonInformationEntry<R>,
) -> Result<RuleRow<R>, Error>
where
    R: Reader,
    US: UnwindSection<R>,
{
    let mut interpreter = Interpreter::new(RuleRow::new(), None, cie);
    let mut instructions = cie.instructions(section, bases);
    interpreter.run(section, None, || instructions.next())?;
    Ok(interpreter.row)
}

struct LocationRange {
    current: u64,
    end: u64,
    target: u64,
}

impl LocationRange {
    fn is_past_target(&self) -> bool {
        self.current > self.target || self.current >= self.end
    }
}

struct Interpreter<'i, R: Reader> {
    row: RuleRow<R>,
    /// The CIE's rules, used by DW_CFA_restore. `None` while running the CIE.
    initial: Option<&'i RuleRow<R>>,
    remembered: ArrayVec<RuleRow<R>, REMEMBER_STACK_DEPTH>,
    code_alignment_factor: u64,
    data_alignment_factor: i64,
}

impl<'i, R: Reader> Interpreter<'i, R> {
    fn new(
        row: RuleRow<R>,
        initial: Option<&'i RuleRow<R>>,
        cie: &CommonInformationEntry<R>,
    ) -> Self {
        Self {
            row,
            initial,
            remembered: ArrayVec::new(),
            code_alignment_factor: cie.code_alignment_factor(),
            data_alignment_factor: cie.data_alignment_factor(),
        }
    }

    fn factored(&self, factored_offset: i64) -> Result<i64, Error> {
        factored_offset
            .checked_mul(self.data_alignment_factor)
            .ok_or(Error::BadUnwindInfo(CfiError::OffsetOverflow))
    }

    fn factored_unsigned(&self, factored_offset: u64) -> Result<i64, Error> {
        let factored_offset =
            i64::try_from(factored_offset).map_err(|_| CfiError::OffsetOverflow)?;
        self.factored(factored_offset)
    }

    fn cfa_register_and_offset(&mut self) -> Result<(&mut Register, &mut i64), Error> {
        match &mut self.row.cfa {
            Some(CfaRule::RegisterAndOffset { register, offset }) => Ok((register, offset)),
            _ => Err(CfiError::CfaNotRegisterBased.into()),
        }
    }

    /// Execute instructions until they run out or, if `location` is given,
    /// until the location counter moves past the target address.
    fn run<US, F>(
        &mut self,
        section: &US,
        mut location: Option<LocationRange>,
        mut next: F,
    ) -> Result<(), Error>
    where
        US: UnwindSection<R>,
        F: FnMut() -> gimli::Result<Option<CallFrameInstruction<R::Offset>>>,
    {
        while let Some(instruction) = next()? {
            match instruction {
                CallFrameInstruction::SetLoc { address } => {
                    let location = location.as_mut().ok_or(CfiError::InvalidInCie)?;
                    if address < location.current {
                        return Err(CfiError::LocationMovedBackwards.into());
                    }
                    location.current = address;
                    if location.is_past_target() {
                        break;
                    }
                }
                CallFrameInstruction::AdvanceLoc { delta } => {
                    let location = location.as_mut().ok_or(CfiError::InvalidInCie)?;
                    let delta = u64::from(delta)
                        .checked_mul(self.code_alignment_factor)
                        .ok_or(CfiError::OffsetOverflow)?;
                    location.current = location
                        .current
                        .checked_add(delta)
                        .ok_or(CfiError::OffsetOverflow)?;
                    if location.is_past_target() {
                        break;
                    }
                }
                CallFrameInstruction::DefCfa { register, offset } => {
                    let offset = i64::try_from(offset).map_err(|_| CfiError::OffsetOverflow)?;
                    self.row.cfa = Some(CfaRule::RegisterAndOffset { register, offset });
                }
                CallFrameInstruction::DefCfaSf {
                    register,
                    factored_offset,
                } => {
                    let offset = self.factored(factored_offset)?;
                    self.row.cfa = Some(CfaRule::RegisterAndOffset { register, offset });
                }
                CallFrameInstruction::DefCfaRegister { register } => {
                    *self.cfa_register_and_offset()?.0 = register;
                }
                CallFrameInstruction::DefCfaOffset { offset } => {
                    let offset = i64::try_from(offset).map_err(|_| CfiError::OffsetOverflow)?;
                    *self.cfa_register_and_offset()?.1 = offset;
                }
                CallFrameInstruction::DefCfaOffsetSf { factored_offset } => {
                    let offset = self.factored(factored_offset)?;
                    *self.cfa_register_and_offset()?.1 = offset;
                }
                CallFrameInstruction::DefCfaExpression { expression } => {
                    self.row.cfa = Some(CfaRule::Expression(expression.get(section)?));
                }
                CallFrameInstruction::Undefined { register } => {
                    self.row.set_register(register, RegisterRule::Undefined);
                }
                CallFrameInstruction::SameValue { register } => {
                    self.row.set_register(register, RegisterRule::SameValue);
                }
                CallFrameInstruction::Offset {
                    register,
                    factored_offset,
                } => {
                    let offset = self.factored_unsigned(factored_offset)?;
                    self.row.set_register(register, RegisterRule::Offset(offset));
                }
                CallFrameInstruction::OffsetExtendedSf {
                    register,
                    factored_offset,
                } => {
                    let offset = self.factored(factored_offset)?;
                    self.row.set_register(register, RegisterRule::Offset(offset));
                }
                CallFrameInstruction::ValOffset {
                    register,
                    factored_offset,
                } => {
                    let offset = self.factored_unsigned(factored_offset)?;
                    self.row.set_register(register, RegisterRule::ValOffset(offset));
                }
                CallFrameInstruction::ValOffsetSf {
                    register,
                    factored_offset,
                } => {
                    let offset = self.factored(factored_offset)?;
                    self.row.set_register(register, RegisterRule::ValOffset(offset));
                }
                CallFrameInstruction::Register {
                    dest_register,
                    src_register,
                } => {
                    self.row
                        .set_register(dest_register, RegisterRule::Register(src_register));
                }
                CallFrameInstruction::Expression {
                    register,
                    expression,
                } => {
                    let expression = expression.get(section)?;
                    self.row
                        .set_register(register, RegisterRule::Expression(expression));
                }
                CallFrameInstruction::ValExpression {
                    register,
                    expression,
                } => {
                    let expression = expression.get(section)?;
                    self.row
                        .set_register(register, RegisterRule::ValExpression(expression));
                }
                CallFrameInstruction::Restore { register } => {
                    let initial = self.initial.ok_or(CfiError::InvalidInCie)?;
                    self.row.set_register(register, initial.register(register));
                }
                CallFrameInstruction::RememberState => {
                    self.remembered
                        .try_push(self.row.clone())
                        .map_err(|_| CfiError::RememberStackOverflow)?;
                }
                CallFrameInstruction::RestoreState => {
                    self.row = self
                        .remembered
                        .pop()
                        .ok_or(CfiError::RestoreWithoutRemember)?;
                }
                CallFrameInstruction::ArgsSize { size } => {
                    self.row.args_size = u64::from(size);
                }
                CallFrameInstruction::NegateRaState => {
                    self.row.ra_signed = !self.row.ra_signed;
                }
                CallFrameInstruction::Nop => {}
                #[allow(unreachable_patterns)]
                _ => return Err(CfiError::UnsupportedInstruction.into()),
            }
        }
        Ok(())
    }
}
