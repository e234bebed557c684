use alloc::vec::Vec;
use gimli::{
    BaseAddresses, CieOrFde, CommonInformationEntry, DebugFrame, EhFrame, Encoding, EndianSlice,
    Evaluation, EvaluationResult, EvaluationStorage, Expression, Location, Piece, Reader,
    Register, UnwindOffset, UnwindSection, Value,
};
use tracing::trace;

use crate::add_signed::offset_address;
use crate::address_space::ByteOrder;
use crate::arch::Arch;
use crate::cfi::{CfaRule, RegisterRule, UnwindRow};
use crate::error::{CfiError, Error};
use crate::module::SectionAddresses;
use crate::proc_info::CfiSectionKind;
use crate::unwindregs::DwarfUnwindRegs;

/// Fixed-size storage for DWARF expression evaluation, so that evaluating
/// unwind rules never allocates.
pub struct StoreOnStack;

impl<R: Reader> EvaluationStorage<R> for StoreOnStack {
    type Stack = [Value; 64];
    type ExpressionStack = [(R, R); 4];
    type Result = [Piece<R>; 1];
}

pub(crate) fn base_addresses_for_sections(sections: &SectionAddresses) -> BaseAddresses {
    BaseAddresses::default()
        .set_eh_frame(sections.eh_frame)
        .set_eh_frame_hdr(sections.eh_frame_hdr)
        .set_text(sections.text)
        .set_got(sections.got)
}

#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(not(feature = "std"), derive(thiserror_no_std::Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiIndexError {
    #[error("Could not parse the entries of {0:?}: {1}")]
    Parse(CfiSectionKind, gimli::Error),

    #[error("FDE for 0x{0:x} starts below the module's base address")]
    BelowBaseAddress(u64),

    #[error("FDE for 0x{0:x} starts more than 4 GiB past the module's base address")]
    TooFarFromBase(u64),

    #[error("FDE offset 0x{0:x} does not fit into 32 bits")]
    OffsetTooLarge(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct IndexEntry {
    /// Relative to the module's base address.
    relative_start: u32,
    fde_offset: u32,
}

/// The start addresses of all FDEs in a section, sorted for binary search.
/// Built for modules whose `.eh_frame_hdr` has no search table, and for
/// `.debug_frame`, which never has one.
pub struct CfiIndex {
    entries: Vec<IndexEntry>,
}

impl CfiIndex {
    pub fn build(
        section: &[u8],
        kind: CfiSectionKind,
        byte_order: ByteOrder,
        bases: &BaseAddresses,
        base_address: u64,
    ) -> Result<Self, CfiIndexError> {
        let data = EndianSlice::new(section, byte_order.gimli());
        let mut entries = match kind {
            CfiSectionKind::EhFrame => {
                let mut eh_frame = EhFrame::from(data);
                eh_frame.set_address_size(8);
                index_entries(&eh_frame, kind, bases, base_address)?
            }
            CfiSectionKind::DebugFrame => {
                let mut debug_frame = DebugFrame::from(data);
                debug_frame.set_address_size(8);
                index_entries(&debug_frame, kind, bases, base_address)?
            }
        };
        entries.sort_unstable_by_key(|entry| entry.relative_start);
        Ok(Self { entries })
    }

    /// The offset of the last FDE that starts at or before
    /// `relative_address`. Whether that FDE covers the address is up to the
    /// caller to check.
    pub fn lookup(&self, relative_address: u32) -> Option<usize> {
        let i = self
            .entries
            .partition_point(|entry| entry.relative_start <= relative_address);
        let entry = self.entries.get(i.checked_sub(1)?)?;
        Some(entry.fde_offset as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn index_entries<R, US>(
    section: &US,
    kind: CfiSectionKind,
    bases: &BaseAddresses,
    base_address: u64,
) -> Result<Vec<IndexEntry>, CfiIndexError>
where
    R: Reader<Offset = usize>,
    US: UnwindSection<R>,
{
    let parse_error = |e| CfiIndexError::Parse(kind, e);
    let mut entries = Vec::new();
    let mut last_cie: Option<CommonInformationEntry<R>> = None;
    let mut iter = section.entries(bases);
    while let Some(entry) = iter.next().map_err(parse_error)? {
        let partial = match entry {
            CieOrFde::Cie(cie) => {
                last_cie = Some(cie);
                continue;
            }
            CieOrFde::Fde(partial) => partial,
        };
        // An FDE almost always belongs to the CIE right before it.
        let fde = partial
            .parse(|section, bases, cie_offset| match &last_cie {
                Some(cie) if cie.offset() == UnwindOffset::<usize>::into(cie_offset) => {
                    Ok(cie.clone())
                }
                _ => section.cie_from_offset(bases, cie_offset),
            })
            .map_err(parse_error)?;
        let start = fde.initial_address();
        let relative_start = start
            .checked_sub(base_address)
            .ok_or(CfiIndexError::BelowBaseAddress(start))?;
        let relative_start =
            u32::try_from(relative_start).map_err(|_| CfiIndexError::TooFarFromBase(start))?;
        let fde_offset =
            u32::try_from(fde.offset()).map_err(|_| CfiIndexError::OffsetTooLarge(fde.offset()))?;
        entries.push(IndexEntry {
            relative_start,
            fde_offset,
        });
    }
    Ok(entries)
}

/// The registers of the caller, computed from a rule row.
#[derive(Clone, Debug, PartialEq)]
pub struct CallerFrame<UR> {
    pub regs: UR,
    pub cfa: u64,
    /// `None` if the return address column is undefined, which marks the
    /// outermost frame.
    pub return_address: Option<u64>,
}

/// Apply `unwind_row` to the callee's registers.
///
/// Values are always computed from the callee's registers, never from
/// partially updated caller registers. Registers without a rule keep their
/// value. A callee-saved register that cannot be read from the stack becomes
/// unknown; failing to recover the CFA or the return address fails the step.
pub fn apply_unwind_row<A, R, F>(
    unwind_row: &UnwindRow<R>,
    regs: &A::UnwindRegs,
    byte_order: ByteOrder,
    read_word: &mut F,
) -> Result<CallerFrame<A::UnwindRegs>, Error>
where
    A: Arch,
    R: Reader,
    F: FnMut(u64) -> Result<u64, Error>,
{
    let row = &unwind_row.row;
    let encoding = unwind_row.encoding;
    let cfa_rule = row.cfa().ok_or(CfiError::CfaUndefined)?;
    let cfa = eval_cfa_rule(cfa_rule, encoding, regs, byte_order, read_word)?;

    let mut caller = regs.clone();
    for i in 0..A::REGISTER_COUNT {
        let register = Register(i);
        match row.register(register) {
            RegisterRule::Unspecified | RegisterRule::SameValue => {}
            RegisterRule::Undefined => caller.clear(register),
            rule => {
                match eval_register_rule(rule, cfa, encoding, regs, byte_order, read_word) {
                    Ok(value) => {
                        caller.set(register, value);
                    }
                    Err(e) => {
                        trace!("Could not recover register {}: {}", i, e);
                        caller.clear(register);
                    }
                }
            }
        }
    }
    if matches!(row.register(A::SP), RegisterRule::Unspecified) {
        caller.set(A::SP, cfa);
    }

    let ra = unwind_row.return_address_register;
    let return_address = match row.register(ra) {
        RegisterRule::Undefined => None,
        RegisterRule::Unspecified | RegisterRule::SameValue => {
            Some(regs.get(ra).ok_or(Error::RegisterUnavailable(ra.0))?)
        }
        rule => Some(eval_register_rule(
            rule, cfa, encoding, regs, byte_order, read_word,
        )?),
    };

    Ok(CallerFrame {
        regs: caller,
        cfa,
        return_address,
    })
}

pub fn eval_cfa_rule<R, UR, F>(
    rule: &CfaRule<R>,
    encoding: Encoding,
    regs: &UR,
    byte_order: ByteOrder,
    read_word: &mut F,
) -> Result<u64, Error>
where
    R: Reader,
    UR: DwarfUnwindRegs,
    F: FnMut(u64) -> Result<u64, Error>,
{
    match rule {
        CfaRule::RegisterAndOffset { register, offset } => {
            let val = regs
                .get(*register)
                .ok_or(Error::RegisterUnavailable(register.0))?;
            offset_address(val, *offset)
        }
        CfaRule::Expression(expr) => {
            eval_expr(expr.clone(), encoding, regs, None, byte_order, read_word)
        }
    }
}

fn eval_expr<R, UR, F>(
    expr: Expression<R>,
    encoding: Encoding,
    regs: &UR,
    initial_value: Option<u64>,
    byte_order: ByteOrder,
    read_word: &mut F,
) -> Result<u64, Error>
where
    R: Reader,
    UR: DwarfUnwindRegs,
    F: FnMut(u64) -> Result<u64, Error>,
{
    let failed = |_| Error::BadUnwindInfo(CfiError::ExpressionFailed);
    let mut eval = Evaluation::<R, StoreOnStack>::new_in(expr.0, encoding);
    if let Some(value) = initial_value {
        eval.set_initial_value(value);
    }
    let mut result = eval.evaluate().map_err(failed)?;
    loop {
        match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = regs
                    .get(register)
                    .ok_or(Error::RegisterUnavailable(register.0))?;
                result = eval
                    .resume_with_register(Value::Generic(value))
                    .map_err(failed)?;
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let word = read_word(address)?;
                let value = truncate_word(word, size, byte_order);
                result = eval
                    .resume_with_memory(Value::Generic(value))
                    .map_err(failed)?;
            }
            _ => return Err(CfiError::ExpressionFailed.into()),
        }
    }
    match eval.as_result().last().map(|piece| &piece.location) {
        Some(Location::Address { address }) => Ok(*address),
        Some(Location::Value {
            value: Value::Generic(value),
        }) => Ok(*value),
        _ => Err(CfiError::ExpressionFailed.into()),
    }
}

/// Keep the first `size` bytes in memory order of a word read at the same
/// address.
fn truncate_word(word: u64, size: u8, byte_order: ByteOrder) -> u64 {
    if size == 0 || size >= 8 {
        return word;
    }
    let bits = u32::from(size) * 8;
    match byte_order {
        ByteOrder::Little => word & ((1u64 << bits) - 1),
        ByteOrder::Big => word >> (64 - bits),
    }
}

pub fn eval_register_rule<R, UR, F>(
    rule: RegisterRule<R>,
    cfa: u64,
    encoding: Encoding,
    regs: &UR,
    byte_order: ByteOrder,
    read_word: &mut F,
) -> Result<u64, Error>
where
    R: Reader,
    UR: DwarfUnwindRegs,
    F: FnMut(u64) -> Result<u64, Error>,
{
    match rule {
        RegisterRule::Offset(offset) => read_word(offset_address(cfa, offset)?),
        RegisterRule::ValOffset(offset) => offset_address(cfa, offset),
        RegisterRule::Register(register) => regs
            .get(register)
            .ok_or(Error::RegisterUnavailable(register.0)),
        RegisterRule::Expression(expr) => {
            let address = eval_expr(expr, encoding, regs, Some(cfa), byte_order, read_word)?;
            read_word(address)
        }
        RegisterRule::ValExpression(expr) => {
            eval_expr(expr, encoding, regs, Some(cfa), byte_order, read_word)
        }
        RegisterRule::Unspecified | RegisterRule::SameValue | RegisterRule::Undefined => {
            Err(Error::InvalidArgument)
        }
    }
}
