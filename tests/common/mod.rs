#![allow(dead_code)]

use framestep::*;
use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec,
    FrameDescriptionEntry, FrameTable,
};
use gimli::{AArch64, Encoding, Format, LittleEndian, X86_64};

/// The address at which the synthetic modules' `.eh_frame` is "mapped".
pub const EH_FRAME_ADDRESS: u64 = 0x40_0000;

/// A remote target made of a few memory regions and a register snapshot.
pub struct Target<A: Arch> {
    regions: Vec<(u64, Vec<u8>)>,
    pub regs: A::UnwindRegs,
    pub fp_regs: Vec<(Register, FpValue)>,
    pub resumed: Option<A::UnwindRegs>,
    pub memory_reads: usize,
}

impl<A: Arch> Target<A> {
    pub fn new(regs: A::UnwindRegs) -> Self {
        Self {
            regions: Vec::new(),
            regs,
            fp_regs: Vec::new(),
            resumed: None,
            memory_reads: 0,
        }
    }

    pub fn map(&mut self, base: u64, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }

    pub fn map_words(&mut self, base: u64, words: &[u64]) {
        self.map(base, words.iter().flat_map(|w| w.to_le_bytes()).collect());
    }

    fn slot(&mut self, address: u64) -> Option<&mut [u8]> {
        self.regions.iter_mut().find_map(|(base, bytes)| {
            let start = usize::try_from(address.checked_sub(*base)?).ok()?;
            bytes.get_mut(start..start.checked_add(8)?)
        })
    }
}

fn access_mem<A: Arch>(
    _space: &AddressSpace<'_, A, Target<A>>,
    address: u64,
    value: &mut u64,
    write: bool,
    target: &mut Target<A>,
) -> Result<(), Error> {
    target.memory_reads += usize::from(!write);
    let slot = target
        .slot(address)
        .ok_or(Error::UnreadableMemory(address))?;
    if write {
        slot.copy_from_slice(&value.to_le_bytes());
    } else {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(slot);
        *value = u64::from_le_bytes(bytes);
    }
    Ok(())
}

fn access_reg<A: Arch>(
    _space: &AddressSpace<'_, A, Target<A>>,
    register: Register,
    value: &mut u64,
    write: bool,
    target: &mut Target<A>,
) -> Result<(), Error> {
    if register.0 >= A::REGISTER_COUNT {
        return Err(Error::UnsupportedRegister(register.0));
    }
    if write {
        target.regs.set(register, *value);
    } else {
        *value = target
            .regs
            .get(register)
            .ok_or(Error::RegisterUnavailable(register.0))?;
    }
    Ok(())
}

fn access_fpreg<A: Arch>(
    _space: &AddressSpace<'_, A, Target<A>>,
    register: Register,
    value: &mut FpValue,
    write: bool,
    target: &mut Target<A>,
) -> Result<(), Error> {
    let slot = target
        .fp_regs
        .iter_mut()
        .find(|(r, _)| *r == register)
        .ok_or(Error::UnsupportedRegister(register.0))?;
    if write {
        slot.1 = *value;
    } else {
        *value = slot.1;
    }
    Ok(())
}

fn resume<A: Arch>(
    _space: &AddressSpace<'_, A, Target<A>>,
    regs: &A::UnwindRegs,
    target: &mut Target<A>,
) -> Result<(), Error> {
    target.resumed = Some(regs.clone());
    Ok(())
}

pub fn accessors<'a, A: Arch>() -> Accessors<'a, A, Target<A>> {
    Accessors {
        find_proc_info: from_modules::find_proc_info,
        access_mem,
        access_reg,
        access_fpreg,
        resume,
        get_proc_name: from_modules::get_proc_name,
    }
}

pub fn remote_space<'a, A: Arch>(modules: Vec<Module<'a>>) -> AddressSpace<'a, A, Target<A>> {
    let mut space = AddressSpace::remote(ByteOrder::Little, accessors());
    for module in modules {
        space.add_module(module);
    }
    space
}

pub fn module<'a>(name: &str, range: std::ops::Range<u64>, data: UnwindData<'a>) -> Module<'a> {
    let sections = SectionAddresses {
        text: range.start,
        eh_frame: EH_FRAME_ADDRESS,
        ..Default::default()
    };
    Module::new(name.to_string(), range.clone(), range.start, sections, data)
}

/// A function and the CFA instructions of its FDE, keyed by code offset.
pub struct Function {
    pub start: u64,
    pub len: u32,
    pub instructions: Vec<(u32, CallFrameInstruction)>,
}

impl Function {
    pub fn new(start: u64, len: u32) -> Self {
        Self {
            start,
            len,
            instructions: Vec::new(),
        }
    }

    pub fn at(mut self, offset: u32, instruction: CallFrameInstruction) -> Self {
        self.instructions.push((offset, instruction));
        self
    }
}

fn encoding() -> Encoding {
    Encoding {
        format: Format::Dwarf32,
        version: 1,
        address_size: 8,
    }
}

/// The CIE compilers emit on x86_64: CFA = rsp + 8, return address at CFA - 8.
pub fn x86_64_cie() -> CommonInformationEntry {
    let mut cie = CommonInformationEntry::new(encoding(), 1, -8, X86_64::RA);
    cie.add_instruction(CallFrameInstruction::Cfa(X86_64::RSP, 8));
    cie.add_instruction(CallFrameInstruction::Offset(X86_64::RA, -8));
    cie
}

/// The CIE compilers emit on aarch64: CFA = sp, return address in x30.
pub fn aarch64_cie() -> CommonInformationEntry {
    let mut cie = CommonInformationEntry::new(encoding(), 4, -8, AArch64::X30);
    cie.add_instruction(CallFrameInstruction::Cfa(AArch64::SP, 0));
    cie
}

pub fn eh_frame(cie: CommonInformationEntry, functions: Vec<Function>) -> Vec<u8> {
    let mut table = FrameTable::default();
    let cie_id = table.add_cie(cie);
    for function in functions {
        let mut fde = FrameDescriptionEntry::new(Address::Constant(function.start), function.len);
        for (offset, instruction) in function.instructions {
            fde.add_instruction(offset, instruction);
        }
        table.add_fde(cie_id, fde);
    }
    let mut eh_frame = EhFrame::from(EndianVec::new(LittleEndian));
    table.write_eh_frame(&mut eh_frame).unwrap();
    eh_frame.0.into_vec()
}

/// An `.eh_frame` with one CIE and hand-assembled instruction bytes, for
/// instructions the writer has no representation for.
pub fn raw_eh_frame(
    code_alignment: u8,
    return_address_register: u8,
    cie_instructions: &[u8],
    functions: &[(u64, u64, &[u8])],
) -> Vec<u8> {
    fn entry(out: &mut Vec<u8>, body: &[u8]) {
        let mut body = body.to_vec();
        while (body.len() + 4) % 8 != 0 {
            body.push(0); // DW_CFA_nop
        }
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
    }

    assert!(code_alignment < 0x80 && return_address_register < 0x80);
    let mut out = Vec::new();
    let mut cie = vec![0, 0, 0, 0, 1, 0, code_alignment, 0x78, return_address_register];
    cie.extend_from_slice(cie_instructions);
    entry(&mut out, &cie);
    for (start, len, instructions) in functions {
        // The CIE pointer is relative to its own position.
        let cie_pointer = out.len() as u32 + 4;
        let mut fde = cie_pointer.to_le_bytes().to_vec();
        fde.extend_from_slice(&start.to_le_bytes());
        fde.extend_from_slice(&len.to_le_bytes());
        fde.extend_from_slice(instructions);
        entry(&mut out, &fde);
    }
    out
}

/// Steps until the cursor stops, returning the (ip, sp) of every frame
/// including the first, and the final outcome.
pub fn walk<A: Unwinding, T: ?Sized>(
    cursor: &mut Cursor<'_, '_, A, T>,
    max_frames: usize,
) -> (Vec<(u64, u64)>, Result<Step, Error>) {
    let mut frames = vec![(cursor.ip(), cursor.sp())];
    loop {
        match cursor.step() {
            Ok(Step::HasMore) if frames.len() < max_frames => {
                frames.push((cursor.ip(), cursor.sp()));
            }
            result => return (frames, result),
        }
    }
}
