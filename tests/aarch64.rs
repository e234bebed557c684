#![cfg(not(feature = "local-only"))]

use framestep::aarch64::*;
use framestep::*;
use gimli::write::CallFrameInstruction;
use gimli::AArch64;

mod common;
use common::{Function, Target};

const START: u64 = 0x10000;
const CALLER: u64 = 0x10100;
const SIGNED: u64 = 0x10200;
const HANDLER: u64 = 0x10300;
const PLT: u64 = 0x30000;
const SIGRETURN: u64 = 0x31000;

const STACK: u64 = 0x7000_1000;
const ALT_STACK: u64 = 0x7100_0000;

/// Linux with FEAT_PAuth: everything above the 48-bit address but bit 55.
const PTR_AUTH_MASK: u64 = 0xff7f_0000_0000_0000;

fn program_eh_frame() -> Vec<u8> {
    common::eh_frame(
        common::aarch64_cie(),
        vec![
            Function::new(START, 0x100).at(0, CallFrameInstruction::Undefined(AArch64::X30)),
            // stp x29, x30, [sp, #-16]!; mov x29, sp
            Function::new(CALLER, 0x100)
                .at(4, CallFrameInstruction::CfaOffset(16))
                .at(4, CallFrameInstruction::Offset(AArch64::X29, -16))
                .at(4, CallFrameInstruction::Offset(AArch64::X30, -8))
                .at(8, CallFrameInstruction::CfaRegister(AArch64::X29)),
            Function::new(HANDLER, 0x100),
        ],
    )
}

fn code(words: &[u32]) -> Vec<u8> {
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    bytes.resize((bytes.len() + 7) & !7, 0);
    bytes
}

/// Stack of start -> caller, with caller's frame record at `STACK`.
fn target(regs: UnwindRegsAarch64) -> Target<ArchAarch64> {
    let mut target = Target::new(regs);
    target.map_words(STACK, &[0, START + 0x14, 0x5a5a, 0x5a5a]);
    target.map(PLT, code(&[0x90000090, 0xf9400a11, 0x91002210, 0xd61f0220]));
    target.map(SIGRETURN, code(&[0xd2801168, 0xd4000001]));
    target
}

#[test]
fn test_plt_stub_positions() {
    let eh_frame = program_eh_frame();
    let space = common::remote_space::<ArchAarch64>(vec![common::module(
        "program",
        0x10000..0x40000,
        UnwindData::EhFrame(&eh_frame),
    )]);
    for position in 0..4 {
        let ip = PLT + 4 * position;
        let mut target = target(UnwindRegsAarch64::new(ip, CALLER + 0x24, STACK, STACK));
        let mut cursor = Cursor::init_remote(&space, &mut target).unwrap();
        assert_eq!(cursor.frame_kind(), FrameKind::PltStub(position as usize));
        let (frames, result) = common::walk(&mut cursor, 64);
        assert_eq!(result, Ok(Step::Terminated));
        assert_eq!(
            frames,
            vec![
                (ip, STACK),
                (CALLER + 0x24, STACK),
                (START + 0x14, STACK + 0x10),
            ]
        );
    }
}

#[test]
fn test_corrupted_plt_stub_is_unwound_with_cfi() {
    let eh_frame = program_eh_frame();
    let space = common::remote_space::<ArchAarch64>(vec![common::module(
        "program",
        0x10000..0x40000,
        UnwindData::EhFrame(&eh_frame),
    )]);
    let mut target = Target::new(UnwindRegsAarch64::new(PLT + 4, CALLER + 0x24, STACK, STACK));
    target.map_words(STACK, &[0, START + 0x14]);
    target.map(PLT, code(&[0x90000090, 0xf154f00d, 0x91002210, 0xd61f0220]));
    let mut cursor = Cursor::init_remote(&space, &mut target).unwrap();
    assert_eq!(cursor.frame_kind(), FrameKind::Normal);
    // No FDE covers the stub.
    assert_eq!(cursor.step(), Err(Error::NoUnwindInfo(PLT + 4)));
}

#[test]
fn test_signed_return_address() {
    // paciasp; stp x29, x30, [sp, #-16]!; mov x29, sp
    let signed: &[u8] = &[
        0x41, 0x2d, 0x41, 0x0e, 0x10, 0x9d, 0x02, 0x9e, 0x01, 0x41, 0x0c, 0x1d, 0x10,
    ];
    let eh_frame = common::raw_eh_frame(
        4,
        30,
        &[0x0c, 31, 0x00],
        &[(START, 0x100, &[0x07, 0x1e]), (SIGNED, 0x100, signed)],
    );
    let mut space = common::remote_space::<ArchAarch64>(vec![common::module(
        "program",
        0x10000..0x40000,
        UnwindData::EhFrame(&eh_frame),
    )]);
    space.set_ptr_auth_mask(PTR_AUTH_MASK);
    let signed_return_address = 0x002a_0000_0000_0000 | (START + 0x14);
    let regs = UnwindRegsAarch64::new(SIGNED + 0x20, 0x1234, STACK, STACK);

    let mut target = Target::new(regs.clone());
    target.map_words(STACK, &[0, signed_return_address]);
    let mut cursor = Cursor::init_remote(&space, &mut target).unwrap();
    assert_eq!(cursor.ptr_auth_mask(), PTR_AUTH_MASK);
    assert_eq!(cursor.step(), Ok(Step::HasMore));
    assert_eq!(cursor.ip(), START + 0x14);
    assert_eq!(cursor.reg(AArch64::X30), Ok(signed_return_address));
    assert_eq!(cursor.sp(), STACK + 0x10);
    assert_eq!(cursor.step(), Ok(Step::Terminated));

    // Without the mask the signed pointer is taken at face value.
    let mut target = Target::new(regs);
    target.map_words(STACK, &[0, signed_return_address]);
    let mut cursor = Cursor::init_remote(&space, &mut target).unwrap();
    cursor.set_ptr_auth_mask(0);
    assert_eq!(cursor.step(), Ok(Step::HasMore));
    assert_eq!(cursor.ip(), signed_return_address);
    assert_eq!(
        cursor.step(),
        Err(Error::NoUnwindInfo(signed_return_address - 1))
    );
}

#[test]
fn test_signal_frame_crossing() {
    let eh_frame = program_eh_frame();
    let space = common::remote_space::<ArchAarch64>(vec![common::module(
        "program",
        0x10000..0x40000,
        UnwindData::EhFrame(&eh_frame),
    )]);

    // siginfo (128 bytes), then the ucontext whose sigcontext starts at 0xb0.
    let sigcontext = (128 + 0xb0) / 8;
    // x0..x30, sp and pc follow the fault address.
    let mut alt_stack = vec![0; sigcontext + 34];
    for n in 0..31 {
        alt_stack[sigcontext + 1 + n] = 0x900 + n as u64;
    }
    alt_stack[sigcontext + 1 + 29] = STACK;
    alt_stack[sigcontext + 32] = STACK;
    alt_stack[sigcontext + 33] = CALLER + 0x24;

    let mut target = target(UnwindRegsAarch64::new(
        HANDLER + 0x10,
        SIGRETURN,
        ALT_STACK,
        0,
    ));
    target.map_words(ALT_STACK, &alt_stack);
    let mut cursor = Cursor::init_remote(&space, &mut target).unwrap();
    assert_eq!(cursor.step(), Ok(Step::HasMore));
    assert_eq!(cursor.ip(), SIGRETURN);
    assert!(cursor.is_signal_frame());
    assert_eq!(cursor.step(), Ok(Step::HasMore));
    assert_eq!(
        cursor.code_address(),
        CodeAddress::InstructionPointer(CALLER + 0x24)
    );
    assert_eq!(cursor.sp(), STACK);
    assert_eq!(cursor.reg(AArch64::X0), Ok(0x900));
    assert_eq!(cursor.reg(AArch64::X19), Ok(0x900 + 19));
    let (frames, result) = common::walk(&mut cursor, 64);
    assert_eq!(result, Ok(Step::Terminated));
    assert_eq!(
        frames,
        vec![(CALLER + 0x24, STACK), (START + 0x14, STACK + 0x10)]
    );
}

#[test]
fn test_registers_beyond_the_file() {
    let space = common::remote_space::<ArchAarch64>(Vec::new());
    let mut target = target(UnwindRegsAarch64::new(CALLER, 0, STACK, 0));
    let cursor = Cursor::init_remote(&space, &mut target).unwrap();
    assert_eq!(cursor.reg(PC), Ok(CALLER));
    assert_eq!(cursor.reg(Register(33)), Err(Error::UnsupportedRegister(33)));
    assert_eq!(cursor.reg(Register(64)), Err(Error::UnsupportedRegister(64)));
}
