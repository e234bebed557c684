#![cfg(all(
    feature = "std",
    any(target_os = "linux", target_os = "android"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use std::hint::black_box;
use std::sync::Mutex;

use framestep::*;
use once_cell::sync::OnceCell;

type Callback<'c> = &'c mut dyn FnMut(UnwindRegsNative);

#[inline(never)]
fn innermost(f: Callback<'_>) {
    let regs = capture_context();
    f(regs);
    black_box(());
}

#[inline(never)]
fn middle(f: Callback<'_>) {
    innermost(f);
    black_box(());
}

#[inline(never)]
fn outer(f: Callback<'_>) {
    middle(f);
    black_box(());
}

fn local_space() -> LocalAddressSpace<'static, NativeArch> {
    LocalAddressSpace::<NativeArch>::local(unsafe { loaded_modules() })
}

#[test]
fn test_loaded_modules_cover_this_binary() {
    let space = local_space();
    assert!(!space.modules().is_empty());
    let module = space.modules().find_module(outer as usize as u64).unwrap();
    assert!(matches!(
        module.unwind_data(),
        UnwindData::EhFrameHdrAndEhFrame(..)
    ));
}

#[test]
fn test_unwind_own_stack() {
    let space = local_space();
    let mut frames = Vec::new();
    let mut starts = Vec::new();
    outer(&mut |regs| {
        let mut arg = LocalArg::new(regs);
        let mut cursor = Cursor::init_local(&space, &mut arg).unwrap();
        for _ in 0..4 {
            starts.push(cursor.proc_info().map(|pi| pi.start_ip).ok());
            frames.push((cursor.ip(), cursor.sp()));
            if cursor.step() != Ok(Step::HasMore) {
                break;
            }
        }
    });
    assert_eq!(frames.len(), 4);
    assert!(frames.windows(2).all(|pair| pair[0].1 < pair[1].1));
    assert_eq!(starts[0], Some(innermost as usize as u64));
    assert_eq!(starts[1], Some(middle as usize as u64));
    assert_eq!(starts[2], Some(outer as usize as u64));
}

#[cfg(not(feature = "local-only"))]
#[test]
fn test_remote_space_with_local_accessors() {
    let local = local_space();
    let mut remote = AddressSpace::<NativeArch, LocalArg<NativeArch>>::new(
        AddressSpaceKind::Remote,
        ByteOrder::native(),
        local_accessors(),
        unsafe { loaded_modules() },
    );
    remote.set_ptr_auth_mask(local.ptr_auth_mask());
    outer(&mut |regs| {
        let mut local_arg = LocalArg::new(regs.clone());
        let mut remote_arg = LocalArg::new(regs);
        let mut local_cursor = Cursor::init_local(&local, &mut local_arg).unwrap();
        let mut remote_cursor = Cursor::init_remote(&remote, &mut remote_arg).unwrap();
        for _ in 0..4 {
            assert_eq!(local_cursor.ip(), remote_cursor.ip());
            assert_eq!(local_cursor.sp(), remote_cursor.sp());
            assert_eq!(local_cursor.regs(), remote_cursor.regs());
            let step = local_cursor.step();
            assert_eq!(step, remote_cursor.step());
            if step != Ok(Step::HasMore) {
                break;
            }
        }
    });
}

#[test]
fn test_local_cursor_needs_local_space() {
    let remote = AddressSpace::<NativeArch, LocalArg<NativeArch>>::remote(
        ByteOrder::native(),
        local_accessors(),
    );
    let mut arg = LocalArg::new(capture_context());
    assert_eq!(
        Cursor::init_local(&remote, &mut arg).unwrap_err(),
        Error::InvalidArgument
    );
}

#[test]
fn test_concurrent_cursors() {
    let space = local_space();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut ips = Vec::new();
                outer(&mut |regs| {
                    let mut arg = LocalArg::new(regs);
                    let mut cursor = Cursor::init_local(&space, &mut arg).unwrap();
                    for _ in 0..3 {
                        assert_eq!(cursor.step(), Ok(Step::HasMore));
                        ips.push(cursor.proc_info().unwrap().start_ip);
                    }
                });
                assert_eq!(ips.len(), 3);
                assert_eq!(ips[..2], [middle as usize as u64, outer as usize as u64]);
            });
        }
    });
}

type SignalWalk = (Vec<(Option<u64>, bool)>, Result<Step, Error>);

static SIGNAL_SPACE: OnceCell<LocalAddressSpace<'static, NativeArch>> = OnceCell::new();
static SIGNAL_WALK: Mutex<Option<SignalWalk>> = Mutex::new(None);

/// Walks out of the handler and records the start of every frame's routine
/// and whether it is a signal trampoline.
extern "C" fn record_walk(_signal: libc::c_int) {
    let Some(space) = SIGNAL_SPACE.get() else {
        return;
    };
    let mut arg = LocalArg::new(capture_context());
    let Ok(mut cursor) = Cursor::init_local(space, &mut arg) else {
        return;
    };
    let mut frames = Vec::new();
    let result = loop {
        let start = cursor.proc_info().map(|pi| pi.start_ip).ok();
        frames.push((start, cursor.is_signal_frame()));
        match cursor.step() {
            Ok(Step::HasMore) if frames.len() < 256 => {}
            result => break result,
        }
    };
    *SIGNAL_WALK.lock().unwrap() = Some((frames, result));
}

#[test]
fn test_unwind_through_kernel_signal_frame() {
    SIGNAL_SPACE.get_or_init(local_space);
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = record_walk as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        let mut previous: libc::sigaction = std::mem::zeroed();
        assert_eq!(libc::sigaction(libc::SIGUSR1, &action, &mut previous), 0);
        outer(&mut |_| {
            assert_eq!(libc::raise(libc::SIGUSR1), 0);
        });
        libc::sigaction(libc::SIGUSR1, &previous, std::ptr::null_mut());
    }

    let (frames, result) = SIGNAL_WALK.lock().unwrap().take().unwrap();
    assert_eq!(result, Ok(Step::Terminated));
    let trampoline = frames.iter().position(|&(_, is_signal)| is_signal).unwrap();
    let starts: Vec<u64> = frames[trampoline..]
        .iter()
        .filter_map(|&(start, _)| start)
        .collect();
    let middle_index = starts
        .iter()
        .position(|&start| start == middle as usize as u64)
        .unwrap();
    assert_eq!(starts[middle_index - 1], innermost as usize as u64);
    assert_eq!(starts[middle_index + 1], outer as usize as u64);
}
