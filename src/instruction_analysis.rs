use crate::address_space::ByteOrder;
use crate::arch::Arch;
use crate::error::Error;

/// How the frame at an instruction address has to be unwound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Unwound with CFI.
    Normal,
    /// Inside a PLT stub. The value is the index of the instruction that is
    /// about to execute.
    PltStub(usize),
    /// The kernel's signal return trampoline; the interrupted registers are
    /// in the signal frame on the stack.
    SignalTrampoline,
    /// An index table marks the routine as not unwindable.
    IndexTableStop,
}

/// Recognizes code sequences that carry no CFI but have a fixed register
/// layout, by looking at the instruction bytes around `ip`.
///
/// Both predicates return `Ok(None)` if the bytes don't match or can't be
/// read, and `Err(Error::UnsupportedByteOrder)` for targets whose byte order
/// the patterns are not written for.
pub trait InstructionAnalysis: Arch {
    fn plt_stub_position<F>(
        ip: u64,
        byte_order: ByteOrder,
        read_word: &mut F,
    ) -> Result<Option<usize>, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>;

    fn signal_trampoline_position<F>(
        ip: u64,
        byte_order: ByteOrder,
        read_word: &mut F,
    ) -> Result<Option<usize>, Error>
    where
        F: FnMut(u64) -> Result<u64, Error>;
}

pub fn classify<A, F>(ip: u64, byte_order: ByteOrder, read_word: &mut F) -> Result<FrameKind, Error>
where
    A: InstructionAnalysis,
    F: FnMut(u64) -> Result<u64, Error>,
{
    if let Some(position) = A::plt_stub_position(ip, byte_order, read_word)? {
        return Ok(FrameKind::PltStub(position));
    }
    if A::signal_trampoline_position(ip, byte_order, read_word)?.is_some() {
        return Ok(FrameKind::SignalTrampoline);
    }
    Ok(FrameKind::Normal)
}

/// Reads the bytes at `start..start + buf.len()` with aligned word reads.
/// Returns `false` if any of the words could not be read.
pub fn read_code<F>(start: u64, buf: &mut [u8], byte_order: ByteOrder, read_word: &mut F) -> bool
where
    F: FnMut(u64) -> Result<u64, Error>,
{
    let Some(end) = start.checked_add(buf.len() as u64) else {
        return false;
    };
    let mut word_address = start & !7;
    while word_address < end {
        let Ok(word) = read_word(word_address) else {
            return false;
        };
        let bytes = match byte_order {
            ByteOrder::Little => word.to_le_bytes(),
            ByteOrder::Big => word.to_be_bytes(),
        };
        for (i, byte) in bytes.into_iter().enumerate() {
            let address = word_address + i as u64;
            if address >= start && address < end {
                buf[(address - start) as usize] = byte;
            }
        }
        word_address = match word_address.checked_add(8) {
            Some(next) => next,
            None => break,
        };
    }
    true
}

/// Finds which instruction of a fixed code sequence `ip` points at.
/// `offsets` are the byte offsets of the instructions within the sequence,
/// and `matches` checks a complete window of `LEN` bytes.
pub(crate) fn match_window<F, M, const LEN: usize>(
    ip: u64,
    offsets: &[u64],
    byte_order: ByteOrder,
    read_word: &mut F,
    matches: M,
) -> Option<usize>
where
    F: FnMut(u64) -> Result<u64, Error>,
    M: Fn(&[u8; LEN]) -> bool,
{
    offsets.iter().position(|&offset| {
        let Some(start) = ip.checked_sub(offset) else {
            return false;
        };
        let mut window = [0; LEN];
        read_code(start, &mut window, byte_order, read_word) && matches(&window)
    })
}
