use core::fmt::{Debug, LowerHex};

pub struct HexNum<N: LowerHex>(pub N);

impl<N: LowerHex> Debug for HexNum<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x")?;
        LowerHex::fmt(&self.0, f)
    }
}

/// Formats an optional register value, printing `-` for unknown values.
pub struct MaybeHexNum(pub Option<u64>);

impl Debug for MaybeHexNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.0 {
            Some(value) => Debug::fmt(&HexNum(value), f),
            None => f.write_str("-"),
        }
    }
}
