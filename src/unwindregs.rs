use core::fmt::Debug;

use gimli::Register;

/// Register access by DWARF register number, as used by the CFI rules.
pub trait DwarfUnwindRegs {
    fn get(&self, register: Register) -> Option<u64>;

    /// Returns `false` if the register is not part of this register file.
    fn set(&mut self, register: Register, value: u64) -> bool;

    fn clear(&mut self, register: Register);
}

/// A fixed-size register file indexed by DWARF register number. Each slot
/// is either known or unknown ("undefined" in CFI terms).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet<const N: usize> {
    values: [u64; N],
    known: u64,
}

impl<const N: usize> Default for RegisterSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RegisterSet<N> {
    pub const fn new() -> Self {
        assert!(N <= 64);
        Self {
            values: [0; N],
            known: 0,
        }
    }

    pub fn from_values(values: [u64; N]) -> Self {
        let known = u64::MAX.checked_shr((64 - N) as u32).unwrap_or(0);
        Self { values, known }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<u64> {
        if index < N && self.known & (1 << index) != 0 {
            Some(self.values[index])
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn set(&mut self, index: usize, value: u64) -> bool {
        if index >= N {
            return false;
        }
        self.values[index] = value;
        self.known |= 1 << index;
        true
    }

    #[inline(always)]
    pub fn clear(&mut self, index: usize) {
        if index < N {
            self.known &= !(1 << index);
        }
    }

    pub fn len(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        self.known == 0
    }

    pub fn iter_known(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        (0..N).filter_map(move |i| self.get(i).map(|v| (i, v)))
    }
}

impl<const N: usize> DwarfUnwindRegs for RegisterSet<N> {
    fn get(&self, register: Register) -> Option<u64> {
        RegisterSet::get(self, register.0 as usize)
    }

    fn set(&mut self, register: Register, value: u64) -> bool {
        RegisterSet::set(self, register.0 as usize, value)
    }

    fn clear(&mut self, register: Register) {
        RegisterSet::clear(self, register.0 as usize)
    }
}

impl<const N: usize> Debug for RegisterSet<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (i, v) in self.iter_known() {
            map.entry(&i, &crate::display_utils::HexNum(v));
        }
        map.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut regs = RegisterSet::<17>::new();
        assert!(regs.is_empty());
        assert_eq!(regs.get(7), None);
        assert!(regs.set(7, 0x7fff_0000));
        assert_eq!(regs.get(7), Some(0x7fff_0000));
        assert!(!regs.set(17, 1));
        assert_eq!(regs.get(17), None);
        regs.clear(7);
        assert_eq!(regs.get(7), None);
    }

    #[test]
    fn from_values_marks_everything_known() {
        let regs = RegisterSet::<3>::from_values([1, 2, 3]);
        assert_eq!(regs.iter_known().collect::<Vec<_>>(), vec![(0, 1), (1, 2), (2, 3)]);
    }
}
