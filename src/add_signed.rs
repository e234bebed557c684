use crate::error::Error;

/// Add a signed integer to this unsigned integer, but only if doing so
/// does not cause underflow / overflow.
pub fn checked_add_signed<T: AddSigned>(lhs: T, rhs: T::Signed) -> Option<T> {
    lhs.checked_add_signed(rhs)
}

/// Compute `base + offset` for a target address, failing with
/// `Error::IntegerOverflow` if the result leaves the address space.
pub fn offset_address(base: u64, offset: i64) -> Result<u64, Error> {
    checked_add_signed(base, offset).ok_or(Error::IntegerOverflow)
}

/// A trait which adds a method to unsigned integers which allows checked
/// addition of the corresponding signed integer type.
pub trait AddSigned: Sized {
    type Signed;

    /// Add a signed integer to this unsigned integer, but only if doing so
    /// does not cause underflow / overflow.
    fn checked_add_signed(self, rhs: Self::Signed) -> Option<Self>;
}

impl AddSigned for u64 {
    type Signed = i64;

    fn checked_add_signed(self, rhs: i64) -> Option<u64> {
        let res = self.wrapping_add(rhs as u64);
        if (rhs >= 0 && res >= self) || (rhs < 0 && res < self) {
            Some(res)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offset_address() {
        assert_eq!(offset_address(0x1000, 0x10), Ok(0x1010));
        assert_eq!(offset_address(0x1000, -0x10), Ok(0xff0));
        assert_eq!(offset_address(0x8, -0x10), Err(Error::IntegerOverflow));
        assert_eq!(offset_address(u64::MAX - 4, 8), Err(Error::IntegerOverflow));
        assert_eq!(offset_address(u64::MAX, 0), Ok(u64::MAX));
    }
}
