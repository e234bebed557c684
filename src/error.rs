#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(not(feature = "std"), derive(thiserror_no_std::Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid argument")]
    InvalidArgument,

    #[error("No unwind info for address 0x{0:x}")]
    NoUnwindInfo(u64),

    #[error("Bad unwind info: {0}")]
    BadUnwindInfo(#[source] CfiError),

    #[error("Could not read memory at 0x{0:x}")]
    UnreadableMemory(u64),

    #[error("Unsupported register {0}")]
    UnsupportedRegister(u16),

    #[error("The value of register {0} is not known in this frame")]
    RegisterUnavailable(u16),

    #[error("Unwinding did not make progress")]
    NoProgress,

    #[error("Reached a frame which is marked as not unwindable")]
    StopUnwind,

    #[error("The byte order of the target is not supported by the instruction classifier")]
    UnsupportedByteOrder,

    #[error("The address space does not support this operation")]
    Unsupported,

    #[error("No procedure name found for address 0x{0:x}")]
    NoProcName(u64),

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,
}

/// The reason why a CFI program could not be used.
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(not(feature = "std"), derive(thiserror_no_std::Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiError {
    #[error("Could not decode the CFI: {0}")]
    Gimli(#[from] gimli::Error),

    #[error("DW_CFA_set_loc moved the location backwards")]
    LocationMovedBackwards,

    #[error("A factored offset overflowed")]
    OffsetOverflow,

    #[error("The CFA was modified by register or offset but is not register based")]
    CfaNotRegisterBased,

    #[error("No CFA rule was defined")]
    CfaUndefined,

    #[error("The instruction is not allowed in a CIE")]
    InvalidInCie,

    #[error("Unsupported CFI instruction")]
    UnsupportedInstruction,

    #[error("Too many nested DW_CFA_remember_state")]
    RememberStackOverflow,

    #[error("DW_CFA_restore_state without DW_CFA_remember_state")]
    RestoreWithoutRemember,

    #[error("Could not evaluate a DWARF expression")]
    ExpressionFailed,
}

impl From<CfiError> for Error {
    fn from(e: CfiError) -> Self {
        Error::BadUnwindInfo(e)
    }
}

impl From<gimli::Error> for Error {
    fn from(e: gimli::Error) -> Self {
        Error::BadUnwindInfo(CfiError::Gimli(e))
    }
}

/// Stable numeric error codes, shared with collaborators that only deal in
/// integers. The values must not change within a release line.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unspecified = -1,
    UnsupportedRegister = -3,
    StopUnwind = -5,
    NoProgress = -6,
    BadUnwindInfo = -7,
    InvalidArgument = -8,
    NoUnwindInfo = -10,
    UnreadableMemory = -11,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            -1 => ErrorCode::Unspecified,
            -3 => ErrorCode::UnsupportedRegister,
            -5 => ErrorCode::StopUnwind,
            -6 => ErrorCode::NoProgress,
            -7 => ErrorCode::BadUnwindInfo,
            -8 => ErrorCode::InvalidArgument,
            -10 => ErrorCode::NoUnwindInfo,
            -11 => ErrorCode::UnreadableMemory,
            _ => return None,
        })
    }
}

impl Error {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument | Error::UnsupportedByteOrder => ErrorCode::InvalidArgument,
            Error::NoUnwindInfo(_) | Error::NoProcName(_) => ErrorCode::NoUnwindInfo,
            Error::BadUnwindInfo(_) => ErrorCode::BadUnwindInfo,
            Error::UnreadableMemory(_) => ErrorCode::UnreadableMemory,
            Error::UnsupportedRegister(_) | Error::RegisterUnavailable(_) => {
                ErrorCode::UnsupportedRegister
            }
            Error::NoProgress => ErrorCode::NoProgress,
            Error::StopUnwind => ErrorCode::StopUnwind,
            Error::Unsupported | Error::IntegerOverflow => ErrorCode::Unspecified,
        }
    }

    /// The negative integer reported to integer-based collaborators.
    pub fn code(&self) -> i32 {
        self.error_code().as_i32()
    }

    /// Whether this error marks the expected end of a backtrace rather than a
    /// failure, e.g. a frame that an index table says cannot be unwound.
    pub fn is_expected_stop(&self) -> bool {
        matches!(self, Error::StopUnwind)
    }
}
