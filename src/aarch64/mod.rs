mod arch;
#[cfg(target_arch = "aarch64")]
mod context;
mod instruction_analysis;
mod special_frames;
mod unwindregs;

pub use arch::*;
#[cfg(target_arch = "aarch64")]
pub use context::*;
pub use unwindregs::*;
