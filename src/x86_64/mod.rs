mod arch;
#[cfg(target_arch = "x86_64")]
mod context;
mod instruction_analysis;
mod special_frames;
mod unwindregs;

pub use arch::*;
#[cfg(target_arch = "x86_64")]
pub use context::*;
pub use unwindregs::*;
