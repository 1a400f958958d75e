//! Stack unwinding for Android userspace.
//!
//! Given a register snapshot and a way to read the memory of a process, the
//! [`Unwinder`](unwinder::Unwinder) walks the call stack using ARM EHABI
//! tables (`.ARM.exidx`/`.ARM.extab`) and DWARF CFI (`.eh_frame`,
//! `.debug_frame`).

#[macro_use]
extern crate tracing;

pub mod address;
pub mod arch;
pub mod arm;
pub mod dwarf;
pub mod elf;
pub mod maps;
pub mod memory;
pub mod regs;
pub mod unwinder;

use arm::ArmStatus;
use dwarf::DwarfError;
use regs::InvalidRegister;

/// The outcome of unwinding one frame successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The registers now describe the caller.
    Continue,
    /// The frame has no caller, the walk is over.
    Finished,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnwindError {
    #[error("no unwind information covers {0:#x}")]
    NoUnwindInfo(u64),
    #[error("exidx: {0}")]
    Arm(#[from] ArmStatus),
    #[error("dwarf: {0}")]
    Dwarf(#[from] DwarfError),
    #[error(transparent)]
    Register(#[from] InvalidRegister),
}
