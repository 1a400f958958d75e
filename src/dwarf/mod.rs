//! DWARF call frame information.
//!
//! # how it works
//! an FDE covering the pc is looked up, either through the binary search
//! table in `.eh_frame_hdr` or through an index built by walking the whole
//! `.eh_frame`/`.debug_frame` section. the FDE and its CIE are parsed, and the
//! CFA program of the CIE followed by the one of the FDE is run up to the pc.
//! that yields the row of the CFI table for the pc, which is then applied to
//! the registers.
//!
//! See <https://dwarfstd.org/doc/DWARF5.pdf> §6.4 for the format and
//! <https://refspecs.linuxfoundation.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>
//! for the `.eh_frame` flavour of it.

mod cfa;
mod location;
mod memory;
mod parse;
mod section;

pub use cfa::DwarfCfa;
pub use location::{CfaRule, DwarfLocation, RegRules, Row};
pub use memory::{DwarfMemory, Encoding};
pub use parse::{Cie, EntryHead, EntryKind, Fde, FrameKind};
pub use section::{apply_row, CieEntry, DwarfSection, UnwindRow};

use crate::memory::ReadError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DwarfError {
    #[error(transparent)]
    MemoryInvalid(#[from] ReadError),
    #[error("illegal CFA opcode {0:#04x}")]
    IllegalValue(u8),
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("unsupported CIE version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported pointer encoding {0:#04x}")]
    UnsupportedEncoding(u8),
    #[error("unsupported augmentation {0:?}")]
    UnsupportedAugmentation(String),
    #[error("entry at {0:#x} is not a CIE")]
    NotACie(u64),
    #[error("entry at {0:#x} is not an FDE")]
    NotAnFde(u64),
    #[error("no FDE covers pc {0:#x}")]
    NoFde(u64),
    #[error("register {0} does not exist")]
    IllegalRegister(u64),
    #[error("the CFA is not defined")]
    CfaUndefined,
    #[error("{0} are not evaluated")]
    NotImplemented(&'static str),
}

pub type Result<T, E = DwarfError> = core::result::Result<T, E>;
