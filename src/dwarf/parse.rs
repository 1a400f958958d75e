//! Parsing of Common Information Entries and Frame Description Entries.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program. The remaining columns contain unwinding rules that are associated
//! with the indicated location. A CIE holds what is shared by many FDEs: the
//! alignment factors, the return address column and the instructions that
//! set up the first row. An FDE covers one range of code and holds the
//! instructions that build the rows for it.
//!
//! `.eh_frame` and `.debug_frame` store the same entries with small
//! differences in how the CIE is referenced and which versions are allowed.


use super::memory::{DwarfMemory, Encoding};
use super::{DwarfError, Result};
use crate::address::AddressType;

/// Longest augmentation string we accept.
const MAX_AUGMENTATION_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    EhFrame,
    DebugFrame,
}

impl FrameKind {
    pub fn section_name(self) -> &'static str {
        match self {
            FrameKind::EhFrame => ".eh_frame",
            FrameKind::DebugFrame => ".debug_frame",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Cie,
    Fde { cie_offset: u64 },
    /// A zero length entry, ending `.eh_frame`.
    Terminator,
}

/// The part shared by every entry: length and CIE id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHead {
    pub offset: u64,
    pub kind: EntryKind,
    /// Offset of the first byte after the CIE id.
    pub contents: u64,
    /// Offset of the first byte after the entry.
    pub end: u64,
    pub is_dwarf64: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    pub offset: u64,
    pub version: u8,
    pub augmentation: String,
    pub fde_address_encoding: Encoding,
    pub lsda_encoding: Encoding,
    pub personality_handler: Option<u64>,
    pub is_signal_frame: bool,
    pub segment_size: u8,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u64,
    pub cfa_instructions_offset: u64,
    pub cfa_instructions_end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    pub offset: u64,
    pub cie_offset: u64,
    pub pc_start: u64,
    pub pc_end: u64,
    pub lsda_address: u64,
    pub cfa_instructions_offset: u64,
    pub cfa_instructions_end: u64,
}

/// Reads the head of the entry at `offset`. `section_offset` is where the
/// section starts, `.debug_frame` CIE pointers are relative to it.
pub fn read_entry_head<A: AddressType>(
    mem: &mut DwarfMemory<'_, A>,
    kind: FrameKind,
    section_offset: u64,
    offset: u64,
) -> Result<EntryHead> {
    mem.set_cur_offset(offset);
    let (length, is_dwarf64) = mem.read_entry_length()?;
    let id_offset = mem.cur_offset();
    let end = id_offset.wrapping_add(length);
    if length == 0 {
        return Ok(EntryHead {
            offset,
            kind: EntryKind::Terminator,
            contents: id_offset,
            end,
            is_dwarf64,
        });
    }

    let kind = match kind {
        // The CIE pointer is always 4 bytes in .eh_frame and counts
        // backwards from itself.
        FrameKind::EhFrame => match mem.read_u32()? {
            0 => EntryKind::Cie,
            id => EntryKind::Fde {
                cie_offset: id_offset
                    .checked_sub(id.into())
                    .ok_or(DwarfError::NotACie(u64::from(id)))?,
            },
        },
        FrameKind::DebugFrame => {
            let (id, cie_id) = if is_dwarf64 {
                (mem.read_u64()?, u64::MAX)
            } else {
                (mem.read_u32()?.into(), u64::from(u32::MAX))
            };
            if id == cie_id {
                EntryKind::Cie
            } else {
                EntryKind::Fde {
                    cie_offset: section_offset.wrapping_add(id),
                }
            }
        }
    };

    Ok(EntryHead {
        offset,
        kind,
        contents: mem.cur_offset(),
        end,
        is_dwarf64,
    })
}

/// Parses the CIE whose head has been read. Pointers in the augmentation
/// are resolved with the bases configured on `mem`.
#[instrument(level = "trace", skip(mem), err)]
pub fn parse_cie<A: AddressType>(mem: &mut DwarfMemory<'_, A>, head: &EntryHead) -> Result<Cie> {
    if head.kind != EntryKind::Cie {
        return Err(DwarfError::NotACie(head.offset));
    }
    mem.set_cur_offset(head.contents);

    let version = mem.read_u8()?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(DwarfError::UnsupportedVersion(version));
    }

    let augmentation = mem.read_cstr(MAX_AUGMENTATION_LEN)?;
    let mut segment_size = 0;
    if version == 4 {
        let address_size = mem.read_u8()?;
        segment_size = mem.read_u8()?;
        if usize::from(address_size) != A::SIZE {
            debug!("CIE address size {address_size} differs from the target's {}", A::SIZE);
        }
    }
    let code_alignment_factor = mem.read_uleb128()?;
    let data_alignment_factor = mem.read_sleb128()?;
    let return_address_register = if version == 1 {
        mem.read_u8()?.into()
    } else {
        mem.read_uleb128()?
    };

    let mut cie = Cie {
        offset: head.offset,
        version,
        augmentation,
        fde_address_encoding: Encoding::ABSPTR,
        lsda_encoding: Encoding::OMIT,
        personality_handler: None,
        is_signal_frame: false,
        segment_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        cfa_instructions_offset: 0,
        cfa_instructions_end: head.end,
    };

    if let Some(codes) = cie.augmentation.strip_prefix('z') {
        let len = mem.read_uleb128()?;
        let data_end = mem.cur_offset().wrapping_add(len);
        for code in codes.bytes() {
            match code {
                // Encoding of the LSDA pointer in the FDE augmentation data.
                b'L' => cie.lsda_encoding = Encoding(mem.read_u8()?),
                // Encoding and value of the personality routine pointer.
                b'P' => {
                    let encoding = Encoding(mem.read_u8()?);
                    cie.personality_handler = Some(mem.read_encoded(encoding)?);
                }
                // Encoding of the address pointers in the FDE.
                b'R' => cie.fde_address_encoding = Encoding(mem.read_u8()?),
                b'S' => cie.is_signal_frame = true,
                // AArch64 branch target identification and memory tagging,
                // neither carries data.
                b'B' | b'G' => {}
                _ => {
                    debug!("unknown augmentation code {:?}, skipping the rest", code as char);
                    break;
                }
            }
        }
        mem.set_cur_offset(data_end);
    } else if !cie.augmentation.is_empty() {
        return Err(DwarfError::UnsupportedAugmentation(cie.augmentation));
    }

    cie.cfa_instructions_offset = mem.cur_offset();
    Ok(cie)
}

/// Parses the FDE whose head has been read, given its CIE.
#[instrument(level = "trace", skip(mem, cie), err)]
pub fn parse_fde<A: AddressType>(
    mem: &mut DwarfMemory<'_, A>,
    head: &EntryHead,
    cie: &Cie,
) -> Result<Fde> {
    let EntryKind::Fde { cie_offset } = head.kind else {
        return Err(DwarfError::NotAnFde(head.offset));
    };
    mem.set_cur_offset(head.contents);
    mem.skip(cie.segment_size.into());

    let pc_start = mem.read_encoded(cie.fde_address_encoding)?;
    let pc_range = mem.read_encoded(cie.fde_address_encoding.format_only())?;

    let mut lsda_address = 0;
    if cie.augmentation.starts_with('z') {
        let len = mem.read_uleb128()?;
        let data_end = mem.cur_offset().wrapping_add(len);
        if !cie.lsda_encoding.is_omit() {
            mem.set_func_base(pc_start);
            let lsda = mem.read_encoded(cie.lsda_encoding);
            mem.clear_func_base();
            lsda_address = lsda?;
        }
        mem.set_cur_offset(data_end);
    }

    Ok(Fde {
        offset: head.offset,
        cie_offset,
        pc_start,
        pc_end: A::from_u64(pc_start.wrapping_add(pc_range)).to_u64(),
        lsda_address,
        cfa_instructions_offset: mem.cur_offset(),
        cfa_instructions_end: head.end,
    })
}
