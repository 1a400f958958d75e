use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use super::cfa::DwarfCfa;
use super::location::{CfaRule, DwarfLocation, Row};
use super::memory::{DwarfMemory, Encoding};
use super::parse::{self, Cie, EntryKind, Fde, FrameKind};
use super::{DwarfError, Result};
use crate::address::AddressType;
use crate::elf::Region;
use crate::memory::Memory;
use crate::regs::Regs;
use crate::StepResult;

/// A CIE together with the row its initial instructions set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CieEntry {
    pub cie: Cie,
    pub row: Row,
}

/// The CFI row covering one pc.
#[derive(Debug, Clone)]
pub struct UnwindRow {
    pub fde: Fde,
    pub cie: Arc<CieEntry>,
    pub row: Row,
}

#[derive(Debug, Clone, Copy)]
struct FdeIndexEntry {
    pc_start: u64,
    pc_end: u64,
    offset: u64,
}

/// The binary search table of `.eh_frame_hdr`.
#[derive(Debug, Clone, Copy)]
struct SearchTable {
    hdr: Region,
    table_offset: u64,
    fde_count: u64,
    encoding: Encoding,
    entry_size: u64,
}

/// One `.eh_frame` or `.debug_frame` section of an ELF file.
///
/// The section is read through the ELF memory, where offsets are file
/// offsets. Addresses inside it are virtual addresses of the ELF.
#[derive(Debug)]
pub struct DwarfSection<A> {
    kind: FrameKind,
    region: Region,
    search_table: Option<SearchTable>,
    fde_index: OnceLock<Vec<FdeIndexEntry>>,
    cies: Mutex<HashMap<u64, Arc<CieEntry>>>,
    _addr: PhantomData<fn() -> A>,
}

impl<A: AddressType> DwarfSection<A> {
    pub fn new(kind: FrameKind, region: Region) -> Self {
        Self {
            kind,
            region,
            search_table: None,
            fde_index: OnceLock::new(),
            cies: Mutex::new(HashMap::new()),
            _addr: PhantomData,
        }
    }

    /// An `.eh_frame` located through its `.eh_frame_hdr`. `eh_frame` is the
    /// section found through the section headers, if any; it is used for the
    /// size when it agrees with the header.
    #[instrument(level = "debug", skip(memory), err)]
    pub fn from_eh_frame_hdr(
        memory: &dyn Memory,
        hdr: Region,
        eh_frame: Option<Region>,
    ) -> Result<Self> {
        let mut mem = DwarfMemory::<A>::new(memory);
        mem.set_cur_offset(hdr.offset);
        mem.set_pc_bias(hdr.bias());
        mem.set_data_base(hdr.vaddr);

        let version = mem.read_u8()?;
        if version != 1 {
            return Err(DwarfError::UnsupportedVersion(version));
        }
        let eh_frame_ptr_encoding = Encoding(mem.read_u8()?);
        let fde_count_encoding = Encoding(mem.read_u8()?);
        let encoding = Encoding(mem.read_u8()?);

        let eh_frame_vaddr = mem.read_encoded(eh_frame_ptr_encoding)?;
        let fde_count = mem.read_encoded(fde_count_encoding)?;

        let offset = eh_frame_vaddr.wrapping_sub(hdr.bias());
        let region = match eh_frame {
            Some(section) if section.vaddr == eh_frame_vaddr => section,
            _ => Region {
                offset,
                vaddr: eh_frame_vaddr,
                size: u64::MAX - offset,
            },
        };

        let mut section = Self::new(FrameKind::EhFrame, region);
        match encoding.size(A::SIZE) {
            Some(size) if fde_count != 0 && !fde_count_encoding.is_omit() => {
                section.search_table = Some(SearchTable {
                    hdr,
                    table_offset: mem.cur_offset(),
                    fde_count,
                    encoding,
                    entry_size: 2 * size as u64,
                });
            }
            _ => debug!("no usable search table in .eh_frame_hdr, the section will be scanned"),
        }
        Ok(section)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn has_search_table(&self) -> bool {
        self.search_table.is_some()
    }

    fn dwarf_memory<'m>(&self, memory: &'m dyn Memory) -> DwarfMemory<'m, A> {
        let mut mem = DwarfMemory::new(memory);
        mem.set_pc_bias(self.region.bias());
        mem
    }

    fn cie_cache(&self) -> MutexGuard<'_, HashMap<u64, Arc<CieEntry>>> {
        self.cies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The CIE at `offset` with its initial row, parsed once.
    pub fn get_cie(&self, memory: &dyn Memory, offset: u64) -> Result<Arc<CieEntry>> {
        if let Some(entry) = self.cie_cache().get(&offset) {
            return Ok(Arc::clone(entry));
        }

        let mut mem = self.dwarf_memory(memory);
        let head = parse::read_entry_head(&mut mem, self.kind, self.region.offset, offset)?;
        let cie = parse::parse_cie(&mut mem, &head)?;

        let mut cfa = DwarfCfa::new(mem, &cie, 0);
        cfa.eval(u64::MAX, cie.cfa_instructions_offset, cie.cfa_instructions_end)?;
        let row = cfa.into_row();

        let entry = Arc::new(CieEntry { cie, row });
        self.cie_cache().insert(offset, Arc::clone(&entry));
        Ok(entry)
    }

    /// The FDE at `offset`.
    pub fn get_fde(&self, memory: &dyn Memory, offset: u64) -> Result<Fde> {
        let mut mem = self.dwarf_memory(memory);
        let head = parse::read_entry_head(&mut mem, self.kind, self.region.offset, offset)?;
        let EntryKind::Fde { cie_offset } = head.kind else {
            return Err(DwarfError::NotAnFde(offset));
        };
        let cie = self.get_cie(memory, cie_offset)?;
        parse::parse_fde(&mut mem, &head, &cie.cie)
    }

    /// The FDE whose range contains `pc`, a virtual address.
    #[instrument(level = "trace", skip(self, memory), err)]
    pub fn find_fde(&self, memory: &dyn Memory, pc: u64) -> Result<Fde> {
        let offset = match &self.search_table {
            Some(table) => self.search(memory, table, pc)?,
            None => {
                let index = self.fde_index(memory);
                let pos = index.partition_point(|entry| entry.pc_start <= pc);
                match pos.checked_sub(1).map(|pos| index[pos]) {
                    Some(entry) if pc < entry.pc_end => entry.offset,
                    _ => return Err(DwarfError::NoFde(pc)),
                }
            }
        };

        let fde = self.get_fde(memory, offset)?;
        if pc < fde.pc_start || pc >= fde.pc_end {
            return Err(DwarfError::NoFde(pc));
        }
        Ok(fde)
    }

    /// Binary search over the `.eh_frame_hdr` table of (initial location,
    /// FDE address) pairs, sorted by location.
    fn search(&self, memory: &dyn Memory, table: &SearchTable, pc: u64) -> Result<u64> {
        let mut mem = DwarfMemory::<A>::new(memory);
        mem.set_pc_bias(table.hdr.bias());
        mem.set_data_base(table.hdr.vaddr);
        let mut read = |idx: u64| -> Result<(u64, u64)> {
            mem.set_cur_offset(table.table_offset + idx * table.entry_size);
            Ok((mem.read_encoded(table.encoding)?, mem.read_encoded(table.encoding)?))
        };

        let (mut low, mut high) = (0, table.fde_count);
        while low < high {
            let mid = low + (high - low) / 2;
            if read(mid)?.0 <= pc {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low == 0 {
            return Err(DwarfError::NoFde(pc));
        }
        let (_, fde_vaddr) = read(low - 1)?;
        Ok(fde_vaddr.wrapping_sub(self.region.bias()))
    }

    fn fde_index(&self, memory: &dyn Memory) -> &[FdeIndexEntry] {
        self.fde_index.get_or_init(|| self.build_fde_index(memory))
    }

    /// Walks the whole section once. Entries that fail to parse are skipped,
    /// a broken length ends the walk.
    #[instrument(level = "debug", skip_all, fields(section = self.kind.section_name()))]
    fn build_fde_index(&self, memory: &dyn Memory) -> Vec<FdeIndexEntry> {
        let mut entries = Vec::new();
        let end = self.region.offset.saturating_add(self.region.size);
        let mut offset = self.region.offset;
        while offset < end {
            let mut mem = self.dwarf_memory(memory);
            let head = match parse::read_entry_head(&mut mem, self.kind, self.region.offset, offset)
            {
                Ok(head) => head,
                Err(err) => {
                    debug!("stopping at {offset:#x}: {err}");
                    break;
                }
            };
            match head.kind {
                EntryKind::Terminator => break,
                EntryKind::Cie => {}
                EntryKind::Fde { .. } => match self.get_fde(memory, offset) {
                    Ok(fde) if fde.pc_start < fde.pc_end => entries.push(FdeIndexEntry {
                        pc_start: fde.pc_start,
                        pc_end: fde.pc_end,
                        offset,
                    }),
                    Ok(_) => {}
                    Err(err) => debug!("skipping FDE at {offset:#x}: {err}"),
                },
            }
            if head.end <= offset {
                break;
            }
            offset = head.end;
        }
        entries.sort_by_key(|entry| entry.pc_start);
        debug!("indexed {} FDEs", entries.len());
        entries
    }

    /// Evaluates the CFI up to `pc`.
    pub fn rule_row(&self, memory: &dyn Memory, pc: u64) -> Result<UnwindRow> {
        let fde = self.find_fde(memory, pc)?;
        let cie = self.get_cie(memory, fde.cie_offset)?;

        let mut cfa = DwarfCfa::new(self.dwarf_memory(memory), &cie.cie, fde.pc_start)
            .with_cie_row(&cie.row);
        cfa.eval(pc, fde.cfa_instructions_offset, fde.cfa_instructions_end)?;
        let row = cfa.into_row();

        Ok(UnwindRow { fde, cie, row })
    }

    /// Unwinds one frame at `pc`, a virtual address of the ELF.
    #[instrument(level = "debug", skip(self, memory, regs, process_memory), fields(section = self.kind.section_name()))]
    pub fn step(
        &self,
        memory: &dyn Memory,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult> {
        let row = self.rule_row(memory, pc)?;
        apply_row::<A>(&row.row, row.cie.cie.return_address_register, regs, process_memory)
    }
}

/// Computes the caller's registers from a CFI row. `regs` only changes when
/// the whole row could be applied.
pub fn apply_row<A: AddressType>(
    row: &Row,
    return_address_register: u64,
    regs: &mut dyn Regs,
    process_memory: &dyn Memory,
) -> Result<StepResult> {
    let total = regs.total_regs();
    let index = |reg: u64| {
        usize::try_from(reg)
            .ok()
            .filter(|reg| *reg < total)
            .ok_or(DwarfError::IllegalRegister(reg))
    };
    let get = |regs: &dyn Regs, reg: u64| -> Result<u64> {
        regs.get(index(reg)?)
            .map_err(|_| DwarfError::IllegalRegister(reg))
    };
    let offset_from = |base: u64, offset: i64| A::from_u64(base.wrapping_add(offset as u64)).to_u64();

    let cfa = match row.cfa {
        CfaRule::RegOffset { reg, offset } => offset_from(get(&*regs, reg)?, offset),
        CfaRule::Expression { .. } => return Err(DwarfError::NotImplemented("CFA expressions")),
        CfaRule::Undefined => return Err(DwarfError::CfaUndefined),
    };
    let ra = index(return_address_register)?;

    let mut next = regs.clone_box();
    let mut return_address_undefined = false;
    for (&reg, location) in &row.regs {
        let Ok(idx) = index(reg) else {
            debug!("rule {location:?} for register {reg} outside of {}", regs.arch());
            continue;
        };
        let value = match *location {
            DwarfLocation::Undefined => {
                return_address_undefined |= idx == ra;
                0
            }
            DwarfLocation::Same => continue,
            DwarfLocation::Offset(offset) => A::read(process_memory, offset_from(cfa, offset))?.to_u64(),
            DwarfLocation::ValOffset(offset) => offset_from(cfa, offset),
            DwarfLocation::Register(src) => get(&*regs, src)?,
            DwarfLocation::Expression { .. } | DwarfLocation::ValExpression { .. } => {
                return Err(DwarfError::NotImplemented("register expressions"));
            }
        };
        next.set(idx, value)
            .map_err(|_| DwarfError::IllegalRegister(reg))?;
    }

    next.set_sp(cfa);
    let return_address = if return_address_undefined {
        0
    } else {
        get(next.as_ref(), return_address_register)?
    };
    next.set_pc(return_address);

    for idx in 0..total {
        let value = next.get(idx).map_err(|_| DwarfError::IllegalRegister(idx as u64))?;
        regs.set(idx, value)
            .map_err(|_| DwarfError::IllegalRegister(idx as u64))?;
    }

    Ok(if return_address == 0 {
        StepResult::Finished
    } else {
        StepResult::Continue
    })
}
