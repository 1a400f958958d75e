//! Locates the unwind information of an ELF image.
//!
//! Only the parts of the file needed for unwinding are read: the program
//! headers (executable loads, `PT_DYNAMIC`, `PT_GNU_EH_FRAME`,
//! `PT_ARM_EXIDX`), the dynamic section for the soname and the section
//! headers for `.eh_frame`, `.debug_frame` and `.ARM.exidx`.
//!
//! The image is read through a [`Memory`] where addresses are file offsets.

mod class;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::marker::PhantomData;

pub use class::{Elf32, Elf64, ElfClass, FileHeader, ProgramHeader, SectionHeader};

use crate::address::AddressType;
use crate::arm::{self, ExidxTable};
use crate::dwarf::{DwarfError, DwarfSection, FrameKind, UnwindRow};
use crate::memory::{Memory, ReadError};
use crate::regs::{ArchType, Regs};
use crate::{StepResult, UnwindError};

use class::read_record;

pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_DYNAMIC: u32 = 2;
pub(crate) const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
pub(crate) const PT_ARM_EXIDX: u32 = 0x7000_0001;
pub(crate) const PF_X: u32 = 1;

pub(crate) const DT_STRTAB: i64 = 5;
pub(crate) const DT_SONAME: i64 = 14;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const MAX_SONAME_LEN: usize = 4096;
const MAX_SECTION_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("not an ELF file")]
    BadMagic,
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),
    #[error("unsupported ELF data encoding {0}")]
    UnsupportedEncoding(u8),
    #[error("unsupported machine {machine} in an {class} file")]
    UnsupportedMachine { machine: u16, class: &'static str },
    #[error("malformed section header table: {0}")]
    BadSectionHeaders(&'static str),
    #[error("{0} lies past the end of the address space")]
    OutOfRange(&'static str),
}

/// One `PT_LOAD` segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInfo {
    pub offset: u64,
    pub vaddr: u64,
    pub size: u64,
}

/// A piece of the file with the address it is loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub vaddr: u64,
    pub size: u64,
}

impl Region {
    /// What to add to a file offset inside the region to get its virtual
    /// address.
    pub fn bias(&self) -> u64 {
        self.vaddr.wrapping_sub(self.offset)
    }
}

/// The class dependent reader. Everything it finds is normalized to `u64`.
pub struct ElfInterface<C: ElfClass> {
    memory: Box<dyn Memory>,
    header: FileHeader,
    arch: ArchType,
    load_bias: u64,
    pt_loads: BTreeMap<u64, LoadInfo>,
    /// Every `PT_LOAD`, for translating virtual addresses.
    segments: Vec<LoadInfo>,
    dynamic: Option<Region>,
    strtab_offset: Option<u64>,
    soname_offset: Option<u64>,
    eh_frame_hdr: Option<Region>,
    eh_frame: Option<Region>,
    debug_frame: Option<Region>,
    exidx: Option<ExidxTable>,
    eh_frame_section: Option<DwarfSection<C::Addr>>,
    debug_frame_section: Option<DwarfSection<C::Addr>>,
    _class: PhantomData<C>,
}

impl<C: ElfClass> ElfInterface<C> {
    /// Reads the file header. Nothing else is processed yet.
    pub fn new(memory: Box<dyn Memory>) -> Result<Self, ElfError> {
        let raw: C::Ehdr = read_record(memory.as_ref(), 0)?;
        let header = C::file_header(&raw);
        let arch = C::arch(header.machine).ok_or(ElfError::UnsupportedMachine {
            machine: header.machine,
            class: C::NAME,
        })?;

        Ok(Self {
            memory,
            header,
            arch,
            load_bias: 0,
            pt_loads: BTreeMap::new(),
            segments: Vec::new(),
            dynamic: None,
            strtab_offset: None,
            soname_offset: None,
            eh_frame_hdr: None,
            eh_frame: None,
            debug_frame: None,
            exidx: None,
            eh_frame_section: None,
            debug_frame_section: None,
            _class: PhantomData,
        })
    }

    pub fn memory(&self) -> &dyn Memory {
        self.memory.as_ref()
    }

    pub fn arch(&self) -> ArchType {
        self.arch
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// Executable loads keyed by file offset.
    pub fn pt_loads(&self) -> &BTreeMap<u64, LoadInfo> {
        &self.pt_loads
    }

    pub fn dynamic(&self) -> Option<Region> {
        self.dynamic
    }

    pub fn eh_frame_hdr(&self) -> Option<Region> {
        self.eh_frame_hdr
    }

    pub fn exidx(&self) -> Option<&ExidxTable> {
        self.exidx.as_ref()
    }

    pub fn eh_frame(&self) -> Option<&DwarfSection<C::Addr>> {
        self.eh_frame_section.as_ref()
    }

    pub fn debug_frame(&self) -> Option<&DwarfSection<C::Addr>> {
        self.debug_frame_section.as_ref()
    }

    #[instrument(level = "debug", skip(self), fields(class = C::NAME), err)]
    pub fn process_program_headers(&mut self) -> Result<(), ElfError> {
        let mut exidx = None;
        for i in 0..self.header.phnum {
            let addr = self
                .header
                .phoff
                .checked_add(i * self.header.phentsize)
                .ok_or(ElfError::OutOfRange("program header"))?;
            let raw: C::Phdr = read_record(self.memory.as_ref(), addr)?;
            let phdr = C::program_header(&raw);
            trace!("program header {i}: {phdr:x?}");

            let region = Region {
                offset: phdr.p_offset,
                vaddr: phdr.p_vaddr,
                size: phdr.p_memsz,
            };
            match phdr.p_type {
                PT_LOAD => {
                    let load = LoadInfo {
                        offset: phdr.p_offset,
                        vaddr: phdr.p_vaddr,
                        size: phdr.p_memsz,
                    };
                    self.segments.push(load);
                    if phdr.p_flags & PF_X == 0 {
                        continue;
                    }
                    if self.pt_loads.is_empty() {
                        self.load_bias = region.bias();
                    }
                    self.pt_loads.insert(phdr.p_offset, load);
                }
                PT_GNU_EH_FRAME => self.eh_frame_hdr = Some(region),
                PT_DYNAMIC => self.dynamic = Some(region),
                PT_ARM_EXIDX => exidx = Some(region),
                _ => {}
            }
        }

        // The table needs the load bias, which is only known after the loop.
        if let Some(region) = exidx {
            self.exidx = Some(ExidxTable::new(
                region.offset,
                (region.size / 8) as usize,
                self.load_bias,
            ));
        }
        Ok(())
    }

    /// The file offset of a virtual address.
    pub fn vaddr_to_offset(&self, vaddr: u64) -> u64 {
        self.segments
            .iter()
            .find(|load| (load.vaddr..load.vaddr.saturating_add(load.size)).contains(&vaddr))
            .map(|load| load.offset.wrapping_add(vaddr - load.vaddr))
            .unwrap_or_else(|| vaddr.wrapping_sub(self.load_bias))
    }

    /// The virtual address of a file offset. Executable loads win when
    /// segments overlap in the file.
    pub fn offset_to_vaddr(&self, offset: u64) -> u64 {
        self.pt_loads
            .values()
            .chain(&self.segments)
            .find(|load| (load.offset..load.offset.saturating_add(load.size)).contains(&offset))
            .map(|load| load.vaddr.wrapping_add(offset - load.offset))
            .unwrap_or_else(|| offset.wrapping_add(self.load_bias))
    }

    /// Scans the whole dynamic section for `DT_STRTAB` and `DT_SONAME`.
    /// A `DT_NULL` does not end the scan.
    #[instrument(level = "debug", skip(self), err)]
    pub fn process_dynamic_headers(&mut self) -> Result<(), ElfError> {
        let Some(dynamic) = self.dynamic else {
            return Ok(());
        };

        let end = dynamic.offset.saturating_add(dynamic.size);
        let mut offset = dynamic.offset;
        while let Some(next) = offset.checked_add(C::DYN_SIZE).filter(|next| *next <= end) {
            let entry = C::read_dyn(self.memory.as_ref(), offset)?;
            match entry.tag {
                DT_STRTAB => self.strtab_offset = Some(self.vaddr_to_offset(entry.val)),
                DT_SONAME => self.soname_offset = Some(entry.val),
                _ => {}
            }
            offset = next;
        }
        Ok(())
    }

    pub fn read_soname(&self) -> Option<String> {
        let offset = self.strtab_offset?.checked_add(self.soname_offset?)?;
        match self.memory.read_cstring(offset, MAX_SONAME_LEN) {
            Ok(soname) => Some(soname),
            Err(err) => {
                debug!("failed to read the soname: {err}");
                None
            }
        }
    }

    fn section_header(&self, idx: u64) -> Result<SectionHeader, ElfError> {
        let addr = self
            .header
            .shoff
            .checked_add(idx * self.header.shentsize)
            .ok_or(ElfError::OutOfRange("section header"))?;
        let raw: C::Shdr = read_record(self.memory.as_ref(), addr)?;
        Ok(C::section_header(&raw))
    }

    /// Finds `.eh_frame`, `.debug_frame` and `.ARM.exidx` by name.
    #[instrument(level = "debug", skip(self), err)]
    pub fn process_section_headers(&mut self) -> Result<(), ElfError> {
        if self.header.shoff == 0 || self.header.shnum == 0 {
            return Ok(());
        }
        if self.header.shstrndx >= self.header.shnum {
            return Err(ElfError::BadSectionHeaders("name table index out of range"));
        }

        let names = self.section_header(self.header.shstrndx)?;
        for idx in 0..self.header.shnum {
            let section = self.section_header(idx)?;
            let Some(name_offset) = names.sh_offset.checked_add(u64::from(section.sh_name)) else {
                continue;
            };
            let Ok(name) = self.memory.read_cstring(name_offset, MAX_SECTION_NAME_LEN) else {
                continue;
            };
            let region = Region {
                offset: section.sh_offset,
                vaddr: section.sh_addr,
                size: section.sh_size,
            };
            match name.as_str() {
                ".eh_frame" => self.eh_frame = Some(region),
                ".debug_frame" => self.debug_frame = Some(region),
                ".ARM.exidx" if self.exidx.is_none() => {
                    self.exidx = Some(ExidxTable::new(
                        region.offset,
                        (region.size / 8) as usize,
                        self.load_bias,
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Sets up the DWARF sections from what the headers described.
    fn init_dwarf(&mut self) {
        let memory = self.memory.as_ref();
        self.eh_frame_section = match (self.eh_frame_hdr, self.eh_frame) {
            (Some(hdr), section) => match DwarfSection::from_eh_frame_hdr(memory, hdr, section) {
                Ok(dwarf) => Some(dwarf),
                Err(err) => {
                    debug!("unusable .eh_frame_hdr: {err}");
                    section.map(|region| DwarfSection::new(FrameKind::EhFrame, region))
                }
            },
            (None, section) => section.map(|region| DwarfSection::new(FrameKind::EhFrame, region)),
        };
        self.debug_frame_section = self
            .debug_frame
            .map(|region| DwarfSection::new(FrameKind::DebugFrame, region));
    }

    /// Unwinds one frame. `pc` is a virtual address of this file.
    pub fn step(
        &self,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult, UnwindError> {
        let memory = self.memory.as_ref();
        let mut last_error = UnwindError::NoUnwindInfo(pc);

        if self.arch == ArchType::Arm {
            if let Some(exidx) = &self.exidx {
                match exidx.step(memory, pc, regs, process_memory) {
                    Ok(result) => return Ok(result),
                    Err(err) => {
                        debug!("exidx failed at {pc:#x}: {err}");
                        last_error = err;
                    }
                }
            }
        }

        for section in [&self.eh_frame_section, &self.debug_frame_section]
            .into_iter()
            .flatten()
        {
            match section.step(memory, pc, regs, process_memory) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    debug!("{} failed at {pc:#x}: {err}", section.kind().section_name());
                    if !matches!(err, DwarfError::NoFde(_)) {
                        last_error = err.into();
                    }
                }
            }
        }
        Err(last_error)
    }

    /// The DWARF row covering `pc`, from `.eh_frame` or else `.debug_frame`.
    pub fn rule_row(&self, pc: u64) -> Result<UnwindRow, DwarfError> {
        let mut last_error = DwarfError::NoFde(pc);
        for section in [&self.eh_frame_section, &self.debug_frame_section]
            .into_iter()
            .flatten()
        {
            match section.rule_row(self.memory.as_ref(), pc) {
                Ok(row) => return Ok(row),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }
}

enum ElfKind {
    Elf32(ElfInterface<Elf32>),
    Elf64(ElfInterface<Elf64>),
}

macro_rules! with_interface {
    ($self:expr, $interface:ident => $body:expr) => {
        match &$self.inner {
            ElfKind::Elf32($interface) => $body,
            ElfKind::Elf64($interface) => $body,
        }
    };
}

/// A parsed ELF image of either class.
pub struct Elf {
    inner: ElfKind,
}

impl Elf {
    #[instrument(level = "debug", skip(memory), err)]
    pub fn new(memory: Box<dyn Memory>) -> Result<Self, ElfError> {
        let mut ident = [0u8; 16];
        memory.read(0, &mut ident)?;
        if ident[..4] != *b"\x7fELF" {
            return Err(ElfError::BadMagic);
        }
        if ident[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEncoding(ident[EI_DATA]));
        }

        let inner = match ident[EI_CLASS] {
            ELFCLASS32 => ElfKind::Elf32(Self::load(memory)?),
            ELFCLASS64 => ElfKind::Elf64(Self::load(memory)?),
            class => return Err(ElfError::UnsupportedClass(class)),
        };
        Ok(Self { inner })
    }

    fn load<C: ElfClass>(memory: Box<dyn Memory>) -> Result<ElfInterface<C>, ElfError> {
        let mut interface = ElfInterface::<C>::new(memory)?;
        interface.process_program_headers()?;
        if let Err(err) = interface.process_dynamic_headers() {
            warn!("failed to read the dynamic section: {err}");
        }
        if let Err(err) = interface.process_section_headers() {
            debug!("failed to read the section headers: {err}");
        }
        interface.init_dwarf();
        Ok(interface)
    }

    pub fn class_name(&self) -> &'static str {
        match &self.inner {
            ElfKind::Elf32(_) => Elf32::NAME,
            ElfKind::Elf64(_) => Elf64::NAME,
        }
    }

    pub fn address_size(&self) -> usize {
        match &self.inner {
            ElfKind::Elf32(_) => <u32 as AddressType>::SIZE,
            ElfKind::Elf64(_) => <u64 as AddressType>::SIZE,
        }
    }

    pub fn arch(&self) -> ArchType {
        with_interface!(self, interface => interface.arch())
    }

    pub fn memory(&self) -> &dyn Memory {
        with_interface!(self, interface => interface.memory())
    }

    pub fn load_bias(&self) -> u64 {
        with_interface!(self, interface => interface.load_bias())
    }

    pub fn pt_loads(&self) -> &BTreeMap<u64, LoadInfo> {
        with_interface!(self, interface => interface.pt_loads())
    }

    pub fn offset_to_vaddr(&self, offset: u64) -> u64 {
        with_interface!(self, interface => interface.offset_to_vaddr(offset))
    }

    pub fn soname(&self) -> Option<String> {
        with_interface!(self, interface => interface.read_soname())
    }

    pub fn exidx(&self) -> Option<&ExidxTable> {
        with_interface!(self, interface => interface.exidx())
    }

    pub fn eh_frame(&self) -> Option<(Region, bool)> {
        with_interface!(self, interface => interface
            .eh_frame()
            .map(|section| (section.region(), section.has_search_table())))
    }

    pub fn debug_frame(&self) -> Option<Region> {
        with_interface!(self, interface => interface.debug_frame().map(|section| section.region()))
    }

    /// Moves the return address `pc` of a caller frame back into the call
    /// instruction. `rel_pc` is its offset in the file.
    pub fn adjust_pc(&self, rel_pc: u64, pc: u64) -> u64 {
        match self.arch() {
            ArchType::Arm => arm::adjust_pc(self.memory(), rel_pc, pc),
            ArchType::Arm64 => pc.wrapping_sub(4),
            ArchType::X86 | ArchType::X86_64 => pc.wrapping_sub(1),
        }
    }

    /// Unwinds one frame. `pc` is a virtual address of this file.
    pub fn step(
        &self,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult, UnwindError> {
        with_interface!(self, interface => interface.step(pc, regs, process_memory))
    }

    pub fn rule_row(&self, pc: u64) -> Result<UnwindRow, DwarfError> {
        with_interface!(self, interface => interface.rule_row(pc))
    }
}

impl std::fmt::Debug for Elf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Elf")
            .field("class", &self.class_name())
            .field("arch", &self.arch())
            .field("load_bias", &format_args!("{:#x}", self.load_bias()))
            .finish_non_exhaustive()
    }
}
