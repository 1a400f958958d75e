//! The two ELF classes. Everything that differs between 32-bit and 64-bit
//! objects is a record layout; [`ElfClass`] normalizes those records so the
//! rest of the reader is written once.

use core::mem;

use crate::address::AddressType;
use crate::memory::{self, Memory};
use crate::regs::ArchType;

pub(crate) const EM_386: u16 = 3;
pub(crate) const EM_ARM: u16 = 40;
pub(crate) const EM_X86_64: u16 = 62;
pub(crate) const EM_AARCH64: u16 = 183;

/// ELF records that can be built from any byte pattern.
///
/// # Safety
///
/// Implementors must be `repr(C)` structs made only of integer fields.
pub unsafe trait Record: Copy {}

unsafe impl Record for libc::Elf32_Ehdr {}
unsafe impl Record for libc::Elf64_Ehdr {}
unsafe impl Record for libc::Elf32_Phdr {}
unsafe impl Record for libc::Elf64_Phdr {}
unsafe impl Record for libc::Elf32_Shdr {}
unsafe impl Record for libc::Elf64_Shdr {}

/// Reads one record stored in target (little-endian) byte order.
pub(crate) fn read_record<T: Record>(memory: &dyn Memory, addr: u64) -> memory::Result<T> {
    let mut buf = vec![0u8; mem::size_of::<T>()];
    memory.read(addr, &mut buf)?;
    // SAFETY: `T: Record` is valid for every bit pattern and `buf` holds
    // exactly `size_of::<T>()` bytes.
    Ok(unsafe { buf.as_ptr().cast::<T>().read_unaligned() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub machine: u16,
    pub phoff: u64,
    pub phentsize: u64,
    pub phnum: u64,
    pub shoff: u64,
    pub shentsize: u64,
    pub shnum: u64,
    pub shstrndx: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_memsz: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dyn {
    pub tag: i64,
    pub val: u64,
}

pub trait ElfClass: Send + Sync + 'static {
    type Addr: AddressType;
    type Ehdr: Record;
    type Phdr: Record;
    type Shdr: Record;

    const NAME: &'static str;

    fn file_header(raw: &Self::Ehdr) -> FileHeader;
    fn program_header(raw: &Self::Phdr) -> ProgramHeader;
    fn section_header(raw: &Self::Shdr) -> SectionHeader;

    /// Architectures this class is accepted for.
    fn arch(machine: u16) -> Option<ArchType>;

    /// Size of one dynamic section entry: a tag and a value, both address
    /// sized.
    const DYN_SIZE: u64 = 2 * <Self::Addr as AddressType>::SIZE as u64;

    fn read_dyn(memory: &dyn Memory, addr: u64) -> memory::Result<Dyn> {
        let tag = Self::Addr::read(memory, addr)?.to_u64();
        let val = Self::Addr::read(memory, addr + Self::Addr::SIZE as u64)?.to_u64();
        Ok(Dyn {
            tag: Self::Addr::sign_extend(tag) as i64,
            val,
        })
    }
}

#[derive(Debug)]
pub struct Elf32;

#[derive(Debug)]
pub struct Elf64;

impl ElfClass for Elf32 {
    type Addr = u32;
    type Ehdr = libc::Elf32_Ehdr;
    type Phdr = libc::Elf32_Phdr;
    type Shdr = libc::Elf32_Shdr;

    const NAME: &'static str = "ELF32";

    fn file_header(raw: &Self::Ehdr) -> FileHeader {
        FileHeader {
            machine: raw.e_machine,
            phoff: raw.e_phoff.into(),
            phentsize: raw.e_phentsize.into(),
            phnum: raw.e_phnum.into(),
            shoff: raw.e_shoff.into(),
            shentsize: raw.e_shentsize.into(),
            shnum: raw.e_shnum.into(),
            shstrndx: raw.e_shstrndx.into(),
        }
    }

    fn program_header(raw: &Self::Phdr) -> ProgramHeader {
        ProgramHeader {
            p_type: raw.p_type,
            p_flags: raw.p_flags,
            p_offset: raw.p_offset.into(),
            p_vaddr: raw.p_vaddr.into(),
            p_memsz: raw.p_memsz.into(),
        }
    }

    fn section_header(raw: &Self::Shdr) -> SectionHeader {
        SectionHeader {
            sh_name: raw.sh_name,
            sh_type: raw.sh_type,
            sh_addr: raw.sh_addr.into(),
            sh_offset: raw.sh_offset.into(),
            sh_size: raw.sh_size.into(),
        }
    }

    fn arch(machine: u16) -> Option<ArchType> {
        match machine {
            EM_ARM => Some(ArchType::Arm),
            EM_386 => Some(ArchType::X86),
            _ => None,
        }
    }
}

impl ElfClass for Elf64 {
    type Addr = u64;
    type Ehdr = libc::Elf64_Ehdr;
    type Phdr = libc::Elf64_Phdr;
    type Shdr = libc::Elf64_Shdr;

    const NAME: &'static str = "ELF64";

    fn file_header(raw: &Self::Ehdr) -> FileHeader {
        FileHeader {
            machine: raw.e_machine,
            phoff: raw.e_phoff,
            phentsize: raw.e_phentsize.into(),
            phnum: raw.e_phnum.into(),
            shoff: raw.e_shoff,
            shentsize: raw.e_shentsize.into(),
            shnum: raw.e_shnum.into(),
            shstrndx: raw.e_shstrndx.into(),
        }
    }

    fn program_header(raw: &Self::Phdr) -> ProgramHeader {
        ProgramHeader {
            p_type: raw.p_type,
            p_flags: raw.p_flags,
            p_offset: raw.p_offset,
            p_vaddr: raw.p_vaddr,
            p_memsz: raw.p_memsz,
        }
    }

    fn section_header(raw: &Self::Shdr) -> SectionHeader {
        SectionHeader {
            sh_name: raw.sh_name,
            sh_type: raw.sh_type,
            sh_addr: raw.sh_addr,
            sh_offset: raw.sh_offset,
            sh_size: raw.sh_size,
        }
    }

    fn arch(machine: u16) -> Option<ArchType> {
        match machine {
            EM_AARCH64 => Some(ArchType::Arm64),
            EM_X86_64 => Some(ArchType::X86_64),
            _ => None,
        }
    }
}
