use super::class::{EM_AARCH64, EM_ARM, EM_X86_64};
use super::class::Elf64;
use super::{
    Elf, ElfError, ElfInterface, LoadInfo, Region, DT_SONAME, DT_STRTAB, PF_X, PT_ARM_EXIDX, PT_DYNAMIC,
    PT_GNU_EH_FRAME, PT_LOAD,
};
use crate::memory::{MemoryBuffer, MemoryFake};
use crate::regs::ArchType;

#[derive(Clone, Copy)]
struct Phdr {
    p_type: u32,
    p_flags: u32,
    offset: u64,
    vaddr: u64,
    memsz: u64,
}

struct Shdr {
    name: u32,
    addr: u64,
    offset: u64,
    size: u64,
}

struct Image(Vec<u8>);

impl Image {
    fn put(&mut self, at: u64, bytes: &[u8]) {
        let at = at as usize;
        if self.0.len() < at + bytes.len() {
            self.0.resize(at + bytes.len(), 0);
        }
        self.0[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn u16(&mut self, at: u64, value: u16) {
        self.put(at, &value.to_le_bytes());
    }

    fn u32(&mut self, at: u64, value: u32) {
        self.put(at, &value.to_le_bytes());
    }

    fn u64(&mut self, at: u64, value: u64) {
        self.put(at, &value.to_le_bytes());
    }

    fn ident(&mut self, class: u8) {
        self.put(0, &[0x7f, b'E', b'L', b'F', class, 1, 1]);
    }

    /// ELF32 header and program headers at 0x34.
    fn elf32(machine: u16, phdrs: &[Phdr]) -> Self {
        let mut image = Image(vec![0; 0x100]);
        image.ident(1);
        image.u16(18, machine);
        image.u32(28, 0x34);
        image.u16(42, 32);
        image.u16(44, phdrs.len() as u16);
        for (i, phdr) in phdrs.iter().enumerate() {
            let at = 0x34 + i as u64 * 32;
            image.u32(at, phdr.p_type);
            image.u32(at + 4, phdr.offset as u32);
            image.u32(at + 8, phdr.vaddr as u32);
            image.u32(at + 20, phdr.memsz as u32);
            image.u32(at + 24, phdr.p_flags);
        }
        image
    }

    /// ELF64 header, program headers at 0x40 and section headers at
    /// `shoff` with the name table last.
    fn elf64(machine: u16, phdrs: &[Phdr], shoff: u64, shdrs: &[Shdr]) -> Self {
        let mut image = Image(vec![0; 0x100]);
        image.ident(2);
        image.u16(18, machine);
        image.u64(32, 0x40);
        image.u16(54, 56);
        image.u16(56, phdrs.len() as u16);
        for (i, phdr) in phdrs.iter().enumerate() {
            let at = 0x40 + i as u64 * 56;
            image.u32(at, phdr.p_type);
            image.u32(at + 4, phdr.p_flags);
            image.u64(at + 8, phdr.offset);
            image.u64(at + 16, phdr.vaddr);
            image.u64(at + 40, phdr.memsz);
        }
        if !shdrs.is_empty() {
            image.u64(40, shoff);
            image.u16(58, 64);
            image.u16(60, shdrs.len() as u16);
            image.u16(62, shdrs.len() as u16 - 1);
            for (i, shdr) in shdrs.iter().enumerate() {
                let at = shoff + i as u64 * 64;
                image.u32(at, shdr.name);
                image.u64(at + 16, shdr.addr);
                image.u64(at + 24, shdr.offset);
                image.u64(at + 32, shdr.size);
            }
        }
        image
    }

    fn load(self) -> Result<Elf, ElfError> {
        Elf::new(Box::new(MemoryBuffer::new(self.0)))
    }
}

const TEXT: Phdr = Phdr {
    p_type: PT_LOAD,
    p_flags: PF_X,
    offset: 0,
    vaddr: 0,
    memsz: 0x1000,
};

#[test]
fn soname_after_dt_null() {
    let dynamic = Phdr {
        p_type: PT_DYNAMIC,
        p_flags: 0,
        offset: 0x200,
        vaddr: 0x200,
        memsz: 32,
    };
    let mut image = Image::elf32(EM_ARM, &[TEXT, dynamic]);
    image.u32(0x200, DT_STRTAB as u32);
    image.u32(0x204, 0x300);
    // DT_NULL at 0x208
    image.u32(0x210, DT_SONAME as u32);
    image.u32(0x214, 5);
    image.put(0x305, b"libfoo.so\0");

    let elf = image.load().unwrap();
    assert_eq!(elf.arch(), ArchType::Arm);
    assert_eq!(elf.class_name(), "ELF32");
    assert_eq!(elf.soname().as_deref(), Some("libfoo.so"));
}

#[test]
fn soname_needs_both_tags() {
    let dynamic = Phdr {
        p_type: PT_DYNAMIC,
        p_flags: 0,
        offset: 0x200,
        vaddr: 0x200,
        memsz: 16,
    };
    let mut image = Image::elf32(EM_ARM, &[TEXT, dynamic]);
    image.u32(0x200, DT_SONAME as u32);
    image.u32(0x204, 5);
    assert_eq!(image.load().unwrap().soname(), None);

    // No PT_DYNAMIC at all.
    assert_eq!(Image::elf32(EM_ARM, &[TEXT]).load().unwrap().soname(), None);
}

#[test]
fn rejects_foreign_files() {
    let mut image = Image::elf32(EM_ARM, &[TEXT]);
    image.put(0, b"\x7fELG");
    assert_eq!(image.load().unwrap_err(), ElfError::BadMagic);

    let mut image = Image::elf32(EM_ARM, &[TEXT]);
    image.put(5, &[2]);
    assert_eq!(image.load().unwrap_err(), ElfError::UnsupportedEncoding(2));

    let mut image = Image::elf32(EM_ARM, &[TEXT]);
    image.put(4, &[3]);
    assert_eq!(image.load().unwrap_err(), ElfError::UnsupportedClass(3));

    assert_eq!(
        Image::elf32(EM_AARCH64, &[TEXT]).load().unwrap_err(),
        ElfError::UnsupportedMachine {
            machine: EM_AARCH64,
            class: "ELF32"
        }
    );
    assert_eq!(
        Image::elf64(EM_ARM, &[TEXT], 0, &[]).load().unwrap_err(),
        ElfError::UnsupportedMachine {
            machine: EM_ARM,
            class: "ELF64"
        }
    );

    assert!(matches!(
        Elf::new(Box::new(MemoryBuffer::new(vec![0x7f, b'E']))),
        Err(ElfError::Read(_))
    ));
}

#[test]
fn exidx_and_load_bias() {
    let data = Phdr {
        p_type: PT_LOAD,
        p_flags: 0,
        offset: 0,
        vaddr: 0x8000,
        memsz: 0x100,
    };
    let text = Phdr {
        p_type: PT_LOAD,
        p_flags: PF_X,
        offset: 0x1000,
        vaddr: 0x11000,
        memsz: 0x2000,
    };
    let exidx = Phdr {
        p_type: PT_ARM_EXIDX,
        p_flags: 0,
        offset: 0x400,
        vaddr: 0x10400,
        memsz: 24,
    };
    let elf = Image::elf32(EM_ARM, &[data, text, exidx]).load().unwrap();

    assert_eq!(elf.load_bias(), 0x10000);
    assert_eq!(
        elf.pt_loads().values().copied().collect::<Vec<_>>(),
        [LoadInfo {
            offset: 0x1000,
            vaddr: 0x11000,
            size: 0x2000
        }]
    );
    assert_eq!(elf.offset_to_vaddr(0x1234), 0x11234);
    assert_eq!(elf.offset_to_vaddr(0x40), 0x8040);
    assert_eq!(elf.offset_to_vaddr(0x5000), 0x15000);
    let table = elf.exidx().unwrap();
    assert_eq!(table.start_offset(), 0x400);
    assert_eq!(table.len(), 3);
    assert!(elf.eh_frame().is_none());
    assert!(elf.debug_frame().is_none());
}

#[test]
fn pc_adjustment_per_arch() {
    let elf = Image::elf64(EM_AARCH64, &[TEXT], 0, &[]).load().unwrap();
    assert_eq!(elf.arch(), ArchType::Arm64);
    assert_eq!(elf.adjust_pc(0x100, 0x5100), 0x50fc);

    let elf = Image::elf64(EM_X86_64, &[TEXT], 0, &[]).load().unwrap();
    assert_eq!(elf.adjust_pc(0x100, 0x5100), 0x50ff);

    let elf = Image::elf32(EM_ARM, &[TEXT]).load().unwrap();
    // Too close to the start of the file to look back.
    assert_eq!(elf.adjust_pc(4, 0x5004), 0x5004);
    assert_eq!(elf.adjust_pc(0x100, 0x5100), 0x50fc);
    // Thumb, the halfwords before the return address are no 32-bit call.
    assert_eq!(elf.adjust_pc(0x101, 0x5101), 0x50ff);
}

#[test]
fn sections_by_name() {
    let eh_frame_hdr = Phdr {
        p_type: PT_GNU_EH_FRAME,
        p_flags: 0,
        offset: 0x600,
        vaddr: 0x600,
        memsz: 12,
    };
    let shdrs = [
        Shdr {
            name: 0,
            addr: 0,
            offset: 0,
            size: 0,
        },
        Shdr {
            name: 1,
            addr: 0x700,
            offset: 0x700,
            size: 0x40,
        },
        Shdr {
            name: 11,
            addr: 0,
            offset: 0x800,
            size: 0x80,
        },
        Shdr {
            name: 24,
            addr: 0,
            offset: 0x900,
            size: 0x20,
        },
    ];
    let mut image = Image::elf64(EM_X86_64, &[TEXT, eh_frame_hdr], 0x400, &shdrs);
    image.put(0x900, b"\0.eh_frame\0.debug_frame\0.shstrtab\0");
    // .eh_frame_hdr without a search table, pointing at .eh_frame.
    image.put(0x600, &[1, 0x1b, 0xff, 0xff]);
    image.u32(0x604, 0x700 - 0x604);

    let elf = image.load().unwrap();
    assert_eq!(elf.class_name(), "ELF64");
    assert_eq!(
        elf.eh_frame(),
        Some((
            Region {
                offset: 0x700,
                vaddr: 0x700,
                size: 0x40
            },
            false
        ))
    );
    assert_eq!(
        elf.debug_frame(),
        Some(Region {
            offset: 0x800,
            vaddr: 0,
            size: 0x80
        })
    );
    assert!(elf.exidx().is_none());
}

#[test]
fn broken_section_headers_are_tolerated() {
    let shdrs = [Shdr {
        name: 0,
        addr: 0,
        offset: 0,
        size: 0,
    }];
    // The table runs off the end of the file.
    let elf = Image::elf64(EM_X86_64, &[TEXT], 0x10_0000, &shdrs)
        .load()
        .unwrap();
    assert!(elf.eh_frame().is_none());
}

/// The image at address 0 and `len` zero bytes ending at the last address.
fn image_and_top(image: &Image, len: u64) -> MemoryFake {
    let mut memory = MemoryFake::new();
    memory.set_memory(0, &image.0);
    memory.set_memory(u64::MAX - (len - 1), &vec![0; len as usize]);
    memory
}

#[test]
fn dynamic_section_at_the_end_of_the_address_space() {
    let dynamic = Phdr {
        p_type: PT_DYNAMIC,
        p_flags: 0,
        offset: u64::MAX - 8,
        vaddr: 0x200,
        memsz: 64,
    };
    let elf = Image::elf64(EM_X86_64, &[TEXT, dynamic], 0, &[])
        .load()
        .unwrap();
    assert_eq!(elf.soname(), None);
}

#[test]
fn program_headers_at_the_end_of_the_address_space() {
    let mut image = Image::elf64(EM_X86_64, &[TEXT, TEXT], 0, &[]);
    // The first header is the last 56 bytes of the address space.
    image.u64(32, u64::MAX - 55);
    let memory = image_and_top(&image, 56);

    let mut interface = ElfInterface::<Elf64>::new(Box::new(memory)).unwrap();
    assert_eq!(
        interface.process_program_headers(),
        Err(ElfError::OutOfRange("program header"))
    );
}

#[test]
fn section_headers_at_the_end_of_the_address_space() {
    let mut image = Image::elf64(EM_X86_64, &[TEXT], 0, &[]);
    image.u64(40, u64::MAX - 63);
    image.u16(58, 64);
    image.u16(60, 2);
    image.u16(62, 0);
    let memory = image_and_top(&image, 64);

    let mut interface = ElfInterface::<Elf64>::new(Box::new(memory)).unwrap();
    interface.process_program_headers().unwrap();
    assert_eq!(
        interface.process_section_headers(),
        Err(ElfError::OutOfRange("section header"))
    );
}

#[test]
fn section_names_past_the_end_of_the_address_space() {
    let shdrs = [
        Shdr {
            name: 0x10,
            addr: 0x400,
            offset: 0x400,
            size: 0x40,
        },
        Shdr {
            name: 0,
            addr: 0,
            offset: u64::MAX - 2,
            size: 0x20,
        },
    ];
    let elf = Image::elf64(EM_X86_64, &[TEXT], 0x100, &shdrs)
        .load()
        .unwrap();
    assert!(elf.eh_frame().is_none());
    assert!(elf.debug_frame().is_none());
}
