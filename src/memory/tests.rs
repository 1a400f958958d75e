use std::io::Write;
use std::sync::Arc;

use super::{
    Memory, MemoryBuffer, MemoryFake, MemoryFileAtOffset, MemoryLocal, MemoryRange, MemoryZero,
    ReadError,
};

#[test]
fn buffer_reads_are_bounds_checked() {
    let memory = MemoryBuffer::with_base(0x1000, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    assert_eq!(memory.read_u32(0x1000), Ok(0x0403_0201));
    assert_eq!(memory.read_u32(0x1004), Ok(0x0807_0605));
    assert_eq!(
        memory.read_u32(0x1005),
        Err(ReadError {
            addr: 0x1005,
            len: 4
        })
    );
    assert!(memory.read_u8(0xfff).is_err());
    assert!(memory.read_u64(u64::MAX - 2).is_err());
}

#[test]
fn fake_needs_every_byte() {
    let mut memory = MemoryFake::new();
    memory.set_data32(0x100, 0xdead_beef);
    memory.set_data8(0x105, 0x11);

    assert_eq!(memory.read_u32(0x100), Ok(0xdead_beef));
    assert_eq!(memory.read_u16(0x102), Ok(0xdead));
    // 0x104 was never set
    assert!(memory.read_u16(0x104).is_err());
    assert_eq!(memory.read_u8(0x105), Ok(0x11));

    memory.clear();
    assert!(memory.read_u8(0x100).is_err());
}

#[test]
fn zero_memory_always_succeeds() {
    let mut buf = [0xffu8; 16];
    MemoryZero.read(0x1234, &mut buf).unwrap();
    assert_eq!(buf, [0; 16]);
}

#[test]
fn cstring_needs_terminator_in_window() {
    let mut memory = MemoryFake::new();
    memory.set_memory(0x10, b"libc.so\0");

    assert_eq!(memory.read_cstring(0x10, 64).unwrap(), "libc.so");
    assert_eq!(memory.read_cstring(0x10, 7).unwrap(), "libc.so");
    assert!(memory.read_cstring(0x10, 6).is_err());
}

#[test]
fn file_at_unaligned_offset() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let contents: Vec<u8> = (0..0x3000u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&contents).unwrap();
    file.flush().unwrap();

    let memory = MemoryFileAtOffset::new(file.path(), 0x1003).unwrap();
    assert_eq!(memory.len(), 0x3000 - 0x1003);

    let mut buf = [0u8; 8];
    memory.read(0, &mut buf).unwrap();
    assert_eq!(buf, contents[0x1003..0x100b]);

    memory.read(0x1ff0, &mut buf[..4]).unwrap();
    assert_eq!(buf[..4], contents[0x2ff3..0x2ff7]);

    // straddles the end of the file
    assert!(memory.read(0x2000 - 0x3 - 4, &mut buf).is_err());
    assert!(memory.read(0x1ffd, &mut buf[..1]).is_err());
}

#[test]
fn file_offset_past_end_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0; 16]).unwrap();
    file.flush().unwrap();

    assert!(MemoryFileAtOffset::new(file.path(), 16).is_err());
    assert!(MemoryFileAtOffset::new(file.path(), 15).is_ok());
}

#[test]
fn local_reads_own_stack() {
    let value: u64 = 0x0123_4567_89ab_cdef;
    let addr = &value as *const u64 as u64;

    assert_eq!(MemoryLocal.read_u64(addr), Ok(value));
    assert!(MemoryLocal.read_u64(0).is_err());
}

#[test]
fn range_is_rebased_and_clamped() {
    let inner = Arc::new(MemoryBuffer::with_base(0x4000, (0..=255).collect()));
    let range = MemoryRange::new(inner, 0x4010, 0x20);

    assert_eq!(range.read_u8(0), Ok(0x10));
    assert_eq!(range.read_u8(0x1f), Ok(0x2f));
    assert!(range.read_u8(0x20).is_err());
    assert!(range.read_u16(0x1f).is_err());

    // Rebasing past the end of the address space fails instead of wrapping.
    let range = MemoryRange::new(Arc::new(MemoryZero), u64::MAX - 1, 0x10);
    assert_eq!(range.read_u8(1), Ok(0));
    assert!(range.read_u8(2).is_err());
}
