use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use unwindstack::maps::Maps;
use unwindstack::memory::{Memory, MemoryFake};
use unwindstack::regs::{Regs, RegsArm};
use unwindstack::unwinder::{ElfCache, Frame, StopReason, Unwinder, UnwinderConfig};
use unwindstack::UnwindError;

const PT_LOAD: u32 = 1;
const PT_ARM_EXIDX: u32 = 0x7000_0001;
const PF_X: u32 = 1;
const EM_ARM: u16 = 40;

/// "pop {r4, r14}; vsp = vsp + 4; finish"
const POP_R4_LR: u32 = 0x80a8_00b0;

const MAP_START: u64 = 0x10000;
const STACK: u64 = 0x8000;

/// An ARM shared object with two functions, at 0x400 and 0x500, that both
/// save r4 and lr.
fn arm_image() -> Vec<u8> {
    let mut image = vec![0u8; 0x600];
    let mut put = |at: usize, bytes: &[u8]| image[at..at + bytes.len()].copy_from_slice(bytes);

    put(0, &[0x7f, b'E', b'L', b'F', 1, 1, 1]);
    put(18, &EM_ARM.to_le_bytes());
    put(28, &0x34u32.to_le_bytes());
    put(42, &32u16.to_le_bytes());
    put(44, &2u16.to_le_bytes());

    let phdrs = [(PT_LOAD, PF_X, 0u32, 0x600u32), (PT_ARM_EXIDX, 0, 0x200, 16)];
    for (i, (p_type, p_flags, offset, size)) in phdrs.into_iter().enumerate() {
        let at = 0x34 + i * 32;
        put(at, &p_type.to_le_bytes());
        put(at + 4, &offset.to_le_bytes());
        put(at + 8, &offset.to_le_bytes());
        put(at + 16, &size.to_le_bytes());
        put(at + 20, &size.to_le_bytes());
        put(at + 24, &p_flags.to_le_bytes());
    }

    for (i, function) in [0x400u32, 0x500].into_iter().enumerate() {
        let entry = 0x200 + i as u32 * 8;
        put(entry as usize, &(function - entry).to_le_bytes());
        put(entry as usize + 4, &POP_R4_LR.to_le_bytes());
    }
    image
}

struct Fixture {
    _file: NamedTempFile,
    maps: Maps,
    stack: Arc<dyn Memory>,
}

fn fixture() -> Fixture {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&arm_image()).unwrap();
    file.flush().unwrap();

    let maps = Maps::parse(&format!(
        "{:x}-{:x} r-xp 00000000 00:00 0 {}\n",
        MAP_START,
        MAP_START + 0x600,
        file.path().display()
    ))
    .unwrap();

    let mut stack = MemoryFake::new();
    // Saved by the function at 0x400: r4, lr, padding.
    stack.set_data32(STACK, 1);
    stack.set_data32(STACK + 4, (MAP_START + 0x508) as u32);
    // Saved by the function at 0x500, the outermost one.
    stack.set_data32(STACK + 0xc, 2);
    stack.set_data32(STACK + 0x10, 0);

    Fixture {
        _file: file,
        maps,
        stack: Arc::new(stack),
    }
}

fn regs_at(pc: u64) -> RegsArm {
    let mut regs = RegsArm::new();
    regs.set_pc(pc);
    regs.set_sp(STACK);
    regs.set(14, 1).unwrap();
    regs
}

#[test]
fn walks_two_arm_frames() {
    let fixture = fixture();
    let elfs = ElfCache::new();
    let unwinder = Unwinder::new(&fixture.maps, Arc::clone(&fixture.stack), &elfs);

    let mut regs = regs_at(MAP_START + 0x404);
    let backtrace = unwinder.unwind(&mut regs);

    let name = fixture.maps.iter().next().unwrap().name.clone();
    assert_eq!(
        backtrace.frames,
        [
            Frame {
                num: 0,
                pc: MAP_START + 0x404,
                sp: STACK,
                rel_pc: 0x404,
                map_name: name.clone(),
            },
            Frame {
                num: 1,
                pc: MAP_START + 0x504,
                sp: STACK + 0xc,
                rel_pc: 0x504,
                map_name: name,
            },
        ]
    );
    assert_eq!(backtrace.stop, StopReason::PcZero);
    assert!(!backtrace.to_string().contains("unwind failed"));

    assert_eq!(regs.get(4), Ok(2));
    assert_eq!(regs.sp(), STACK + 0x18);
    assert_eq!(elfs.len(), 1);
}

#[test]
fn frame_limit() {
    let fixture = fixture();
    let elfs = ElfCache::new();
    let unwinder = Unwinder::new(&fixture.maps, Arc::clone(&fixture.stack), &elfs)
        .with_config(UnwinderConfig { max_frames: 1 });

    let backtrace = unwinder.unwind(&mut regs_at(MAP_START + 0x404));
    assert_eq!(backtrace.frames.len(), 1);
    assert_eq!(backtrace.stop, StopReason::MaxFrames);
}

#[test]
fn failures_are_reported() {
    let fixture = fixture();
    let elfs = ElfCache::new();
    let unwinder = Unwinder::new(&fixture.maps, Arc::clone(&fixture.stack), &elfs);

    let backtrace = unwinder.unwind(&mut regs_at(0x9000));
    assert!(backtrace.frames.is_empty());
    assert_eq!(backtrace.stop, StopReason::NoMap(0x9000));

    // Below the first function of the exidx table.
    let mut regs = regs_at(MAP_START + 0x100);
    let backtrace = unwinder.unwind(&mut regs);
    assert_eq!(backtrace.frames.len(), 1);
    assert_eq!(
        backtrace.stop,
        StopReason::Step(UnwindError::NoUnwindInfo(0x100))
    );
    assert_eq!(regs.pc(), MAP_START + 0x100);

    let text = backtrace.to_string();
    assert!(text.starts_with("#00 pc 0000000000000100  "), "{text}");
    assert!(
        text.ends_with("  !! unwind failed: no unwind information covers 0x100\n"),
        "{text}"
    );
}

#[test]
fn unreadable_elf() {
    let maps = Maps::parse("10000-11000 r-xp 00000000 00:00 0 /nonexistent/libfoo.so").unwrap();
    let elfs = ElfCache::new();
    let unwinder = Unwinder::new(&maps, Arc::new(MemoryFake::new()), &elfs);

    let backtrace = unwinder.unwind(&mut regs_at(0x10004));
    assert_eq!(
        backtrace.stop,
        StopReason::NoElf("/nonexistent/libfoo.so".into())
    );
    // The failure is cached too.
    unwinder.unwind(&mut regs_at(0x10008));
    assert_eq!(elfs.len(), 1);
}
