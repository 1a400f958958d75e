use super::ExidxTable;
use crate::arm::ArmStatus;
use crate::memory::{Memory, MemoryFake};
use crate::regs::{Regs, RegsArm};
use crate::{StepResult, UnwindError};

const TABLE: u64 = 0x1000;

/// A table at 0x1000 whose entry `i` covers the function at `starts[i]`.
fn build_table(starts: &[u32], load_bias: u64) -> (ExidxTable, MemoryFake) {
    let mut memory = MemoryFake::new();
    for (i, start) in starts.iter().enumerate() {
        let offset = TABLE + i as u64 * 8;
        memory.set_data32(offset, start.wrapping_sub(offset as u32) & 0x7fff_ffff);
        memory.set_data32(offset + 4, 1);
    }
    (ExidxTable::new(TABLE, starts.len(), load_bias), memory)
}

#[test]
fn find_entry_binary_search() {
    let starts: Vec<u32> = (0..10).map(|i| 0x2000 + i * 0x100).collect();
    let (table, memory) = build_table(&starts, 0);
    let entry = |idx: u64| Some(TABLE + idx * 8);

    assert_eq!(table.find_entry(&memory, 0x1fff), None);
    assert_eq!(table.find_entry(&memory, 0x2000), entry(0));
    assert_eq!(table.find_entry(&memory, 0x20ff), entry(0));
    assert_eq!(table.find_entry(&memory, 0x2100), entry(1));
    for (i, start) in starts.iter().enumerate() {
        assert_eq!(table.find_entry(&memory, u64::from(*start) + 4), entry(i as u64));
    }
    // Everything past the last start belongs to the last entry.
    assert_eq!(table.find_entry(&memory, 0x2900), entry(9));
    assert_eq!(table.find_entry(&memory, 0xffff_0000), entry(9));
}

#[test]
fn find_entry_edges() {
    let (table, memory) = build_table(&[0x2000], 0);
    assert_eq!(table.find_entry(&memory, 0x1fff), None);
    assert_eq!(table.find_entry(&memory, 0x2000), Some(TABLE));
    assert_eq!(table.find_entry(&memory, 0x9000), Some(TABLE));

    let (table, memory) = build_table(&[], 0);
    assert!(table.is_empty());
    assert_eq!(table.find_entry(&memory, 0x2000), None);

    // Entries that cannot be read cover nothing.
    let table = ExidxTable::new(TABLE, 4, 0);
    assert_eq!(table.find_entry(&MemoryFake::new(), 0x2000), None);
}

#[test]
fn find_entry_removes_the_load_bias() {
    let (table, memory) = build_table(&[0x2000, 0x3000], 0x10000);
    assert_eq!(table.find_entry(&memory, 0x11fff), None);
    assert_eq!(table.find_entry(&memory, 0x12800), Some(TABLE));
    assert_eq!(table.find_entry(&memory, 0x13000), Some(TABLE + 8));
}

#[test]
fn entry_addresses_are_cached() {
    let (table, memory) = build_table(&[0x2000, 0x1000_0000], 0);
    assert_eq!(table.entry_addr(&memory, 1), Ok(0x1000_0000));

    // Backward references wrap.
    let (back, memory) = table_with_data(0x7fff_fff0);
    assert_eq!(back.entry_addr(&memory, 0), Ok(TABLE as u32 - 0x10));

    // Once decoded the memory is not consulted again.
    let empty = MemoryFake::new();
    assert_eq!(table.entry_addr(&empty, 1), Ok(0x1000_0000));
    assert!(table.entry_addr(&empty, 0).is_err());
}

fn table_with_data(data: u32) -> (ExidxTable, MemoryFake) {
    let mut memory = MemoryFake::new();
    memory.set_data32(TABLE, data);
    (ExidxTable::new(TABLE, 1, 0), memory)
}

/// Two entries at 0x2000 and 0x2008, the first one "pop {r4, r14};
/// vsp = vsp + 4; finish", the second one cannot be unwound.
fn two_entry_image() -> MemoryFake {
    let mut memory = MemoryFake::new();
    memory.set_data32(0x2000, 0);
    memory.set_data32(0x2004, 0x80a8_00b0);
    memory.set_data32(0x2008, 0);
    memory.set_data32(0x200c, 1);

    memory.set_data32(0x1000, 0x4444);
    memory.set_data32(0x1004, 0x5000);
    memory
}

fn arm_regs() -> RegsArm {
    let mut regs = RegsArm::new();
    regs.set_sp(0x1000);
    regs.set(14, 0x3000).unwrap();
    regs.set_pc(0x2004);
    regs
}

#[test]
fn step_two_entry_table() {
    let memory = two_entry_image();
    let table = ExidxTable::new(0x2000, 2, 0);
    let mut regs = arm_regs();

    assert_eq!(
        table.step(&memory, 0x2004, &mut regs, &memory),
        Ok(StepResult::Continue)
    );
    assert_eq!(regs.get(4), Ok(0x4444));
    assert_eq!(regs.lr(), Some(0x5000));
    assert_eq!(regs.pc(), 0x5000);
    assert_eq!(regs.sp(), 0x100c);
}

#[test]
fn failed_step_leaves_registers_alone() {
    let memory = two_entry_image();
    let table = ExidxTable::new(0x2000, 2, 0);
    let mut regs = arm_regs();
    let before = format!("{regs:?}");

    assert_eq!(
        table.step(&memory, 0x2010, &mut regs, &memory),
        Err(UnwindError::Arm(ArmStatus::NoUnwind))
    );
    assert_eq!(
        table.step(&memory, 0x1000, &mut regs, &memory),
        Err(UnwindError::NoUnwindInfo(0x1000))
    );

    // The stack is not readable.
    let mut image = MemoryFake::new();
    image.set_data32(0x2000, 0);
    image.set_data32(0x2004, 0x80a8_00b0);
    let stack: &dyn Memory = &MemoryFake::new();
    assert_eq!(
        ExidxTable::new(0x2000, 1, 0).step(&image, 0x2004, &mut regs, stack),
        Err(UnwindError::Arm(ArmStatus::ReadFailed(0x1000)))
    );
    assert_eq!(format!("{regs:?}"), before);
}

#[test]
fn table_at_the_end_of_the_address_space() {
    let table = ExidxTable::new(u64::MAX - 8, 4, 0);
    assert_eq!(table.entry_offset(0), Some(u64::MAX - 8));
    assert_eq!(table.entry_offset(1), Some(u64::MAX));
    assert_eq!(table.entry_offset(2), None);

    let memory = MemoryFake::new();
    assert!(table.entry_addr(&memory, 3).is_err());
    assert_eq!(table.find_entry(&memory, 0x2000), None);
}
