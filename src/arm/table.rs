use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{prel31, ArmExidx, ARM_REG_PC};
use crate::memory::{self, Memory, ReadError};
use crate::regs::Regs;
use crate::{StepResult, UnwindError};

#[cfg(test)]
mod tests;

/// The `.ARM.exidx` table of one ELF file.
///
/// Function start addresses are decoded on demand and cached by entry index,
/// so a table shared between threads is only ever read once per entry.
#[derive(Debug)]
pub struct ExidxTable {
    start_offset: u64,
    total_entries: usize,
    load_bias: u64,
    addrs: Mutex<HashMap<usize, u32>>,
}

impl ExidxTable {
    /// `start_offset` is the offset of the table in the ELF memory.
    pub fn new(start_offset: u64, total_entries: usize, load_bias: u64) -> Self {
        Self {
            start_offset,
            total_entries,
            load_bias,
            addrs: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn len(&self) -> usize {
        self.total_entries
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }

    /// `None` when the entry would lie past the end of the address space.
    pub fn entry_offset(&self, idx: usize) -> Option<u64> {
        (idx as u64)
            .checked_mul(8)
            .and_then(|offset| self.start_offset.checked_add(offset))
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<usize, u32>> {
        self.addrs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The function start of entry `idx`, as an offset into the ELF memory.
    pub fn entry_addr(&self, memory: &dyn Memory, idx: usize) -> memory::Result<u32> {
        if let Some(addr) = self.cache().get(&idx).copied() {
            return Ok(addr);
        }

        let offset = self.entry_offset(idx).ok_or(ReadError {
            addr: self.start_offset,
            len: 8,
        })?;
        let data = memory.read_u32(offset)?;
        let addr = (offset as u32).wrapping_add(prel31(data) as u32);
        self.cache().insert(idx, addr);
        Ok(addr)
    }

    /// Returns the offset of the entry covering `pc`: the last entry whose
    /// function starts at or below `pc`. Addresses past the last entry belong
    /// to the last entry.
    #[instrument(level = "trace", skip(self, memory), ret)]
    pub fn find_entry(&self, memory: &dyn Memory, pc: u64) -> Option<u64> {
        if self.total_entries == 0 {
            return None;
        }

        let pc = pc.wrapping_sub(self.load_bias);
        let addr = |idx: usize| match self.entry_addr(memory, idx) {
            Ok(addr) => Some(u64::from(addr)),
            Err(err) => {
                debug!("failed to read exidx entry {idx}: {err}");
                None
            }
        };

        if pc < addr(0)? {
            return None;
        }

        let mut last = self.total_entries - 1;
        if pc >= addr(last)? {
            return self.entry_offset(last);
        }

        // addr(first) <= pc < addr(last)
        let mut first = 0;
        while last - first > 1 {
            let current = first + (last - first) / 2;
            if addr(current)? <= pc {
                first = current;
            } else {
                last = current;
            }
        }
        self.entry_offset(first)
    }

    /// Unwinds one frame with the entry covering `pc`. On success SP is the
    /// CFA and PC is the return address; the registers are left untouched
    /// otherwise.
    #[instrument(level = "debug", skip(self, elf_memory, regs, process_memory))]
    pub fn step(
        &self,
        elf_memory: &dyn Memory,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult, UnwindError> {
        let entry = self
            .find_entry(elf_memory, pc)
            .ok_or(UnwindError::NoUnwindInfo(pc))?;

        let mut arm = ArmExidx::new(elf_memory, process_memory);
        for (reg, slot) in arm.regs_mut().iter_mut().enumerate() {
            *slot = regs.get(reg)? as u32;
        }
        // FINISH fills in the return address unless r15 was popped.
        arm.regs_mut()[ARM_REG_PC] = 0;
        arm.set_cfa(regs.sp() as u32);

        arm.extract_entry(entry)?;
        arm.eval()?;

        for (reg, value) in arm.regs().iter().enumerate() {
            regs.set(reg, u64::from(*value))?;
        }
        regs.set_sp(u64::from(arm.cfa()));
        Ok(StepResult::Continue)
    }
}
