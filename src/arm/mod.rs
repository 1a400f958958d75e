//! ARM EHABI unwinding.
//!
//! Every function covered by `.ARM.exidx` has an 8-byte entry: a prel31
//! offset to the function start, followed by either the unwind opcodes
//! themselves (compact form), a prel31 pointer to them in `.ARM.extab`
//! (generic form), or the `EXIDX_CANTUNWIND` marker.
//!
//! The opcodes drive a tiny machine over the virtual stack pointer (`vsp`,
//! the CFA here) and the sixteen core registers.
//!
//! Source: "Exception Handling ABI for the ARM Architecture", §9.3

mod table;


use core::fmt;
use core::ops::ControlFlow;
use std::collections::VecDeque;

use crate::memory::Memory;

pub use table::ExidxTable;

pub const ARM_OP_FINISH: u8 = 0xb0;

const ARM_REG_LR: usize = 14;
const ARM_REG_PC: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArmStatus {
    #[error("no status")]
    None,
    #[error("the function cannot be unwound")]
    NoUnwind,
    #[error("finished")]
    Finish,
    #[error("reserved opcode")]
    Reserved,
    #[error("spare opcode")]
    Spare,
    #[error("opcode stream ended early")]
    Truncated,
    #[error("failed to read memory at {0:#x}")]
    ReadFailed(u64),
    #[error("malformed unwind table entry")]
    Malformed,
    #[error("unsupported personality routine")]
    InvalidPersonality,
}

/// Sign extends the low 31 bits of `data`.
pub fn prel31(data: u32) -> i32 {
    ((data << 1) as i32) >> 1
}

/// Returns `pc` moved back onto the call instruction that produced it.
///
/// `rel_pc` is the same location as an offset into `elf_memory`. Thumb
/// return addresses (bit 0 set) are preceded by either a 2 byte or a 4 byte
/// `BL`/`BLX`, which is told apart by looking at the preceding halfwords.
pub fn adjust_pc(elf_memory: &dyn Memory, rel_pc: u64, pc: u64) -> u64 {
    if rel_pc < 5 {
        return pc;
    }

    if rel_pc & 1 != 0 {
        let is_wide_call = elf_memory
            .read_u32(rel_pc - 5)
            .map(|value| value & 0xe000_f000 == 0xe000_f000)
            .unwrap_or(false);
        if !is_wide_call {
            return pc.wrapping_sub(2);
        }
    }
    pc.wrapping_sub(4)
}

/// `{r4, r7, r10}` for the bits of `mask`, numbered from `first`.
struct RegMask {
    prefix: &'static str,
    first: usize,
    mask: u16,
}

impl fmt::Display for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut comma = false;
        for bit in 0..16 {
            if self.mask & (1 << bit) != 0 {
                if comma {
                    f.write_str(", ")?;
                }
                write!(f, "{}{}", self.prefix, self.first + bit)?;
                comma = true;
            }
        }
        f.write_str("}")
    }
}

/// `{d8-d11}`, or `{d8}` when the range holds a single register.
struct RegRange {
    prefix: &'static str,
    start: usize,
    end: usize,
    /// Printed after the range, inside the braces.
    extra: &'static str,
}

impl fmt::Display for RegRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}{}", self.prefix, self.start)?;
        if self.end != self.start {
            write!(f, "-{}{}", self.prefix, self.end)?;
        }
        write!(f, "{}}}", self.extra)
    }
}

/// The EHABI unwind opcode interpreter for one table entry.
pub struct ArmExidx<'a> {
    elf_memory: &'a dyn Memory,
    process_memory: &'a dyn Memory,
    regs: [u32; 16],
    cfa: u32,
    data: VecDeque<u8>,
    status: ArmStatus,
    log_only: bool,
}

impl<'a> ArmExidx<'a> {
    /// Table entries are read from `elf_memory`, popped registers from
    /// `process_memory`.
    pub fn new(elf_memory: &'a dyn Memory, process_memory: &'a dyn Memory) -> Self {
        Self {
            elf_memory,
            process_memory,
            regs: [0; 16],
            cfa: 0,
            data: VecDeque::new(),
            status: ArmStatus::None,
            log_only: false,
        }
    }

    pub fn regs(&self) -> &[u32; 16] {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut [u32; 16] {
        &mut self.regs
    }

    pub fn cfa(&self) -> u32 {
        self.cfa
    }

    pub fn set_cfa(&mut self, cfa: u32) {
        self.cfa = cfa;
    }

    pub fn status(&self) -> ArmStatus {
        self.status
    }

    /// The opcodes that have not been decoded yet.
    pub fn data(&self) -> &VecDeque<u8> {
        &self.data
    }

    /// Only log the decoded opcodes, without touching registers, the CFA or
    /// process memory.
    pub fn set_log_only(&mut self, log_only: bool) {
        self.log_only = log_only;
    }

    fn log_op(&self, op: fmt::Arguments<'_>) {
        if self.log_only {
            info!("{op}");
        } else {
            trace!("{op}");
        }
    }

    fn fail<T>(&mut self, status: ArmStatus) -> Result<T, ArmStatus> {
        self.status = status;
        Err(status)
    }

    fn stop<T>(&mut self, status: ArmStatus) -> ControlFlow<ArmStatus, T> {
        self.status = status;
        ControlFlow::Break(status)
    }

    fn read_entry_word(&mut self, addr: u64) -> Result<u32, ArmStatus> {
        match self.elf_memory.read_u32(addr) {
            Ok(word) => Ok(word),
            Err(_) => self.fail(ArmStatus::ReadFailed(addr)),
        }
    }

    fn push_word_bytes(&mut self, word: u32, count: usize) {
        let bytes = word.to_be_bytes();
        self.data.extend(&bytes[4 - count..]);
    }

    /// Loads the opcodes of the table entry at `entry_offset` (an offset into
    /// the ELF memory), appending FINISH if they do not end with it.
    #[instrument(level = "trace", skip(self))]
    pub fn extract_entry(&mut self, entry_offset: u64) -> Result<(), ArmStatus> {
        self.data.clear();
        self.status = ArmStatus::None;

        let Some(data_offset) = entry_offset.checked_add(4) else {
            return self.fail(ArmStatus::ReadFailed(entry_offset));
        };
        let data = self.read_entry_word(data_offset)?;
        if data == 1 {
            self.log_op(format_args!("[cantunwind]"));
            return self.fail(ArmStatus::NoUnwind);
        }

        if data & (1 << 31) != 0 {
            // Compact entry: the opcodes are the low three bytes.
            self.push_word_bytes(data, 3);
            self.terminate();
            return Ok(());
        }

        let mut addr = data_offset.wrapping_add(prel31(data) as i64 as u64);
        let data = self.read_entry_word(addr)?;

        let table_words = if data & (1 << 31) != 0 {
            match (data >> 24) & 0xf {
                0 => {
                    self.push_word_bytes(data, 3);
                    0
                }
                1 | 2 => {
                    self.push_word_bytes(data, 2);
                    addr = addr.wrapping_add(4);
                    (data >> 16) & 0xff
                }
                personality => {
                    debug!("personality routine {personality} is not supported");
                    return self.fail(ArmStatus::InvalidPersonality);
                }
            }
        } else {
            // Generic model, the first word is the personality routine which
            // plays no role in unwinding.
            addr = addr.wrapping_add(4);
            let data = self.read_entry_word(addr)?;
            self.push_word_bytes(data, 3);
            addr = addr.wrapping_add(4);
            data >> 24
        };

        if table_words > 5 {
            debug!("{table_words} additional table words");
            return self.fail(ArmStatus::Malformed);
        }

        for _ in 0..table_words {
            let word = self.read_entry_word(addr)?;
            self.push_word_bytes(word, 4);
            addr = addr.wrapping_add(4);
        }

        self.terminate();
        Ok(())
    }

    fn terminate(&mut self) {
        if self.data.back() != Some(&ARM_OP_FINISH) {
            self.data.push_back(ARM_OP_FINISH);
        }
        trace!("opcodes: {:02x?}", self.data);
    }

    fn next_byte(&mut self) -> ControlFlow<ArmStatus, u8> {
        match self.data.pop_front() {
            Some(byte) => ControlFlow::Continue(byte),
            None => self.stop(ArmStatus::Truncated),
        }
    }

    fn pop(&mut self, reg: usize) -> ControlFlow<ArmStatus> {
        let addr = u64::from(self.cfa);
        match self.process_memory.read_u32(addr) {
            Ok(value) => {
                self.regs[reg] = value;
                self.cfa = self.cfa.wrapping_add(4);
                ControlFlow::Continue(())
            }
            Err(_) => self.stop(ArmStatus::ReadFailed(addr)),
        }
    }

    fn add_cfa(&mut self, amount: u32) {
        self.cfa = self.cfa.wrapping_add(amount);
    }

    /// Runs every opcode. Succeeds iff decoding stopped at FINISH.
    #[instrument(level = "trace", skip(self), fields(cfa = self.cfa))]
    pub fn eval(&mut self) -> Result<(), ArmStatus> {
        loop {
            if let ControlFlow::Break(status) = self.decode() {
                return match status {
                    ArmStatus::Finish => Ok(()),
                    status => Err(status),
                };
            }
        }
    }

    /// Decodes and executes the next opcode. Breaks with the terminal
    /// status once interpretation has to stop.
    pub fn decode(&mut self) -> ControlFlow<ArmStatus> {
        self.status = ArmStatus::None;
        let byte = self.next_byte()?;

        match byte >> 6 {
            0 => {
                // 00xxxxxx: vsp = vsp + (xxxxxx << 2) + 4
                let amount = (u32::from(byte & 0x3f) << 2) + 4;
                self.log_op(format_args!("vsp = vsp + {amount}"));
                if !self.log_only {
                    self.add_cfa(amount);
                }
                ControlFlow::Continue(())
            }
            1 => {
                // 01xxxxxx: vsp = vsp - (xxxxxx << 2) - 4
                let amount = (u32::from(byte & 0x3f) << 2) + 4;
                self.log_op(format_args!("vsp = vsp - {amount}"));
                if !self.log_only {
                    self.cfa = self.cfa.wrapping_sub(amount);
                }
                ControlFlow::Continue(())
            }
            2 => self.decode_prefix_2(byte),
            _ => self.decode_prefix_3(byte),
        }
    }

    fn decode_prefix_2(&mut self, byte: u8) -> ControlFlow<ArmStatus> {
        match (byte >> 4) & 0x3 {
            0 => self.decode_pop_mask(byte),
            1 => {
                let reg = usize::from(byte & 0xf);
                if reg == 13 || reg == 15 {
                    // 10011101 and 10011111: reserved register to register moves
                    self.log_op(format_args!("[Reserved]"));
                    return self.stop(ArmStatus::Reserved);
                }
                // 1001nnnn: vsp = r[nnnn]
                self.log_op(format_args!("vsp = r{reg}"));
                if !self.log_only {
                    self.cfa = self.regs[reg];
                }
                ControlFlow::Continue(())
            }
            2 => {
                // 10100nnn: pop r4-r[4+nnn]
                // 10101nnn: pop r4-r[4+nnn], r14
                let end = 4 + usize::from(byte & 0x7);
                let with_lr = byte & 0x8 != 0;
                let range = RegRange {
                    prefix: "r",
                    start: 4,
                    end,
                    extra: if with_lr { ", r14" } else { "" },
                };
                self.log_op(format_args!("pop {range}"));
                if self.log_only {
                    return ControlFlow::Continue(());
                }
                for reg in 4..=end {
                    self.pop(reg)?;
                }
                if with_lr {
                    self.pop(ARM_REG_LR)?;
                }
                ControlFlow::Continue(())
            }
            _ => self.decode_prefix_2_3(byte),
        }
    }

    fn decode_pop_mask(&mut self, byte: u8) -> ControlFlow<ArmStatus> {
        let low = self.next_byte()?;
        let mask = (u16::from(byte & 0xf) << 8) | u16::from(low);
        if mask == 0 {
            // 10000000 00000000: refuse to unwind
            self.log_op(format_args!("Refuse to unwind"));
            return self.stop(ArmStatus::NoUnwind);
        }

        // 1000iiii iiiiiiii: pop up to 12 registers under mask {r15-r12}, {r11-r4}
        self.log_op(format_args!(
            "pop {}",
            RegMask {
                prefix: "r",
                first: 4,
                mask,
            }
        ));
        if self.log_only {
            return ControlFlow::Continue(());
        }
        for bit in 0..12 {
            if mask & (1 << bit) != 0 {
                self.pop(4 + bit)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn decode_prefix_2_3(&mut self, byte: u8) -> ControlFlow<ArmStatus> {
        match byte & 0xf {
            0 => {
                // 10110000: finish
                self.log_op(format_args!("finish"));
                if !self.log_only && self.regs[ARM_REG_PC] == 0 {
                    self.regs[ARM_REG_PC] = self.regs[ARM_REG_LR];
                }
                self.stop(ArmStatus::Finish)
            }
            1 => {
                let mask = self.next_byte()?;
                if mask == 0 || mask >> 4 != 0 {
                    // 10110001 00000000 and 10110001 xxxxyyyy (xxxx != 0): spare
                    self.log_op(format_args!("Spare"));
                    return self.stop(ArmStatus::Spare);
                }
                // 10110001 0000iiii: pop registers under mask {r3, r2, r1, r0}
                self.log_op(format_args!(
                    "pop {}",
                    RegMask {
                        prefix: "r",
                        first: 0,
                        mask: u16::from(mask),
                    }
                ));
                if self.log_only {
                    return ControlFlow::Continue(());
                }
                for reg in 0..4 {
                    if mask & (1 << reg) != 0 {
                        self.pop(reg)?;
                    }
                }
                ControlFlow::Continue(())
            }
            2 => {
                // 10110010 uleb128: vsp = vsp + 0x204 + (uleb128 << 2)
                let mut result: u32 = 0;
                let mut shift = 0u32;
                loop {
                    let byte = self.next_byte()?;
                    let bits = u32::from(byte & 0x7f).checked_shl(shift).unwrap_or(0);
                    result = result.wrapping_add(bits);
                    if byte & 0x80 == 0 {
                        break;
                    }
                    shift += 7;
                }
                let amount = 0x204u32.wrapping_add(result.wrapping_shl(2));
                self.log_op(format_args!("vsp = vsp + {amount}"));
                if !self.log_only {
                    self.add_cfa(amount);
                }
                ControlFlow::Continue(())
            }
            3 => {
                // 10110011 sssscccc: pop VFP D[ssss]-D[ssss+cccc] saved by FSTMFDX
                let byte = self.next_byte()?;
                let start = usize::from(byte >> 4);
                let count = byte & 0xf;
                self.log_op(format_args!(
                    "pop {}",
                    RegRange {
                        prefix: "d",
                        start,
                        end: start + usize::from(count),
                        extra: "",
                    }
                ));
                if !self.log_only {
                    self.add_cfa(u32::from(count) * 8 + 12);
                }
                ControlFlow::Continue(())
            }
            4..=7 => {
                // 101101nn: spare
                self.log_op(format_args!("Spare"));
                self.stop(ArmStatus::Spare)
            }
            _ => {
                // 10111nnn: pop VFP D[8]-D[8+nnn] saved by FSTMFDX
                let count = byte & 0x7;
                self.log_op(format_args!(
                    "pop {}",
                    RegRange {
                        prefix: "d",
                        start: 8,
                        end: 8 + usize::from(count),
                        extra: "",
                    }
                ));
                if !self.log_only {
                    self.add_cfa(u32::from(count) * 8 + 12);
                }
                ControlFlow::Continue(())
            }
        }
    }

    fn decode_prefix_3(&mut self, byte: u8) -> ControlFlow<ArmStatus> {
        match (byte >> 3) & 0x7 {
            0 => self.decode_prefix_3_0(byte),
            1 => match byte & 0x7 {
                0 | 1 => {
                    // 11001000 sssscccc: pop VFP D[16+ssss]-D[16+ssss+cccc] saved by VPUSH
                    // 11001001 sssscccc: pop VFP D[ssss]-D[ssss+cccc] saved by VPUSH
                    let base = if byte & 0x7 == 0 { 16 } else { 0 };
                    let operand = self.next_byte()?;
                    let start = base + usize::from(operand >> 4);
                    let count = operand & 0xf;
                    self.log_op(format_args!(
                        "pop {}",
                        RegRange {
                            prefix: "d",
                            start,
                            end: start + usize::from(count),
                            extra: "",
                        }
                    ));
                    if !self.log_only {
                        self.add_cfa(u32::from(count) * 8 + 8);
                    }
                    ControlFlow::Continue(())
                }
                _ => {
                    // 11001yyy (yyy != 000, 001): spare
                    self.log_op(format_args!("Spare"));
                    self.stop(ArmStatus::Spare)
                }
            },
            2 => {
                // 11010nnn: pop VFP D[8]-D[8+nnn] saved by VPUSH
                let count = byte & 0x7;
                self.log_op(format_args!(
                    "pop {}",
                    RegRange {
                        prefix: "d",
                        start: 8,
                        end: 8 + usize::from(count),
                        extra: "",
                    }
                ));
                if !self.log_only {
                    self.add_cfa(u32::from(count) * 8 + 8);
                }
                ControlFlow::Continue(())
            }
            _ => {
                // 11xxxyyy (xxx != 000, 001, 010): spare
                self.log_op(format_args!("Spare"));
                self.stop(ArmStatus::Spare)
            }
        }
    }

    /// The Intel Wireless MMX pops, `11000xxx`.
    fn decode_prefix_3_0(&mut self, byte: u8) -> ControlFlow<ArmStatus> {
        match byte & 0x7 {
            6 => {
                // 11000110 sssscccc: pop wR[ssss]-wR[ssss+cccc]
                let operand = self.next_byte()?;
                let start = usize::from(operand >> 4);
                let count = operand & 0xf;
                self.log_op(format_args!(
                    "pop {}",
                    RegRange {
                        prefix: "wR",
                        start,
                        end: start + usize::from(count),
                        extra: "",
                    }
                ));
                if !self.log_only {
                    self.add_cfa(u32::from(count) * 8 + 8);
                }
                ControlFlow::Continue(())
            }
            7 => {
                let mask = self.next_byte()?;
                if mask == 0 || mask >> 4 != 0 {
                    // 11000111 00000000 and 11000111 xxxxyyyy (xxxx != 0): spare
                    self.log_op(format_args!("Spare"));
                    return self.stop(ArmStatus::Spare);
                }
                // 11000111 0000iiii: pop wCGR registers under mask {wCGR3, 2, 1, 0}
                self.log_op(format_args!(
                    "pop {}",
                    RegMask {
                        prefix: "wCGR",
                        first: 0,
                        mask: u16::from(mask),
                    }
                ));
                if !self.log_only {
                    self.add_cfa(mask.count_ones() * 4);
                }
                ControlFlow::Continue(())
            }
            count => {
                // 11000nnn (nnn != 6, 7): pop wR[10]-wR[10+nnn]
                self.log_op(format_args!(
                    "pop {}",
                    RegRange {
                        prefix: "wR",
                        start: 10,
                        end: 10 + usize::from(count),
                        extra: "",
                    }
                ));
                if !self.log_only {
                    self.add_cfa(u32::from(count) * 8 + 8);
                }
                ControlFlow::Continue(())
            }
        }
    }
}
