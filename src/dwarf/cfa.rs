//! The CFA program interpreter.
//!
//! Instructions with one of the two high bits set carry their first operand
//! in the low six bits. Every other instruction is looked up by its low six
//! bits in [`CFA_TABLE`], which describes its operands; the operands are
//! decoded generically before the operation runs.


use super::location::{CfaRule, DwarfLocation, Row};
use super::memory::DwarfMemory;
use super::parse::Cie;
use super::{DwarfError, Result};
use crate::address::AddressType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Data1,
    Data2,
    Data4,
    /// A target address.
    Address,
    Uleb,
    Sleb,
    /// A ULEB128 length followed by that many bytes, decoded to two operands:
    /// the offset of the bytes and the length.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CfaOp {
    Nop,
    SetLoc,
    AdvanceLoc,
    OffsetExtended,
    RestoreExtended,
    Undefined,
    SameValue,
    Register,
    RememberState,
    RestoreState,
    DefCfa,
    DefCfaRegister,
    DefCfaOffset,
    DefCfaExpression,
    Expression,
    OffsetExtendedSf,
    DefCfaSf,
    DefCfaOffsetSf,
    ValOffset,
    ValOffsetSf,
    ValExpression,
    GnuArgsSize,
    GnuNegativeOffsetExtended,
}

#[derive(Debug, Clone, Copy)]
struct CfaInfo {
    name: &'static str,
    operands: &'static [Operand],
    op: CfaOp,
}

const fn info(name: &'static str, operands: &'static [Operand], op: CfaOp) -> Option<CfaInfo> {
    Some(CfaInfo { name, operands, op })
}

/// Opcodes without an entry are illegal. That includes `DW_CFA_lo_user`,
/// `DW_CFA_hi_user` and `DW_CFA_GNU_window_save`.
const CFA_TABLE: [Option<CfaInfo>; 64] = {
    use Operand::*;

    let mut table = [None; 64];
    table[0x00] = info("DW_CFA_nop", &[], CfaOp::Nop);
    table[0x01] = info("DW_CFA_set_loc", &[Address], CfaOp::SetLoc);
    table[0x02] = info("DW_CFA_advance_loc1", &[Data1], CfaOp::AdvanceLoc);
    table[0x03] = info("DW_CFA_advance_loc2", &[Data2], CfaOp::AdvanceLoc);
    table[0x04] = info("DW_CFA_advance_loc4", &[Data4], CfaOp::AdvanceLoc);
    table[0x05] = info("DW_CFA_offset_extended", &[Uleb, Uleb], CfaOp::OffsetExtended);
    table[0x06] = info("DW_CFA_restore_extended", &[Uleb], CfaOp::RestoreExtended);
    table[0x07] = info("DW_CFA_undefined", &[Uleb], CfaOp::Undefined);
    table[0x08] = info("DW_CFA_same_value", &[Uleb], CfaOp::SameValue);
    table[0x09] = info("DW_CFA_register", &[Uleb, Uleb], CfaOp::Register);
    table[0x0a] = info("DW_CFA_remember_state", &[], CfaOp::RememberState);
    table[0x0b] = info("DW_CFA_restore_state", &[], CfaOp::RestoreState);
    table[0x0c] = info("DW_CFA_def_cfa", &[Uleb, Uleb], CfaOp::DefCfa);
    table[0x0d] = info("DW_CFA_def_cfa_register", &[Uleb], CfaOp::DefCfaRegister);
    table[0x0e] = info("DW_CFA_def_cfa_offset", &[Uleb], CfaOp::DefCfaOffset);
    table[0x0f] = info("DW_CFA_def_cfa_expression", &[Block], CfaOp::DefCfaExpression);
    table[0x10] = info("DW_CFA_expression", &[Uleb, Block], CfaOp::Expression);
    table[0x11] = info("DW_CFA_offset_extended_sf", &[Uleb, Sleb], CfaOp::OffsetExtendedSf);
    table[0x12] = info("DW_CFA_def_cfa_sf", &[Uleb, Sleb], CfaOp::DefCfaSf);
    table[0x13] = info("DW_CFA_def_cfa_offset_sf", &[Sleb], CfaOp::DefCfaOffsetSf);
    table[0x14] = info("DW_CFA_val_offset", &[Uleb, Uleb], CfaOp::ValOffset);
    table[0x15] = info("DW_CFA_val_offset_sf", &[Uleb, Sleb], CfaOp::ValOffsetSf);
    table[0x16] = info("DW_CFA_val_expression", &[Uleb, Block], CfaOp::ValExpression);
    table[0x2e] = info("DW_CFA_GNU_args_size", &[Uleb], CfaOp::GnuArgsSize);
    table[0x2f] = info(
        "DW_CFA_GNU_negative_offset_extended",
        &[Uleb, Uleb],
        CfaOp::GnuNegativeOffsetExtended,
    );
    table
};

pub struct DwarfCfa<'a, A> {
    memory: DwarfMemory<'a, A>,
    cie: &'a Cie,
    /// The row set up by the CIE, `None` while the CIE itself is evaluated.
    cie_row: Option<&'a Row>,
    pc_start: u64,
    cur_pc: u64,
    row: Row,
    stack: Vec<Row>,
    last_error: Option<DwarfError>,
}

impl<'a, A: AddressType> DwarfCfa<'a, A> {
    /// `pc_start` is the first pc the program describes: the FDE start, or
    /// zero for a CIE.
    pub fn new(memory: DwarfMemory<'a, A>, cie: &'a Cie, pc_start: u64) -> Self {
        Self {
            memory,
            cie,
            cie_row: None,
            pc_start,
            cur_pc: pc_start,
            row: Row::default(),
            stack: Vec::new(),
            last_error: None,
        }
    }

    /// Evaluate an FDE program on top of the row its CIE set up.
    pub fn with_cie_row(mut self, row: &'a Row) -> Self {
        self.cie_row = Some(row);
        self
    }

    pub fn cur_pc(&self) -> u64 {
        self.cur_pc
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn cfa(&self) -> &CfaRule {
        &self.row.cfa
    }

    pub fn last_error(&self) -> Option<&DwarfError> {
        self.last_error.as_ref()
    }

    pub fn into_row(self) -> Row {
        self.row
    }

    /// Runs the instructions in `start..end` until the row for `pc` is
    /// complete.
    #[instrument(level = "trace", skip(self), err)]
    pub fn eval(&mut self, pc: u64, start: u64, end: u64) -> Result<()> {
        self.row = self.cie_row.cloned().unwrap_or_default();
        self.stack.clear();
        self.cur_pc = self.pc_start;
        self.memory.set_cur_offset(start);

        let result = self.run(pc, end);
        self.last_error = result.as_ref().err().cloned();
        result
    }

    fn run(&mut self, pc: u64, end: u64) -> Result<()> {
        while self.memory.cur_offset() < end && self.cur_pc <= pc {
            let op = self.memory.read_u8()?;
            let low = op & 0x3f;
            match op >> 6 {
                1 => {
                    trace!("DW_CFA_advance_loc {low}");
                    self.advance(low.into());
                }
                2 => {
                    let offset = self.memory.read_uleb128()?;
                    trace!("DW_CFA_offset r{low} {offset}");
                    let offset = self.factored(offset as i64);
                    self.set_rule(low.into(), DwarfLocation::Offset(offset));
                }
                3 => {
                    trace!("DW_CFA_restore r{low}");
                    self.restore(low.into())?;
                }
                _ => self.execute(low)?,
            }
        }
        Ok(())
    }

    fn execute(&mut self, opcode: u8) -> Result<()> {
        let Some(info) = CFA_TABLE[usize::from(opcode)] else {
            trace!("illegal CFA opcode {opcode:#04x}");
            return Err(DwarfError::IllegalValue(opcode));
        };

        let mut operands = [0u64; 3];
        let mut count = 0;
        for operand in info.operands {
            let value = match operand {
                Operand::Block => {
                    let len = self.memory.read_uleb128()?;
                    operands[count] = self.memory.cur_offset();
                    operands[count + 1] = len;
                    count += 2;
                    self.memory.skip(len);
                    continue;
                }
                Operand::Data1 => self.memory.read_u8()?.into(),
                Operand::Data2 => self.memory.read_u16()?.into(),
                Operand::Data4 => self.memory.read_u32()?.into(),
                Operand::Address => self.memory.read_address()?,
                Operand::Uleb => self.memory.read_uleb128()?,
                Operand::Sleb => self.memory.read_sleb128()? as u64,
            };
            operands[count] = value;
            count += 1;
        }
        trace!("{} {:?}", info.name, &operands[..count]);

        let [op0, op1, op2] = operands;
        match info.op {
            CfaOp::Nop | CfaOp::GnuArgsSize => {}
            CfaOp::SetLoc => {
                if op0 < self.cur_pc {
                    warn!("DW_CFA_set_loc moves backwards from {:#x} to {op0:#x}", self.cur_pc);
                }
                self.cur_pc = op0;
            }
            CfaOp::AdvanceLoc => self.advance(op0),
            CfaOp::OffsetExtended => {
                let offset = self.factored(op1 as i64);
                self.set_rule(op0, DwarfLocation::Offset(offset));
            }
            CfaOp::RestoreExtended => self.restore(op0)?,
            CfaOp::Undefined => self.set_rule(op0, DwarfLocation::Undefined),
            CfaOp::SameValue => self.set_rule(op0, DwarfLocation::Same),
            CfaOp::Register => self.set_rule(op0, DwarfLocation::Register(op1)),
            CfaOp::RememberState => self.stack.push(self.row.clone()),
            CfaOp::RestoreState => match self.stack.pop() {
                Some(row) => self.row = row,
                None => warn!("DW_CFA_restore_state with an empty stack"),
            },
            CfaOp::DefCfa => {
                self.row.cfa = CfaRule::RegOffset {
                    reg: op0,
                    offset: op1 as i64,
                };
            }
            CfaOp::DefCfaRegister => match &mut self.row.cfa {
                CfaRule::RegOffset { reg, .. } => *reg = op0,
                _ => {
                    return Err(DwarfError::IllegalState(
                        "CFA register set without a register CFA",
                    ))
                }
            },
            CfaOp::DefCfaOffset => self.set_cfa_offset(op0 as i64)?,
            CfaOp::DefCfaOffsetSf => {
                let offset = self.factored(op0 as i64);
                self.set_cfa_offset(offset)?;
            }
            CfaOp::DefCfaExpression => {
                self.row.cfa = CfaRule::Expression {
                    offset: op0,
                    len: op1,
                };
            }
            CfaOp::Expression => {
                self.set_rule(op0, DwarfLocation::Expression { offset: op1, len: op2 });
            }
            CfaOp::ValExpression => {
                self.set_rule(op0, DwarfLocation::ValExpression { offset: op1, len: op2 });
            }
            CfaOp::OffsetExtendedSf => {
                let offset = self.factored(op1 as i64);
                self.set_rule(op0, DwarfLocation::Offset(offset));
            }
            CfaOp::DefCfaSf => {
                self.row.cfa = CfaRule::RegOffset {
                    reg: op0,
                    offset: self.factored(op1 as i64),
                };
            }
            CfaOp::ValOffset | CfaOp::ValOffsetSf => {
                let offset = self.factored(op1 as i64);
                self.set_rule(op0, DwarfLocation::ValOffset(offset));
            }
            CfaOp::GnuNegativeOffsetExtended => {
                let offset = self.factored((op1 as i64).wrapping_neg());
                self.set_rule(op0, DwarfLocation::Offset(offset));
            }
        }
        Ok(())
    }

    fn advance(&mut self, delta: u64) {
        let pc = self
            .cur_pc
            .wrapping_add(delta.wrapping_mul(self.cie.code_alignment_factor));
        self.cur_pc = A::from_u64(pc).to_u64();
    }

    /// Multiplies by the data alignment factor, wrapping at the address
    /// width.
    fn factored(&self, value: i64) -> i64 {
        let value = value.wrapping_mul(self.cie.data_alignment_factor);
        A::sign_extend(A::from_u64(value as u64).to_u64()) as i64
    }

    fn set_rule(&mut self, reg: u64, location: DwarfLocation) {
        self.row.regs.insert(reg, location);
    }

    fn set_cfa_offset(&mut self, new_offset: i64) -> Result<()> {
        match &mut self.row.cfa {
            CfaRule::RegOffset { offset, .. } => {
                *offset = new_offset;
                Ok(())
            }
            _ => Err(DwarfError::IllegalState(
                "CFA offset set before a CFA register",
            )),
        }
    }

    fn restore(&mut self, reg: u64) -> Result<()> {
        let Some(cie_row) = self.cie_row else {
            return Err(DwarfError::IllegalState("restore inside a CIE program"));
        };
        match cie_row.regs.get(&reg) {
            Some(location) => self.set_rule(reg, *location),
            None => {
                self.row.regs.remove(&reg);
            }
        }
        Ok(())
    }
}
