use std::collections::BTreeMap;
use std::fmt;

/// How to recover the value a register had in the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfLocation {
    /// The register has no recoverable value in the previous frame.
    Undefined,
    /// The register has not been modified from the previous frame.
    Same,
    /// Saved at the address CFA+N.
    Offset(i64),
    /// The previous value is CFA+N itself.
    ValOffset(i64),
    /// Held in another register.
    Register(u64),
    /// Saved at the address produced by a DWARF expression. The expression
    /// bytes are at `offset..offset + len` in the section.
    Expression { offset: u64, len: u64 },
    /// The previous value is produced by a DWARF expression.
    ValExpression { offset: u64, len: u64 },
}

/// The notation of `readelf --debug-dump=frames-interp`.
impl fmt::Display for DwarfLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DwarfLocation::Undefined => f.write_str("u"),
            DwarfLocation::Same => f.write_str("s"),
            DwarfLocation::Offset(offset) => write!(f, "c{offset:+}"),
            DwarfLocation::ValOffset(offset) => write!(f, "v(c{offset:+})"),
            DwarfLocation::Register(reg) => write!(f, "r{reg}"),
            DwarfLocation::Expression { len, .. } => write!(f, "exp({len} bytes)"),
            DwarfLocation::ValExpression { len, .. } => write!(f, "vexp({len} bytes)"),
        }
    }
}

/// Rules keyed by DWARF register number. Registers without an entry keep
/// their value.
pub type RegRules = BTreeMap<u64, DwarfLocation>;

/// How to compute the canonical frame address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CfaRule {
    /// No `DW_CFA_def_cfa*` has been executed yet.
    #[default]
    Undefined,
    RegOffset {
        reg: u64,
        offset: i64,
    },
    Expression {
        offset: u64,
        len: u64,
    },
}

impl fmt::Display for CfaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfaRule::Undefined => f.write_str("u"),
            CfaRule::RegOffset { reg, offset } => write!(f, "r{reg}{offset:+}"),
            CfaRule::Expression { len, .. } => write!(f, "exp({len} bytes)"),
        }
    }
}

/// One row of the CFI table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    pub cfa: CfaRule,
    pub regs: RegRules,
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfa={}", self.cfa)?;
        for (reg, location) in &self.regs {
            write!(f, " r{reg}={location}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readelf_notation() {
        let mut row = Row {
            cfa: CfaRule::RegOffset { reg: 7, offset: 16 },
            ..Row::default()
        };
        row.regs.insert(16, DwarfLocation::Offset(-8));
        row.regs.insert(6, DwarfLocation::Register(3));
        row.regs.insert(3, DwarfLocation::ValOffset(0));
        row.regs.insert(1, DwarfLocation::Expression { offset: 9, len: 2 });
        assert_eq!(
            row.to_string(),
            "cfa=r7+16 r1=exp(2 bytes) r3=v(c+0) r6=r3 r16=c-8"
        );
        assert_eq!(Row::default().to_string(), "cfa=u");
    }
}
