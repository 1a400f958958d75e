//! Architecture register files.
//!
//! Registers are indexed by their DWARF register numbers so that CFI rules
//! can be applied without translation.

use core::fmt;
use core::marker::PhantomData;

use crate::address::AddressType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchType {
    Arm,
    Arm64,
    X86,
    X86_64,
}

impl ArchType {
    pub fn name(self) -> &'static str {
        match self {
            ArchType::Arm => "arm",
            ArchType::Arm64 => "arm64",
            ArchType::X86 => "x86",
            ArchType::X86_64 => "x86_64",
        }
    }
}

impl fmt::Display for ArchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("register {reg} does not exist on {arch} ({count} registers)")]
pub struct InvalidRegister {
    pub reg: usize,
    pub arch: ArchType,
    pub count: usize,
}

/// The register layout of one architecture.
pub trait Machine: Send + Sync + 'static {
    type Addr: AddressType;

    const ARCH: ArchType;
    const REG_COUNT: usize;
    const PC: usize;
    const SP: usize;
    /// The link register, on architectures that have one.
    const LR: Option<usize>;
    /// The DWARF column of the return address.
    const RA: usize;
}

pub struct Arm;
pub struct Arm64;
pub struct X86;
pub struct X86_64;

impl Machine for Arm {
    type Addr = u32;
    const ARCH: ArchType = ArchType::Arm;
    const REG_COUNT: usize = 16;
    const PC: usize = 15;
    const SP: usize = 13;
    const LR: Option<usize> = Some(14);
    const RA: usize = 14;
}

impl Machine for Arm64 {
    type Addr = u64;
    const ARCH: ArchType = ArchType::Arm64;
    const REG_COUNT: usize = 33;
    const PC: usize = 32;
    const SP: usize = 31;
    const LR: Option<usize> = Some(30);
    const RA: usize = 30;
}

impl Machine for X86 {
    type Addr = u32;
    const ARCH: ArchType = ArchType::X86;
    const REG_COUNT: usize = 9;
    const PC: usize = 8;
    const SP: usize = 4;
    const LR: Option<usize> = None;
    const RA: usize = 8;
}

impl Machine for X86_64 {
    type Addr = u64;
    const ARCH: ArchType = ArchType::X86_64;
    const REG_COUNT: usize = 17;
    const PC: usize = 16;
    const SP: usize = 7;
    const LR: Option<usize> = None;
    const RA: usize = 16;
}

pub trait Regs: fmt::Debug + Send {
    fn arch(&self) -> ArchType;
    fn total_regs(&self) -> usize;
    fn get(&self, reg: usize) -> Result<u64, InvalidRegister>;
    fn set(&mut self, reg: usize, value: u64) -> Result<(), InvalidRegister>;

    fn pc_reg(&self) -> usize;
    fn sp_reg(&self) -> usize;
    fn lr_reg(&self) -> Option<usize>;
    fn return_address_reg(&self) -> usize;

    fn pc(&self) -> u64;
    fn sp(&self) -> u64;
    fn set_pc(&mut self, value: u64);
    fn set_sp(&mut self, value: u64);

    fn lr(&self) -> Option<u64> {
        self.lr_reg().and_then(|reg| self.get(reg).ok())
    }

    fn clone_box(&self) -> Box<dyn Regs>;
}

pub struct RegsImpl<M: Machine> {
    regs: Box<[M::Addr]>,
    _machine: PhantomData<M>,
}

pub type RegsArm = RegsImpl<Arm>;
pub type RegsArm64 = RegsImpl<Arm64>;
pub type RegsX86 = RegsImpl<X86>;
pub type RegsX86_64 = RegsImpl<X86_64>;

impl<M: Machine> RegsImpl<M> {
    pub fn new() -> Self {
        Self {
            regs: vec![M::Addr::default(); M::REG_COUNT].into_boxed_slice(),
            _machine: PhantomData,
        }
    }

    /// Builds a register file from the first `REG_COUNT` values, missing
    /// values are zero.
    pub fn from_values(values: &[u64]) -> Self {
        let mut regs = Self::new();
        for (slot, value) in regs.regs.iter_mut().zip(values) {
            *slot = M::Addr::from_u64(*value);
        }
        regs
    }

    fn invalid(reg: usize) -> InvalidRegister {
        InvalidRegister {
            reg,
            arch: M::ARCH,
            count: M::REG_COUNT,
        }
    }
}

impl<M: Machine> Default for RegsImpl<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Machine> Clone for RegsImpl<M> {
    fn clone(&self) -> Self {
        Self {
            regs: self.regs.clone(),
            _machine: PhantomData,
        }
    }
}

impl<M: Machine> fmt::Debug for RegsImpl<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regs")
            .field("arch", &M::ARCH)
            .field("regs", &self.regs)
            .finish()
    }
}

impl<M: Machine> Regs for RegsImpl<M> {
    fn arch(&self) -> ArchType {
        M::ARCH
    }

    fn total_regs(&self) -> usize {
        M::REG_COUNT
    }

    fn get(&self, reg: usize) -> Result<u64, InvalidRegister> {
        self.regs
            .get(reg)
            .map(|value| value.to_u64())
            .ok_or_else(|| Self::invalid(reg))
    }

    fn set(&mut self, reg: usize, value: u64) -> Result<(), InvalidRegister> {
        let slot = self.regs.get_mut(reg).ok_or_else(|| Self::invalid(reg))?;
        *slot = M::Addr::from_u64(value);
        Ok(())
    }

    fn pc_reg(&self) -> usize {
        M::PC
    }

    fn sp_reg(&self) -> usize {
        M::SP
    }

    fn lr_reg(&self) -> Option<usize> {
        M::LR
    }

    fn return_address_reg(&self) -> usize {
        M::RA
    }

    fn pc(&self) -> u64 {
        self.regs[M::PC].to_u64()
    }

    fn sp(&self) -> u64 {
        self.regs[M::SP].to_u64()
    }

    fn set_pc(&mut self, value: u64) {
        self.regs[M::PC] = M::Addr::from_u64(value);
    }

    fn set_sp(&mut self, value: u64) {
        self.regs[M::SP] = M::Addr::from_u64(value);
    }

    fn clone_box(&self) -> Box<dyn Regs> {
        Box::new(self.clone())
    }
}

/// Creates an empty register file for `arch`.
pub fn new_regs(arch: ArchType) -> Box<dyn Regs> {
    match arch {
        ArchType::Arm => Box::new(RegsArm::new()),
        ArchType::Arm64 => Box::new(RegsArm64::new()),
        ArchType::X86 => Box::new(RegsX86::new()),
        ArchType::X86_64 => Box::new(RegsX86_64::new()),
    }
}
