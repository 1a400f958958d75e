//! Target address widths.
//!
//! The ELF reader, the DWARF interpreter and the register sets are generic
//! over the width of a target address so one implementation serves both
//! 32-bit and 64-bit images.

use core::fmt;

use crate::memory::{self, Memory};

pub trait AddressType:
    Copy + Default + Eq + Ord + fmt::Debug + fmt::LowerHex + Into<u64> + Send + Sync + 'static
{
    /// Size of an address in bytes.
    const SIZE: usize;

    /// Truncates `value` to this width.
    fn from_u64(value: u64) -> Self;

    fn to_u64(self) -> u64 {
        self.into()
    }

    /// Treats the low `SIZE` bytes of `value` as a signed number and sign
    /// extends it to 64 bits.
    fn sign_extend(value: u64) -> u64;

    /// Reads one little-endian address.
    fn read(memory: &dyn Memory, addr: u64) -> memory::Result<Self>;
}

impl AddressType for u32 {
    const SIZE: usize = 4;

    fn from_u64(value: u64) -> Self {
        value as u32
    }

    fn sign_extend(value: u64) -> u64 {
        value as u32 as i32 as i64 as u64
    }

    fn read(memory: &dyn Memory, addr: u64) -> memory::Result<Self> {
        memory.read_u32(addr)
    }
}

impl AddressType for u64 {
    const SIZE: usize = 8;

    fn from_u64(value: u64) -> Self {
        value
    }

    fn sign_extend(value: u64) -> u64 {
        value
    }

    fn read(memory: &dyn Memory, addr: u64) -> memory::Result<Self> {
        memory.read_u64(addr)
    }
}
