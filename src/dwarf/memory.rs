//! A cursor over section memory that knows how to read the DWARF primitive
//! types: LEB128 numbers, initial lengths and `DW_EH_PE_*` encoded pointers.
#![allow(non_camel_case_types)]

use core::fmt;
use core::marker::PhantomData;

use super::{DwarfError, Result};
use crate::address::AddressType;
use crate::memory::Memory;

pub struct DwarfMemory<'a, A> {
    memory: &'a dyn Memory,
    cur_offset: u64,
    /// Added to an offset to get its virtual address, for `DW_EH_PE_pcrel`.
    pc_bias: Option<u64>,
    data_base: Option<u64>,
    func_base: Option<u64>,
    text_base: Option<u64>,
    _addr: PhantomData<fn() -> A>,
}

impl<'a, A: AddressType> DwarfMemory<'a, A> {
    pub fn new(memory: &'a dyn Memory) -> Self {
        Self {
            memory,
            cur_offset: 0,
            pc_bias: None,
            data_base: None,
            func_base: None,
            text_base: None,
            _addr: PhantomData,
        }
    }

    pub fn memory(&self) -> &'a dyn Memory {
        self.memory
    }

    pub fn cur_offset(&self) -> u64 {
        self.cur_offset
    }

    pub fn set_cur_offset(&mut self, offset: u64) {
        self.cur_offset = offset;
    }

    pub fn skip(&mut self, len: u64) {
        self.cur_offset = self.cur_offset.wrapping_add(len);
    }

    pub fn set_pc_bias(&mut self, bias: u64) {
        self.pc_bias = Some(bias);
    }

    pub fn set_data_base(&mut self, base: u64) {
        self.data_base = Some(base);
    }

    pub fn set_func_base(&mut self, base: u64) {
        self.func_base = Some(base);
    }

    pub fn clear_func_base(&mut self) {
        self.func_base = None;
    }

    pub fn set_text_base(&mut self, base: u64) {
        self.text_base = Some(base);
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.memory.read(self.cur_offset, dst)?;
        self.skip(dst.len() as u64);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.memory.read_u8(self.cur_offset)?;
        self.skip(1);
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let value = self.memory.read_u16(self.cur_offset)?;
        self.skip(2);
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.memory.read_u32(self.cur_offset)?;
        self.skip(4);
        Ok(value)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.memory.read_u64(self.cur_offset)?;
        self.skip(8);
        Ok(value)
    }

    /// Reads one target address.
    pub fn read_address(&mut self) -> Result<u64> {
        let value = A::read(self.memory, self.cur_offset)?;
        self.skip(A::SIZE as u64);
        Ok(value.to_u64())
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    pub fn read_cstr(&mut self, max_len: usize) -> Result<String> {
        let string = self.memory.read_cstring(self.cur_offset, max_len)?;
        self.skip(string.len() as u64 + 1);
        Ok(string)
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads the initial length of a CIE or FDE. Returns the length of the
    /// rest of the entry and whether it uses the 64-bit DWARF format.
    pub fn read_entry_length(&mut self) -> Result<(u64, bool)> {
        match self.read_u32()? {
            0xffff_ffff => Ok((self.read_u64()?, true)),
            length => Ok((u64::from(length), false)),
        }
    }

    /// Reads a pointer with the given encoding. The result is truncated to
    /// the target address width. [`Encoding::OMIT`] reads nothing and yields
    /// zero. An indirect pointer yields the address of the slot holding the
    /// pointer; the slot itself is never read.
    pub fn read_encoded(&mut self, encoding: Encoding) -> Result<u64> {
        if encoding.is_omit() {
            return Ok(0);
        }
        if encoding.is_indirect() {
            trace!("not following indirect pointer {encoding:?}");
        }

        let application = encoding.application()?;
        if let ValueApplication::DW_EH_PE_aligned = application {
            let align = A::SIZE as u64;
            self.cur_offset = self.cur_offset.wrapping_add(align - 1) & !(align - 1);
        }

        let start = self.cur_offset;
        let value = match encoding.format()? {
            ValueFormat::DW_EH_PE_absptr => self.read_address()?,
            ValueFormat::DW_EH_PE_uleb128 => self.read_uleb128()?,
            ValueFormat::DW_EH_PE_udata2 => self.read_u16()?.into(),
            ValueFormat::DW_EH_PE_udata4 => self.read_u32()?.into(),
            ValueFormat::DW_EH_PE_udata8 => self.read_u64()?,
            ValueFormat::DW_EH_PE_sleb128 => self.read_sleb128()? as u64,
            ValueFormat::DW_EH_PE_sdata2 => self.read_u16()? as i16 as i64 as u64,
            ValueFormat::DW_EH_PE_sdata4 => self.read_u32()? as i32 as i64 as u64,
            ValueFormat::DW_EH_PE_sdata8 => self.read_u64()?,
        };

        let base = match application {
            ValueApplication::DW_EH_PE_absptr | ValueApplication::DW_EH_PE_aligned => Some(0),
            ValueApplication::DW_EH_PE_pcrel => self.pc_bias.map(|bias| start.wrapping_add(bias)),
            ValueApplication::DW_EH_PE_textrel => self.text_base,
            ValueApplication::DW_EH_PE_datarel => self.data_base,
            ValueApplication::DW_EH_PE_funcrel => self.func_base,
        };
        let base = base.ok_or(DwarfError::UnsupportedEncoding(encoding.0))?;
        Ok(A::from_u64(value.wrapping_add(base)).to_u64())
    }
}

/// A `DW_EH_PE_*` pointer encoding: the low nibble is the value format, the
/// high nibble how the value is applied.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Encoding = Encoding(0x00);
    pub const OMIT: Encoding = Encoding(0xff);
    const INDIRECT: u8 = 0x80;

    pub fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    fn is_indirect(self) -> bool {
        self.0 & Self::INDIRECT != 0
    }

    /// The same value format without an application, as used for FDE ranges.
    pub fn format_only(self) -> Encoding {
        Encoding(self.0 & 0x0f)
    }

    fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0x0f {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(DwarfError::UnsupportedEncoding(self.0)),
        })
    }

    fn application(self) -> Result<ValueApplication> {
        Ok(match (self.0 & 0x70) >> 4 {
            0x0 => ValueApplication::DW_EH_PE_absptr,
            0x1 => ValueApplication::DW_EH_PE_pcrel,
            0x2 => ValueApplication::DW_EH_PE_textrel,
            0x3 => ValueApplication::DW_EH_PE_datarel,
            0x4 => ValueApplication::DW_EH_PE_funcrel,
            0x5 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(DwarfError::UnsupportedEncoding(self.0)),
        })
    }

    /// Size of a value in this encoding, `None` for the LEB128 formats.
    pub fn size(self, address_size: usize) -> Option<usize> {
        match self.format().ok()? {
            ValueFormat::DW_EH_PE_absptr => Some(address_size),
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => None,
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => Some(2),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => Some(4),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => Some(8),
        }
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        let indirect = if self.is_indirect() { "DW_EH_PE_indirect | " } else { "" };
        match (self.application(), self.format()) {
            (Ok(application), Ok(format)) => write!(f, "{indirect}{application:?} | {format:?}"),
            _ => write!(f, "Encoding({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ValueFormat {
    /// A value of the target address size.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug, Clone, Copy)]
enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the current program counter.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}
