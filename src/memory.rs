//! Byte-level access to an address space.
//!
//! Every read is all-or-nothing: an implementation either fills the whole
//! destination buffer and returns `Ok`, or returns a [`ReadError`] and the
//! buffer contents are unspecified.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to read {len} bytes at {addr:#x}")]
pub struct ReadError {
    pub addr: u64,
    pub len: usize,
}

pub type Result<T, E = ReadError> = core::result::Result<T, E>;

pub trait Memory: Send + Sync {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()>;

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (excluding
    /// the terminator). A missing terminator is reported as a failed read of
    /// the whole window.
    fn read_cstring(&self, addr: u64, max_len: usize) -> Result<String> {
        let mut bytes = Vec::new();
        for i in 0..=max_len as u64 {
            let byte = self.read_u8(addr.wrapping_add(i))?;
            if byte == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(byte);
        }
        Err(ReadError { addr, len: max_len })
    }
}

fn read_slice(data: &[u8], addr: u64, dst: &mut [u8]) -> Result<()> {
    let err = ReadError {
        addr,
        len: dst.len(),
    };
    let start = usize::try_from(addr).map_err(|_| err)?;
    let end = start.checked_add(dst.len()).ok_or(err)?;
    let src = data.get(start..end).ok_or(err)?;
    dst.copy_from_slice(src);
    Ok(())
}

/// A byte vector placed at `base`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    base: u64,
    data: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_base(0, data)
    }

    pub fn with_base(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Memory for MemoryBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let offset = addr.checked_sub(self.base).ok_or(ReadError {
            addr,
            len: dst.len(),
        })?;
        read_slice(&self.data, offset, dst).map_err(|_| ReadError {
            addr,
            len: dst.len(),
        })
    }
}

fn process_vm_read(pid: libc::pid_t, addr: u64, dst: &mut [u8]) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    let err = ReadError {
        addr,
        len: dst.len(),
    };
    let remote_base = usize::try_from(addr).map_err(|_| err)?;

    let local = libc::iovec {
        iov_base: dst.as_mut_ptr().cast(),
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: remote_base as *mut libc::c_void,
        iov_len: dst.len(),
    };

    // SAFETY: `local` describes exactly the writable buffer `dst`. The remote
    // range is validated by the kernel, which fails with EFAULT instead of
    // faulting us.
    let read = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if read < 0 || read as usize != dst.len() {
        trace!(
            pid,
            "process_vm_readv at {addr:#x} returned {read}: {}",
            io::Error::last_os_error()
        );
        return Err(err);
    }
    Ok(())
}

/// The address space of the calling process.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryLocal;

impl Memory for MemoryLocal {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        process_vm_read(pid, addr, dst)
    }
}

/// The address space of another process. The caller is responsible for
/// having the permissions to read it (usually by being its tracer).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRemote {
    pid: libc::pid_t,
}

impl MemoryRemote {
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
}

impl Memory for MemoryRemote {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        process_vm_read(self.pid, addr, dst)
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

/// A file mapped read-only from `offset` to its end. Address 0 is the byte
/// at `offset`.
#[derive(Debug)]
pub struct MemoryFileAtOffset {
    mmap: Mmap,
    /// Distance between the page aligned start of the mapping and `offset`.
    skew: usize,
}

impl MemoryFileAtOffset {
    pub fn new(path: impl AsRef<Path>, offset: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "offset {offset:#x} is past the end of {} ({file_len:#x} bytes)",
                    path.display()
                ),
            ));
        }

        let aligned = offset & !(page_size() - 1);
        // SAFETY: the mapping is private and read only. Like every file
        // mapping it can observe concurrent modification of the file, which
        // only ever turns into wrong unwind data, never into a bad access.
        let mmap = unsafe { MmapOptions::new().offset(aligned).map(&file)? };
        debug!(
            path = %path.display(),
            "mapped {:#x} bytes at file offset {aligned:#x}",
            mmap.len()
        );

        Ok(Self {
            mmap,
            skew: (offset - aligned) as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.mmap.len() - self.skew
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Memory for MemoryFileAtOffset {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        read_slice(&self.mmap[self.skew..], addr, dst)
    }
}

/// `[begin, begin + length)` of another memory, rebased to start at 0.
#[derive(Clone)]
pub struct MemoryRange {
    memory: Arc<dyn Memory>,
    begin: u64,
    length: u64,
}

impl MemoryRange {
    pub fn new(memory: Arc<dyn Memory>, begin: u64, length: u64) -> Self {
        Self {
            memory,
            begin,
            length,
        }
    }
}

impl Memory for MemoryRange {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let err = ReadError {
            addr,
            len: dst.len(),
        };
        let end = addr.checked_add(dst.len() as u64).ok_or(err)?;
        if end > self.length {
            return Err(err);
        }
        let addr = self.begin.checked_add(addr).ok_or(err)?;
        self.memory.read(addr, dst).map_err(|_| err)
    }
}

/// Sparse memory for tests: only bytes that were explicitly set can be read.
#[derive(Debug, Clone, Default)]
pub struct MemoryFake {
    data: BTreeMap<u64, u8>,
}

impl MemoryFake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_memory(&mut self, addr: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.data.insert(addr + i as u64, *byte);
        }
    }

    pub fn set_data8(&mut self, addr: u64, value: u8) {
        self.set_memory(addr, &[value]);
    }

    pub fn set_data16(&mut self, addr: u64, value: u16) {
        self.set_memory(addr, &value.to_le_bytes());
    }

    pub fn set_data32(&mut self, addr: u64, value: u32) {
        self.set_memory(addr, &value.to_le_bytes());
    }

    pub fn set_data64(&mut self, addr: u64, value: u64) {
        self.set_memory(addr, &value.to_le_bytes());
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Memory for MemoryFake {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let err = ReadError {
            addr,
            len: dst.len(),
        };
        for (i, out) in dst.iter_mut().enumerate() {
            let byte = addr
                .checked_add(i as u64)
                .and_then(|a| self.data.get(&a))
                .ok_or(err)?;
            *out = *byte;
        }
        Ok(())
    }
}

/// Reads always succeed and produce zeroes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryZero;

impl Memory for MemoryZero {
    fn read(&self, _addr: u64, dst: &mut [u8]) -> Result<()> {
        dst.fill(0);
        Ok(())
    }
}
