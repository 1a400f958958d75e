//! Walks the stack of a process frame by frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::elf::Elf;
use crate::maps::{MapInfo, Maps};
use crate::memory::Memory;
use crate::regs::Regs;
use crate::{StepResult, UnwindError};

/// Parsed ELF files, shared between unwinds. Every file is parsed at most
/// once, files that failed to parse are remembered as such.
#[derive(Debug, Default)]
pub struct ElfCache {
    elfs: Mutex<HashMap<String, Option<Arc<Elf>>>>,
}

impl ElfCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<Arc<Elf>>>> {
        self.elfs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The ELF behind `map`. Files are keyed by path; maps that can only be
    /// read from the process are keyed by name and load address.
    pub fn get(&self, map: &MapInfo, process_memory: &Arc<dyn Memory>) -> Option<Arc<Elf>> {
        let key = if map.is_file() {
            map.name.clone()
        } else {
            format!("{}@{:#x}", map.name, map.file_base().unwrap_or(map.start))
        };

        self.lock()
            .entry(key)
            .or_insert_with(|| map.load_elf(process_memory).map(Arc::new))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwinderConfig {
    /// The walk stops after this many frames.
    pub max_frames: usize,
}

impl Default for UnwinderConfig {
    fn default() -> Self {
        Self { max_frames: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub num: usize,
    /// The pc of the frame, moved back onto the call instruction for every
    /// frame but the first.
    pub pc: u64,
    pub sp: u64,
    /// `pc` as an offset into the file.
    pub rel_pc: u64,
    pub map_name: String,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02} pc {:016x}", self.num, self.rel_pc)?;
        if !self.map_name.is_empty() {
            write!(f, "  {}", self.map_name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The return address was zero, the end of the stack.
    PcZero,
    /// The unwind information marked the outermost frame.
    Finished,
    MaxFrames,
    NoMap(u64),
    NoElf(String),
    /// The step left pc and sp as they were.
    Unchanged,
    Step(UnwindError),
}

impl StopReason {
    /// Whether the walk reached the end of the stack rather than giving up.
    pub fn is_complete(&self) -> bool {
        matches!(self, StopReason::PcZero | StopReason::Finished)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::PcZero => f.write_str("pc is zero"),
            StopReason::Finished => f.write_str("outermost frame"),
            StopReason::MaxFrames => f.write_str("frame limit reached"),
            StopReason::NoMap(pc) => write!(f, "no map contains {pc:#x}"),
            StopReason::NoElf(name) => write!(f, "cannot read the ELF of {name:?}"),
            StopReason::Unchanged => f.write_str("pc and sp did not change"),
            StopReason::Step(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backtrace {
    pub frames: Vec<Frame>,
    pub stop: StopReason,
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }
        if !self.stop.is_complete() {
            writeln!(f, "  !! unwind failed: {}", self.stop)?;
        }
        Ok(())
    }
}

pub struct Unwinder<'a> {
    maps: &'a Maps,
    process_memory: Arc<dyn Memory>,
    elfs: &'a ElfCache,
    config: UnwinderConfig,
}

impl<'a> Unwinder<'a> {
    pub fn new(maps: &'a Maps, process_memory: Arc<dyn Memory>, elfs: &'a ElfCache) -> Self {
        Self {
            maps,
            process_memory,
            elfs,
            config: UnwinderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: UnwinderConfig) -> Self {
        self.config = config;
        self
    }

    /// Walks the stack starting at `regs`, which are left describing the
    /// last frame that could be reached.
    #[instrument(level = "debug", skip_all, fields(pc = regs.pc(), sp = regs.sp()))]
    pub fn unwind(&self, regs: &mut dyn Regs) -> Backtrace {
        let mut frames = Vec::new();
        let stop = loop {
            if frames.len() >= self.config.max_frames {
                break StopReason::MaxFrames;
            }

            let pc = regs.pc();
            let sp = regs.sp();
            if pc == 0 {
                break StopReason::PcZero;
            }
            let Some(map) = self.maps.find(pc) else {
                break StopReason::NoMap(pc);
            };
            let Some(elf) = self.elfs.get(map, &self.process_memory) else {
                break StopReason::NoElf(map.name.clone());
            };

            let mut rel_pc = map.rel_pc(pc);
            let mut frame_pc = pc;
            if !frames.is_empty() {
                frame_pc = elf.adjust_pc(rel_pc, pc);
                rel_pc = rel_pc.wrapping_sub(pc.wrapping_sub(frame_pc));
            }

            let frame = Frame {
                num: frames.len(),
                pc: frame_pc,
                sp,
                rel_pc,
                map_name: map.name.clone(),
            };
            debug!("{frame}");
            frames.push(frame);

            let vaddr = elf.offset_to_vaddr(rel_pc);
            match elf.step(vaddr, regs, self.process_memory.as_ref()) {
                Ok(StepResult::Finished) => break StopReason::Finished,
                Ok(StepResult::Continue) => {
                    if regs.pc() == pc && regs.sp() == sp {
                        break StopReason::Unchanged;
                    }
                }
                Err(err) => break StopReason::Step(err),
            }
        };

        if !stop.is_complete() {
            debug!("unwind stopped after {} frames: {stop}", frames.len());
        }
        Backtrace { frames, stop }
    }
}
