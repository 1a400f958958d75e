//! The memory maps of a process, in `/proc/<pid>/maps` format.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::elf::Elf;
use crate::memory::{Memory, MemoryFileAtOffset, MemoryRange};

#[derive(Debug, thiserror::Error)]
pub enum MapsError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed maps line {line}: {content:?}")]
    Malformed { line: usize, content: String },
}

/// One mapping, `start-end perms offset dev inode name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    /// `PROT_*` bits.
    pub flags: i32,
    pub name: String,
}

impl MapInfo {
    /// Parses one line, without its trailing newline.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\n');
        let mut fields = line.splitn(6, ' ');

        let (start, end) = fields.next()?.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if end < start {
            return None;
        }

        let perms = fields.next()?.as_bytes();
        if perms.len() < 3 {
            return None;
        }
        let mut flags = libc::PROT_NONE;
        if perms[0] == b'r' {
            flags |= libc::PROT_READ;
        }
        if perms[1] == b'w' {
            flags |= libc::PROT_WRITE;
        }
        if perms[2] == b'x' {
            flags |= libc::PROT_EXEC;
        }

        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        let (major, minor) = fields.next()?.split_once(':')?;
        u32::from_str_radix(major, 16).ok()?;
        u32::from_str_radix(minor, 16).ok()?;
        fields.next()?.parse::<u64>().ok()?;
        let name = fields.next().unwrap_or_default().trim_start().to_owned();

        Some(Self {
            start,
            end,
            offset,
            flags,
            name,
        })
    }

    pub fn contains(&self, pc: u64) -> bool {
        (self.start..self.end).contains(&pc)
    }

    pub fn is_executable(&self) -> bool {
        self.flags & libc::PROT_EXEC != 0
    }

    /// A file path rather than `[stack]`, `[vdso]` or an anonymous mapping.
    pub fn is_file(&self) -> bool {
        self.name.starts_with('/')
    }

    /// Where the start of the mapped file would be in the process, assuming
    /// the file is mapped contiguously. `None` if that would be below 0.
    pub fn file_base(&self) -> Option<u64> {
        self.start.checked_sub(self.offset)
    }

    /// The file offset of `pc`.
    pub fn rel_pc(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.start).wrapping_add(self.offset)
    }

    /// Reads the ELF image backing this map: the file itself if it can be
    /// opened, otherwise the process memory it is mapped at. Either way
    /// addresses of the returned memory are file offsets, so a map whose
    /// file would start below address 0 has no memory.
    pub fn create_memory(&self, process_memory: &Arc<dyn Memory>) -> Option<Box<dyn Memory>> {
        if self.is_file() {
            match MemoryFileAtOffset::new(&self.name, 0) {
                Ok(memory) => return Some(Box::new(memory)),
                Err(err) => debug!("cannot map {}: {err}", self.name),
            }
        }
        let Some(file_base) = self.file_base() else {
            debug!("{self}: offset is past the start of the map");
            return None;
        };
        Some(Box::new(MemoryRange::new(
            Arc::clone(process_memory),
            file_base,
            self.end - file_base,
        )))
    }

    pub fn load_elf(&self, process_memory: &Arc<dyn Memory>) -> Option<Elf> {
        match Elf::new(self.create_memory(process_memory)?) {
            Ok(elf) => Some(elf),
            Err(err) => {
                debug!("{self}: {err}");
                None
            }
        }
    }
}

impl fmt::Display for MapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit, c| if self.flags & bit != 0 { c } else { '-' };
        write!(
            f,
            "{:x}-{:x} {}{}{} {:08x}",
            self.start,
            self.end,
            flag(libc::PROT_READ, 'r'),
            flag(libc::PROT_WRITE, 'w'),
            flag(libc::PROT_EXEC, 'x'),
            self.offset,
        )?;
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        Ok(())
    }
}

/// All maps of a process, sorted by start address.
#[derive(Debug, Clone, Default)]
pub struct Maps {
    maps: Vec<MapInfo>,
}

impl Maps {
    pub fn parse(buffer: &str) -> Result<Self, MapsError> {
        let mut maps = buffer
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                MapInfo::parse_line(line).ok_or_else(|| MapsError::Malformed {
                    line: idx + 1,
                    content: line.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        maps.sort_by_key(|map| map.start);
        Ok(Self { maps })
    }

    #[instrument(level = "debug")]
    pub fn from_pid(pid: libc::pid_t) -> Result<Self, MapsError> {
        let path = format!("/proc/{pid}/maps");
        let buffer = std::fs::read_to_string(&path).map_err(|source| MapsError::Io {
            path: path.clone(),
            source,
        })?;
        let maps = Self::parse(&buffer)?;
        debug!("{} maps", maps.len());
        Ok(maps)
    }

    /// The maps of the calling process.
    pub fn local() -> Result<Self, MapsError> {
        // SAFETY: getpid has no preconditions.
        Self::from_pid(unsafe { libc::getpid() })
    }

    /// The map containing `pc`.
    pub fn find(&self, pc: u64) -> Option<&MapInfo> {
        let idx = self.maps.partition_point(|map| map.end <= pc);
        self.maps.get(idx).filter(|map| map.contains(pc))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MapInfo> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl FromIterator<MapInfo> for Maps {
    fn from_iter<I: IntoIterator<Item = MapInfo>>(iter: I) -> Self {
        let mut maps: Vec<_> = iter.into_iter().collect();
        maps.sort_by_key(|map| map.start);
        Self { maps }
    }
}

impl<'a> IntoIterator for &'a Maps {
    type Item = &'a MapInfo;
    type IntoIter = std::slice::Iter<'a, MapInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.maps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
6f000000-6f01e000 rwxp 00000000 00:0c 16389419   /system/lib/libcomposer.so
70000000-70001000 r--p 00001000 fd:01 12 /system/lib/libc.so
7fff0000-7fff2000 rw-p 00000000 00:00 0                                  [stack]
60000000-60001000 ---p 00000000 00:00 0
";

    #[test]
    fn parse_lines() {
        let map = MapInfo::parse_line(
            "6f000000-6f01e000 rwxp 00000000 00:0c 16389419   /system/lib/libcomposer.so\n",
        )
        .unwrap();
        assert_eq!(
            map,
            MapInfo {
                start: 0x6f00_0000,
                end: 0x6f01_e000,
                offset: 0,
                flags: libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                name: "/system/lib/libcomposer.so".into(),
            }
        );
        assert!(map.is_executable());
        assert!(map.is_file());

        let map = MapInfo::parse_line("60000000-60001000 ---p 00001000 00:00 0").unwrap();
        assert_eq!(map.flags, libc::PROT_NONE);
        assert_eq!(map.offset, 0x1000);
        assert_eq!(map.name, "");
        assert_eq!(map.to_string(), "60000000-60001000 --- 00001000");

        // Names keep inner spaces.
        let map = MapInfo::parse_line("1000-2000 r-xp 0 00:00 0 /data/my app/lib.so").unwrap();
        assert_eq!(map.name, "/data/my app/lib.so");
    }

    #[test]
    fn malformed_lines() {
        for line in [
            "",
            "6f000000 rwxp 00000000 00:0c 1 /a",
            "6f000000-6f01e000 rw 00000000 00:0c 1 /a",
            "6f000000-zz rwxp 00000000 00:0c 1 /a",
            "6f000000-6f01e000 rwxp 00000000 000c 1 /a",
            "6f000000-6f01e000 rwxp 00000000 00:0c inode /a",
            "6f01e000-6f000000 rwxp 00000000 00:0c 1 /a",
        ] {
            assert_eq!(MapInfo::parse_line(line), None, "{line:?}");
        }

        let err = Maps::parse("1000-2000 r-xp 0 00:00 0\nnonsense\n").unwrap_err();
        assert!(matches!(err, MapsError::Malformed { line: 2, .. }), "{err}");
    }

    #[test]
    fn find_by_pc() {
        let maps = Maps::parse(MAPS).unwrap();
        assert_eq!(maps.len(), 4);
        assert_eq!(maps.iter().next().unwrap().start, 0x6000_0000);

        assert_eq!(maps.find(0x5fff_ffff), None);
        assert_eq!(maps.find(0x6000_0000).unwrap().start, 0x6000_0000);
        assert_eq!(maps.find(0x6f01_dfff).unwrap().start, 0x6f00_0000);
        assert_eq!(maps.find(0x6f01_e000), None);
        assert_eq!(maps.find(0x7000_0800).unwrap().name, "/system/lib/libc.so");
        assert_eq!(maps.find(0x7fff_1fff).unwrap().name, "[stack]");
        assert_eq!(maps.find(u64::MAX), None);
        assert_eq!(Maps::default().find(0x1000), None);
    }

    #[test]
    fn rel_pc_and_file_base() {
        let maps = Maps::parse(MAPS).unwrap();
        let libc = maps.find(0x7000_0800).unwrap();
        assert_eq!(libc.rel_pc(0x7000_0800), 0x1800);
        assert_eq!(libc.file_base(), Some(0x6fff_f000));
    }

    #[test]
    fn memory_falls_back_to_the_process() {
        use crate::memory::MemoryFake;

        let map = MapInfo::parse_line("2000-3000 r-xp 00001000 00:00 0 [vdso]").unwrap();
        let mut process = MemoryFake::new();
        process.set_data32(0x1000, 0x464c_457f);
        process.set_data32(0x2ffc, 0x1234_5678);
        let process: Arc<dyn Memory> = Arc::new(process);

        let memory = map.create_memory(&process).unwrap();
        assert_eq!(memory.read_u32(0), Ok(0x464c_457f));
        assert_eq!(memory.read_u32(0x1ffc), Ok(0x1234_5678));
        assert!(memory.read_u32(0x1ffe).is_err());
    }

    #[test]
    fn offset_past_the_map_start() {
        use crate::memory::MemoryZero;

        let map = MapInfo::parse_line("1000-2000 r-xp 00010000 00:00 0 [anon:x]").unwrap();
        assert_eq!(map.file_base(), None);
        assert_eq!(map.rel_pc(0x1800), 0x10800);

        let process: Arc<dyn Memory> = Arc::new(MemoryZero);
        assert!(map.create_memory(&process).is_none());
        assert!(map.load_elf(&process).is_none());
    }

    #[test]
    fn local_maps() {
        let maps = Maps::local().unwrap();
        let here = local_maps as usize as u64;
        let map = maps.find(here).unwrap();
        assert!(map.is_executable());
    }
}
