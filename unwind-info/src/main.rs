use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unwindstack::arm::{ArmExidx, ArmStatus};
use unwindstack::elf::Elf;
use unwindstack::maps::Maps;
use unwindstack::memory::{Memory, MemoryFileAtOffset, MemoryRemote, MemoryZero};
use unwindstack::unwinder::ElfCache;

/// Inspects the unwind information of ELF files and processes.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Summarize the unwind information of an ELF file
    Info { elf: PathBuf },
    /// Disassemble the .ARM.exidx entry covering a pc
    Exidx {
        elf: PathBuf,
        /// Virtual address in the file, in hex
        #[arg(long, value_parser = parse_hex)]
        pc: u64,
    },
    /// Print the DWARF CFI row covering a pc
    Cfi {
        elf: PathBuf,
        /// Virtual address in the file, in hex
        #[arg(long, value_parser = parse_hex)]
        pc: u64,
    },
    /// List the maps of a process and whether their ELF files can be read
    Maps { pid: i32 },
    /// Unwind the stack of this program
    #[command(name = "self")]
    SelfUnwind {
        #[arg(long, default_value_t = 64)]
        max_frames: usize,
    },
}

fn parse_hex(value: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
}

fn main() -> Result<()> {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()?,
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    match Opt::parse().command {
        Command::Info { elf } => info(&elf),
        Command::Exidx { elf, pc } => exidx(&elf, pc),
        Command::Cfi { elf, pc } => cfi(&elf, pc),
        Command::Maps { pid } => maps(pid),
        Command::SelfUnwind { max_frames } => unwind_self(max_frames),
    }
}

fn open_elf(path: &Path) -> Result<Elf> {
    let memory = MemoryFileAtOffset::new(path, 0)
        .with_context(|| format!("failed to map {}", path.display()))?;
    Elf::new(Box::new(memory)).with_context(|| format!("failed to read {}", path.display()))
}

fn info(path: &Path) -> Result<()> {
    let elf = open_elf(path)?;

    println!("class:       {}", elf.class_name());
    println!("machine:     {}", elf.arch());
    println!("load bias:   {:#x}", elf.load_bias());
    println!("soname:      {}", elf.soname().as_deref().unwrap_or("-"));
    for load in elf.pt_loads().values() {
        println!(
            "exec load:   offset {:#x} vaddr {:#x} size {:#x}",
            load.offset, load.vaddr, load.size
        );
    }

    match elf.exidx() {
        Some(table) => println!(
            "exidx:       {} entries at {:#x}",
            table.len(),
            table.start_offset()
        ),
        None => println!("exidx:       -"),
    }
    match elf.eh_frame() {
        Some((region, search_table)) => println!(
            "eh_frame:    offset {:#x} vaddr {:#x}{}",
            region.offset,
            region.vaddr,
            if search_table {
                ", indexed by .eh_frame_hdr"
            } else {
                ""
            }
        ),
        None => println!("eh_frame:    -"),
    }
    match elf.debug_frame() {
        Some(region) => println!(
            "debug_frame: offset {:#x} size {:#x}",
            region.offset, region.size
        ),
        None => println!("debug_frame: -"),
    }
    Ok(())
}

fn exidx(path: &Path, pc: u64) -> Result<()> {
    let elf = open_elf(path)?;
    let table = elf.exidx().context("the file has no .ARM.exidx")?;
    let memory = elf.memory();

    let entry = table
        .find_entry(memory, pc)
        .with_context(|| format!("no exidx entry covers {pc:#x}"))?;
    let idx = ((entry - table.start_offset()) / 8) as usize;
    let function = table.entry_addr(memory, idx)?;
    println!("entry {idx} at {entry:#x}, function at {function:#x}");

    // Log-only decoding never reads process memory.
    let mut arm = ArmExidx::new(memory, &MemoryZero);
    arm.set_log_only(true);
    match arm.extract_entry(entry) {
        Ok(()) => {}
        Err(ArmStatus::NoUnwind) => {
            println!("cantunwind");
            return Ok(());
        }
        Err(status) => return Err(status).context("failed to extract the entry"),
    }
    println!("opcodes: {:02x?}", arm.data());

    if let Err(status) = arm.eval() {
        println!("decoding stopped: {status}");
    }
    Ok(())
}

fn cfi(path: &Path, pc: u64) -> Result<()> {
    let elf = open_elf(path)?;
    let row = elf
        .rule_row(pc)
        .with_context(|| format!("no CFI row for {pc:#x}"))?;

    let cie = &row.cie.cie;
    println!(
        "cie at {:#x}: version {} augmentation {:?} code_align {} data_align {} ra r{}",
        cie.offset,
        cie.version,
        cie.augmentation,
        cie.code_alignment_factor,
        cie.data_alignment_factor,
        cie.return_address_register
    );
    println!("  initial: {}", row.cie.row);
    println!(
        "fde at {:#x}: pc {:#x}..{:#x}",
        row.fde.offset, row.fde.pc_start, row.fde.pc_end
    );
    println!("  {pc:#x}: {}", row.row);
    Ok(())
}

fn maps(pid: i32) -> Result<()> {
    let maps = Maps::from_pid(pid)?;
    let process: Arc<dyn Memory> = Arc::new(MemoryRemote::new(pid));
    let elfs = ElfCache::new();

    for map in &maps {
        let status = match elfs.get(map, &process) {
            Some(elf) => format!("{} {}", elf.class_name(), elf.arch()),
            None => "no ELF".to_owned(),
        };
        println!("{map}  [{status}]");
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
fn unwind_self(max_frames: usize) -> Result<()> {
    use unwindstack::memory::MemoryLocal;
    use unwindstack::unwinder::{Unwinder, UnwinderConfig};

    let mut regs = unwindstack::capture_local_regs!();
    let maps = Maps::local()?;
    let elfs = ElfCache::new();
    let backtrace = Unwinder::new(&maps, Arc::new(MemoryLocal), &elfs)
        .with_config(UnwinderConfig { max_frames })
        .unwind(&mut regs);
    print!("{backtrace}");
    Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn unwind_self(_max_frames: usize) -> Result<()> {
    anyhow::bail!("capturing the registers of this program needs x86_64")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_pcs() {
        assert_eq!(parse_hex("0x1f00"), Ok(0x1f00));
        assert_eq!(parse_hex("1F00"), Ok(0x1f00));
        assert!(parse_hex("pc").is_err());
    }

    #[test]
    fn arguments() {
        let opt = Opt::try_parse_from(["unwind-info", "cfi", "/lib/libc.so", "--pc", "4a0"]).unwrap();
        assert!(matches!(opt.command, Command::Cfi { pc: 0x4a0, .. }));

        let opt = Opt::try_parse_from(["unwind-info", "self"]).unwrap();
        assert!(matches!(opt.command, Command::SelfUnwind { max_frames: 64 }));

        assert!(Opt::try_parse_from(["unwind-info", "exidx", "/lib/libc.so"]).is_err());
    }
}
