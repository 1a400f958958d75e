//! Register capture for unwinding the calling thread.

#[cfg(target_arch = "x86_64")]
#[doc(hidden)]
pub use core::arch::asm as __asm;

/// Captures the registers at the point of expansion as a
/// [`RegsX86_64`](crate::regs::RegsX86_64), in DWARF numbering. The first
/// frame of an unwind from the result is the function containing the
/// expansion, whose stack stays live for as long as that function runs.
#[cfg(target_arch = "x86_64")]
#[macro_export]
macro_rules! capture_local_regs {
    () => {{
        let mut registers = [0u64; 17];

        // SAFETY: only writes the 17 slots of `registers`.
        unsafe {
            $crate::arch::__asm!(
                "mov [{regs}+1*8], rdx",
                "mov [{regs}+2*8], rcx",
                "mov [{regs}+3*8], rbx", // callee-saved
                "mov [{regs}+4*8], rsi",
                "mov [{regs}+5*8], rdi",
                "mov [{regs}+6*8], rbp", // callee-saved
                "mov [{regs}+7*8], rsp", // callee-saved
                "mov [{regs}+8*8], r8",
                "mov [{regs}+9*8], r9",
                "mov [{regs}+10*8], r10",
                "mov [{regs}+11*8], r11",
                "mov [{regs}+12*8], r12", // callee-saved
                "mov [{regs}+13*8], r13", // callee-saved
                "mov [{regs}+14*8], r14", // callee-saved
                "mov [{regs}+15*8], r15", // callee-saved

                "lea rax, [rip + 0]", // must use rip as a base register
                "mov [{regs}+16*8], rax", // return address column

                out("rax") _,
                regs = in(reg) registers.as_mut_ptr(),
                options(nostack, preserves_flags),
            );
        }

        $crate::regs::RegsX86_64::from_values(&registers)
    }};
}

#[cfg(all(test, target_arch = "x86_64", target_os = "linux"))]
mod tests {
    use std::sync::Arc;

    use crate::maps::Maps;
    use crate::memory::MemoryLocal;
    use crate::regs::Regs;
    use crate::unwinder::{ElfCache, Unwinder};

    #[test]
    fn captured_pc_is_in_this_binary() {
        let regs = capture_local_regs!();
        let maps = Maps::local().unwrap();

        let map = maps.find(regs.pc()).unwrap();
        assert!(map.is_executable());
        assert_eq!(
            std::fs::canonicalize(&map.name).unwrap(),
            std::fs::canonicalize(std::env::current_exe().unwrap()).unwrap()
        );

        let stack = maps.find(regs.sp()).unwrap();
        assert!(!stack.is_executable());
    }

    #[test]
    fn unwinds_past_the_capturing_function() {
        let mut regs = capture_local_regs!();
        let maps = Maps::local().unwrap();
        let elfs = ElfCache::new();

        let backtrace = Unwinder::new(&maps, Arc::new(MemoryLocal), &elfs).unwind(&mut regs);
        assert!(backtrace.frames.len() > 1, "{backtrace}");
        let exe = std::fs::canonicalize(std::env::current_exe().unwrap()).unwrap();
        assert_eq!(
            std::fs::canonicalize(&backtrace.frames[1].map_name).unwrap(),
            exe
        );
    }
}
