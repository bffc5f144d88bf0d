//! X64 architecture backend.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::arch::asm;
use core::fmt::Write;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU64, Ordering};

use debug_cpu::interrupts::ExceptionContext;

use super::{DebuggerArch, RegisterEntry, TargetInfo, WatchAccess};
use crate::paging::{x64::X64PageWalker, PageAccess};
use crate::{DebuggerControl, ExceptionInfo, ExceptionKind};

/// The "int 3" instruction.
const INT_3: u8 = 0xCC;

/// The trap flag in RFLAGS.
const TF_BIT: u64 = 0x100;

/// TSC ticks per millisecond. Measured by the early init phase and delivered
/// through the control record; the default is a reasonable guess for when the
/// agent is force enabled without one.
static PERFORMANCE_COUNTER_FREQ: AtomicU64 = AtomicU64::new(0x30_0000);

/// Identity mapped platform carve-out that must never be dereferenced. The
/// control record may override or disable it.
static RESERVED_WINDOW: spin::RwLock<Option<(u64, u64)>> =
    spin::RwLock::new(Some(DebuggerControl::DEFAULT_RESERVED_WINDOW));

/// The uninhabitable type for implementing the X64 architecture.
pub enum X64Arch {}

pub(crate) const REGISTER_MAP: &[RegisterEntry] = &[
    RegisterEntry::present(offset_of!(ExceptionContext, rax), 8, "rax", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rbx), 8, "rbx", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rcx), 8, "rcx", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rdx), 8, "rdx", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rsi), 8, "rsi", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rdi), 8, "rdi", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rbp), 8, "rbp", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rsp), 8, "rsp", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r8), 8, "r8", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r9), 8, "r9", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r10), 8, "r10", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r11), 8, "r11", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r12), 8, "r12", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r13), 8, "r13", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r14), 8, "r14", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, r15), 8, "r15", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, rip), 8, "rip", "code_ptr"),
    // GDB expects the 32-bit eflags here; the context value is truncated.
    RegisterEntry::present(offset_of!(ExceptionContext, rflags), 4, "eflags", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, cs), 4, "cs", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, ss), 4, "ss", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, ds), 4, "ds", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, es), 4, "es", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, fs), 4, "fs", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, gs), 4, "gs", "int32"),
    RegisterEntry::present(offset_of!(ExceptionContext, cr0), 8, "cr0", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, cr2), 8, "cr2", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, cr3), 8, "cr3", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, cr4), 8, "cr4", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, cr8), 8, "cr8", "int64"),
    // The x87 state is not preserved in the context; GDB still requires the
    // register numbers to exist.
    RegisterEntry::absent(4, "fctrl", "int"),
    RegisterEntry::absent(4, "fstat", "int"),
    RegisterEntry::absent(4, "ftag", "int"),
    RegisterEntry::absent(4, "fiseg", "int"),
    RegisterEntry::absent(4, "fioff", "int"),
    RegisterEntry::absent(4, "foseg", "int"),
    RegisterEntry::absent(4, "fooff", "int"),
    RegisterEntry::absent(10, "fop", "i387_ext"),
    RegisterEntry::absent(10, "st0", "i387_ext"),
    RegisterEntry::absent(10, "st1", "i387_ext"),
    RegisterEntry::absent(10, "st2", "i387_ext"),
    RegisterEntry::absent(10, "st3", "i387_ext"),
    RegisterEntry::absent(10, "st4", "i387_ext"),
    RegisterEntry::absent(10, "st5", "i387_ext"),
    RegisterEntry::absent(10, "st6", "i387_ext"),
    RegisterEntry::absent(10, "st7", "i387_ext"),
];

impl DebuggerArch for X64Arch {
    const DEFAULT_EXCEPTION_TYPES: &'static [usize] = &[0, 1, 2, 3, 8, 11, 13, 14];
    const BREAKPOINT_INSTRUCTION: &'static [u8] = &[INT_3];
    const TARGET: TargetInfo = TargetInfo { arch: "i386:x86-64", registers_feature: "org.gnu.gdb.i386.core" };
    const REGISTER_MAP: &'static [RegisterEntry] = REGISTER_MAP;

    #[inline(always)]
    fn breakpoint() {
        unsafe { asm!("int 3") };
    }

    fn process_entry(exception_type: u64, context: &mut ExceptionContext) -> ExceptionInfo {
        let kind = match exception_type {
            1 => {
                context.rflags &= !TF_BIT; // Clear any single step flag.
                ExceptionKind::DebugStep
            }
            3 => {
                // The "int 3" trap leaves RIP after the instruction. Step it
                // back so the debugger shows the breakpoint location.
                context.rip -= 1;
                ExceptionKind::Breakpoint
            }
            6 => ExceptionKind::InvalidOp,
            14 => ExceptionKind::AccessViolation(context.cr2),
            17 => ExceptionKind::Alignment,
            _ => ExceptionKind::GenericFault,
        };

        ExceptionInfo { kind, address: context.rip, arch_code: exception_type, context: *context }
    }

    fn process_exit(exception_info: &mut ExceptionInfo) {
        if matches!(exception_info.kind, ExceptionKind::Breakpoint) {
            step_past_breakpoint(exception_info);
        }

        // Invalidate the TLB in case mappings were changed. The instruction
        // cache does not need separate maintenance on x64; it is kept coherent
        // with stores (Intel SDM Vol 3, 11.6). The CR3 write is serializing.
        unsafe {
            asm!("mov {0}, cr3", "mov cr3, {0}", out(reg) _);
        }
    }

    fn set_single_step(exception_info: &mut ExceptionInfo) {
        exception_info.context.rflags |= TF_BIT;
    }

    fn initialize(control: &DebuggerControl) {
        PERFORMANCE_COUNTER_FREQ.store(control.performance_counter_freq.max(1), Ordering::Relaxed);
        *RESERVED_WINDOW.write() = control.reserved_window;

        // Disable any stale hardware breakpoints left by earlier firmware.
        let mut regs = LiveDebugRegs {};
        clear_watchpoints_in(&mut regs);
    }

    fn add_watchpoint(address: u64, length: u64, access: WatchAccess) -> bool {
        let mut regs = LiveDebugRegs {};
        add_watchpoint_in(&mut regs, address, length, access)
    }

    fn remove_watchpoint(address: u64, length: u64, access: WatchAccess) -> bool {
        let mut regs = LiveDebugRegs {};
        remove_watchpoint_in(&mut regs, address, length, access)
    }

    fn is_page_readable(address: u64) -> bool {
        current_walker().query(address) != PageAccess::NotValid
    }

    fn is_page_writable(address: u64) -> bool {
        current_walker().query(address) == PageAccess::ReadWrite
    }

    fn invalidate_icache(_address: u64, _length: usize) {
        // Stores to the instruction stream are coherent with instruction
        // fetch; the TLB flush on exception exit covers the rest.
    }

    fn reboot() -> ! {
        // Reset the system through the keyboard controller IO port.
        unsafe {
            asm!("cli", "out dx, al", in("dx") 0x64, in("al") 0xFE_u8);
            loop {
                asm!("hlt");
            }
        }
    }

    fn time_ms() -> u64 {
        read_tsc() / PERFORMANCE_COUNTER_FREQ.load(Ordering::Relaxed)
    }

    fn monitor_system_registers(out: &mut dyn core::fmt::Write) {
        let mut idtr = [0u8; 10];
        let mut gdtr = [0u8; 10];
        let tr: u16;
        unsafe {
            asm!("sidt [{}]", in(reg) idtr.as_mut_ptr(), options(nostack));
            asm!("sgdt [{}]", in(reg) gdtr.as_mut_ptr(), options(nostack));
            asm!("str {0:x}", out(reg) tr, options(nostack, nomem));
        }

        let _ = writeln!(out, "IDT: base=0x{:x} limit=0x{:x}", table_base(&idtr), table_limit(&idtr));
        let _ = writeln!(out, "GDT: base=0x{:x} limit=0x{:x}", table_base(&gdtr), table_limit(&gdtr));
        let _ = writeln!(out, "TR: 0x{:x}", tr);

        let regs = LiveDebugRegs {};
        for index in 0..=DR7_MAX_INDEX {
            let _ = writeln!(out, "DR{}: 0x{:x}", index, regs.read_address(index));
        }
        let dr6: u64;
        unsafe { asm!("mov {}, dr6", out(reg) dr6) };
        let _ = writeln!(out, "DR6: 0x{:x}", dr6);
        let _ = writeln!(out, "DR7: 0x{:x}", regs.read_dr7());
    }

    fn monitor_read_msr(command: &str, out: &mut dyn core::fmt::Write) {
        let Some(msr) = crate::gdb::hex::parse_hex_u64(command.trim().as_bytes()) else {
            let _ = writeln!(out, "Invalid MSR number '{}'", command);
            return;
        };

        let value = read_msr(msr as u32);
        let _ = writeln!(out, "MSR {:08x} = {:016x}", msr, value);
    }
}

/// If the instruction at the saved RIP is still a breakpoint trap, advance
/// past it so resuming does not immediately re-trap.
pub(crate) fn step_past_breakpoint(exception_info: &mut ExceptionInfo) {
    // SAFETY: Given the breakpoint classification, RIP points at a mapped
    // instruction byte.
    if unsafe { *(exception_info.context.rip as *const u8) } == INT_3 {
        exception_info.context.rip += 1;
    }
}

fn current_walker() -> X64PageWalker {
    let cr3: u64;
    let cr4: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3);
        asm!("mov {}, cr4", out(reg) cr4);
    }

    // CR4.LA57 selects 5-level paging.
    let five_level = cr4 & (1 << 12) != 0;
    X64PageWalker::new(cr3, five_level, *RESERVED_WINDOW.read())
}

fn read_tsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe { asm!("rdtsc", out("eax") lo, out("edx") hi, options(nostack, nomem)) };
    ((hi as u64) << 32) | lo as u64
}

fn read_msr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe { asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nostack, nomem)) };
    ((hi as u64) << 32) | lo as u64
}

fn table_base(descriptor: &[u8; 10]) -> u64 {
    u64::from_le_bytes(descriptor[2..10].try_into().unwrap())
}

fn table_limit(descriptor: &[u8; 10]) -> u16 {
    u16::from_le_bytes(descriptor[0..2].try_into().unwrap())
}

//
// Hardware breakpoint (debug register) handling.
//
// The DR7 register is as follows for the relevant bits.
//
// 32     30    28     26    24     22    20     18    16     8    7    6    5    4    3    2    1    0
// |------|-----|------|-----|------|-----|------|-----|-----|----|----|----|----|----|----|----|----|
// | LEN3 | RW3 | LEN2 | RW2 | LEN1 | RW1 | LEN0 | RW0 | ... | G3 | L3 | G2 | L2 | G1 | L1 | G0 | L0 |
// |------|-----|------|-----|------|-----|------|-----|-----|----|----|----|----|----|----|----|----|
//

const DR7_MAX_INDEX: usize = 3;
/// The first 8 bits of DR7 are the global and local enable bits for the 4
/// hardware breakpoints.
const DR7_ENABLE_MASK: u64 = 0xFF;
const DR7_LOCAL_ENABLE_STRIDE: usize = 2;
const DR7_FIELD_MASK: u64 = 0x3;
const DR7_RW_OFFSET: usize = 16;
const DR7_LEN_OFFSET: usize = 18;
const DR7_FIELD_STRIDE: usize = 4;

/// Access to the debug address registers and DR7. Abstracted so the slot
/// allocation logic can be exercised without touching the live registers.
pub(crate) trait DebugRegs {
    fn read_dr7(&self) -> u64;
    fn write_dr7(&mut self, value: u64);
    fn read_address(&self, index: usize) -> u64;
    fn write_address(&mut self, index: usize, address: u64);
}

struct LiveDebugRegs {}

impl DebugRegs for LiveDebugRegs {
    fn read_dr7(&self) -> u64 {
        let dr7: u64;
        unsafe { asm!("mov {}, dr7", out(reg) dr7) };
        dr7
    }

    fn write_dr7(&mut self, value: u64) {
        unsafe { asm!("mov dr7, {}", in(reg) value) };
    }

    fn read_address(&self, index: usize) -> u64 {
        let mut address = 0;
        unsafe {
            match index {
                0 => asm!("mov {}, dr0", out(reg) address),
                1 => asm!("mov {}, dr1", out(reg) address),
                2 => asm!("mov {}, dr2", out(reg) address),
                3 => asm!("mov {}, dr3", out(reg) address),
                _ => debug_assert!(false, "Invalid x64 hardware breakpoint index."),
            }
        }
        address
    }

    fn write_address(&mut self, index: usize, address: u64) {
        unsafe {
            match index {
                0 => asm!("mov dr0, {}", in(reg) address),
                1 => asm!("mov dr1, {}", in(reg) address),
                2 => asm!("mov dr2, {}", in(reg) address),
                3 => asm!("mov dr3, {}", in(reg) address),
                _ => debug_assert!(false, "Invalid x64 hardware breakpoint index."),
            }
        }
    }
}

fn dr7_enabled(dr7: u64, index: usize) -> bool {
    (dr7 >> (index * DR7_LOCAL_ENABLE_STRIDE)) & 0x1 != 0
}

fn dr7_rw(dr7: u64, index: usize) -> u64 {
    (dr7 >> (index * DR7_FIELD_STRIDE + DR7_RW_OFFSET)) & DR7_FIELD_MASK
}

fn dr7_len(dr7: u64, index: usize) -> u64 {
    (dr7 >> (index * DR7_FIELD_STRIDE + DR7_LEN_OFFSET)) & DR7_FIELD_MASK
}

/// Data watchpoints cannot break on reads alone; read watchpoints are
/// silently widened to read/write (RW = 0b11).
fn rw_bits(access: WatchAccess) -> u64 {
    match access {
        WatchAccess::Write => 0b01,
        WatchAccess::Read | WatchAccess::ReadWrite => 0b11,
    }
}

/// LEN encoding: 00 = 1 byte, 01 = 2 bytes, 10 = 8 bytes, 11 = 4 bytes.
fn len_bits(length: u64) -> u64 {
    match length {
        1 => 0b00,
        2 => 0b01,
        8 => 0b10,
        _ => 0b11,
    }
}

pub(crate) fn add_watchpoint_in<R: DebugRegs>(regs: &mut R, address: u64, length: u64, access: WatchAccess) -> bool {
    let rw = rw_bits(access);
    let len = len_bits(length);
    let mut dr7 = regs.read_dr7();

    // Check for duplicates.
    for index in 0..=DR7_MAX_INDEX {
        if dr7_enabled(dr7, index)
            && regs.read_address(index) == address
            && dr7_rw(dr7, index) == rw
            && dr7_len(dr7, index) == len
        {
            return true;
        }
    }

    // Find an empty slot and fill it.
    for index in 0..=DR7_MAX_INDEX {
        if !dr7_enabled(dr7, index) {
            regs.write_address(index, address);

            dr7 &= !(DR7_FIELD_MASK << (index * DR7_FIELD_STRIDE + DR7_RW_OFFSET));
            dr7 &= !(DR7_FIELD_MASK << (index * DR7_FIELD_STRIDE + DR7_LEN_OFFSET));
            dr7 |= rw << (index * DR7_FIELD_STRIDE + DR7_RW_OFFSET);
            dr7 |= len << (index * DR7_FIELD_STRIDE + DR7_LEN_OFFSET);
            dr7 |= 1 << (index * DR7_LOCAL_ENABLE_STRIDE);
            regs.write_dr7(dr7);
            return true;
        }
    }

    false
}

pub(crate) fn remove_watchpoint_in<R: DebugRegs>(regs: &mut R, address: u64, length: u64, access: WatchAccess) -> bool {
    let rw = rw_bits(access);
    let len = len_bits(length);
    let mut dr7 = regs.read_dr7();

    for index in 0..=DR7_MAX_INDEX {
        if dr7_enabled(dr7, index)
            && regs.read_address(index) == address
            && dr7_rw(dr7, index) == rw
            && dr7_len(dr7, index) == len
        {
            dr7 &= !(1 << (index * DR7_LOCAL_ENABLE_STRIDE));
            regs.write_dr7(dr7);
            return true;
        }
    }

    false
}

pub(crate) fn clear_watchpoints_in<R: DebugRegs>(regs: &mut R) {
    let dr7 = regs.read_dr7();
    regs.write_dr7(dr7 & !DR7_ENABLE_MASK);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeDebugRegs {
        dr7: u64,
        addresses: [u64; 4],
    }

    impl DebugRegs for FakeDebugRegs {
        fn read_dr7(&self) -> u64 {
            self.dr7
        }

        fn write_dr7(&mut self, value: u64) {
            self.dr7 = value;
        }

        fn read_address(&self, index: usize) -> u64 {
            self.addresses[index]
        }

        fn write_address(&mut self, index: usize, address: u64) {
            self.addresses[index] = address;
        }
    }

    #[test]
    fn test_watchpoint_add_programs_dr7() {
        let mut regs = FakeDebugRegs::default();
        assert!(add_watchpoint_in(&mut regs, 0x1000, 4, WatchAccess::Write));

        assert_eq!(regs.addresses[0], 0x1000);
        assert!(dr7_enabled(regs.dr7, 0));
        assert_eq!(dr7_rw(regs.dr7, 0), 0b01);
        assert_eq!(dr7_len(regs.dr7, 0), 0b11);
    }

    #[test]
    fn test_watchpoint_read_maps_to_read_write() {
        let mut regs = FakeDebugRegs::default();
        assert!(add_watchpoint_in(&mut regs, 0x2000, 8, WatchAccess::Read));
        assert_eq!(dr7_rw(regs.dr7, 0), 0b11);
        assert_eq!(dr7_len(regs.dr7, 0), 0b10);
    }

    #[test]
    fn test_watchpoint_dedup_and_remove() {
        let mut regs = FakeDebugRegs::default();
        assert!(add_watchpoint_in(&mut regs, 0x3000, 4, WatchAccess::ReadWrite));
        assert!(add_watchpoint_in(&mut regs, 0x3000, 4, WatchAccess::ReadWrite));

        // The duplicate did not take a second slot.
        assert!(dr7_enabled(regs.dr7, 0));
        assert!(!dr7_enabled(regs.dr7, 1));

        assert!(remove_watchpoint_in(&mut regs, 0x3000, 4, WatchAccess::ReadWrite));
        assert!(!dr7_enabled(regs.dr7, 0));
        assert!(!remove_watchpoint_in(&mut regs, 0x3000, 4, WatchAccess::ReadWrite));
    }

    #[test]
    fn test_watchpoint_pool_exhaustion() {
        let mut regs = FakeDebugRegs::default();
        for i in 0..4 {
            assert!(add_watchpoint_in(&mut regs, 0x4000 + i * 8, 4, WatchAccess::Write));
        }
        assert!(!add_watchpoint_in(&mut regs, 0x5000, 4, WatchAccess::Write));
    }

    #[test]
    fn test_clear_watchpoints_preserves_fields() {
        let mut regs = FakeDebugRegs::default();
        assert!(add_watchpoint_in(&mut regs, 0x6000, 2, WatchAccess::Write));
        let before = regs.dr7;
        clear_watchpoints_in(&mut regs);
        assert_eq!(regs.dr7 & DR7_ENABLE_MASK, 0);
        assert_eq!(regs.dr7 & !DR7_ENABLE_MASK, before & !DR7_ENABLE_MASK);
    }

    #[test]
    fn test_process_entry_classification() {
        let mut context = ExceptionContext::default();
        context.rip = 0x1001;
        context.rflags = TF_BIT;

        let info = X64Arch::process_entry(1, &mut context);
        assert!(matches!(info.kind, ExceptionKind::DebugStep));
        assert_eq!(info.context.rflags & TF_BIT, 0);

        let mut context = ExceptionContext::default();
        context.rip = 0x1001;
        let info = X64Arch::process_entry(3, &mut context);
        assert!(matches!(info.kind, ExceptionKind::Breakpoint));
        // The int 3 trap reports the following instruction; entry rewinds it.
        assert_eq!(info.context.rip, 0x1000);
        assert_eq!(info.address, 0x1000);

        let mut context = ExceptionContext::default();
        context.cr2 = 0xBAD0;
        let info = X64Arch::process_entry(14, &mut context);
        assert!(matches!(info.kind, ExceptionKind::AccessViolation(0xBAD0)));

        let mut context = ExceptionContext::default();
        let info = X64Arch::process_entry(13, &mut context);
        assert!(matches!(info.kind, ExceptionKind::GenericFault));
        assert_eq!(info.arch_code, 13);
    }

    #[test]
    fn test_step_past_breakpoint() {
        let code = [INT_3, 0x90u8];
        let mut context = ExceptionContext::default();
        context.rip = code.as_ptr() as u64;

        let mut info = X64Arch::process_entry(3, &mut context);
        // Undo the entry rewind; point directly at the trap byte.
        info.context.rip = code.as_ptr() as u64;
        step_past_breakpoint(&mut info);
        assert_eq!(info.context.rip, code.as_ptr() as u64 + 1);

        // A restored instruction is not stepped past.
        info.context.rip = code.as_ptr() as u64 + 1;
        step_past_breakpoint(&mut info);
        assert_eq!(info.context.rip, code.as_ptr() as u64 + 1);
    }

    #[test]
    fn test_set_single_step() {
        let mut context = ExceptionContext::default();
        let mut info = X64Arch::process_entry(3, &mut context);
        X64Arch::set_single_step(&mut info);
        assert_eq!(info.context.rflags & TF_BIT, TF_BIT);
    }
}
