//! AArch64 architecture backend.
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

use bitfield_struct::bitfield;
use debug_cpu::interrupts::ExceptionContext;

use super::{DebuggerArch, RegisterEntry, TargetInfo, WatchAccess};
use crate::paging::aarch64::{descriptor_allows, AArch64PageWalker};
use crate::{DebuggerControl, ExceptionInfo, ExceptionKind};

/// The uninhabitable type for implementing the AArch64 architecture.
pub enum Aarch64Arch {}

const NUM_WATCHPOINTS: usize = 4;

// Exception classes from the high 6 bits of ESR_EL1.
const EC_UNKNOWN: u64 = 0x00;
const EC_INST_ABORT_LOWER_EL: u64 = 0x20;
const EC_INST_ABORT_CURRENT_EL: u64 = 0x21;
const EC_PC_ALIGNMENT: u64 = 0x22;
const EC_DATA_ABORT_LOWER_EL: u64 = 0x24;
const EC_DATA_ABORT_CURRENT_EL: u64 = 0x25;
const EC_SP_ALIGNMENT: u64 = 0x26;
const EC_BREAKPOINT_LOWER_EL: u64 = 0x30;
const EC_BREAKPOINT_CURRENT_EL: u64 = 0x31;
const EC_SW_STEP_LOWER_EL: u64 = 0x32;
const EC_SW_STEP_CURRENT_EL: u64 = 0x33;
const EC_WATCHPOINT_LOWER_EL: u64 = 0x34;
const EC_WATCHPOINT_CURRENT_EL: u64 = 0x35;
const EC_BRK_INSTRUCTION: u64 = 0x3C;

const SPSR_DEBUG_MASK: u64 = 0x200;
const SPSR_SOFTWARE_STEP: u64 = 0x20_0000;

const MDSCR_SOFTWARE_STEP: u64 = 0x1;
const MDSCR_KDE: u64 = 0x2000;
const MDSCR_MDE: u64 = 0x8000;

const OS_LOCK_STATUS_LOCKED: u64 = 0x2;

const DAIF_DEBUG_MASK: u64 = 0x200;

macro_rules! read_sysreg {
  ($reg:expr) => {{
    let value: u64;
    unsafe {
      asm!(concat!("mrs {}, ", $reg), out(reg) value);
    }
    value
  }};
}

macro_rules! write_sysreg {
  ($reg:expr, $value:expr) => {
    unsafe {
      asm!(concat!("msr ", $reg, ", {}"), in(reg) $value);
    }
  };
}

/// Writes a system register and completes the write with an instruction
/// barrier before continuing.
macro_rules! write_sysreg_sync {
  ($reg:expr, $value:expr) => {
    unsafe {
      asm!(concat!("msr ", $reg, ", {}"), "isb sy", in(reg) $value);
    }
  };
}

pub(crate) const REGISTER_MAP: &[RegisterEntry] = &[
    RegisterEntry::present(offset_of!(ExceptionContext, x0), 8, "x0", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x1), 8, "x1", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x2), 8, "x2", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x3), 8, "x3", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x4), 8, "x4", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x5), 8, "x5", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x6), 8, "x6", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x7), 8, "x7", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x8), 8, "x8", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x9), 8, "x9", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x10), 8, "x10", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x11), 8, "x11", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x12), 8, "x12", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x13), 8, "x13", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x14), 8, "x14", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x15), 8, "x15", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x16), 8, "x16", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x17), 8, "x17", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x18), 8, "x18", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x19), 8, "x19", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x20), 8, "x20", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x21), 8, "x21", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x22), 8, "x22", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x23), 8, "x23", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x24), 8, "x24", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x25), 8, "x25", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x26), 8, "x26", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x27), 8, "x27", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, x28), 8, "x28", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, fp), 8, "x29", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, lr), 8, "x30", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, sp), 8, "sp", "data_ptr"),
    RegisterEntry::present(offset_of!(ExceptionContext, elr), 8, "pc", "code_ptr"),
    // GDB's fpcr number is served from the FPSR slot; the context does not
    // save the FPCR itself.
    RegisterEntry::present(offset_of!(ExceptionContext, fpsr), 8, "fpcr", "int64"),
    RegisterEntry::present(offset_of!(ExceptionContext, spsr), 4, "cpsr", "int32"),
];

impl DebuggerArch for Aarch64Arch {
    // The synchronous exception vector.
    const DEFAULT_EXCEPTION_TYPES: &'static [usize] = &[0];
    // BRK, little endian.
    const BREAKPOINT_INSTRUCTION: &'static [u8] = &[0x00, 0x00, 0x3E, 0xD4];
    const TARGET: TargetInfo = TargetInfo { arch: "aarch64", registers_feature: "org.gnu.gdb.aarch64.core" };
    const REGISTER_MAP: &'static [RegisterEntry] = REGISTER_MAP;

    #[inline(always)]
    fn breakpoint() {
        unsafe {
            asm!("brk 0xf000", options(nostack));
        }
    }

    fn process_entry(_exception_type: u64, context: &mut ExceptionContext) -> ExceptionInfo {
        // The EFI exception number is not sufficient here; the upper 6 bits of
        // the ESR carry the real exception class.
        let exception_class = (context.esr >> 26) & 0x3F;

        let kind = match exception_class {
            EC_UNKNOWN => ExceptionKind::InvalidOp,
            EC_INST_ABORT_LOWER_EL | EC_INST_ABORT_CURRENT_EL | EC_DATA_ABORT_LOWER_EL | EC_DATA_ABORT_CURRENT_EL => {
                ExceptionKind::AccessViolation(context.far)
            }
            EC_PC_ALIGNMENT | EC_SP_ALIGNMENT => ExceptionKind::Alignment,
            EC_BREAKPOINT_LOWER_EL
            | EC_BREAKPOINT_CURRENT_EL
            | EC_WATCHPOINT_LOWER_EL
            | EC_WATCHPOINT_CURRENT_EL
            | EC_BRK_INSTRUCTION => ExceptionKind::Breakpoint,
            EC_SW_STEP_LOWER_EL | EC_SW_STEP_CURRENT_EL => {
                // Clear the step bit in the MDSCR.
                let mdscr = read_sysreg!("mdscr_el1");
                write_sysreg!("mdscr_el1", mdscr & !MDSCR_SOFTWARE_STEP);
                ExceptionKind::DebugStep
            }
            _ => {
                // The classification is lost; continuing would corrupt
                // host visible state. Halt here instead.
                loop {
                    core::hint::spin_loop();
                }
            }
        };

        ExceptionInfo { kind, address: context.elr, arch_code: exception_class, context: *context }
    }

    fn process_exit(exception_info: &mut ExceptionInfo) {
        // If resuming at a hard-coded BRK, step past it on return.
        if exception_info.arch_code == EC_BRK_INSTRUCTION {
            let elr = exception_info.context.elr as *const u8;
            let instruction_size = Self::BREAKPOINT_INSTRUCTION.len();

            // SAFETY: Given the exception class, the ELR points at a mapped
            // instruction.
            if unsafe { core::slice::from_raw_parts(elr, instruction_size) } == Self::BREAKPOINT_INSTRUCTION {
                exception_info.context.elr += instruction_size as u64;
            }
        }

        // The debugger may have rewritten instructions or relaxed mappings;
        // invalidate the instruction cache and TLB before resuming.
        unsafe {
            asm!("dsb sy", "ic iallu", "tlbi vmalle1", "dsb sy", "isb sy");
        }
    }

    fn set_single_step(exception_info: &mut ExceptionInfo) {
        // Clear the D bit; if it is still set from configuration outside an
        // exception the SS bit would not be respected.
        exception_info.context.spsr &= !SPSR_DEBUG_MASK;
        // Set the software step bit in the SPSR.
        exception_info.context.spsr |= SPSR_SOFTWARE_STEP;
        // Set the software step bit in the MDSCR, making sure MDE and KDE stay set.
        let mdscr = read_sysreg!("mdscr_el1");
        write_sysreg!("mdscr_el1", mdscr | MDSCR_SOFTWARE_STEP | MDSCR_MDE | MDSCR_KDE);
    }

    fn initialize(_control: &DebuggerControl) {
        //
        // For AArch64 debugging to work, the following must hold:
        //    1. The OS lock is unlocked.
        //    2. The kernel and monitor debug bits are set in the MDSCR.
        //    3. The watchpoint registers are cleared.
        //    4. Debug exceptions are unmasked in the DAIF.
        //

        // Mask debug exceptions while configuring in case there is latent
        // configuration.
        let daif = read_sysreg!("daif");
        write_sysreg_sync!("daif", daif | DAIF_DEBUG_MASK);

        // Clear the OS lock if needed.
        if read_sysreg!("oslsr_el1") & OS_LOCK_STATUS_LOCKED != 0 {
            unsafe { asm!("msr oslar_el1, xzr", "isb sy") };

            // Secure firmware may own the lock; debug exceptions silently
            // stay disabled if it cannot be cleared from this EL.
            if read_sysreg!("oslsr_el1") & OS_LOCK_STATUS_LOCKED != 0 {
                log::error!("OS lock could not be cleared, debug exceptions will not work!");
            }
        }

        // Enable kernel and monitor debug bits.
        let mdscr = read_sysreg!("mdscr_el1");
        write_sysreg!("mdscr_el1", mdscr | MDSCR_MDE | MDSCR_KDE);

        // Clear watchpoints.
        let mut regs = LiveWatchpointRegs {};
        for index in 0..NUM_WATCHPOINTS {
            regs.write_control(index, Wcr::from(0));
        }

        // Unmask debug exceptions.
        let daif = read_sysreg!("daif");
        write_sysreg_sync!("daif", daif & !DAIF_DEBUG_MASK);
    }

    fn add_watchpoint(address: u64, length: u64, access: WatchAccess) -> bool {
        let mut regs = LiveWatchpointRegs {};
        add_watchpoint_in(&mut regs, address, length, access)
    }

    fn remove_watchpoint(address: u64, length: u64, access: WatchAccess) -> bool {
        let mut regs = LiveWatchpointRegs {};
        remove_watchpoint_in(&mut regs, address, length, access)
    }

    fn is_page_readable(address: u64) -> bool {
        match current_walker().query(address) {
            Some(descriptor) => descriptor_allows(descriptor, false),
            None => false,
        }
    }

    fn is_page_writable(address: u64) -> bool {
        match current_walker().query(address) {
            Some(descriptor) => descriptor_allows(descriptor, true),
            None => false,
        }
    }

    fn invalidate_icache(_address: u64, _length: usize) {
        unsafe {
            asm!("dsb sy", "ic iallu", "dsb sy", "isb sy");
        }
    }

    fn reboot() -> ! {
        // Reboot through PSCI SYSTEM_RESET. Clobbering x0 is fine on the way
        // out.
        unsafe {
            asm!("ldr x0, =0x84000009", "smc 0");
        }
        loop {
            core::hint::spin_loop();
        }
    }

    fn time_ms() -> u64 {
        // The generic timer frequency is discoverable, no calibration needed.
        let freq = read_sysreg!("cntfrq_el0");
        assert!(freq >= 1000);
        read_sysreg!("cntpct_el0") / (freq / 1000)
    }

    fn monitor_system_registers(out: &mut dyn core::fmt::Write) {
        let _ = writeln!(out, "Not supported for AARCH64.");
    }

    fn monitor_read_msr(_command: &str, out: &mut dyn core::fmt::Write) {
        let _ = writeln!(out, "Not supported for AARCH64.");
    }
}

fn current_walker() -> AArch64PageWalker {
    AArch64PageWalker::new(read_sysreg!("ttbr0_el1"), read_sysreg!("tcr_el1"))
}

/// DBGWCRn_EL1 layout.
#[bitfield(u64)]
pub(crate) struct Wcr {
    pub enable: bool,
    #[bits(2)]
    pub pac: u8,
    #[bits(2)]
    pub lsc: u8,
    #[bits(8)]
    pub bas: u8,
    pub hmc: bool,
    #[bits(2)]
    pub ssc: u8,
    #[bits(4)]
    pub lbn: u8,
    pub wt: bool,
    #[bits(3)]
    pub reserved_0: u8,
    #[bits(5)]
    pub mask: u8,
    pub ssce: bool,
    #[bits(34)]
    pub reserved_1: u64,
}

impl Wcr {
    /// Byte address select is a bitmap over Address + N for N up to 7; shift
    /// away a full 8 bits by (8 - count) to build it.
    pub fn calculate_bas(length: u64) -> u8 {
        (0xFFu64 >> (8 - 8u64.min(length.max(1)))) as u8
    }

    pub fn calculate_lsc(access: WatchAccess) -> u8 {
        match access {
            WatchAccess::Read => 0b01,
            WatchAccess::Write => 0b10,
            WatchAccess::ReadWrite => 0b11,
        }
    }
}

/// Access to the watchpoint value/control register pairs. Abstracted so the
/// slot allocation logic can be exercised without touching the live
/// registers.
pub(crate) trait WatchpointRegs {
    fn read_value(&self, index: usize) -> u64;
    fn write_value(&mut self, index: usize, value: u64);
    fn read_control(&self, index: usize) -> Wcr;
    fn write_control(&mut self, index: usize, control: Wcr);
}

struct LiveWatchpointRegs {}

impl WatchpointRegs for LiveWatchpointRegs {
    fn read_value(&self, index: usize) -> u64 {
        match index {
            0 => read_sysreg!("dbgwvr0_el1"),
            1 => read_sysreg!("dbgwvr1_el1"),
            2 => read_sysreg!("dbgwvr2_el1"),
            3 => read_sysreg!("dbgwvr3_el1"),
            _ => 0,
        }
    }

    fn write_value(&mut self, index: usize, value: u64) {
        match index {
            0 => write_sysreg!("dbgwvr0_el1", value),
            1 => write_sysreg!("dbgwvr1_el1", value),
            2 => write_sysreg!("dbgwvr2_el1", value),
            3 => write_sysreg!("dbgwvr3_el1", value),
            _ => {}
        }
    }

    fn read_control(&self, index: usize) -> Wcr {
        let value = match index {
            0 => read_sysreg!("dbgwcr0_el1"),
            1 => read_sysreg!("dbgwcr1_el1"),
            2 => read_sysreg!("dbgwcr2_el1"),
            3 => read_sysreg!("dbgwcr3_el1"),
            _ => 0,
        };
        Wcr::from(value)
    }

    fn write_control(&mut self, index: usize, control: Wcr) {
        let value: u64 = control.into();
        match index {
            0 => write_sysreg_sync!("dbgwcr0_el1", value),
            1 => write_sysreg_sync!("dbgwcr1_el1", value),
            2 => write_sysreg_sync!("dbgwcr2_el1", value),
            3 => write_sysreg_sync!("dbgwcr3_el1", value),
            _ => {}
        }
    }
}

pub(crate) fn add_watchpoint_in<R: WatchpointRegs>(regs: &mut R, address: u64, length: u64, access: WatchAccess) -> bool {
    let bas = Wcr::calculate_bas(length);
    let lsc = Wcr::calculate_lsc(access);

    // Check for duplicates.
    for index in 0..NUM_WATCHPOINTS {
        let wcr = regs.read_control(index);
        if wcr.enable() && wcr.bas() == bas && wcr.lsc() == lsc && regs.read_value(index) == address {
            return true;
        }
    }

    // Find an empty slot and fill it.
    for index in 0..NUM_WATCHPOINTS {
        if !regs.read_control(index).enable() {
            let mut wcr = Wcr::from(0);
            wcr.set_enable(true);
            wcr.set_bas(bas);
            wcr.set_lsc(lsc);

            // These are required to trap at all levels in the normal world.
            // Refer to table D2-13 in the ARM A profile reference manual.
            wcr.set_hmc(true);
            wcr.set_ssc(0b01);
            wcr.set_pac(0b11);

            regs.write_value(index, address);
            regs.write_control(index, wcr);
            return true;
        }
    }

    false
}

pub(crate) fn remove_watchpoint_in<R: WatchpointRegs>(
    regs: &mut R,
    address: u64,
    length: u64,
    access: WatchAccess,
) -> bool {
    let bas = Wcr::calculate_bas(length);
    let lsc = Wcr::calculate_lsc(access);

    for index in 0..NUM_WATCHPOINTS {
        let wcr = regs.read_control(index);
        if wcr.enable() && wcr.bas() == bas && wcr.lsc() == lsc && regs.read_value(index) == address {
            regs.write_control(index, Wcr::from(0));
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeWatchpointRegs {
        values: [u64; NUM_WATCHPOINTS],
        controls: [u64; NUM_WATCHPOINTS],
    }

    impl WatchpointRegs for FakeWatchpointRegs {
        fn read_value(&self, index: usize) -> u64 {
            self.values[index]
        }

        fn write_value(&mut self, index: usize, value: u64) {
            self.values[index] = value;
        }

        fn read_control(&self, index: usize) -> Wcr {
            Wcr::from(self.controls[index])
        }

        fn write_control(&mut self, index: usize, control: Wcr) {
            self.controls[index] = control.into();
        }
    }

    #[test]
    fn test_bas_encoding() {
        assert_eq!(Wcr::calculate_bas(1), 0b1);
        assert_eq!(Wcr::calculate_bas(2), 0b11);
        assert_eq!(Wcr::calculate_bas(4), 0b1111);
        assert_eq!(Wcr::calculate_bas(8), 0xFF);
        assert_eq!(Wcr::calculate_bas(64), 0xFF);
    }

    #[test]
    fn test_watchpoint_add_sets_control_bits() {
        let mut regs = FakeWatchpointRegs::default();
        assert!(add_watchpoint_in(&mut regs, 0x1000, 4, WatchAccess::Write));

        let wcr = regs.read_control(0);
        assert!(wcr.enable());
        assert_eq!(wcr.bas(), 0b1111);
        assert_eq!(wcr.lsc(), 0b10);
        assert!(wcr.hmc());
        assert_eq!(wcr.ssc(), 0b01);
        assert_eq!(wcr.pac(), 0b11);
        assert_eq!(regs.values[0], 0x1000);
    }

    #[test]
    fn test_watchpoint_dedup_and_remove() {
        let mut regs = FakeWatchpointRegs::default();
        assert!(add_watchpoint_in(&mut regs, 0x2000, 8, WatchAccess::Read));
        assert!(add_watchpoint_in(&mut regs, 0x2000, 8, WatchAccess::Read));
        assert!(!regs.read_control(1).enable());

        assert!(remove_watchpoint_in(&mut regs, 0x2000, 8, WatchAccess::Read));
        assert!(!regs.read_control(0).enable());
        assert!(!remove_watchpoint_in(&mut regs, 0x2000, 8, WatchAccess::Read));
    }

    #[test]
    fn test_watchpoint_pool_exhaustion() {
        let mut regs = FakeWatchpointRegs::default();
        for i in 0..NUM_WATCHPOINTS as u64 {
            assert!(add_watchpoint_in(&mut regs, 0x3000 + i * 8, 8, WatchAccess::ReadWrite));
        }
        assert!(!add_watchpoint_in(&mut regs, 0x4000, 8, WatchAccess::ReadWrite));
    }
}
