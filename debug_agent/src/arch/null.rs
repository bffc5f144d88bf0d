//! No-op architecture backend for unsupported host architectures.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::fmt::Write;
use core::sync::atomic::{AtomicU64, Ordering};

use debug_cpu::interrupts::ExceptionContext;

use super::{DebuggerArch, RegisterEntry, TargetInfo, WatchAccess};
use crate::{DebuggerControl, ExceptionInfo, ExceptionKind};

pub enum NullArch {}

static CLOCK: AtomicU64 = AtomicU64::new(0);

impl DebuggerArch for NullArch {
    const DEFAULT_EXCEPTION_TYPES: &'static [usize] = &[];
    const BREAKPOINT_INSTRUCTION: &'static [u8] = &[0x00];
    const TARGET: TargetInfo = TargetInfo { arch: "none", registers_feature: "none" };
    const REGISTER_MAP: &'static [RegisterEntry] = &[];

    fn breakpoint() {}

    fn process_entry(exception_type: u64, context: &mut ExceptionContext) -> ExceptionInfo {
        ExceptionInfo {
            kind: ExceptionKind::GenericFault,
            address: context.pc,
            arch_code: exception_type,
            context: *context,
        }
    }

    fn process_exit(_exception_info: &mut ExceptionInfo) {}

    fn set_single_step(_exception_info: &mut ExceptionInfo) {}

    fn initialize(_control: &DebuggerControl) {}

    fn add_watchpoint(_address: u64, _length: u64, _access: WatchAccess) -> bool {
        false
    }

    fn remove_watchpoint(_address: u64, _length: u64, _access: WatchAccess) -> bool {
        false
    }

    fn is_page_readable(_address: u64) -> bool {
        false
    }

    fn is_page_writable(_address: u64) -> bool {
        false
    }

    fn invalidate_icache(_address: u64, _length: usize) {}

    fn reboot() -> ! {
        panic!("Reboot is not supported on this architecture.");
    }

    fn time_ms() -> u64 {
        CLOCK.fetch_add(1, Ordering::Relaxed)
    }

    fn monitor_system_registers(out: &mut dyn core::fmt::Write) {
        let _ = writeln!(out, "Not supported.");
    }

    fn monitor_read_msr(_command: &str, out: &mut dyn core::fmt::Write) {
        let _ = writeln!(out, "Not supported.");
    }
}
