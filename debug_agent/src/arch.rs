//! Architecture backends for the debug agent.
//!
//! This module contains the architecture specific implementations for the
//! debugger, abstracted behind the [`DebuggerArch`] trait. As these routines
//! abstract processor state and instructions, all of them are static.
//! [`SystemArch`] selects the backend for the compilation target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use debug_cpu::interrupts::ExceptionContext;

use crate::{DebuggerControl, ExceptionInfo};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x64;
        /// The architecture backend for the compilation target.
        pub type SystemArch = x64::X64Arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        /// The architecture backend for the compilation target.
        pub type SystemArch = aarch64::Aarch64Arch;
    } else {
        pub mod null;
        /// The architecture backend for the compilation target.
        pub type SystemArch = null::NullArch;
    }
}

/// Access kind of a hardware data watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAccess {
    Read,
    Write,
    ReadWrite,
}

impl WatchAccess {
    /// Builds the access mask from read/write flags. An empty mask is not a
    /// valid watchpoint.
    pub fn from_flags(read: bool, write: bool) -> Option<Self> {
        match (read, write) {
            (true, false) => Some(WatchAccess::Read),
            (false, true) => Some(WatchAccess::Write),
            (true, true) => Some(WatchAccess::ReadWrite),
            (false, false) => None,
        }
    }
}

/// Describes one GDB visible register backed by the exception context.
pub struct RegisterEntry {
    /// Byte offset of the register in the exception context, or `None` if the
    /// register is not captured. Absent registers read as zeroes and discard
    /// writes.
    pub offset: Option<usize>,
    /// Size of the register in bytes.
    pub size: usize,
    /// GDB register name.
    pub name: &'static str,
    /// GDB type string.
    pub ty: &'static str,
}

impl RegisterEntry {
    pub const fn present(offset: usize, size: usize, name: &'static str, ty: &'static str) -> Self {
        RegisterEntry { offset: Some(offset), size, name, ty }
    }

    pub const fn absent(size: usize, name: &'static str, ty: &'static str) -> Self {
        RegisterEntry { offset: None, size, name, ty }
    }
}

/// Static target naming used for the target description XML.
pub struct TargetInfo {
    /// GDB architecture name, e.g. "i386:x86-64".
    pub arch: &'static str,
    /// GDB feature name for the register document.
    pub registers_feature: &'static str,
}

/// Trait for architecture specific debugger implementations.
///
/// This trait abstracts the architecture specifics for the debugger: taking
/// and resuming from exceptions, the debug hardware, the page walk, and the
/// register table the GDB stub serves.
///
pub trait DebuggerArch {
    /// Exception numbers the agent installs itself for by default.
    const DEFAULT_EXCEPTION_TYPES: &'static [usize];
    /// The software breakpoint trap instruction, in memory order.
    const BREAKPOINT_INSTRUCTION: &'static [u8];
    /// Target naming for the description XML.
    const TARGET: TargetInfo;
    /// Ordered register table; the index is the GDB register number.
    const REGISTER_MAP: &'static [RegisterEntry];

    /// Executes a breakpoint instruction.
    fn breakpoint();

    /// Classifies an exception on entry into the debugger, doing any fixup
    /// needed to the CPU state of the saved context.
    fn process_entry(exception_type: u64, context: &mut ExceptionContext) -> ExceptionInfo;

    /// Processes the exit from the debugger, doing any fixup needed to the
    /// CPU state of the saved context.
    fn process_exit(exception_info: &mut ExceptionInfo);

    /// Arms the architecture specific single step in the saved context.
    fn set_single_step(exception_info: &mut ExceptionInfo);

    /// Initializes the architecture debug state from the control record.
    fn initialize(control: &DebuggerControl);

    /// Programs a hardware watchpoint. Returns false if no slot is available.
    fn add_watchpoint(address: u64, length: u64, access: WatchAccess) -> bool;

    /// Clears a previously programmed hardware watchpoint.
    fn remove_watchpoint(address: u64, length: u64, access: WatchAccess) -> bool;

    /// Checks against the live translation tables that the address can be
    /// read without faulting.
    fn is_page_readable(address: u64) -> bool;

    /// Checks against the live translation tables that the address can be
    /// written without faulting.
    fn is_page_writable(address: u64) -> bool;

    /// Invalidates the instruction cache after the instruction stream was
    /// rewritten.
    fn invalidate_icache(address: u64, length: usize);

    /// Resets the system.
    fn reboot() -> !;

    /// Millisecond timestamp, monotonic over a debug session.
    fn time_ms() -> u64;

    /// Writes the architecture system register dump for the monitor `i`
    /// command.
    fn monitor_system_registers(out: &mut dyn core::fmt::Write);

    /// Services the monitor `m` (MSR read) command.
    fn monitor_read_msr(command: &str, out: &mut dyn core::fmt::Write);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_access_from_flags() {
        assert_eq!(WatchAccess::from_flags(true, false), Some(WatchAccess::Read));
        assert_eq!(WatchAccess::from_flags(false, true), Some(WatchAccess::Write));
        assert_eq!(WatchAccess::from_flags(true, true), Some(WatchAccess::ReadWrite));
        assert_eq!(WatchAccess::from_flags(false, false), None);
    }
}
