//! UEFI Debug Agent
//!
//! This crate provides a debug agent that installs itself in the exception
//! handlers and communicates with debugger software over a byte transport
//! using the GDB Remote Serial Protocol. The agent is intended to live inside
//! the boot phase firmware: it gains control on faults, breakpoints, and
//! single step events, and services the host against the live system.
//!
//! ## Examples and Usage
//!
//! The agent consists of the static access routines and the underlying
//! [`DebugAgent`] struct. The platform initializes a static `DebugAgent` with
//! its transport and registers it as the global instance. Core code then
//! interacts with the agent through the static routines; if the agent is not
//! set or not enabled they are no-ops.
//!
//! ```rust,ignore
//! use debug_cpu::interrupts::{InterruptManager, Interrupts};
//!
//! static DEBUGGER: debug_agent::DebugAgent<Uart> = debug_agent::DebugAgent::new(UART);
//!
//! fn entry() {
//!     debug_agent::set_debugger(&DEBUGGER);
//!
//!     let mut interrupt_manager = Interrupts::default();
//!     let control = debug_agent::DebuggerControl::default();
//!
//!     // Install the exception handlers. This may invoke the initial debug
//!     // break depending on the control record.
//!     debug_agent::initialize(&mut interrupt_manager, &control);
//!
//!     // Notify the agent of a module load.
//!     debug_agent::notify_module_load("module.efi", 0x420000, 0x10000);
//!
//!     // Poll for a host break-in request.
//!     debug_agent::poll_debugger();
//! }
//! ```
//!
//! ## Features
//!
//! `windbg_workarounds` - (Default) Enables workarounds for Windbg
//! compatibility.
//!
//! `alloc` - (Default) Uses allocated storage for module name tracking.
//! Without it, only the break-all form of module breakpoints is available.
//!
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

pub mod arch;
mod breakpoint;
mod debugger;
mod gdb;
pub mod memory;
mod modules;
mod paging;
pub mod transport;

#[cfg(feature = "alloc")]
extern crate alloc;

use arch::{DebuggerArch, SystemArch, WatchAccess};
use bitfield_struct::bitfield;
use debug_cpu::interrupts::{ExceptionContext, InterruptManager};

pub use debugger::DebugAgent;
pub use memory::{set_memory_attribute_service, MemoryAttributeService, MemoryAttributes};
pub use transport::{DebugTransport, DebuggerLoggingPolicy, NullWatchdog, SystemReset, WatchdogControl};

/// Global instance of the debugger.
///
/// This is only expected to be set once, and will be accessed through the
/// static routines after that point. Because the debugger installs itself in
/// exception handlers and owns static state like the breakpoint table, it is
/// not safe to remove or replace it; the Once lock provides these properties.
///
static DEBUGGER: spin::Once<&dyn Debugger> = spin::Once::new();

/// Enable flags published by the early boot phase.
#[bitfield(u32)]
pub struct DebugControlFlags {
    /// Break into the debugger once initialization completes.
    pub initial_breakpoint: bool,
    /// The DXE phase agent is enabled.
    pub dxe_debug_enabled: bool,
    /// The MM phase agent is enabled.
    pub mm_debug_enabled: bool,
    #[bits(29)]
    __: u32,
}

/// The control record published by the firmware's early phase, telling the
/// agent whether and how to run.
pub struct DebuggerControl {
    pub flags: DebugControlFlags,
    /// TSC ticks per millisecond, measured by the early phase. Only used on
    /// x86-64; other architectures discover their timer frequency.
    pub performance_counter_freq: u64,
    /// How long the initial breakpoint waits for a connection before
    /// resuming. Zero waits forever.
    pub initial_breakpoint_timeout_ms: u64,
    /// Identity mapped platform carve-out (inclusive) the agent must never
    /// dereference. `None` disables the check.
    pub reserved_window: Option<(u64, u64)>,
}

impl DebuggerControl {
    /// The carve-out used when the platform does not override it.
    pub const DEFAULT_RESERVED_WINDOW: (u64, u64) = (0x8300_0000, 0x87C0_0000);

    pub const fn new() -> Self {
        DebuggerControl {
            flags: DebugControlFlags::new(),
            // Reasonable guess for the TSC rate; timing may be inaccurate.
            performance_counter_freq: 0x30_0000,
            initial_breakpoint_timeout_ms: 0,
            reserved_window: Some(Self::DEFAULT_RESERVED_WINDOW),
        }
    }
}

impl Default for DebuggerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// The firmware phase an agent instance is embedded in. Selects which enable
/// flag of the control record applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPhase {
    Dxe,
    Mm,
}

/// The cause of an agent invoked breakpoint, surfaced through the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakReason {
    None = 0,
    Initial,
    ModuleLoad,
    DebuggerBreak,
}

impl BreakReason {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakReason::Initial,
            2 => BreakReason::ModuleLoad,
            3 => BreakReason::DebuggerBreak,
            _ => BreakReason::None,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            BreakReason::None => "N/A",
            BreakReason::Initial => "Initial Breakpoint",
            BreakReason::ModuleLoad => "Module Load",
            BreakReason::DebuggerBreak => "Debugger Break",
        }
    }
}

/// Architecture agnostic classification of an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// A completed instruction step.
    DebugStep,
    /// A breakpoint or watchpoint trap.
    Breakpoint,
    /// A fault with no more specific classification.
    GenericFault,
    /// An undefined or illegal instruction.
    InvalidOp,
    /// A misaligned access or stack.
    Alignment,
    /// An invalid memory access; carries the accessed address.
    AccessViolation(u64),
}

impl core::fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExceptionKind::DebugStep => write!(f, "Debug Step"),
            ExceptionKind::Breakpoint => write!(f, "Breakpoint"),
            ExceptionKind::GenericFault => write!(f, "Generic Fault"),
            ExceptionKind::InvalidOp => write!(f, "Invalid Opcode"),
            ExceptionKind::Alignment => write!(f, "Alignment Fault"),
            ExceptionKind::AccessViolation(address) => write!(f, "Access Violation at 0x{:x}", address),
        }
    }
}

/// A captured exception, as delivered to the stub.
pub struct ExceptionInfo {
    /// The classification of the exception.
    pub kind: ExceptionKind,
    /// The faulting instruction address.
    pub address: u64,
    /// The raw architecture exception code.
    pub arch_code: u64,
    /// The register state at the time of the exception. Mutations take effect
    /// when the exception handler returns.
    pub context: ExceptionContext,
}

/// Trait for debugger interaction through the global instance.
trait Debugger: Sync {
    /// Initializes the debugger from the control record.
    fn initialize(&'static self, interrupt_manager: &mut dyn InterruptManager, control: &DebuggerControl);

    /// Checks if the debugger is enabled.
    fn enabled(&'static self) -> bool;

    /// Notifies the debugger of a module load.
    fn notify_module_load(&'static self, module_name: &str, address: usize, length: usize);

    /// Polls the debugger transport for a pending break-in.
    fn poll_debugger(&'static self);
}

/// Agent internal failures. Protocol and memory errors are reported to the
/// host instead and never surface here.
#[derive(Debug)]
#[allow(dead_code)]
pub(crate) enum DebugError {
    /// The debugger lock could not be acquired, usually indicating the
    /// debugger itself faulted.
    Reentry,
    /// The debugger was invoked without being fully initialized.
    NotInitialized,
    /// The transport failed during initialization.
    TransportFailure,
}

/// Sets the global instance of the debugger.
pub fn set_debugger<T: DebugTransport>(debugger: &'static DebugAgent<T>) {
    DEBUGGER.call_once(|| debugger);
}

/// Initializes the debugger from the control record. This will install the
/// debugger into the exception handlers using the provided interrupt manager,
/// and may invoke the initial debug break.
pub fn initialize(interrupt_manager: &mut dyn InterruptManager, control: &DebuggerControl) {
    if let Some(debugger) = DEBUGGER.get() {
        debugger.initialize(interrupt_manager, control);
    }
}

/// Invokes a debug break instruction. Callers should ensure the debugger is
/// enabled first; the trap is unhandled otherwise.
pub fn breakpoint() {
    SystemArch::breakpoint();
}

/// Notifies the debugger of a module load at the provided address and length.
/// This should be invoked before the module has begun execution.
pub fn notify_module_load(module_name: &str, address: usize, length: usize) {
    if let Some(debugger) = DEBUGGER.get() {
        debugger.notify_module_load(module_name, address, length);
    }
}

/// Polls the debugger transport for a pending break-in request. May cause a
/// debug break.
pub fn poll_debugger() {
    if let Some(debugger) = DEBUGGER.get() {
        debugger.poll_debugger();
    }
}

/// Checks if the debugger is enabled.
pub fn enabled() -> bool {
    match DEBUGGER.get() {
        Some(debugger) => debugger.enabled(),
        None => false,
    }
}

/// Programs a hardware data watchpoint. Returns false if the access mask is
/// empty or no slot is available.
pub fn add_watchpoint(address: u64, length: u64, read: bool, write: bool) -> bool {
    match WatchAccess::from_flags(read, write) {
        Some(access) => SystemArch::add_watchpoint(address, length, access),
        None => false,
    }
}

/// Removes a previously programmed hardware data watchpoint.
pub fn remove_watchpoint(address: u64, length: u64, read: bool, write: bool) -> bool {
    match WatchAccess::from_flags(read, write) {
        Some(access) => SystemArch::remove_watchpoint(address, length, access),
        None => false,
    }
}

#[cfg(test)]
pub(crate) mod test_support;
