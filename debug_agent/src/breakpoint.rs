//! Software breakpoint table.
//!
//! Breakpoints are tracked in a fixed table of saved instruction bytes. The
//! instruction stream is rewritten with the architecture's trap opcode on
//! insert and restored on remove. The table never needs to be consulted on a
//! trap; the exception front-end pattern matches the instruction bytes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::DebuggerArch;
use crate::memory;
use crate::BreakReason;

pub(crate) const MAX_BREAKPOINTS: usize = 64;
const MAX_BREAKPOINT_SIZE: usize = 4;

#[derive(Copy, Clone)]
struct BreakpointEntry {
    active: bool,
    address: u64,
    original: [u8; MAX_BREAKPOINT_SIZE],
}

impl BreakpointEntry {
    const fn empty() -> Self {
        BreakpointEntry { active: false, address: 0, original: [0; MAX_BREAKPOINT_SIZE] }
    }
}

static BREAKPOINTS: spin::Mutex<[BreakpointEntry; MAX_BREAKPOINTS]> =
    spin::Mutex::new([BreakpointEntry::empty(); MAX_BREAKPOINTS]);

/// Tracks the reason for an agent invoked breakpoint. This has to be process
/// wide: the trap raised by [`debugger_break`] delivers the reason to the
/// exception path synchronously.
static BREAK_REASON: AtomicU8 = AtomicU8::new(BreakReason::None as u8);

/// Adds a software breakpoint at the specified address.
///
/// Adding an address that already has an active breakpoint succeeds without
/// consuming a slot. Returns false if the table is full or the instruction
/// bytes cannot be accessed.
pub(crate) fn add_software_breakpoint<A: DebuggerArch>(address: u64) -> bool {
    let size = A::BREAKPOINT_INSTRUCTION.len();
    debug_assert!(size <= MAX_BREAKPOINT_SIZE);

    let mut breakpoints = BREAKPOINTS.lock();

    let mut slot = None;
    for (i, entry) in breakpoints.iter().enumerate() {
        if entry.active && entry.address == address {
            return true;
        }

        if !entry.active && slot.is_none() {
            slot = Some(i);
        }
    }

    let Some(slot) = slot else {
        return false;
    };

    let entry = &mut breakpoints[slot];
    if memory::read_memory::<A>(address, &mut entry.original[..size]).is_err() {
        return false;
    }

    if memory::write_memory::<A>(address, A::BREAKPOINT_INSTRUCTION).is_err() {
        return false;
    }

    entry.active = true;
    entry.address = address;
    A::invalidate_icache(address, size);
    true
}

/// Removes the software breakpoint at the specified address, restoring the
/// original instruction bytes. Returns false if no breakpoint matches.
pub(crate) fn remove_software_breakpoint<A: DebuggerArch>(address: u64) -> bool {
    let size = A::BREAKPOINT_INSTRUCTION.len();
    let mut breakpoints = BREAKPOINTS.lock();

    for entry in breakpoints.iter_mut() {
        if entry.active && entry.address == address {
            if memory::write_memory::<A>(address, &entry.original[..size]).is_err() {
                return false;
            }

            entry.active = false;
            A::invalidate_icache(address, size);
            return true;
        }
    }

    false
}

#[cfg(test)]
pub(crate) fn reset_breakpoint_table() {
    *BREAKPOINTS.lock() = [BreakpointEntry::empty(); MAX_BREAKPOINTS];
}

/// Immediately breaks into the debugger with the provided reason.
pub(crate) fn debugger_break<A: DebuggerArch>(reason: BreakReason) {
    BREAK_REASON.store(reason as u8, Ordering::SeqCst);
    A::breakpoint();
    BREAK_REASON.store(BreakReason::None as u8, Ordering::SeqCst);
}

/// Returns the reason for the breakpoint currently being serviced.
pub(crate) fn break_reason() -> BreakReason {
    BreakReason::from_u8(BREAK_REASON.load(Ordering::SeqCst))
}
