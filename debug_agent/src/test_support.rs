//! Shared fixtures for host tests: a scriptable transport and a controllable
//! architecture backend.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::Mutex;

use debug_cpu::interrupts::ExceptionContext;

use crate::arch::{DebuggerArch, RegisterEntry, TargetInfo, WatchAccess};
use crate::transport::DebugTransport;
use crate::{BreakReason, DebuggerControl, ExceptionInfo, ExceptionKind};

/// Serializes tests that touch process wide state: the breakpoint table, the
/// attribute service registration, and the TestArch statics.
pub(crate) static ARCH_TEST_LOCK: Mutex<()> = Mutex::new(());

static PAGES_ACCESSIBLE: AtomicBool = AtomicBool::new(true);
static CLOCK_MS: AtomicU64 = AtomicU64::new(0);
static BREAKPOINT_COUNT: AtomicUsize = AtomicUsize::new(0);
static LAST_BREAK_REASON: AtomicU8 = AtomicU8::new(BreakReason::None as u8);
static SINGLE_STEP: AtomicBool = AtomicBool::new(false);

/// Architecture backend whose state is fully observable from tests. The
/// clock advances by one millisecond per query so timeout loops terminate
/// deterministically.
pub(crate) enum TestArch {}

impl TestArch {
    pub fn set_pages_accessible(accessible: bool) {
        PAGES_ACCESSIBLE.store(accessible, Ordering::SeqCst);
    }

    pub fn reset_counters() {
        BREAKPOINT_COUNT.store(0, Ordering::SeqCst);
        LAST_BREAK_REASON.store(BreakReason::None as u8, Ordering::SeqCst);
        SINGLE_STEP.store(false, Ordering::SeqCst);
        PAGES_ACCESSIBLE.store(true, Ordering::SeqCst);
    }

    pub fn breakpoint_count() -> usize {
        BREAKPOINT_COUNT.load(Ordering::SeqCst)
    }

    /// The break reason observed at the most recent trap request.
    pub fn last_break_reason() -> BreakReason {
        BreakReason::from_u8(LAST_BREAK_REASON.load(Ordering::SeqCst))
    }

    pub fn single_step_requested() -> bool {
        SINGLE_STEP.load(Ordering::SeqCst)
    }
}

impl DebuggerArch for TestArch {
    const DEFAULT_EXCEPTION_TYPES: &'static [usize] = &[1, 3];
    const BREAKPOINT_INSTRUCTION: &'static [u8] = &[0xCC];
    const TARGET: TargetInfo = TargetInfo { arch: "i386:x86-64", registers_feature: "org.gnu.gdb.i386.core" };

    #[cfg(target_arch = "x86_64")]
    const REGISTER_MAP: &'static [RegisterEntry] = crate::arch::x64::REGISTER_MAP;
    #[cfg(not(target_arch = "x86_64"))]
    const REGISTER_MAP: &'static [RegisterEntry] = &[];

    fn breakpoint() {
        BREAKPOINT_COUNT.fetch_add(1, Ordering::SeqCst);
        LAST_BREAK_REASON.store(crate::breakpoint::break_reason() as u8, Ordering::SeqCst);
    }

    fn process_entry(exception_type: u64, context: &mut ExceptionContext) -> ExceptionInfo {
        let kind = match exception_type {
            1 => ExceptionKind::DebugStep,
            3 => ExceptionKind::Breakpoint,
            14 => ExceptionKind::AccessViolation(0),
            _ => ExceptionKind::GenericFault,
        };

        ExceptionInfo { kind, address: context_pc(context), arch_code: exception_type, context: *context }
    }

    fn process_exit(_exception_info: &mut ExceptionInfo) {}

    fn set_single_step(exception_info: &mut ExceptionInfo) {
        SINGLE_STEP.store(true, Ordering::SeqCst);
        #[cfg(target_arch = "x86_64")]
        {
            exception_info.context.rflags |= 0x100;
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = exception_info;
    }

    fn initialize(_control: &DebuggerControl) {}

    fn add_watchpoint(_address: u64, _length: u64, _access: WatchAccess) -> bool {
        false
    }

    fn remove_watchpoint(_address: u64, _length: u64, _access: WatchAccess) -> bool {
        false
    }

    fn is_page_readable(_address: u64) -> bool {
        PAGES_ACCESSIBLE.load(Ordering::SeqCst)
    }

    fn is_page_writable(_address: u64) -> bool {
        PAGES_ACCESSIBLE.load(Ordering::SeqCst)
    }

    fn invalidate_icache(_address: u64, _length: usize) {}

    fn reboot() -> ! {
        panic!("TestArch reboot requested.");
    }

    fn time_ms() -> u64 {
        CLOCK_MS.fetch_add(1, Ordering::SeqCst)
    }

    fn monitor_system_registers(out: &mut dyn core::fmt::Write) {
        let _ = writeln!(out, "test system registers");
    }

    fn monitor_read_msr(command: &str, out: &mut dyn core::fmt::Write) {
        let _ = writeln!(out, "MSR {}", command);
    }
}

fn context_pc(context: &ExceptionContext) -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            context.rip
        } else if #[cfg(target_arch = "aarch64")] {
            context.elr
        } else {
            context.pc
        }
    }
}

pub(crate) fn breakpoint_context() -> ExceptionContext {
    ExceptionContext::default()
}

pub(crate) fn breakpoint_exception_info() -> ExceptionInfo {
    ExceptionInfo {
        kind: ExceptionKind::Breakpoint,
        address: 0,
        arch_code: 3,
        context: ExceptionContext::default(),
    }
}

/// A transport fed from a script of bytes, recording everything written.
pub(crate) struct ScriptTransport {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl ScriptTransport {
    pub fn new() -> Self {
        ScriptTransport { input: Mutex::new(VecDeque::new()), output: Mutex::new(Vec::new()) }
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Queues a framed, checksummed packet for the payload.
    pub fn push_packet(&self, payload: &[u8]) {
        let checksum = crate::gdb::packet::checksum(payload);
        let pair = crate::gdb::hex::encode_byte(checksum);

        let mut input = self.input.lock().unwrap();
        input.push_back(b'$');
        input.extend(payload.iter().copied());
        input.push_back(b'#');
        input.push_back(pair[0]);
        input.push_back(pair[1]);
    }

    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock().unwrap())
    }

    pub fn has_input(&self) -> bool {
        !self.input.lock().unwrap().is_empty()
    }
}

impl DebugTransport for ScriptTransport {
    fn init(&self) -> Result<(), debug_cpu::error::EfiError> {
        Ok(())
    }

    fn read(&self, buffer: &mut [u8], _timeout_ms: u64) -> usize {
        let mut input = self.input.lock().unwrap();
        let mut count = 0;
        for slot in buffer.iter_mut() {
            match input.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn write(&self, buffer: &[u8]) -> usize {
        self.output.lock().unwrap().extend_from_slice(buffer);
        buffer.len()
    }

    fn poll(&self) -> bool {
        self.has_input()
    }
}

/// Splits a recorded output stream into acknowledgement and packet tokens.
pub(crate) fn parse_stream(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut tokens = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' | b'-' => {
                tokens.push(vec![bytes[index]]);
                index += 1;
            }
            b'$' => {
                let hash = bytes[index..].iter().position(|&byte| byte == b'#').expect("Unterminated frame.");
                let end = index + hash + 3;
                tokens.push(bytes[index..end.min(bytes.len())].to_vec());
                index = end;
            }
            _ => panic!("Unexpected byte 0x{:02x} in output stream.", bytes[index]),
        }
    }
    tokens
}

/// Decodes a hex encoded monitor response into text.
pub(crate) fn decode_hex_text(data: &[u8]) -> String {
    let mut text = String::new();
    for pair in data.chunks(2) {
        let byte = crate::gdb::hex::decode_byte(pair).expect("Invalid hex pair.");
        text.push(byte as char);
    }
    text
}
