//! Monitor (`qRcmd`) command handling.
//!
//! Monitor commands are specific to this debugger and are not part of the GDB
//! specification. The command arrives hex encoded; the first byte of the
//! decoded text selects the operation and the textual response is hex encoded
//! again before framing.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::fmt::Write;

use crate::arch::DebuggerArch;
use crate::breakpoint;
use crate::transport::{BufferWriter, DebugTransport};

use super::{hex, GdbError, GdbStub};

/// Decoded monitor commands are capped well below the scratch area; they are
/// short by construction.
const MAX_MONITOR_COMMAND: usize = 128;

impl<A: DebuggerArch, T: DebugTransport + ?Sized> GdbStub<'_, A, T> {
    /// Decodes and services a monitor command.
    pub(super) fn monitor_command(&mut self, command_hex: &[u8]) {
        if command_hex.len() % 2 != 0 || command_hex.len() / 2 >= MAX_MONITOR_COMMAND {
            return self.send_error(GdbError::BadRequest);
        }

        let mut command = [0u8; MAX_MONITOR_COMMAND];
        let length = command_hex.len() / 2;
        for i in 0..length {
            match hex::decode_byte(&command_hex[i * 2..i * 2 + 2]) {
                Some(byte) => command[i] = byte,
                None => return self.send_error(GdbError::BadRequest),
            }
        }

        // Build the textual response in the scratch area, then hex encode it
        // into the response payload.
        let mut writer = BufferWriter::new(self.scratch.as_mut_slice());
        match command[..length].first().copied() {
            // Agent information.
            Some(b'?') => {
                let _ = write!(
                    writer,
                    concat!("UEFI Debug Agent ", env!("CARGO_PKG_VERSION"), "\n"),
                );
                let _ = writeln!(writer, "Exception Type: {}", self.exception_info.kind);
                let _ = writeln!(writer, "Exception Address: 0x{:x}", self.exception_info.address);
                let _ = writeln!(writer, "Architecture Exception Code: 0x{:x}", self.exception_info.arch_code);
                let _ = writeln!(writer, "Break Reason: {}", breakpoint::break_reason().as_str());
            }
            // Architecture system register dump.
            Some(b'i') => A::monitor_system_registers(&mut writer),
            // MSR read.
            Some(b'm') => {
                let argument = core::str::from_utf8(&command[1..length]).unwrap_or("");
                A::monitor_read_msr(argument, &mut writer);
            }
            // Reboot on the next continue.
            Some(b'R') => {
                self.session.reboot_on_continue = true;
                let _ = writeln!(writer, "Will reboot on continue.");
            }
            // Break on module load. "*" breaks on every load.
            Some(b'b') => {
                let name = core::str::from_utf8(&command[1..length]).unwrap_or("").trim();
                let installed = if name == "*" {
                    self.modules.lock().break_on_all();
                    true
                } else {
                    self.modules.lock().add_module_breakpoint(name)
                };

                if installed {
                    let _ = writeln!(writer, "Will break on load for {}", name);
                } else {
                    let _ = writeln!(writer, "FAILED to set break on load for {}", name);
                }
            }
            _ => {
                let text = core::str::from_utf8(&command[..length]).unwrap_or("");
                let _ = writeln!(writer, "Unknown command '{}'", text);
            }
        }

        let text_length = writer.len();
        if text_length * 2 > super::packet::MAX_RESPONSE_SIZE {
            return self.send_error(GdbError::ResponseTooLong);
        }

        let payload = self.response.payload_mut();
        for (i, &byte) in self.scratch[..text_length].iter().enumerate() {
            let pair = hex::encode_byte(byte);
            payload[i * 2] = pair[0];
            payload[i * 2 + 1] = pair[1];
        }

        self.send_sealed(text_length * 2);
    }
}
