//! GDB Remote Serial Protocol stub.
//!
//! This module implements the stub the host debugger talks to: packet
//! framing, command dispatch, and the stop loop that owns the CPU while the
//! system is halted. The implementation follows the protocol as documented at
//! <https://sourceware.org/gdb/current/onlinedocs/gdb.html/Remote-Protocol.html>.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

pub(crate) mod hex;
mod monitor;
pub(crate) mod packet;
pub(crate) mod registers;

use core::fmt::Write;
use core::marker::PhantomData;

use crate::arch::DebuggerArch;
use crate::breakpoint;
use crate::memory;
use crate::modules::Modules;
use crate::transport::{BufferWriter, DebugTransport, SystemReset};
use crate::{ExceptionInfo, ExceptionKind};

use packet::{ResponseBuffer, MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE, SCRATCH_SIZE};

/// Error codes surfaced to the host as `E0X`. The numbering is specific to
/// this stub; GDB does not define one.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub(crate) enum GdbError {
    Unsupported = 0x01,
    Internal = 0x02,
    UnknownCommand = 0x03,
    BadRequest = 0x04,
    BadRegisterIndex = 0x05,
    BadMemoryAddress = 0x06,
    ResponseTooLong = 0x07,
}

/// Session state that survives across debug stops.
pub(crate) struct SessionState {
    /// Loop predicate: false while stopped in the stub.
    pub running: bool,
    /// A monitor command requested a reboot on the next resume.
    pub reboot_on_continue: bool,
    /// If non-zero, the next breakpoint stop auto-resumes after this many
    /// milliseconds unless a debugger has connected.
    pub next_breakpoint_timeout_ms: u64,
    /// Set once a well-formed, checksum-valid packet has been received; after
    /// that, stops wait indefinitely for the host.
    pub connection_occurred: bool,
}

impl SessionState {
    pub const fn new() -> Self {
        SessionState {
            running: true,
            reboot_on_continue: false,
            next_breakpoint_timeout_ms: 0,
            connection_occurred: false,
        }
    }
}

/// One debug stop's view of the stub: the transport, the captured exception,
/// and the persistent session state.
pub(crate) struct GdbStub<'a, A: DebuggerArch, T: DebugTransport + ?Sized> {
    transport: &'a T,
    session: &'a mut SessionState,
    exception_info: &'a mut ExceptionInfo,
    modules: &'a spin::Mutex<Modules>,
    reset: Option<&'a dyn SystemReset>,
    response: &'a mut ResponseBuffer,
    scratch: &'a mut [u8; SCRATCH_SIZE],
    _arch: PhantomData<fn() -> A>,
}

impl<'a, A: DebuggerArch, T: DebugTransport + ?Sized> GdbStub<'a, A, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: &'a T,
        session: &'a mut SessionState,
        exception_info: &'a mut ExceptionInfo,
        modules: &'a spin::Mutex<Modules>,
        reset: Option<&'a dyn SystemReset>,
        response: &'a mut ResponseBuffer,
        scratch: &'a mut [u8; SCRATCH_SIZE],
    ) -> Self {
        GdbStub { transport, session, exception_info, modules, reset, response, scratch, _arch: PhantomData }
    }

    /// Runs the stop loop: announces the stop, services packets until the
    /// host resumes the target, and honours the auto-resume deadline for the
    /// initial breakpoint.
    pub fn run(&mut self, request: &mut [u8; MAX_REQUEST_SIZE]) {
        self.session.running = false;

        let deadline = if matches!(self.exception_info.kind, ExceptionKind::Breakpoint)
            && self.session.next_breakpoint_timeout_ms != 0
        {
            let deadline = A::time_ms() + self.session.next_breakpoint_timeout_ms;
            self.session.next_breakpoint_timeout_ms = 0;
            Some(deadline)
        } else {
            None
        };

        self.send_stop_reply();

        while !self.session.running {
            if self.transport.poll() {
                self.process_input(request);
            }

            if let Some(deadline) = deadline {
                if !self.session.connection_occurred && A::time_ms() >= deadline {
                    // Nobody ever connected; run as if there were no debugger.
                    self.session.running = true;
                }
            }

            core::hint::spin_loop();
        }
    }

    /// Reads and services packets until the transport goes idle.
    fn process_input(&mut self, request: &mut [u8; MAX_REQUEST_SIZE]) {
        loop {
            let Some(first) = packet::read_byte::<A, T>(self.transport, 10) else {
                return;
            };

            match first {
                b'-' if !self.response.acknowledged => {
                    self.resend();
                    continue;
                }
                b'+' => {
                    self.response.acknowledged = true;
                    continue;
                }
                b'$' => {}
                // Not the beginning of a packet, throw it away.
                _ => continue,
            }

            request[0] = b'$';
            let mut length = 1;
            loop {
                if length >= MAX_REQUEST_SIZE {
                    self.send_ack(false);
                    return;
                }

                let Some(byte) = packet::read_byte::<A, T>(self.transport, 1000) else {
                    self.send_ack(false);
                    return;
                };

                request[length] = byte;
                length += 1;

                // The packet always ends in #NN, look for that pattern.
                if length >= 4 && request[length - 3] == b'#' {
                    break;
                }
            }

            self.process_packet(&request[..length]);
        }
    }

    fn process_packet(&mut self, request: &[u8]) {
        match packet::validate(request) {
            Ok(body) => {
                self.send_ack(true);
                self.session.connection_occurred = true;
                self.execute_command(&request[body]);
            }
            Err(_) => self.send_ack(false),
        }
    }

    /// Routes a validated command to the appropriate handler.
    fn execute_command(&mut self, command: &[u8]) {
        let Some(&first) = command.first() else {
            return self.send_error(GdbError::UnknownCommand);
        };

        match first {
            b'g' => self.read_general_registers(),
            b'G' => self.write_general_registers(&command[1..]),
            b'p' => self.read_register(&command[1..]),
            b'P' => self.write_register(&command[1..]),
            b'm' => self.memory_read(&command[1..]),
            b'M' => self.memory_write(&command[1..]),
            b'v' => self.v_command(&command[1..]),
            b'q' => self.query(&command[1..]),
            // Thread selection: there is only one thread.
            b'H' => self.send_response(b"OK"),
            b'?' => self.send_stop_reply(),
            // Extended mode is accepted but changes nothing.
            b'!' => self.send_response(b"OK"),
            b'Z' => self.breakpoint_command(false, &command[1..]),
            b'z' => self.breakpoint_command(true, &command[1..]),
            b'r' | b'R' => self.reboot_command(),
            _ => self.send_error(GdbError::UnknownCommand),
        }
    }

    fn read_general_registers(&mut self) {
        let mut pos = 0;
        let mut overflow = false;
        let payload = self.response.payload_mut();
        for entry in A::REGISTER_MAP {
            match registers::read_register(&self.exception_info.context, entry, &mut payload[pos..]) {
                Some(chars) => pos += chars,
                None => {
                    overflow = true;
                    break;
                }
            }
        }

        if overflow {
            self.send_error(GdbError::ResponseTooLong);
        } else {
            self.send_sealed(pos);
        }
    }

    fn write_general_registers(&mut self, data: &[u8]) {
        let mut offset = 0;
        for entry in A::REGISTER_MAP {
            match registers::write_register(&mut self.exception_info.context, entry, &data[offset.min(data.len())..]) {
                Ok(chars) => offset += chars,
                Err(_) => return self.send_error(GdbError::Internal),
            }
        }

        self.send_response(b"OK");
    }

    fn read_register(&mut self, args: &[u8]) {
        let Some(index) = hex::parse_hex_u64(args) else {
            return self.send_error(GdbError::BadRequest);
        };

        let Some(entry) = A::REGISTER_MAP.get(index as usize) else {
            return self.send_error(GdbError::BadRegisterIndex);
        };

        let payload = self.response.payload_mut();
        let chars = registers::read_register(&self.exception_info.context, entry, payload);
        match chars {
            Some(chars) => self.send_sealed(chars),
            None => self.send_error(GdbError::ResponseTooLong),
        }
    }

    fn write_register(&mut self, args: &[u8]) {
        let Some((index_str, value_str)) = split_once(args, b'=') else {
            return self.send_error(GdbError::BadRequest);
        };

        let Some(index) = hex::parse_hex_u64(index_str) else {
            return self.send_error(GdbError::BadRequest);
        };

        let Some(entry) = A::REGISTER_MAP.get(index as usize) else {
            return self.send_error(GdbError::BadRegisterIndex);
        };

        match registers::write_register(&mut self.exception_info.context, entry, value_str) {
            Ok(_) => self.send_response(b"OK"),
            Err(_) => self.send_error(GdbError::Internal),
        }
    }

    fn memory_read(&mut self, args: &[u8]) {
        let Some((address_str, length_str)) = split_once(args, b',') else {
            return self.send_error(GdbError::BadRequest);
        };

        let (Some(address), Some(length)) = (hex::parse_hex_u64(address_str), hex::parse_hex_u64(length_str)) else {
            return self.send_error(GdbError::BadRequest);
        };

        if length > (MAX_RESPONSE_SIZE / 2) as u64 {
            return self.send_error(GdbError::ResponseTooLong);
        }

        let mut address = address;
        let mut remaining = length as usize;
        let mut pos = 0;
        while remaining > 0 {
            let chunk = remaining.min(SCRATCH_SIZE);
            if memory::read_memory::<A>(address, &mut self.scratch[..chunk]).is_err() {
                return self.send_error(GdbError::BadMemoryAddress);
            }

            let payload = self.response.payload_mut();
            for &byte in &self.scratch[..chunk] {
                let pair = hex::encode_byte(byte);
                payload[pos] = pair[0];
                payload[pos + 1] = pair[1];
                pos += 2;
            }

            address += chunk as u64;
            remaining -= chunk;
        }

        self.send_sealed(pos);
    }

    fn memory_write(&mut self, args: &[u8]) {
        let Some((range, data)) = split_once(args, b':') else {
            return self.send_error(GdbError::BadRequest);
        };

        let Some((address_str, length_str)) = split_once(range, b',') else {
            return self.send_error(GdbError::BadRequest);
        };

        let (Some(address), Some(length)) = (hex::parse_hex_u64(address_str), hex::parse_hex_u64(length_str)) else {
            return self.send_error(GdbError::BadRequest);
        };

        // Two hex characters for every byte written.
        if data.len() as u64 != length * 2 {
            return self.send_error(GdbError::BadRequest);
        }

        let mut address = address;
        let mut data = data;
        while !data.is_empty() {
            let chunk = (data.len() / 2).min(SCRATCH_SIZE);
            for i in 0..chunk {
                match hex::decode_byte(&data[i * 2..i * 2 + 2]) {
                    Some(byte) => self.scratch[i] = byte,
                    None => return self.send_error(GdbError::BadRequest),
                }
            }

            if memory::write_memory::<A>(address, &self.scratch[..chunk]).is_err() {
                return self.send_error(GdbError::BadMemoryAddress);
            }

            address += chunk as u64;
            data = &data[chunk * 2..];
        }

        self.send_response(b"OK");
    }

    fn breakpoint_command(&mut self, remove: bool, args: &[u8]) {
        let Some((type_str, rest)) = split_once(args, b',') else {
            return self.send_error(GdbError::BadRequest);
        };

        let Some((address_str, _length_str)) = split_once(rest, b',') else {
            return self.send_error(GdbError::BadRequest);
        };

        // The length is ignored; a software breakpoint has a fixed size per
        // architecture.
        let (Some(kind), Some(address)) = (hex::parse_hex_u64(type_str), hex::parse_hex_u64(address_str)) else {
            return self.send_error(GdbError::BadRequest);
        };

        if kind != 0 {
            return self.send_error(GdbError::Unsupported);
        }

        let result = if remove {
            breakpoint::remove_software_breakpoint::<A>(address)
        } else {
            breakpoint::add_software_breakpoint::<A>(address)
        };

        if result {
            self.send_response(b"OK");
        } else {
            self.send_error(GdbError::Internal);
        }
    }

    fn v_command(&mut self, args: &[u8]) {
        if args == b"Cont?" {
            return self.send_response(b"vCont;c;C;s;S");
        }

        if let Some(actions) = args.strip_prefix(b"Cont;") {
            match actions.first().copied() {
                Some(b'c') => {
                    self.session.running = true;
                    return;
                }
                Some(b's') => {
                    A::set_single_step(self.exception_info);
                    self.session.running = true;
                    return;
                }
                _ => {}
            }
        }

        // An empty response declines an unknown v command.
        self.send_response(b"");
    }

    fn query(&mut self, args: &[u8]) {
        if args.starts_with(b"Supported") {
            self.send_response(b"PacketSize=1000;qXfer:features:read+;vContSupported+");
        } else if args.starts_with(b"fThreadInfo") {
            // Only one thread.
            self.send_response(b"m01");
        } else if args.starts_with(b"sThreadInfo") {
            self.send_response(b"l");
        } else if args.starts_with(b"Xfer:features:read:target.xml") {
            self.target_description_xml();
        } else if args.starts_with(b"Xfer:features:read:registers.xml") {
            self.target_registers_xml();
        } else if let Some(command) = args.strip_prefix(b"Rcmd,") {
            self.monitor_command(command);
        } else if args.starts_with(b"Attached") {
            // Attached to an existing process.
            self.send_response(b"1");
        } else {
            // An empty response declines an unsupported query.
            self.send_response(b"");
        }
    }

    fn target_description_xml(&mut self) {
        let payload = self.response.payload_mut();
        let mut writer = BufferWriter::new(payload);
        let _ = write!(
            writer,
            concat!(
                "l<?xml version=\"1.0\"?>",
                "<!DOCTYPE target SYSTEM \"gdb-target.dtd\">",
                "<target>",
                "<architecture>{}</architecture>",
                "<xi:include href=\"registers.xml\"/>",
                "</target>"
            ),
            A::TARGET.arch
        );

        let truncated = writer.truncated();
        let len = writer.len();
        if truncated {
            self.send_error(GdbError::ResponseTooLong);
        } else {
            self.send_sealed(len);
        }
    }

    fn target_registers_xml(&mut self) {
        let payload = self.response.payload_mut();
        let mut writer = BufferWriter::new(payload);
        let _ = write!(
            writer,
            "l<?xml version=\"1.0\"?><!DOCTYPE target SYSTEM \"gdb-target.dtd\"><feature name=\"{}\">",
            A::TARGET.registers_feature
        );

        for (number, entry) in A::REGISTER_MAP.iter().enumerate() {
            let _ = write!(
                writer,
                "<reg name=\"{}\" bitsize=\"{}\" type=\"{}\" regnum=\"{}\"/>",
                entry.name,
                entry.size * 8,
                entry.ty,
                number
            );
        }

        let _ = writer.write_str("</feature>");

        let truncated = writer.truncated();
        let len = writer.len();
        if truncated {
            self.send_error(GdbError::ResponseTooLong);
        } else {
            self.send_sealed(len);
        }
    }

    fn reboot_command(&mut self) {
        match self.reset {
            Some(reset) => reset.cold_reset(),
            None => A::reboot(),
        }

        // The reset service returned; report the failure.
        self.send_error(GdbError::Unsupported);
    }

    fn send_ack(&mut self, positive: bool) {
        self.transport.write(if positive { b"+" } else { b"-" });
    }

    fn send_response(&mut self, payload: &[u8]) {
        let frame = self.response.set_payload(payload);
        self.transport.write(frame);
    }

    fn send_sealed(&mut self, payload_len: usize) {
        let frame = self.response.seal(payload_len);
        self.transport.write(frame);
    }

    fn resend(&mut self) {
        let frame = self.response.last();
        if frame.len() >= 4 {
            self.transport.write(frame);
        }
    }

    fn send_error(&mut self, error: GdbError) {
        let pair = hex::encode_byte(error as u8);
        let payload = [b'E', pair[0], pair[1]];
        self.send_response(&payload);
    }

    fn send_stop_reply(&mut self) {
        self.send_response(b"T05thread:01;");
    }
}

/// Splits a byte slice at the first occurrence of the separator.
fn split_once(data: &[u8], separator: u8) -> Option<(&[u8], &[u8])> {
    let index = data.iter().position(|&byte| byte == separator)?;
    Some((&data[..index], &data[index + 1..]))
}
