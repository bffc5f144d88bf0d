//! Debugger transport and collaborator interfaces.
//!
//! This module contains the traits the agent consumes from the embedding
//! firmware: the byte transport, the watchdog, and the reset service. It also
//! contains the logging suspension helper used while broken in and the small
//! formatting adapter used to build responses in fixed buffers.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use debug_cpu::error::EfiError;

/// Byte level transport to the debugger host.
///
/// Implementations wrap whatever carries the GDB channel (a UART, USB-CDC, or
/// similar). All routines are `&self`; transports are expected to handle their
/// own interior mutability as they will be driven from exception context.
///
pub trait DebugTransport: Sync {
    /// Initializes the transport hardware if needed.
    fn init(&self) -> Result<(), EfiError>;

    /// Reads up to `buffer.len()` bytes, waiting at most `timeout_ms`.
    /// Returns the number of bytes read.
    fn read(&self, buffer: &mut [u8], timeout_ms: u64) -> usize;

    /// Writes the buffer to the transport. Returns the number of bytes written.
    fn write(&self, buffer: &[u8]) -> usize;

    /// Checks if there is data immediately available to read.
    fn poll(&self) -> bool;
}

/// Control over any platform watchdog timers.
///
/// The agent suspends the watchdog for the duration of a debug stop; even a
/// short stop can outlast a platform watchdog deadline.
///
pub trait WatchdogControl: Sync {
    /// Suspends any running watchdog. Returns whether one was running.
    fn suspend(&self) -> bool;

    /// Resumes the watchdog if it was previously running.
    fn resume(&self, was_running: bool);
}

/// A watchdog implementation for platforms without one.
#[derive(Default, Copy, Clone)]
pub struct NullWatchdog {}

impl WatchdogControl for NullWatchdog {
    fn suspend(&self) -> bool {
        false
    }

    fn resume(&self, _was_running: bool) {}
}

/// Platform reset service.
pub trait SystemReset: Sync {
    /// Performs a cold reset of the system. Returning from this routine
    /// indicates the reset failed.
    fn cold_reset(&self);
}

/// Policy for how the debugger will handle logging on the system.
pub enum DebuggerLoggingPolicy {
    /// The debugger will suspend logging while broken in, but will not change
    /// the logging state outside of the debugger. This may cause instability
    /// if the debugger and logging share a transport.
    SuspendLogging,
    /// The debugger will disable all logging after a connection is made. This
    /// is the safest option if the debugger and logging share a transport.
    DisableLogging,
    /// The debugger will not suspend logging while broken in. This should only
    /// be used if the debugger and logging transports are separate.
    FullLogging,
}

/// Structure for suspending logging within a given scope.
pub(crate) struct LoggingSuspender {
    level: log::LevelFilter,
}

impl LoggingSuspender {
    /// Suspend logging within the current scope. When the returned LoggingSuspender
    /// goes out of scope, logging will be restored to the previous level.
    pub fn suspend() -> Self {
        let level = log::max_level();
        log::set_max_level(log::LevelFilter::Off);
        LoggingSuspender { level }
    }
}

impl Drop for LoggingSuspender {
    fn drop(&mut self) {
        log::set_max_level(self.level);
    }
}

/// A [`core::fmt::Write`] adapter over a fixed byte buffer.
///
/// Formatting past the end of the buffer is dropped and recorded so callers
/// can distinguish a truncated response from a complete one.
pub(crate) struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    pos: usize,
    truncated: bool,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        BufferWriter { buffer, pos: 0, truncated: false }
    }

    /// Returns the bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.pos]
    }

    /// Returns the number of bytes written so far.
    pub fn len(&self) -> usize {
        self.pos
    }

    /// Returns true if any output did not fit in the buffer.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl core::fmt::Write for BufferWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let data = s.as_bytes();
        let available = self.buffer.len() - self.pos;
        let len = data.len().min(available);
        self.buffer[self.pos..self.pos + len].copy_from_slice(&data[..len]);
        self.pos += len;
        if len < data.len() {
            self.truncated = true;
        }
        Ok(())
    }
}
