//! GDB packet framing.
//!
//! Packets travel as `$<payload>#<checksum>` where the checksum is the 8-bit
//! modular sum of the payload bytes as two lowercase hex digits. Every valid
//! packet is acknowledged with `+`, every rejected one with `-`, and a `-`
//! from the host asks for a resend of the last response.
//!
//! The buffers are static: the stub must be able to service an exception
//! before any allocator exists.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use crate::arch::DebuggerArch;
use crate::transport::DebugTransport;

use super::hex;

pub(crate) const MAX_REQUEST_SIZE: usize = 2048;
pub(crate) const MAX_RESPONSE_SIZE: usize = 0x1000;
pub(crate) const SCRATCH_SIZE: usize = 1024;

/// Static packet buffers, guarded for the duration of a debug session.
pub(crate) struct PacketBuffers {
    /// Incoming request packet, including framing.
    pub request: [u8; MAX_REQUEST_SIZE],
    /// Outgoing framed response.
    pub response: ResponseBuffer,
    /// Staging area for memory chunks and monitor text.
    pub scratch: [u8; SCRATCH_SIZE],
}

impl PacketBuffers {
    pub const fn new() -> Self {
        PacketBuffers { request: [0; MAX_REQUEST_SIZE], response: ResponseBuffer::new(), scratch: [0; SCRATCH_SIZE] }
    }
}

static BUFFERS: spin::Mutex<PacketBuffers> = spin::Mutex::new(PacketBuffers::new());

pub(crate) fn lock_buffers() -> spin::MutexGuard<'static, PacketBuffers> {
    BUFFERS.lock()
}

/// Holds the last framed response so a `-` from the host can be answered with
/// a resend.
pub(crate) struct ResponseBuffer {
    // Room for '$', the payload, and the '#NN' tail.
    data: [u8; MAX_RESPONSE_SIZE + 4],
    len: usize,
    /// Whether the host has acknowledged the last response.
    pub acknowledged: bool,
}

impl ResponseBuffer {
    pub const fn new() -> Self {
        ResponseBuffer { data: [0; MAX_RESPONSE_SIZE + 4], len: 0, acknowledged: true }
    }

    /// The payload area handlers may build a response into directly.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[1..1 + MAX_RESPONSE_SIZE]
    }

    /// Frames the first `payload_len` bytes of the payload area and returns
    /// the full packet to send.
    pub fn seal(&mut self, payload_len: usize) -> &[u8] {
        debug_assert!(payload_len <= MAX_RESPONSE_SIZE);
        let checksum = checksum(&self.data[1..1 + payload_len]);
        self.data[0] = b'$';
        self.data[1 + payload_len] = b'#';
        let pair = hex::encode_byte(checksum);
        self.data[2 + payload_len] = pair[0];
        self.data[3 + payload_len] = pair[1];
        self.len = payload_len + 4;
        self.acknowledged = false;
        &self.data[..self.len]
    }

    /// Copies the payload into the buffer and frames it.
    pub fn set_payload(&mut self, payload: &[u8]) -> &[u8] {
        debug_assert!(payload.len() <= MAX_RESPONSE_SIZE);
        self.data[1..1 + payload.len()].copy_from_slice(payload);
        self.seal(payload.len())
    }

    /// The last framed packet, for resends.
    pub fn last(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// 8-bit modular sum used by the wire format.
pub(crate) fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Reads one byte from the transport, polling for at most `timeout_ms`.
pub(crate) fn read_byte<A: DebuggerArch, T: DebugTransport + ?Sized>(transport: &T, timeout_ms: u64) -> Option<u8> {
    let end_time = A::time_ms() + timeout_ms;
    loop {
        if transport.poll() {
            let mut byte = [0u8; 1];
            if transport.read(&mut byte, timeout_ms) == 1 {
                return Some(byte[0]);
            }
        }

        if A::time_ms() >= end_time {
            return None;
        }

        core::hint::spin_loop();
    }
}

/// Validates the framing and checksum of a received packet, returning the
/// range of the command body on success.
pub(crate) fn validate(packet: &[u8]) -> Result<core::ops::Range<usize>, ()> {
    if packet.first() != Some(&b'$') {
        return Err(());
    }

    let hash = packet.iter().position(|&byte| byte == b'#').ok_or(())?;
    if hash + 2 >= packet.len() {
        return Err(());
    }

    let expected = hex::decode_byte(&packet[hash + 1..hash + 3]).ok_or(())?;
    if checksum(&packet[1..hash]) != expected {
        return Err(());
    }

    Ok(1..hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"OK"), 0x9A);
        assert_eq!(checksum(b"T05thread:01;"), 0x07);
    }

    #[test]
    fn test_seal_and_validate_round_trip() {
        let mut response = ResponseBuffer::new();
        let frame = response.set_payload(b"qXfer:features:read+").to_vec();
        assert_eq!(frame[0], b'$');

        let range = validate(&frame).expect("Failed to validate framed packet.");
        assert_eq!(&frame[range], b"qXfer:features:read+");
    }

    #[test]
    fn test_validate_rejects_corruption() {
        let mut response = ResponseBuffer::new();
        let frame = response.set_payload(b"OK").to_vec();

        // Flipping any payload byte or checksum digit must fail validation.
        for index in 1..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[index] ^= 0x01;
            assert!(validate(&corrupted).is_err(), "byte {} corruption accepted", index);
        }
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(validate(b"").is_err());
        assert!(validate(b"OK#9a").is_err());
        assert!(validate(b"$OK").is_err());
        assert!(validate(b"$OK#9").is_err());
        assert!(validate(b"$OK#zz").is_err());
    }
}
