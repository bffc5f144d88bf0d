//! Null exception context for unsupported host architectures.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Placeholder context carrying only a program counter and status word so the
/// architecture agnostic code has something to address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionContextNull {
    pub pc: u64,
    pub flags: u64,
}
