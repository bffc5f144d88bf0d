//! Error definitions shared by the debug agent crates.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// EFI style status codes for the small set of failures this workspace can
/// produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfiError {
    /// A parameter was outside the supported range.
    InvalidParameter,
    /// The resource was already claimed.
    AlreadyStarted,
    /// The requested item does not exist.
    NotFound,
    /// The operation is not supported on this target.
    Unsupported,
    /// A fixed capacity pool was exhausted.
    OutOfResources,
    /// The underlying device failed.
    DeviceError,
}
