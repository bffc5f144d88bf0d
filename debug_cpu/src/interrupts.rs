//! Exception routing for the debug agent.
//!
//! The platform's vector stubs call [`dispatch_exception`] with the saved
//! context for every synchronous exception. Handlers are registered per
//! exception type through the [`InterruptManager`] trait. Only one handler may
//! own an exception type at a time; the debug agent claims its set during
//! initialization and releases it on teardown.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use crate::error::EfiError;

mod exception_handling;

pub mod null;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x64;
        /// The saved register state for the compilation target.
        pub type ExceptionContext = x64::ExceptionContextX64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        /// The saved register state for the compilation target.
        pub type ExceptionContext = aarch64::ExceptionContextAArch64;
    } else {
        /// The saved register state for the compilation target.
        pub type ExceptionContext = null::ExceptionContextNull;
    }
}

/// Type for storing the exception type. This corresponds to the architecture
/// specific interrupt type ID.
pub type ExceptionType = usize;

/// Type for storing the handler for a given exception.
pub enum HandlerType {
    /// No handler is registered.
    None,
    /// Handler is an implementation of the interrupt handler trait.
    Handler(&'static dyn InterruptHandler),
}

impl HandlerType {
    /// Returns true if the handler is None.
    fn is_none(&self) -> bool {
        matches!(self, HandlerType::None)
    }
}

/// Trait for structs to handle interrupts.
///
/// Interrupt handlers are expected to be static and are called from the
/// exception handler. Because exceptions can be reentrant, any mutable state
/// within the handler is expected to leverage internal locking.
///
pub trait InterruptHandler: Sync {
    /// Invoked when the registered interrupt is triggered.
    ///
    /// Upon return, the processor will be resumed from the exception with any
    /// changes made to the provided exception context. If it is not safe to
    /// resume, then the handler should panic or otherwise halt the system.
    ///
    fn handle_interrupt(&'static self, exception_type: ExceptionType, context: &mut ExceptionContext);
}

/// Trait for structs that manage exception registration.
///
/// Generic trait that abstracts the architecture and platform specifics for
/// routing exceptions. The default methods operate on the process wide handler
/// registry; platform implementations additionally own the hardware vector
/// setup.
///
pub trait InterruptManager {
    /// Registers a callback for the given exception type.
    fn register_exception_handler(&self, exception_type: ExceptionType, handler: HandlerType) -> Result<(), EfiError> {
        exception_handling::register_exception_handler(exception_type, handler)
    }

    /// Removes the registered exception handler for the given exception type.
    fn unregister_exception_handler(&self, exception_type: ExceptionType) -> Result<(), EfiError> {
        exception_handling::unregister_exception_handler(exception_type)
    }
}

/// Routes an exception taken by the platform vector stubs to the registered
/// handler.
///
/// # Panics
///
/// Panics if no handler has been registered for the exception type; resuming
/// an unhandled synchronous exception would rerun the faulting instruction.
///
pub fn dispatch_exception(exception_type: ExceptionType, context: &mut ExceptionContext) {
    exception_handling::dispatch_exception(exception_type, context)
}

/// A registry-only implementation of the interrupt manager for hosts where the
/// platform owns vector setup, and for tests.
#[derive(Default, Copy, Clone)]
pub struct Interrupts {}

impl Interrupts {
    /// Creates a new registry-only interrupt manager.
    pub const fn new() -> Self {
        Self {}
    }
}

impl InterruptManager for Interrupts {}
