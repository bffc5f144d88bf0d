//! Process wide exception handler registry.
//!
//! The registry has to be static to be reachable from the vector stubs, which
//! carry no caller context. RwLock is used to allow potential nested
//! exceptions to read the table while a registration is in flight elsewhere.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use spin::rwlock::RwLock;

use crate::error::EfiError;
use crate::interrupts::{ExceptionContext, ExceptionType, HandlerType};

// Different architectures have a different number of exception types.
const NUM_EXCEPTION_TYPES: usize = if cfg!(target_arch = "x86_64") {
    256
} else if cfg!(target_arch = "aarch64") {
    4
} else {
    32
};

static EXCEPTION_HANDLERS: [RwLock<HandlerType>; NUM_EXCEPTION_TYPES] = {
    // This clippy warning can be ignored. We are purposefully generating a different `INIT` const for each element.
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RwLock<HandlerType> = RwLock::new(HandlerType::None);
    [INIT; NUM_EXCEPTION_TYPES]
};

/// Registers a handler callback for the provided exception type.
///
/// # Errors
///
/// Returns [`InvalidParameter`](EfiError::InvalidParameter) if the exception type is above the expected range
/// or the handler is `None`.
/// Returns [`AlreadyStarted`](EfiError::AlreadyStarted) if a callback has already been registered.
///
pub(crate) fn register_exception_handler(exception_type: ExceptionType, handler: HandlerType) -> Result<(), EfiError> {
    if exception_type >= NUM_EXCEPTION_TYPES || handler.is_none() {
        return Err(EfiError::InvalidParameter);
    }

    let mut entry = EXCEPTION_HANDLERS[exception_type].write();
    if !(*entry).is_none() {
        return Err(EfiError::AlreadyStarted);
    }

    *entry = handler;
    Ok(())
}

/// Removes the handler callback for the provided exception type.
///
/// # Errors
///
/// Returns [`InvalidParameter`](EfiError::InvalidParameter) if the exception type is above the expected range
/// or no callback currently exists.
///
pub(crate) fn unregister_exception_handler(exception_type: ExceptionType) -> Result<(), EfiError> {
    if exception_type >= NUM_EXCEPTION_TYPES {
        return Err(EfiError::InvalidParameter);
    }

    let mut entry = EXCEPTION_HANDLERS[exception_type].write();
    if (*entry).is_none() {
        return Err(EfiError::InvalidParameter);
    }

    *entry = HandlerType::None;
    Ok(())
}

/// The architecture agnostic dispatch of the exception handler stack.
///
/// # Panics
///
/// Panics if no callback has been registered for a given exception or the
/// handler read lock cannot be acquired.
///
pub(crate) fn dispatch_exception(exception_type: ExceptionType, context: &mut ExceptionContext) {
    let handler_lock =
        EXCEPTION_HANDLERS[exception_type].try_read().expect("Failed to read lock in exception handler!");
    match &*handler_lock {
        HandlerType::Handler(handler) => {
            handler.handle_interrupt(exception_type, context);
        }
        HandlerType::None => {
            log::error!("Unhandled Exception! 0x{:x}", exception_type);
            panic!("Unhandled Exception! 0x{:x}", exception_type);
        }
    }
}
