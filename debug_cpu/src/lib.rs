//! CPU exception plumbing for the UEFI debug agent.
//!
//! This crate contains the architecture specific exception context layouts and
//! the handler registry used to route synchronous exceptions into the debug
//! agent. The platform owns the low level vector stubs; it forwards every
//! exception it takes into [`interrupts::dispatch_exception`] and uses an
//! [`interrupts::InterruptManager`] to let the agent claim the exception types
//! it cares about.
//!
//! ## Examples and Usage
//!
//! ```rust
//! use debug_cpu::interrupts::{dispatch_exception, ExceptionContext, HandlerType, InterruptHandler, Interrupts,
//!     InterruptManager};
//!
//! struct MyHandler;
//!
//! impl InterruptHandler for MyHandler {
//!     fn handle_interrupt(&'static self, _exception_type: usize, _context: &mut ExceptionContext) {
//!         // Inspect or alter the context.
//!     }
//! }
//!
//! static HANDLER: MyHandler = MyHandler;
//!
//! let interrupt_manager = Interrupts::default();
//! interrupt_manager.register_exception_handler(3, HandlerType::Handler(&HANDLER)).unwrap();
//!
//! // Invoked by the platform vector stub when an exception is taken.
//! let mut context = ExceptionContext::default();
//! dispatch_exception(3, &mut context);
//!
//! interrupt_manager.unregister_exception_handler(3).unwrap();
//! ```
//!
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod interrupts;
