//! Debug agent orchestration.
//!
//! This module contains the [`DebugAgent`] struct: initialization into the
//! exception handlers, the bracketing of a debug stop (watchdog and logging
//! suspension), the module load hook, and the transport poll for host
//! break-in requests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::marker::PhantomData;

use debug_cpu::interrupts::{ExceptionContext, ExceptionType, HandlerType, InterruptHandler, InterruptManager};

use crate::arch::{DebuggerArch, SystemArch};
use crate::breakpoint::debugger_break;
use crate::gdb::{packet, GdbStub, SessionState};
use crate::modules::Modules;
use crate::transport::{DebugTransport, DebuggerLoggingPolicy, LoggingSuspender, SystemReset, WatchdogControl};
use crate::{BreakReason, DebugError, DebugPhase, Debugger, DebuggerControl, ExceptionInfo};

/// The host break-in byte (Ctrl-C).
const CTRL_C: u8 = 0x03;

/// UEFI Debug Agent
///
/// Wraps the debug transport and owns the session state. The platform creates
/// a static instance, optionally customizes it with the `with_*` builder
/// routines, and registers it with [`crate::set_debugger`].
///
pub struct DebugAgent<T, A = SystemArch>
where
    T: DebugTransport + 'static,
    A: DebuggerArch,
{
    /// The transport for the debugger.
    transport: T,
    /// Which enable flag of the control record applies.
    phase: DebugPhase,
    /// The exception types the debugger will register for.
    exception_types: &'static [usize],
    /// Controls what the debugger does with logging while stopped.
    log_policy: DebuggerLoggingPolicy,
    /// Whether initializing the transport should be skipped.
    no_transport_init: bool,
    /// Platform watchdog, suspended for the duration of a stop.
    watchdog: Option<&'static dyn WatchdogControl>,
    /// Platform reset service used for reboot requests.
    reset: Option<&'static dyn SystemReset>,
    /// Runtime configuration.
    config: spin::RwLock<AgentConfig>,
    /// State owned by the active debug stop.
    internal: spin::Mutex<AgentInternal>,
    /// Loaded module tracking for the module load hook.
    modules: spin::Mutex<Modules>,
    _arch: PhantomData<fn() -> A>,
}

struct AgentConfig {
    enabled: bool,
    initialized: bool,
    initial_break: bool,
    initial_break_timeout_ms: u64,
}

struct AgentInternal {
    session: SessionState,
    /// Whether a first stop has already drained stale transport bytes.
    started: bool,
}

impl<T: DebugTransport + 'static, A: DebuggerArch> DebugAgent<T, A> {
    /// Creates a new debug agent over the provided transport.
    pub const fn new(transport: T) -> Self {
        DebugAgent {
            transport,
            phase: DebugPhase::Dxe,
            exception_types: A::DEFAULT_EXCEPTION_TYPES,
            log_policy: DebuggerLoggingPolicy::SuspendLogging,
            no_transport_init: false,
            watchdog: None,
            reset: None,
            config: spin::RwLock::new(AgentConfig {
                enabled: false,
                initialized: false,
                initial_break: false,
                initial_break_timeout_ms: 0,
            }),
            internal: spin::Mutex::new(AgentInternal { session: SessionState::new(), started: false }),
            modules: spin::Mutex::new(Modules::new()),
            _arch: PhantomData,
        }
    }

    /// Forces the debugger to be enabled regardless of the control record.
    /// This is for development use; it also forces the initial breakpoint
    /// with no timeout so the build cannot ship unnoticed. If `false` is
    /// provided the configuration is unchanged.
    pub const fn with_force_enable(mut self, enabled: bool) -> Self {
        if enabled {
            self.config = spin::RwLock::new(AgentConfig {
                enabled: true,
                initialized: false,
                initial_break: true,
                initial_break_timeout_ms: 0,
            });
        }
        self
    }

    /// Configures the logging policy for the debugger. By default logging is
    /// suspended while broken in.
    pub const fn with_log_policy(mut self, policy: DebuggerLoggingPolicy) -> Self {
        self.log_policy = policy;
        self
    }

    /// Prevents the debugger from initializing the transport. Suggested when
    /// the transport is shared with the logging device.
    pub const fn without_transport_init(mut self) -> Self {
        self.no_transport_init = true;
        self
    }

    /// Customizes the exception types for which the debugger is invoked.
    pub const fn with_exception_types(mut self, exception_types: &'static [usize]) -> Self {
        self.exception_types = exception_types;
        self
    }

    /// Selects the firmware phase this instance is embedded in.
    pub const fn with_phase(mut self, phase: DebugPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Provides the platform watchdog to suspend during debug stops.
    pub const fn with_watchdog(mut self, watchdog: &'static dyn WatchdogControl) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Provides the platform reset service used for reboot requests.
    pub const fn with_reset(mut self, reset: &'static dyn SystemReset) -> Self {
        self.reset = Some(reset);
        self
    }

    /// Runtime configuration of the debugger, for platforms that decide
    /// enablement from policy rather than the control record.
    pub fn configure(&self, enabled: bool, initial_break: bool, initial_break_timeout_ms: u64) {
        let mut config = self.config.write();
        config.enabled = enabled;
        config.initial_break = initial_break;
        config.initial_break_timeout_ms = initial_break_timeout_ms;
    }

    /// Enters the stub for a captured exception and services the host until
    /// the target is resumed.
    fn enter_debugger(&'static self, exception_info: &mut ExceptionInfo) -> Result<(), DebugError> {
        let mut internal = self.internal.try_lock().ok_or(DebugError::Reentry)?;

        if !self.config.read().initialized {
            return Err(DebugError::NotInitialized);
        }

        // Squelch logging output while stopped; it would corrupt the GDB
        // channel. Suspension is restored when the guard drops.
        let _log_suspend = match self.log_policy {
            DebuggerLoggingPolicy::SuspendLogging => Some(LoggingSuspender::suspend()),
            DebuggerLoggingPolicy::DisableLogging => {
                log::set_max_level(log::LevelFilter::Off);
                None
            }
            DebuggerLoggingPolicy::FullLogging => None,
        };

        if !internal.started {
            // Flush any stale data from the transport before the first
            // exchange.
            let mut byte = [0u8; 1];
            while self.transport.poll() {
                self.transport.read(&mut byte, 0);
            }
            internal.started = true;
        }

        {
            let mut buffers = packet::lock_buffers();
            let packet::PacketBuffers { request, response, scratch } = &mut *buffers;

            let mut stub = GdbStub::<A, T>::new(
                &self.transport,
                &mut internal.session,
                exception_info,
                &self.modules,
                self.reset,
                response,
                scratch,
            );
            stub.run(request);
        }

        if internal.session.reboot_on_continue {
            if let Some(reset) = self.reset {
                reset.cold_reset();
            }
            A::reboot();
        }

        Ok(())
    }
}

impl<T: DebugTransport + 'static, A: DebuggerArch> Debugger for DebugAgent<T, A> {
    fn initialize(&'static self, interrupt_manager: &mut dyn InterruptManager, control: &DebuggerControl) {
        let (enabled, initial_break, timeout) = {
            let config = self.config.read();
            let phase_enabled = match self.phase {
                DebugPhase::Dxe => control.flags.dxe_debug_enabled(),
                DebugPhase::Mm => control.flags.mm_debug_enabled(),
            };

            let timeout = if control.flags.initial_breakpoint() {
                control.initial_breakpoint_timeout_ms
            } else {
                config.initial_break_timeout_ms
            };

            (
                config.enabled || phase_enabled,
                config.initial_break || control.flags.initial_breakpoint(),
                timeout,
            )
        };

        if !enabled {
            log::info!("Debugger is disabled.");
            return;
        }

        log::info!("Initializing debugger.");

        if !self.no_transport_init && self.transport.init().is_err() {
            log::error!("Failed to initialize the debugger transport.");
            return;
        }

        // Initialize any architecture specifics.
        A::initialize(control);

        // Setup exception handlers.
        for exception_type in self.exception_types {
            // Remove the existing handler. Don't care about the return since
            // there may not be a handler anyways.
            let _ = interrupt_manager.unregister_exception_handler(*exception_type);

            let result = interrupt_manager.register_exception_handler(*exception_type, HandlerType::Handler(self));
            if result.is_err() {
                log::error!("Failed to register debugger exception handler for type {}: {:?}", exception_type, result);
            }
        }

        {
            let mut config = self.config.write();
            config.enabled = true;
            config.initialized = true;
        }

        if initial_break {
            self.internal.lock().session.next_breakpoint_timeout_ms = timeout;
            log::error!("************************************");
            log::error!("***  Initial debug breakpoint!   ***");
            log::error!("************************************");
            debugger_break::<A>(BreakReason::Initial);
            log::info!("Resuming from initial breakpoint.");
        }
    }

    fn enabled(&'static self) -> bool {
        self.config.read().enabled
    }

    fn notify_module_load(&'static self, module_name: &str, address: usize, length: usize) {
        if !self.enabled() {
            return;
        }

        let break_requested = {
            let mut modules = self.modules.lock();
            modules.add_module(module_name, address, length);
            modules.check_module_breakpoints(module_name)
        };

        if break_requested {
            log::info!("Module load breakpoint: {} - 0x{:x} - 0x{:x}", module_name, address, length);
            debugger_break::<A>(BreakReason::ModuleLoad);
        }
    }

    fn poll_debugger(&'static self) {
        if !self.enabled() {
            return;
        }

        while self.transport.poll() {
            let mut byte = [0u8; 1];
            if self.transport.read(&mut byte, 10) != 1 {
                break;
            }

            if byte[0] == CTRL_C {
                debugger_break::<A>(BreakReason::DebuggerBreak);
            }
        }
    }
}

impl<T: DebugTransport + 'static, A: DebuggerArch> InterruptHandler for DebugAgent<T, A> {
    fn handle_interrupt(&'static self, exception_type: ExceptionType, context: &mut ExceptionContext) {
        // Suspend the watchdog while handling debug events. Even simple
        // events, like symbol loading, can wait in the debugger if there was
        // a pending break-in.
        let watchdog_state = self.watchdog.map(|watchdog| watchdog.suspend());

        let mut exception_info = A::process_entry(exception_type as u64, context);

        if let Err(error) = self.enter_debugger(&mut exception_info) {
            debugger_crash(error);
        }

        A::process_exit(&mut exception_info);
        *context = exception_info.context;

        if let (Some(watchdog), Some(was_running)) = (self.watchdog, watchdog_state) {
            watchdog.resume(was_running);
        }
    }
}

/// The agent itself failed while servicing a stop. Once classification or
/// session state is lost, resuming would corrupt host visible state; halt
/// the CPU where the wreckage can be inspected.
fn debugger_crash(error: DebugError) -> ! {
    log::set_max_level(log::LevelFilter::Error);
    log::error!("DEBUGGER CRASH! Error: {:?}", error);

    loop {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use debug_cpu::interrupts::Interrupts;

    type TestAgent = DebugAgent<ScriptTransport, TestArch>;

    struct CountingWatchdog {
        suspends: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl CountingWatchdog {
        const fn new() -> Self {
            CountingWatchdog { suspends: AtomicUsize::new(0), resumes: AtomicUsize::new(0) }
        }
    }

    impl WatchdogControl for CountingWatchdog {
        fn suspend(&self) -> bool {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn resume(&self, was_running: bool) {
            assert!(was_running);
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FlagReset {
        requested: AtomicBool,
    }

    impl SystemReset for FlagReset {
        fn cold_reset(&self) {
            self.requested.store(true, Ordering::SeqCst);
        }
    }

    fn leaked_agent(agent: TestAgent) -> &'static TestAgent {
        Box::leak(Box::new(agent))
    }

    fn enabled_control() -> DebuggerControl {
        let mut control = DebuggerControl::new();
        control.flags = control.flags.with_dxe_debug_enabled(true);
        control
    }

    #[test]
    fn test_disabled_agent_is_inert() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        let agent = leaked_agent(DebugAgent::new(ScriptTransport::new()));

        let mut interrupt_manager = Interrupts::default();
        agent.initialize(&mut interrupt_manager, &DebuggerControl::new());
        assert!(!agent.enabled());

        // Without enablement the poll and module hooks do nothing.
        TestArch::reset_counters();
        agent.poll_debugger();
        agent.notify_module_load("anything.efi", 0x1000, 0x1000);
        assert_eq!(TestArch::breakpoint_count(), 0);
    }

    #[test]
    fn test_initialize_registers_and_breaks() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        let agent =
            leaked_agent(DebugAgent::new(ScriptTransport::new()).with_exception_types(&[20, 21]));
        let mut interrupt_manager = Interrupts::default();

        let mut control = enabled_control();
        control.flags = control.flags.with_initial_breakpoint(true);
        control.initial_breakpoint_timeout_ms = 123;
        agent.initialize(&mut interrupt_manager, &control);

        assert!(agent.enabled());
        // The initial break was requested with the configured timeout armed.
        assert_eq!(TestArch::breakpoint_count(), 1);
        assert_eq!(TestArch::last_break_reason(), BreakReason::Initial);
        assert_eq!(agent.internal.lock().session.next_breakpoint_timeout_ms, 123);

        // The exception types are claimed; a second registration fails.
        assert!(interrupt_manager.register_exception_handler(20, HandlerType::Handler(agent)).is_err());
        interrupt_manager.unregister_exception_handler(20).unwrap();
        interrupt_manager.unregister_exception_handler(21).unwrap();
    }

    #[test]
    fn test_exception_round_trip_with_watchdog() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        static WATCHDOG: CountingWatchdog = CountingWatchdog::new();
        let agent = leaked_agent(
            DebugAgent::new(ScriptTransport::new()).with_exception_types(&[22]).with_watchdog(&WATCHDOG),
        );

        let mut interrupt_manager = Interrupts::default();
        agent.initialize(&mut interrupt_manager, &enabled_control());

        // Not the first stop; the stale-byte flush has already happened.
        agent.internal.lock().started = true;
        agent.transport.push_packet(b"vCont;c");

        let mut context = breakpoint_context();
        agent.handle_interrupt(3, &mut context);

        let stream = parse_stream(&agent.transport.take_output());
        assert_eq!(stream[0], b"$T05thread:01;#07".to_vec());
        assert_eq!(WATCHDOG.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(WATCHDOG.resumes.load(Ordering::SeqCst), 1);

        interrupt_manager.unregister_exception_handler(22).unwrap();
    }

    #[test]
    fn test_first_stop_flushes_stale_bytes() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        let agent = leaked_agent(DebugAgent::new(ScriptTransport::new()).with_exception_types(&[27]));
        let mut interrupt_manager = Interrupts::default();
        agent.initialize(&mut interrupt_manager, &enabled_control());

        // Garbage left over from before the debugger owned the transport.
        agent.transport.push_bytes(b"\x00\xFFnoise");
        agent.internal.lock().session.next_breakpoint_timeout_ms = 20;

        let mut context = breakpoint_context();
        agent.handle_interrupt(3, &mut context);

        // The noise was consumed before the stop reply went out and never
        // reached the packet parser.
        let stream = parse_stream(&agent.transport.take_output());
        assert_eq!(stream, vec![b"$T05thread:01;#07".to_vec()]);
        assert!(!agent.transport.has_input());

        interrupt_manager.unregister_exception_handler(27).unwrap();
    }

    #[test]
    fn test_initial_breakpoint_times_out() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        let agent = leaked_agent(DebugAgent::new(ScriptTransport::new()).with_exception_types(&[23]));
        let mut interrupt_manager = Interrupts::default();

        let mut control = enabled_control();
        control.flags = control.flags.with_initial_breakpoint(true);
        control.initial_breakpoint_timeout_ms = 50;
        agent.initialize(&mut interrupt_manager, &control);

        // Simulate the trap raised by the initial break. No host ever sends
        // a byte; the stop must resume on its own.
        let mut context = breakpoint_context();
        agent.handle_interrupt(3, &mut context);

        let stream = parse_stream(&agent.transport.take_output());
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0], b"$T05thread:01;#07".to_vec());
        assert_eq!(agent.internal.lock().session.next_breakpoint_timeout_ms, 0);

        interrupt_manager.unregister_exception_handler(23).unwrap();
    }

    #[test]
    fn test_poll_debugger_break_in() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        let agent = leaked_agent(DebugAgent::new(ScriptTransport::new()).with_exception_types(&[24]));
        let mut interrupt_manager = Interrupts::default();
        agent.initialize(&mut interrupt_manager, &enabled_control());

        // Unrelated bytes are discarded; the break-in byte raises the trap.
        agent.transport.push_bytes(&[0x41, CTRL_C]);
        agent.poll_debugger();

        assert_eq!(TestArch::breakpoint_count(), 1);
        assert_eq!(TestArch::last_break_reason(), BreakReason::DebuggerBreak);

        interrupt_manager.unregister_exception_handler(24).unwrap();
    }

    #[test]
    fn test_module_load_break() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        let agent = leaked_agent(DebugAgent::new(ScriptTransport::new()).with_exception_types(&[25]));
        let mut interrupt_manager = Interrupts::default();
        agent.initialize(&mut interrupt_manager, &enabled_control());

        agent.modules.lock().add_module_breakpoint("TestDriver");

        agent.notify_module_load("other.efi", 0x1000, 0x100);
        assert_eq!(TestArch::breakpoint_count(), 0);

        agent.notify_module_load("fv0\\TESTDRIVER.efi", 0x2000, 0x100);
        assert_eq!(TestArch::breakpoint_count(), 1);
        assert_eq!(TestArch::last_break_reason(), BreakReason::ModuleLoad);

        interrupt_manager.unregister_exception_handler(25).unwrap();
    }

    #[test]
    fn test_reboot_command_uses_reset_service() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::reset_counters();

        static RESET: FlagReset = FlagReset { requested: AtomicBool::new(false) };
        let agent = leaked_agent(
            DebugAgent::new(ScriptTransport::new()).with_exception_types(&[26]).with_reset(&RESET),
        );

        let mut interrupt_manager = Interrupts::default();
        agent.initialize(&mut interrupt_manager, &enabled_control());

        agent.internal.lock().started = true;
        agent.transport.push_packet(b"r");
        agent.transport.push_packet(b"vCont;c");

        let mut context = breakpoint_context();
        agent.handle_interrupt(3, &mut context);

        assert!(RESET.requested.load(Ordering::SeqCst));

        // The reset service returned, so the failure was reported.
        let stream = parse_stream(&agent.transport.take_output());
        let body = crate::gdb::packet::validate(&stream[2]).expect("Invalid response frame.");
        assert_eq!(&stream[2][body], b"E01");

        interrupt_manager.unregister_exception_handler(26).unwrap();
    }
}
