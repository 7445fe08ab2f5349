//! Driver-side session orchestration.
//!
//! A session owns the whole protocol for one instrumented privileged call:
//! pin the driver thread, enable debug exceptions on the core, arm the
//! breakpoints, spawn the monitor pinned to the same core, issue the
//! proxied call, complete the token once it returns, join the monitor and
//! tear the breakpoints down.

use std::thread;

use vigil_kernel::Kernel;

use crate::breakpoint::BreakpointRegistry;
use crate::monitor::{
    BreakpointHandler, CompletionToken, MismatchPolicy, Monitor, MonitorOptions, RetryPolicy,
};
use crate::state::SavedContext;
use crate::syscall::{self, SyscallRequest};
use crate::{Error, Result, affinity};

/// Entry point for debugging privileged code through the kernel
/// primitives.
pub struct Debugger<K> {
    kernel: K,
}

impl<K: Kernel + Clone + Send + 'static> Debugger<K> {
    /// Creates a debugger over the given kernel primitives.
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }

    /// Starts configuring an instrumented session.
    pub fn session(&self) -> SessionBuilder<K> {
        SessionBuilder {
            kernel: self.kernel.clone(),
            core: 0,
            options: MonitorOptions::default(),
            handlers: Vec::new(),
        }
    }

    /// Issues a privileged call with debug exceptions deliverable but no
    /// breakpoint armed and no monitor running.
    #[tracing::instrument(name = "RawCall", skip_all, fields(number = request.number))]
    pub fn raw_call(&self, core: u32, request: SyscallRequest) -> Result<u64> {
        let thread = self.kernel.current_thread()?;
        let object = self.kernel.thread_object(thread)?;

        affinity::pin_to_core(&self.kernel, object, core)?;

        syscall::invoke_syscall(&self.kernel, object, request)
    }
}

/// Outcome of an instrumented session.
#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    /// Raw return value of the proxied call.
    pub value: u64,

    /// Number of breakpoint hits the monitor dispatched.
    pub hits: usize,
}

/// Configuration for one instrumented privileged call.
pub struct SessionBuilder<K> {
    kernel: K,
    core: u32,
    options: MonitorOptions,
    handlers: Vec<(u64, BreakpointHandler)>,
}

impl<K: Kernel + Clone + Send + 'static> SessionBuilder<K> {
    /// Selects the processor core both threads are pinned to.
    pub fn on_core(mut self, core: u32) -> Self {
        self.core = core;
        self
    }

    /// Sets the polling behavior while waiting for the spin capture.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    /// Sets the policy on a trapped pc matching no registered breakpoint.
    pub fn mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.options.mismatch = policy;
        self
    }

    /// Sets the number of stack words scanned for the spin capture.
    pub fn scan_window(mut self, words: usize) -> Self {
        self.options.scan_window_words = words;
        self
    }

    /// Sets the number of stack words scanned for the trap capture.
    pub fn trap_scan_limit(mut self, words: usize) -> Self {
        self.options.trap_scan_words = words;
        self
    }

    /// Registers a breakpoint and its hit handler.
    ///
    /// The handler must advance the captured pc past the trapped
    /// instruction and emulate its effect; there is no step facility.
    pub fn breakpoint(
        mut self,
        addr: u64,
        handler: impl FnMut(&mut SavedContext) + Send + 'static,
    ) -> Self {
        self.handlers.push((addr, Box::new(handler)));
        self
    }

    /// Runs the session: executes `request` with every registered
    /// breakpoint live, dispatching hits to their handlers.
    #[tracing::instrument(
        name = "Session",
        skip_all,
        fields(number = request.number, breakpoints = self.handlers.len())
    )]
    pub fn invoke(self, request: SyscallRequest) -> Result<SessionReport> {
        if self.handlers.is_empty() {
            return Err(Error::NoHandlers);
        }

        let thread = self.kernel.current_thread()?;
        let object = self.kernel.thread_object(thread)?;

        affinity::pin_to_core(&self.kernel, object, self.core)?;

        let mut registry = BreakpointRegistry::new(self.kernel.clone());
        registry.enable_debug_exceptions(self.core)?;

        for (addr, _) in &self.handlers {
            if let Err(e) = registry.arm(thread, *addr) {
                if let Err(teardown) = registry.disarm_all(thread) {
                    tracing::warn!(error = %teardown, "failed to disarm after arm failure");
                }
                return Err(e);
            }
        }

        let token = CompletionToken::new();

        let monitor_kernel = self.kernel.clone();
        let monitor_token = token.clone();
        let options = self.options;
        let core = self.core;
        let handlers = self.handlers;

        let monitor = thread::Builder::new()
            .name("vigil-monitor".into())
            .spawn(move || -> Result<usize> {
                // The monitor pins itself before watching: from here on,
                // whenever it runs, the debuggee does not.
                let me = monitor_kernel.current_thread()?;
                let my_object = monitor_kernel.thread_object(me)?;
                affinity::pin_to_core(&monitor_kernel, my_object, core)?;

                Monitor::new(monitor_kernel, thread, handlers, monitor_token, options)?.run()
            })?;

        let call_result = syscall::invoke_syscall(&self.kernel, object, request);

        // The call returned through normal control flow; release the
        // monitor whatever happened.
        token.complete();

        let monitor_result = monitor.join().map_err(|_| Error::MonitorPanicked);

        if let Err(e) = registry.disarm_all(thread) {
            tracing::warn!(error = %e, "failed to disarm breakpoints at teardown");
        }

        let hits = monitor_result??;
        let value = call_result?;

        Ok(SessionReport { value, hits })
    }
}
