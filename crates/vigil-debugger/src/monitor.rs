//! Stuck-thread monitoring.
//!
//! When a privileged breakpoint fires, the debuggee is parked in a fixed
//! spin loop until the scheduler preempts it. From that point its kernel
//! stack holds two nested saved contexts: an outer capture taken at
//! preemption, whose pc is the spin-loop instruction, and further up an
//! inner capture taken at the breakpoint itself. The monitor is pinned to
//! the debuggee's core, so exactly one of the two is ever running: it polls
//! for the outer capture, walks up to the inner one, hands it to the
//! registered handler, writes the modified image back, and rewrites the
//! outer capture's pc so the debuggee falls out of the spin loop when it
//! next runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use vigil_kernel::{Kernel, KernelSymbol, StructField, ThreadHandle};

use crate::scan::TagScanner;
use crate::state::SavedContext;
use crate::{Error, Result};

/// Mutable breakpoint-hit callback. Expected to advance the program counter
/// past the trapped instruction and emulate its effect; no step facility
/// exists.
pub type BreakpointHandler = Box<dyn FnMut(&mut SavedContext) + Send>;

/// Single-writer completion signal shared by a driver and its monitor.
///
/// The driver completes the token once the proxied call has returned
/// through normal control flow; the monitor observes it at the top of every
/// polling iteration.
#[derive(Debug, Clone, Default)]
pub struct CompletionToken(Arc<AtomicBool>);

impl CompletionToken {
    /// Creates an uncompleted token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the session complete.
    pub fn complete(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether the session has completed.
    pub fn is_complete(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What to do when the trapped program counter matches no registered
/// breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MismatchPolicy {
    /// Fail the session with [`Error::UnexpectedBreakpoint`].
    #[default]
    Strict,

    /// Log the mismatch and dispatch to the first registered handler
    /// anyway. Best effort: if another breakpoint-capable call site was
    /// interrupted, this may patch an unrelated execution context.
    Lenient,
}

/// Bounded polling behavior for the spin-capture search.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before giving up with [`Error::SpinStateNotFound`].
    pub max_attempts: usize,

    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Tuning knobs for a monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    /// Polling behavior while waiting for the spin capture.
    pub retry: RetryPolicy,

    /// Policy on a trapped pc that matches no registered breakpoint.
    pub mismatch: MismatchPolicy,

    /// Stack words scanned above the preempted stack pointer for the outer
    /// capture.
    pub scan_window_words: usize,

    /// Stack words scanned above the outer capture for the trap capture.
    pub trap_scan_words: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            mismatch: MismatchPolicy::default(),
            scan_window_words: 128,
            trap_scan_words: 1000,
        }
    }
}

enum SpinWait {
    /// The session completed; no further captures are coming.
    Released,

    /// Kernel address of the outer (preempted-while-spinning) capture.
    Found(u64),
}

/// The monitor half of a debugging session.
///
/// Must run pinned to the same core as the thread it watches; that pinning
/// is the only thing making the raw stack reads and patches race-free.
pub struct Monitor<K> {
    kernel: K,
    target: ThreadHandle,
    target_object: u64,
    kstack_field: u64,
    spin_pc: u64,
    epilogue: u64,
    handlers: Vec<(u64, BreakpointHandler)>,
    token: CompletionToken,
    options: MonitorOptions,
}

impl<K: Kernel> Monitor<K> {
    /// Creates a monitor for the given target thread.
    ///
    /// `handlers` maps breakpoint addresses to their hit callbacks and must
    /// not be empty.
    pub fn new(
        kernel: K,
        target: ThreadHandle,
        handlers: Vec<(u64, BreakpointHandler)>,
        token: CompletionToken,
        options: MonitorOptions,
    ) -> Result<Self> {
        if handlers.is_empty() {
            return Err(Error::NoHandlers);
        }

        let target_object = kernel.thread_object(target)?;
        let kstack_field = kernel.field_offset(StructField::ThreadKernelStack)?;
        let spin_pc = kernel.symbol(KernelSymbol::BreakpointSpinLoop)?;
        let epilogue = kernel.symbol(KernelSymbol::SynchronousHandlerEpilogue)?;

        Ok(Self {
            kernel,
            target,
            target_object,
            kstack_field,
            spin_pc,
            epilogue,
            handlers,
            token,
            options,
        })
    }

    /// Runs the monitor until the completion token is set. Returns the
    /// number of breakpoint hits dispatched.
    #[tracing::instrument(name = "Monitor", skip_all)]
    pub fn run(&mut self) -> Result<usize> {
        let mut hits = 0;

        loop {
            let outer = match self.wait_for_spin()? {
                SpinWait::Released => {
                    tracing::info!(hits, "session complete");
                    return Ok(hits);
                }
                SpinWait::Found(addr) => addr,
            };

            let (trap_addr, mut trap) = self.locate_trap(outer)?;

            self.dispatch(&mut trap)?;
            self.patch_and_resume(outer, trap_addr, &trap)?;

            hits += 1;
        }
    }

    /// Polls the target's kernel stack until the outer spin capture shows
    /// up or the token completes, bounded by the retry policy.
    fn wait_for_spin(&self) -> Result<SpinWait> {
        for attempt in 0..self.options.retry.max_attempts {
            // Token first: once the call has returned there is nothing left
            // to scan for.
            if self.token.is_complete() {
                return Ok(SpinWait::Released);
            }

            if let Some(addr) = self.find_spin_capture()? {
                tracing::debug!(
                    attempt,
                    addr = format_args!("{addr:#x}"),
                    "found preempted spin capture"
                );
                return Ok(SpinWait::Found(addr));
            }

            std::thread::sleep(self.options.retry.backoff);
        }

        Err(Error::SpinStateNotFound {
            attempts: self.options.retry.max_attempts,
        })
    }

    /// One polling attempt: decode the preemption capture at the stack top
    /// and scan the window above its saved stack pointer for a capture
    /// parked on the spin loop.
    fn find_spin_capture(&self) -> Result<Option<u64>> {
        let kstack = self.kernel.read64(self.target_object + self.kstack_field)?;
        if kstack == 0 {
            return Ok(None);
        }

        let Some(preempted) = SavedContext::read_from(&self.kernel, kstack)? else {
            return Ok(None);
        };

        if preempted.sp == 0 {
            return Ok(None);
        }

        let mut window = vec![0u8; self.options.scan_window_words * 8];
        self.kernel.copy_out(preempted.sp, &mut window)?;

        for offset in TagScanner::new(&window, SavedContext::TAG) {
            let addr = preempted.sp + offset as u64;

            let Some(candidate) = SavedContext::read_from(&self.kernel, addr)? else {
                continue;
            };

            if candidate.pc == self.spin_pc {
                return Ok(Some(addr));
            }
        }

        Ok(None)
    }

    /// Walks word by word above the outer capture to the next tagged image:
    /// the state captured when the breakpoint fired.
    fn locate_trap(&self, outer: u64) -> Result<(u64, SavedContext)> {
        let mut addr = outer + SavedContext::SIZE as u64;

        for _ in 0..self.options.trap_scan_words {
            if self.kernel.read64(addr)? != SavedContext::TAG {
                addr += 8;
                continue;
            }

            let Some(trap) = SavedContext::read_from(&self.kernel, addr)? else {
                addr += 8;
                continue;
            };

            return Ok((addr, trap));
        }

        Err(Error::TrapStateNotFound {
            scanned: self.options.trap_scan_words,
        })
    }

    /// Hands the trap capture to the handler registered for its pc.
    fn dispatch(&mut self, trap: &mut SavedContext) -> Result<()> {
        let pc = trap.pc;

        if let Some(index) = self.handlers.iter().position(|(addr, _)| *addr == pc) {
            tracing::info!(pc = format_args!("{pc:#x}"), "breakpoint hit");
            (self.handlers[index].1)(trap);
            return Ok(());
        }

        match self.options.mismatch {
            MismatchPolicy::Strict => Err(Error::UnexpectedBreakpoint { pc }),
            MismatchPolicy::Lenient => {
                tracing::warn!(
                    pc = format_args!("{pc:#x}"),
                    "trapped at an unregistered address, dispatching best-effort"
                );
                (self.handlers[0].1)(trap);
                Ok(())
            }
        }
    }

    /// Writes the modified trap capture back, points the outer capture's pc
    /// at the handler epilogue so the debuggee falls out of the spin loop,
    /// and offers it the core.
    fn patch_and_resume(&self, outer: u64, trap_addr: u64, trap: &SavedContext) -> Result<()> {
        trap.write_to(&self.kernel, trap_addr)?;

        self.kernel
            .write64(outer + SavedContext::PC_OFFSET, self.epilogue)?;

        tracing::debug!(
            resume_pc = format_args!("{:#x}", trap.pc),
            "released the debuggee"
        );

        self.kernel.switch_to(self.target);
        self.kernel.yield_now();

        Ok(())
    }
}
