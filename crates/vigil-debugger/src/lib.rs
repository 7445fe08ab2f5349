//! Userland debugger for privileged (EL1) code, built on a kernel memory
//! read/write primitive, an arbitrary kernel-call primitive and
//! build-specific symbol knowledge.
//!
//! Hardware execution breakpoints on kernel addresses are normally useless:
//! the debug exception class is suppressed during privileged execution, the
//! kernel never re-enables it, and once a breakpoint does fire there is no
//! single-step facility to move past it. This crate turns such a breakpoint
//! into a working primitive anyway:
//!
//! 1. A forged exception return ([`force_privileged_resume`]) rewrites the
//!    live exception-mask state (the only transition that can), leaving
//!    the debug class deliverable, and lands mid-way through the
//!    synchronous entry handler so an arbitrary privileged operation runs
//!    as if invoked normally ([`SyscallRequest`]).
//! 2. The breakpoint is armed through the host's supported debug-register
//!    interface, then the mode-control field that interface sanitizes is
//!    forced on directly ([`BreakpointRegistry`]).
//! 3. When the breakpoint fires, the debuggee parks in a fixed privileged
//!    spin loop until preempted. A [`Monitor`] pinned to the same core
//!    finds the nested saved contexts on its kernel stack, hands the
//!    breakpoint capture to a handler for inspection and mutation, writes
//!    it back and patches the preemption capture so the debuggee resumes
//!    past the loop.
//!
//! <div class="warning">
//!
//! *Correctness is by convention, not proof: the core-pinning of driver and
//! monitor is the sole ordering mechanism, and nothing protects against
//! privileged code that was holding a lock when the breakpoint fired. Wrong
//! symbol addresses for the running kernel build are undefined behavior at
//! the hardware level.*
//!
//! </div>
//!
//! The kernel primitives themselves are out of scope; they are consumed
//! through the traits of the `vigil-kernel` crate.

mod affinity;
mod breakpoint;
mod error;
mod eret;
mod monitor;
mod scan;
mod session;
mod state;
mod syscall;

pub use self::affinity::pin_to_core;
pub use self::breakpoint::{BreakpointRegistry, MDSCR_EL1_KDE};
pub use self::error::{Error, Result};
pub use self::eret::{
    SPSR_A, SPSR_D, SPSR_DEBUG_DELIVERABLE, SPSR_EL1_SP0, SPSR_F, SPSR_I, force_privileged_resume,
};
pub use self::monitor::{
    BreakpointHandler, CompletionToken, MismatchPolicy, Monitor, MonitorOptions, RetryPolicy,
};
pub use self::scan::TagScanner;
pub use self::session::{Debugger, SessionBuilder, SessionReport};
pub use self::state::{
    SAVED_STATE64_COUNT, SAVED_STATE64_FLAVOR, SavedContext, VECTOR_STATE64_COUNT,
    VECTOR_STATE64_FLAVOR,
};
pub use self::syscall::{SyscallRequest, invoke_syscall};
