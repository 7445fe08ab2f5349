/// Error raised by the debugger core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A kernel primitive failed.
    #[error(transparent)]
    Kernel(#[from] vigil_kernel::Error),

    /// A saved-context image could not be (de)serialized.
    #[error(transparent)]
    Codec(#[from] scroll::Error),

    /// A host thread could not be spawned.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A session was started without any breakpoint handler.
    #[error("no breakpoint handlers registered")]
    NoHandlers,

    /// Every hardware comparator is already in use.
    #[error("all {0} hardware breakpoint comparators in use")]
    SlotsExhausted(usize),

    /// A breakpoint is already armed at this address.
    #[error("breakpoint already armed at {0:#x}")]
    DuplicateBreakpoint(u64),

    /// No armed breakpoint exists at this address.
    #[error("no armed breakpoint at {0:#x}")]
    UnknownBreakpoint(u64),

    /// The trapped program counter matches no registered breakpoint
    /// (strict mismatch policy).
    #[error("trapped at unexpected address {pc:#x}")]
    UnexpectedBreakpoint {
        /// Program counter captured at the trap.
        pc: u64,
    },

    /// The preempted spin-loop capture never showed up on the target's
    /// kernel stack within the retry budget.
    #[error("no preempted spin-loop state found after {attempts} attempts")]
    SpinStateNotFound {
        /// Number of polling attempts made.
        attempts: usize,
    },

    /// No trap capture was found above the spin-loop capture.
    #[error("no trap state found within {scanned} words above the spin capture")]
    TrapStateNotFound {
        /// Number of stack words examined.
        scanned: usize,
    },

    /// The monitor thread terminated abnormally.
    #[error("monitor thread panicked")]
    MonitorPanicked,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
