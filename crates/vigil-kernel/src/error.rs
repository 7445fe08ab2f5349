use crate::symbols::{KernelSymbol, StructField};
use crate::ThreadHandle;

/// Error raised by a kernel-primitive implementation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A symbol has no address for the running kernel build.
    #[error("no address for kernel symbol {0:?} on this build")]
    SymbolUnresolved(KernelSymbol),

    /// A structure field has no offset for the running kernel build.
    #[error("no offset for structure field {0:?} on this build")]
    FieldUnresolved(StructField),

    /// A thread handle does not resolve to a kernel object.
    #[error("thread handle {0:?} does not resolve to a kernel object")]
    UnknownThread(ThreadHandle),

    /// A debug-register slot index is outside the comparator file.
    #[error("debug register slot {0} out of range")]
    BadSlot(usize),

    /// A primitive operation reported a host error code.
    #[error("kernel {op} at {addr:#x} failed with code {code}")]
    Primitive {
        /// Name of the failing operation.
        op: &'static str,
        /// Target kernel address.
        addr: u64,
        /// Host error code.
        code: i32,
    },

    /// Implementation-specific failure.
    #[error("kernel backend: {0}")]
    Backend(String),
}

impl Error {
    /// Wraps an implementation-specific error.
    pub fn backend(e: impl std::fmt::Display) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
