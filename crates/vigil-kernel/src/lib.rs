//! Narrow interfaces to the kernel primitives that `vigil-debugger` is
//! built on.
//!
//! The debugger core never talks to the host kernel directly. Everything it
//! needs (memory reads/writes, the arbitrary privileged call, symbol and
//! structure-offset knowledge, thread lookup and scheduling, the host
//! debug-register API, the bootstrap allocator) arrives through the traits
//! in this crate. The exploitation layer that actually owns those
//! primitives implements them; tests implement them with
//! [`testing::MockKernel`].
//!
//! All addresses and offsets handed out by [`KernelSymbols`] are specific to
//! a single kernel build. No version detection happens on this side of the
//! seam: a wrong address is undefined behavior at the hardware level, by
//! contract.

mod error;
mod primitives;
mod symbols;

#[cfg(feature = "testing")]
pub mod testing;

pub use self::error::{Error, Result};
pub use self::primitives::{
    BCR_BAS_ALL, BCR_ENABLE, BCR_MODE_CONTROL_ANY, BREAKPOINT_SLOTS, DebugRegisters, HostThreads,
    Kernel, KernelAlloc, KernelCall, KernelMemory, KernelSymbols, ThreadHandle,
};
pub use self::symbols::{KernelSymbol, StructField};
