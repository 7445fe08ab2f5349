//! Privileged-call proxying with debug exceptions deliverable.
//!
//! An operation invoked through the ordinary trap path runs with the debug
//! class suppressed, so breakpoints sitting on its code never fire. The
//! proxy instead re-enters the privileged dispatch path through a forged
//! exception return whose status word leaves the debug class unmasked, and
//! whose registers are laid out exactly as the synchronous entry handler
//! expects mid-flight: by the time the forged state becomes live, the
//! handler has already "decided" the request is an ordinary one.

use vigil_kernel::{Kernel, KernelSymbol, StructField};

use crate::eret::{self, SPSR_DEBUG_DELIVERABLE};
use crate::state::SavedContext;
use crate::Result;

/// Exception-class value for a 64-bit supervisor call.
const ESR_EC_SVC64: u64 = 0x15;

/// Shift of the exception-class field within the syndrome register.
const ESR_EC_SHIFT: u64 = 26;

/// Register carrying the operation number at dispatch.
const OPERATION_NUMBER_REGISTER: usize = 16;

/// Register the dispatch path reloads the true saved context from on the
/// immediate (no-pending-signal) return path.
const SAVED_CONTEXT_REGISTER: usize = 21;

/// The fault-address register is meaningless for a supervisor call; any
/// recognizable value will do.
const FAULT_ADDRESS_UNUSED: u64 = 0x4545_4545_4540;

/// A privileged operation to invoke: operation number plus up to eight
/// word-sized arguments. Immutable once constructed, consumed once.
#[derive(Debug, Clone, Copy)]
pub struct SyscallRequest {
    /// Operation number.
    pub number: u32,

    /// Word-sized arguments; unused trailing slots stay zero.
    pub args: [u64; 8],
}

impl SyscallRequest {
    /// Builds a request from the given arguments (at most eight are used).
    pub fn new(number: u32, args: &[u64]) -> Self {
        let mut slots = [0u64; 8];
        for (slot, arg) in slots.iter_mut().zip(args) {
            *slot = *arg;
        }

        Self {
            number,
            args: slots,
        }
    }
}

/// Invokes a privileged operation on the calling thread with breakpoint
/// delivery enabled for its duration.
///
/// Fire-and-continue: the privileged work happens once the forged state is
/// live; completion is observed by the caller falling back into normal
/// control flow (or, for instrumented calls, through the monitor protocol).
pub fn invoke_syscall(
    kernel: &impl Kernel,
    thread_object: u64,
    request: SyscallRequest,
) -> Result<u64> {
    // The entry image only needs enough state to get the operation called:
    // number and arguments in the dispatch convention's registers.
    let mut entry = SavedContext::new();
    entry.x[OPERATION_NUMBER_REGISTER] = request.number as u64;
    entry.x[..8].copy_from_slice(&request.args);

    let entry_staged = kernel.alloc(SavedContext::SIZE)?;
    entry.write_to(kernel, entry_staged)?;

    // The image that goes live via the exception return. x21 keeps the real
    // saved context so the ordinary return path stays valid whether or not
    // the thread takes a pending signal on the way out.
    let mut dispatch = SavedContext::new();
    dispatch.x[0] = entry_staged;
    dispatch.x[1] = ESR_EC_SVC64 << ESR_EC_SHIFT;
    dispatch.x[2] = FAULT_ADDRESS_UNUSED;
    dispatch.x[SAVED_CONTEXT_REGISTER] =
        kernel.read64(thread_object + kernel.field_offset(StructField::ThreadContextData)?)?;
    dispatch.sp =
        kernel.read64(thread_object + kernel.field_offset(StructField::ThreadKernelStack)?)?;
    dispatch.pc = kernel.symbol(KernelSymbol::SynchronousHandlerEntry)?;
    dispatch.cpsr = SPSR_DEBUG_DELIVERABLE;

    tracing::info!(number = request.number, "proxying privileged call");

    eret::force_privileged_resume(kernel, &dispatch)
}
