//! Core-affinity control through the live kernel thread object.
//!
//! The monitor/debuggee protocol relies on a single ordering mechanism:
//! both threads share one processor, so whichever is running knows the
//! other is not. Binding is done by writing the processor pointer straight
//! into the thread object; it only takes effect at the next reschedule, so
//! the processor is yielded and the chosen-processor field re-read to
//! confirm.

use vigil_kernel::{Kernel, KernelSymbol, StructField};

use crate::Result;

/// Stride of one entry in the per-cpu data array.
const CPU_DATA_ENTRY_STRIDE: u64 = 0x10;

/// Offset of the virtual `cpu_data` pointer within an entry.
const CPU_DATA_ENTRY_VADDR: u64 = 0x8;

/// Pins the thread owning `thread_object` to the given processor core and
/// returns the processor the scheduler actually chose.
///
/// A divergence between the requested and chosen processor is logged, not
/// fatal; callers compare the return value when they need certainty.
pub fn pin_to_core(kernel: &impl Kernel, thread_object: u64, core: u32) -> Result<u64> {
    let entries = kernel.symbol(KernelSymbol::CpuDataEntries)?;

    let cpu_data = kernel.read64(entries + core as u64 * CPU_DATA_ENTRY_STRIDE + CPU_DATA_ENTRY_VADDR)?;
    let processor = kernel.read64(cpu_data + kernel.field_offset(StructField::CpuDataProcessor)?)?;

    kernel.write64(
        thread_object + kernel.field_offset(StructField::ThreadBoundProcessor)?,
        processor,
    )?;

    // The binding takes effect once the thread is scheduled off and back on.
    kernel.yield_now();

    let chosen = kernel.read64(
        thread_object + kernel.field_offset(StructField::ThreadChosenProcessor)?,
    )?;

    if chosen == processor {
        tracing::debug!(core, processor = format_args!("{processor:#x}"), "pinned");
    } else {
        tracing::warn!(
            core,
            requested = format_args!("{processor:#x}"),
            chosen = format_args!("{chosen:#x}"),
            "thread not running on the requested processor"
        );
    }

    Ok(chosen)
}
