#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]
#![allow(missing_docs)]
#![allow(dead_code)]

use vigil_debugger::SavedContext;
use vigil_kernel::testing::MockKernel;
use vigil_kernel::{HostThreads, KernelMemory, KernelSymbol, StructField, ThreadHandle};

// Fabricated kernel layout shared by the tests. The values are arbitrary
// but internally consistent: the protocol only ever compares them.
pub const CPU_DATA_ENTRIES: u64 = 0xFFFF_FFF0_0800_0000;
pub const CPU0_DATA: u64 = 0xFFFF_FFF0_0900_0000;
pub const CPU1_DATA: u64 = 0xFFFF_FFF0_0900_1000;
pub const PROCESSOR0: u64 = 0xFFFF_FFF0_0A00_0000;
pub const PROCESSOR1: u64 = 0xFFFF_FFF0_0A00_1000;

pub const REGISTER_LOAD_GADGET: u64 = 0xFFFF_FFF0_070C_C1AC;
pub const EXCEPTION_RETURN: u64 = 0xFFFF_FFF0_070C_C200;
pub const SYNC_HANDLER_ENTRY: u64 = 0xFFFF_FFF0_070C_C1D4;
pub const SYNC_HANDLER_EPILOGUE: u64 = 0xFFFF_FFF0_070C_C3CC;
pub const SPIN_LOOP: u64 = 0xFFFF_FFF0_071D_DF00;
pub const DEBUG_ENABLE_GADGET: u64 = 0xFFFF_FFF0_071E_1998;
pub const THREAD_EXCEPTION_RETURN: u64 = 0xFFFF_FFF0_0708_0000;

pub const FIELD_BOUND_PROCESSOR: u64 = 0x80;
pub const FIELD_CHOSEN_PROCESSOR: u64 = 0x88;
pub const FIELD_KERNEL_STACK: u64 = 0xA0;
pub const FIELD_CONTEXT_DATA: u64 = 0xA8;
pub const FIELD_DEBUG_DATA: u64 = 0x2E0;
pub const FIELD_CPU_PROCESSOR: u64 = 0x48;
pub const FIELD_BVR: u64 = 0x10;
pub const FIELD_BCR: u64 = 0x90;

// Staged debuggee state lives outside the mock's allocation range.
pub const KSTACK_TOP: u64 = 0xFFFF_FFE0_0001_0000;
pub const ACT_CONTEXT: u64 = 0xFFFF_FFE0_0010_0000;

/// Builds a mock kernel with the full symbol/offset table and per-cpu data
/// for two cores.
pub fn mock_kernel() -> MockKernel {
    let kernel = MockKernel::new();

    kernel.define_symbol(KernelSymbol::CpuDataEntries, CPU_DATA_ENTRIES);
    kernel.define_symbol(KernelSymbol::RegisterLoadGadget, REGISTER_LOAD_GADGET);
    kernel.define_symbol(KernelSymbol::ExceptionReturn, EXCEPTION_RETURN);
    kernel.define_symbol(KernelSymbol::SynchronousHandlerEntry, SYNC_HANDLER_ENTRY);
    kernel.define_symbol(KernelSymbol::SynchronousHandlerEpilogue, SYNC_HANDLER_EPILOGUE);
    kernel.define_symbol(KernelSymbol::BreakpointSpinLoop, SPIN_LOOP);
    kernel.define_symbol(KernelSymbol::DebugEnableGadget, DEBUG_ENABLE_GADGET);
    kernel.define_symbol(KernelSymbol::ThreadExceptionReturn, THREAD_EXCEPTION_RETURN);

    kernel.define_field(StructField::ThreadBoundProcessor, FIELD_BOUND_PROCESSOR);
    kernel.define_field(StructField::ThreadChosenProcessor, FIELD_CHOSEN_PROCESSOR);
    kernel.define_field(StructField::ThreadKernelStack, FIELD_KERNEL_STACK);
    kernel.define_field(StructField::ThreadContextData, FIELD_CONTEXT_DATA);
    kernel.define_field(StructField::ThreadDebugData, FIELD_DEBUG_DATA);
    kernel.define_field(StructField::CpuDataProcessor, FIELD_CPU_PROCESSOR);
    kernel.define_field(StructField::DebugStateBvr, FIELD_BVR);
    kernel.define_field(StructField::DebugStateBcr, FIELD_BCR);

    kernel.write64(CPU_DATA_ENTRIES + 0x8, CPU0_DATA).unwrap();
    kernel.write64(CPU_DATA_ENTRIES + 0x18, CPU1_DATA).unwrap();
    kernel.write64(CPU0_DATA + FIELD_CPU_PROCESSOR, PROCESSOR0).unwrap();
    kernel.write64(CPU1_DATA + FIELD_CPU_PROCESSOR, PROCESSOR1).unwrap();

    kernel
}

/// Registers the calling thread as the debuggee: kernel stack pointer and
/// saved user context wired into its thread object.
pub fn prepare_current_thread(kernel: &MockKernel) -> (ThreadHandle, u64) {
    let thread = kernel.current_thread().unwrap();
    let object = kernel.thread_object(thread).unwrap();

    kernel.write64(object + FIELD_KERNEL_STACK, KSTACK_TOP).unwrap();
    kernel.write64(object + FIELD_CONTEXT_DATA, ACT_CONTEXT).unwrap();

    (thread, object)
}

/// Kernel addresses of the captures staged by [`stage_stuck_thread`].
pub struct StagedStack {
    /// Preempted stack pointer the scan window starts at.
    pub sp: u64,
    /// Outer (preempted-while-spinning) capture.
    pub outer: u64,
    /// Inner (trapped-at-breakpoint) capture.
    pub trap: u64,
}

/// Lays out a debuggee kernel stack as it looks once a breakpoint has
/// fired and the spinning thread has been preempted: the preemption capture
/// at the stack top, decoy words, the spin-loop capture, more decoys, then
/// the trap capture.
pub fn stage_stuck_thread(kernel: &MockKernel, trap: &SavedContext) -> StagedStack {
    let sp = KSTACK_TOP - 0x800;
    let outer_addr = sp + 0x40;
    let trap_addr = outer_addr + SavedContext::SIZE as u64 + 0x28;

    // Decoys: a plausible pointer and words one bit off the real tag.
    kernel.write64(sp + 0x10, 0xFFFF_FFF0_0000_0001).unwrap();
    kernel.write64(sp + 0x18, SavedContext::TAG ^ 0x100).unwrap();
    kernel
        .write64(outer_addr + SavedContext::SIZE as u64 + 0x8, SavedContext::TAG ^ 0x2)
        .unwrap();

    trap.write_to(kernel, trap_addr).unwrap();

    let mut outer = SavedContext::new();
    outer.pc = SPIN_LOOP;
    outer.sp = sp + 0x40;
    outer.write_to(kernel, outer_addr).unwrap();

    // The preemption capture at the stack top is what a racing monitor
    // keys off, so it goes in last, once the rest of the layout exists.
    let mut preempted = SavedContext::new();
    preempted.pc = 0xFFFF_FFF0_0711_1111;
    preempted.sp = sp;
    preempted.write_to(kernel, KSTACK_TOP).unwrap();

    StagedStack {
        sp,
        outer: outer_addr,
        trap: trap_addr,
    }
}
