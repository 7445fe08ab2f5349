/// Kernel text/data addresses the debugger needs, identified by role.
///
/// Resolution is the collaborator's job ([`KernelSymbols`](crate::KernelSymbols));
/// every address is specific to one kernel build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelSymbol {
    /// Per-cpu data entry array (physical/virtual `cpu_data` pointers).
    CpuDataEntries,

    /// Full-context reload-and-return path: restores an entire saved state,
    /// including SPSR, and executes the exception return.
    ExceptionReturn,

    /// Two-argument trampoline that loads the context pointer into the
    /// register [`ExceptionReturn`](Self::ExceptionReturn) reloads the
    /// processor state from, then branches to its second argument.
    RegisterLoadGadget,

    /// Synchronous exception entry, past the point where the handler has
    /// decided the link register is valid. Resuming here makes a forged
    /// dispatch indistinguishable from a real one downstream.
    SynchronousHandlerEntry,

    /// Tail of the synchronous exception handler: restores the interrupted
    /// context and leaves the handler. Written into a preempted snapshot's
    /// pc to break a thread out of the breakpoint spin loop.
    SynchronousHandlerEpilogue,

    /// The fixed instruction a thread spins on after a hardware breakpoint
    /// fires at EL1. The landmark the stack scanner looks for.
    BreakpointSpinLoop,

    /// Gadget writing its scratch register into the monitor debug system
    /// control register, then falling through to an ordinary epilogue.
    DebugEnableGadget,

    /// Ordinary kernel-to-user return path; used as the final link register
    /// of the debug-enable ROP frame.
    ThreadExceptionReturn,
}

/// Structure-field byte offsets the debugger needs, identified by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructField {
    /// `thread` → processor the thread is bound to.
    ThreadBoundProcessor,

    /// `thread` → processor the scheduler chose for the thread.
    ThreadChosenProcessor,

    /// `thread` → top of the thread's kernel stack (points at the
    /// preemption save area).
    ThreadKernelStack,

    /// `thread` → saved user context restored on the ordinary return path.
    ThreadContextData,

    /// `thread` → per-thread debug register save area.
    ThreadDebugData,

    /// `cpu_data` → owning `processor` object.
    CpuDataProcessor,

    /// Debug save area → base of the breakpoint value register array.
    DebugStateBvr,

    /// Debug save area → base of the breakpoint control register array.
    DebugStateBcr,
}
