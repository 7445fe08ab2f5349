//! Hardware-breakpoint lifecycle.
//!
//! Arming goes through the host's supported debug-register interface so the
//! per-thread save/restore plumbing is all set up, then patches the one
//! control field that interface refuses to pass through: the mode-control
//! bits that let the comparator match during privileged execution. Delivery
//! additionally requires the per-core kernel-debug-enable bit, which only a
//! forged exception return can set once the system is up.

use std::collections::{HashMap, HashSet};

use vigil_kernel::{
    BCR_MODE_CONTROL_ANY, BREAKPOINT_SLOTS, Kernel, KernelSymbol, StructField, ThreadHandle,
};

use crate::eret::{self, SPSR_DEBUG_DELIVERABLE};
use crate::state::SavedContext;
use crate::{Error, Result};

/// Kernel-debug-enable bit of the monitor debug system control register.
pub const MDSCR_EL1_KDE: u64 = 1 << 13;

/// Scratch register the debug-enable gadget writes into the control
/// register.
const DEBUG_ENABLE_GADGET_REGISTER: usize = 8;

/// Stack the debug-enable gadget unwinds: it adds 0x220, then pops
/// x28/x27, x20/x19 and fp/lr (0x30 bytes) before returning.
const ROP_STACK_SIZE: usize = 0x1000;
const ROP_STACK_PIVOT: u64 = 0xc00;
const ROP_FRAME_POP: u64 = 0x220;

/// Recognizable frame-pointer filler for the popped frame.
const FRAME_POINTER_SENTINEL: u64 = 0x41_4243_4445_46;

/// Stride of one entry in the breakpoint value/control register arrays.
const COMPARATOR_STRIDE: u64 = 8;

struct ArmedBreakpoint {
    slot: usize,
}

/// Registry of armed hardware execution breakpoints, keyed by address.
///
/// One registry manages the comparator file of one debugging session; slots
/// are recycled on [`disarm`](Self::disarm).
pub struct BreakpointRegistry<K> {
    kernel: K,

    /// Armed breakpoints, keyed by target address.
    armed: HashMap<u64, ArmedBreakpoint>,

    /// Comparator slots currently in use.
    slots_in_use: HashSet<usize>,

    /// Cores whose kernel-debug-enable bit has already been set.
    debug_enabled_cores: HashSet<u32>,
}

impl<K: Kernel> BreakpointRegistry<K> {
    /// Creates an empty registry over the given kernel.
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            armed: HashMap::new(),
            slots_in_use: HashSet::new(),
            debug_enabled_cores: HashSet::new(),
        }
    }

    /// Addresses of every armed breakpoint.
    pub fn addresses(&self) -> Vec<u64> {
        self.armed.keys().copied().collect()
    }

    /// Arms an execution breakpoint at `addr` on the given thread: installs
    /// it through the supported interface, verifies the comparator read-back
    /// (divergence is logged, not fatal), then forces the mode-control field
    /// on in the live debug save area.
    pub fn arm(&mut self, thread: ThreadHandle, addr: u64) -> Result<()> {
        if self.armed.contains_key(&addr) {
            return Err(Error::DuplicateBreakpoint(addr));
        }

        let slot = (0..BREAKPOINT_SLOTS)
            .find(|slot| !self.slots_in_use.contains(slot))
            .ok_or(Error::SlotsExhausted(BREAKPOINT_SLOTS))?;

        self.kernel.install_breakpoint(thread, slot, addr)?;

        let read_back = self.kernel.breakpoint_address(thread, slot)?;
        if read_back != addr {
            tracing::error!(
                slot,
                requested = format_args!("{addr:#x}"),
                read_back = format_args!("{read_back:#x}"),
                "comparator readback diverges from the requested address"
            );
        }

        // The supported interface sanitized the mode-control request away;
        // force it in the thread's live debug save area.
        let control = self.comparator_control_address(thread, slot)?;
        let bcr = self.kernel.read32(control)?;
        self.kernel.write32(control, bcr | BCR_MODE_CONTROL_ANY)?;

        tracing::info!(addr = format_args!("{addr:#x}"), slot, "breakpoint armed");

        self.slots_in_use.insert(slot);
        self.armed.insert(addr, ArmedBreakpoint { slot });

        Ok(())
    }

    /// Disarms the breakpoint at `addr` and recycles its comparator slot.
    pub fn disarm(&mut self, thread: ThreadHandle, addr: u64) -> Result<()> {
        let armed = self
            .armed
            .remove(&addr)
            .ok_or(Error::UnknownBreakpoint(addr))?;

        self.kernel.clear_breakpoint(thread, armed.slot)?;
        self.slots_in_use.remove(&armed.slot);

        tracing::info!(addr = format_args!("{addr:#x}"), slot = armed.slot, "breakpoint disarmed");

        Ok(())
    }

    /// Disarms every armed breakpoint.
    pub fn disarm_all(&mut self, thread: ThreadHandle) -> Result<()> {
        for addr in self.addresses() {
            self.disarm(thread, addr)?;
        }

        Ok(())
    }

    /// Sets the kernel-debug-enable control bit on the given core.
    ///
    /// Scheduling does not clear the bit, so one application per core per
    /// process lifetime suffices; repeated calls are no-ops.
    pub fn enable_debug_exceptions(&mut self, core: u32) -> Result<()> {
        if !self.debug_enabled_cores.insert(core) {
            tracing::debug!(core, "debug exceptions already enabled");
            return Ok(());
        }

        // The gadget unwinds a real stack frame after writing the control
        // register, so give it one that returns straight through the
        // ordinary exception-return path.
        let stack = self.kernel.alloc(ROP_STACK_SIZE)?;
        let pivot = stack + ROP_STACK_PIVOT;

        let frame: [u64; 6] = [
            0,
            0,
            0,
            0,
            FRAME_POINTER_SENTINEL,
            self.kernel.symbol(KernelSymbol::ThreadExceptionReturn)?,
        ];

        let mut bytes = [0u8; 48];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(frame) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.kernel.copy_in(pivot + ROP_FRAME_POP, &bytes)?;

        let mut ctx = SavedContext::new();
        ctx.x[DEBUG_ENABLE_GADGET_REGISTER] = MDSCR_EL1_KDE;
        ctx.sp = pivot;
        ctx.pc = self.kernel.symbol(KernelSymbol::DebugEnableGadget)?;
        ctx.cpsr = SPSR_DEBUG_DELIVERABLE;

        eret::force_privileged_resume(&self.kernel, &ctx)?;

        tracing::info!(core, "kernel debug exceptions enabled");

        Ok(())
    }
}

impl<K: Kernel> BreakpointRegistry<K> {
    fn comparator_control_address(&self, thread: ThreadHandle, slot: usize) -> Result<u64> {
        let object = self.kernel.thread_object(thread)?;
        let debug_data =
            self.kernel.read64(object + self.kernel.field_offset(StructField::ThreadDebugData)?)?;

        Ok(debug_data
            + self.kernel.field_offset(StructField::DebugStateBcr)?
            + slot as u64 * COMPARATOR_STRIDE)
    }
}
