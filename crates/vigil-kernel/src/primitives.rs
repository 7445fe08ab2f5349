use crate::symbols::{KernelSymbol, StructField};
use crate::Result;

/// Number of hardware breakpoint comparators in the per-thread debug state.
pub const BREAKPOINT_SLOTS: usize = 16;

/// Breakpoint control: comparator enable bit.
pub const BCR_ENABLE: u32 = 1;

/// Breakpoint control: match on all four byte lanes.
pub const BCR_BAS_ALL: u32 = 0xf << 5;

/// Breakpoint control: match regardless of the executing exception level.
///
/// The host debug-register API sanitizes this field away; installing it
/// requires a direct memory patch of the live debug save area.
pub const BCR_MODE_CONTROL_ANY: u32 = 0b11 << 1;

/// Handle to a debuggable thread, as issued by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub u64);

/// Arbitrary kernel memory access.
///
/// No alignment or bounds guarantees beyond what the caller supplies;
/// an invalid address is undefined behavior.
pub trait KernelMemory {
    /// Reads a 32-bit value from a kernel address.
    fn read32(&self, addr: u64) -> Result<u32>;

    /// Reads a 64-bit value from a kernel address.
    fn read64(&self, addr: u64) -> Result<u64>;

    /// Writes a 32-bit value to a kernel address.
    fn write32(&self, addr: u64, value: u32) -> Result<()>;

    /// Writes a 64-bit value to a kernel address.
    fn write64(&self, addr: u64, value: u64) -> Result<()>;

    /// Copies bytes from this process into kernel memory.
    fn copy_in(&self, dst: u64, bytes: &[u8]) -> Result<()>;

    /// Copies bytes out of kernel memory into this process.
    fn copy_out(&self, src: u64, buf: &mut [u8]) -> Result<()>;
}

/// Arbitrary privileged call with register control over two arguments and
/// the return value.
pub trait KernelCall {
    /// Invokes privileged code at `entry` with the given word arguments.
    fn call(&self, entry: u64, args: &[u64]) -> Result<u64>;
}

/// Kernel symbol and structure-offset resolution for the running build.
pub trait KernelSymbols {
    /// Resolves a kernel symbol to its address.
    fn symbol(&self, symbol: KernelSymbol) -> Result<u64>;

    /// Resolves a structure field to its byte offset.
    fn field_offset(&self, field: StructField) -> Result<u64>;
}

/// Bootstrap allocator for wired kernel memory.
pub trait KernelAlloc {
    /// Allocates `size` bytes of kernel memory and returns their address.
    fn alloc(&self, size: usize) -> Result<u64>;
}

/// Host thread lookup and cooperative scheduling.
pub trait HostThreads {
    /// Returns a handle to the calling thread.
    fn current_thread(&self) -> Result<ThreadHandle>;

    /// Resolves a thread handle to its kernel object address.
    fn thread_object(&self, thread: ThreadHandle) -> Result<u64>;

    /// Voluntarily yields the processor.
    fn yield_now(&self);

    /// Offers the processor to the given thread.
    fn switch_to(&self, thread: ThreadHandle);
}

/// The host's supported (sanitizing) debug-register interface.
pub trait DebugRegisters {
    /// Installs an execution breakpoint in the given comparator slot,
    /// enabled, matching all byte lanes. The host clears any mode-control
    /// request.
    fn install_breakpoint(&self, thread: ThreadHandle, slot: usize, addr: u64) -> Result<()>;

    /// Clears the given comparator slot.
    fn clear_breakpoint(&self, thread: ThreadHandle, slot: usize) -> Result<()>;

    /// Reads back the address programmed into the given comparator slot.
    fn breakpoint_address(&self, thread: ThreadHandle, slot: usize) -> Result<u64>;
}

/// The full set of collaborator capabilities the debugger core requires.
pub trait Kernel:
    KernelMemory + KernelCall + KernelSymbols + KernelAlloc + HostThreads + DebugRegisters
{
}

impl<T> Kernel for T where
    T: KernelMemory + KernelCall + KernelSymbols + KernelAlloc + HostThreads + DebugRegisters
{
}
