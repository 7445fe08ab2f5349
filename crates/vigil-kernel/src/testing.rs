//! In-memory kernel double for driving the debugger protocol in tests.
//!
//! [`MockKernel`] models the slice of the host the debugger touches: a
//! sparse byte-addressed kernel image, a bump allocator, a symbol/offset
//! table, per-OS-thread identity whose pending core binding is applied on
//! yield, and a debug-register file that writes through to the owning
//! thread's debug save area with the same mode-control sanitization as the
//! real interface. Privileged calls are recorded and can be scripted with
//! [`MockKernel::set_call_hook`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    BCR_BAS_ALL, BCR_ENABLE, BCR_MODE_CONTROL_ANY, BREAKPOINT_SLOTS, DebugRegisters, Error,
    HostThreads, KernelAlloc, KernelCall, KernelMemory, KernelSymbol, KernelSymbols, Result,
    StructField, ThreadHandle,
};

/// Scripted behavior behind the arbitrary-call primitive.
pub type CallHook = Box<dyn FnMut(&MockKernel, u64, &[u64]) -> u64 + Send>;

const ALLOC_BASE: u64 = 0xFFFF_FFF1_0000_0000;
const THREAD_OBJECT_SIZE: usize = 0x400;
const DEBUG_DATA_SIZE: usize = 0x800;

/// Shareable in-memory kernel double.
///
/// Clones share all state, so one handle can be moved onto a monitor
/// thread while the test thread keeps staging memory through another.
#[derive(Clone)]
pub struct MockKernel {
    inner: Arc<Inner>,
}

struct Inner {
    mem: Mutex<BTreeMap<u64, u8>>,
    symbols: Mutex<HashMap<KernelSymbol, u64>>,
    fields: Mutex<HashMap<StructField, u64>>,
    threads: Mutex<HashMap<ThreadHandle, u64>>,
    by_os_thread: Mutex<HashMap<std::thread::ThreadId, ThreadHandle>>,
    calls: Mutex<Vec<(u64, Vec<u64>)>>,
    hook: Mutex<Option<CallHook>>,
    next_alloc: AtomicU64,
    next_handle: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    /// Creates an empty kernel image.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                mem: Mutex::new(BTreeMap::new()),
                symbols: Mutex::new(HashMap::new()),
                fields: Mutex::new(HashMap::new()),
                threads: Mutex::new(HashMap::new()),
                by_os_thread: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                hook: Mutex::new(None),
                next_alloc: AtomicU64::new(ALLOC_BASE),
                next_handle: AtomicU64::new(0x1103),
            }),
        }
    }

    /// Assigns an address to a kernel symbol.
    pub fn define_symbol(&self, symbol: KernelSymbol, addr: u64) {
        lock(&self.inner.symbols).insert(symbol, addr);
    }

    /// Assigns a byte offset to a structure field.
    pub fn define_field(&self, field: StructField, offset: u64) {
        lock(&self.inner.fields).insert(field, offset);
    }

    /// Scripts the behavior of the arbitrary-call primitive.
    pub fn set_call_hook(
        &self,
        hook: impl FnMut(&MockKernel, u64, &[u64]) -> u64 + Send + 'static,
    ) {
        *lock(&self.inner.hook) = Some(Box::new(hook));
    }

    /// Returns every privileged call issued so far, in order.
    pub fn calls(&self) -> Vec<(u64, Vec<u64>)> {
        lock(&self.inner.calls).clone()
    }

    /// Writes raw bytes into the kernel image.
    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) {
        let mut mem = lock(&self.inner.mem);
        for (i, b) in bytes.iter().enumerate() {
            mem.insert(addr + i as u64, *b);
        }
    }

    /// Reads raw bytes out of the kernel image; unmapped bytes read as zero.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mem = lock(&self.inner.mem);
        (0..len)
            .map(|i| mem.get(&(addr + i as u64)).copied().unwrap_or(0))
            .collect()
    }

    fn bump(&self, size: usize) -> u64 {
        let size = (size as u64 + 0xf) & !0xf;
        self.inner.next_alloc.fetch_add(size, Ordering::Relaxed)
    }

    fn current_handle(&self) -> ThreadHandle {
        let id = std::thread::current().id();

        if let Some(handle) = lock(&self.inner.by_os_thread).get(&id) {
            return *handle;
        }

        // First sighting of this OS thread: give it a handle and a zeroed
        // kernel thread object.
        let handle = ThreadHandle(self.inner.next_handle.fetch_add(4, Ordering::Relaxed));
        let object = self.bump(THREAD_OBJECT_SIZE);

        lock(&self.inner.threads).insert(handle, object);
        lock(&self.inner.by_os_thread).insert(id, handle);

        handle
    }

    fn object_of(&self, thread: ThreadHandle) -> Result<u64> {
        lock(&self.inner.threads)
            .get(&thread)
            .copied()
            .ok_or(Error::UnknownThread(thread))
    }

    fn debug_data_of(&self, thread: ThreadHandle) -> Result<u64> {
        let object = self.object_of(thread)?;
        let field = self.field_offset(StructField::ThreadDebugData)?;

        let existing = self.read64(object + field)?;
        if existing != 0 {
            return Ok(existing);
        }

        let area = self.bump(DEBUG_DATA_SIZE);
        self.write64(object + field, area)?;
        Ok(area)
    }

    fn comparator(&self, thread: ThreadHandle, slot: usize) -> Result<(u64, u64)> {
        if slot >= BREAKPOINT_SLOTS {
            return Err(Error::BadSlot(slot));
        }

        let area = self.debug_data_of(thread)?;
        let bvr = area + self.field_offset(StructField::DebugStateBvr)? + slot as u64 * 8;
        let bcr = area + self.field_offset(StructField::DebugStateBcr)? + slot as u64 * 8;
        Ok((bvr, bcr))
    }
}

impl KernelMemory for MockKernel {
    fn read32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.copy_out(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.copy_out(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write32(&self, addr: u64, value: u32) -> Result<()> {
        self.copy_in(addr, &value.to_le_bytes())
    }

    fn write64(&self, addr: u64, value: u64) -> Result<()> {
        self.copy_in(addr, &value.to_le_bytes())
    }

    fn copy_in(&self, dst: u64, bytes: &[u8]) -> Result<()> {
        self.write_bytes(dst, bytes);
        Ok(())
    }

    fn copy_out(&self, src: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.read_bytes(src, buf.len());
        buf.copy_from_slice(&bytes);
        Ok(())
    }
}

impl KernelCall for MockKernel {
    fn call(&self, entry: u64, args: &[u64]) -> Result<u64> {
        tracing::trace!(entry = format_args!("{entry:#x}"), ?args, "privileged call");

        lock(&self.inner.calls).push((entry, args.to_vec()));

        // Run the hook outside the lock so it may issue further primitive
        // operations through this same handle.
        let hook = lock(&self.inner.hook).take();

        let Some(mut hook) = hook else {
            return Ok(0);
        };

        let ret = hook(self, entry, args);

        let mut slot = lock(&self.inner.hook);
        if slot.is_none() {
            *slot = Some(hook);
        }

        Ok(ret)
    }
}

impl KernelSymbols for MockKernel {
    fn symbol(&self, symbol: KernelSymbol) -> Result<u64> {
        lock(&self.inner.symbols)
            .get(&symbol)
            .copied()
            .ok_or(Error::SymbolUnresolved(symbol))
    }

    fn field_offset(&self, field: StructField) -> Result<u64> {
        lock(&self.inner.fields)
            .get(&field)
            .copied()
            .ok_or(Error::FieldUnresolved(field))
    }
}

impl KernelAlloc for MockKernel {
    fn alloc(&self, size: usize) -> Result<u64> {
        Ok(self.bump(size))
    }
}

impl HostThreads for MockKernel {
    fn current_thread(&self) -> Result<ThreadHandle> {
        Ok(self.current_handle())
    }

    fn thread_object(&self, thread: ThreadHandle) -> Result<u64> {
        self.object_of(thread)
    }

    fn yield_now(&self) {
        // A yield is when a pending core binding takes effect.
        let handle = self.current_handle();

        let _ = (|| -> Result<()> {
            let object = self.object_of(handle)?;
            let bound = self.field_offset(StructField::ThreadBoundProcessor)?;
            let chosen = self.field_offset(StructField::ThreadChosenProcessor)?;

            let processor = self.read64(object + bound)?;
            if processor != 0 {
                self.write64(object + chosen, processor)?;
            }
            Ok(())
        })();

        std::thread::yield_now();
    }

    fn switch_to(&self, _thread: ThreadHandle) {
        std::thread::yield_now();
    }
}

impl DebugRegisters for MockKernel {
    fn install_breakpoint(&self, thread: ThreadHandle, slot: usize, addr: u64) -> Result<()> {
        tracing::trace!(?thread, slot, addr = format_args!("{addr:#x}"), "install breakpoint");

        let (bvr, bcr) = self.comparator(thread, slot)?;

        // The supported interface sanitizes the mode-control request.
        let control = (BCR_BAS_ALL | BCR_ENABLE) & !BCR_MODE_CONTROL_ANY;

        self.write64(bvr, addr)?;
        self.write32(bcr, control)
    }

    fn clear_breakpoint(&self, thread: ThreadHandle, slot: usize) -> Result<()> {
        let (bvr, bcr) = self.comparator(thread, slot)?;

        self.write64(bvr, 0)?;
        self.write32(bcr, 0)
    }

    fn breakpoint_address(&self, thread: ThreadHandle, slot: usize) -> Result<u64> {
        let (bvr, _) = self.comparator(thread, slot)?;
        self.read64(bvr)
    }
}
