//! Wire codec for privileged saved execution contexts.
//!
//! The kernel spills a full register image at every privilege transition:
//! a tagged general-register block (x0..x28, fp, lr, sp, pc, cpsr) followed
//! by a tagged vector block (q0..q31, fpsr, fpcr). [`SavedContext`] mirrors
//! that in-memory layout exactly, 0x328 bytes on the wire. The leading tag
//! (flavor plus 32-bit element count) is the only discriminator available
//! when scanning raw memory for one of these images, so
//! [`decode`](SavedContext::decode) fails soft, to `Ok(None)`, when it does
//! not match.

use scroll::{LE, Pread, Pwrite};
use vigil_kernel::KernelMemory;

use crate::Result;

/// Flavor of a 64-bit general-register saved state.
pub const SAVED_STATE64_FLAVOR: u32 = 0x15;

/// Element count (32-bit words) of a 64-bit general-register saved state.
pub const SAVED_STATE64_COUNT: u32 = 0x44;

/// Flavor of a 64-bit vector-register saved state.
pub const VECTOR_STATE64_FLAVOR: u32 = 0x17;

/// Element count of a 64-bit vector-register saved state.
pub const VECTOR_STATE64_COUNT: u32 = 0x82;

// Byte offsets into the wire image.
const FLAVOR: usize = 0x0;
const COUNT: usize = 0x4;
const X0: usize = 0x8;
const FP: usize = 0xf0;
const LR: usize = 0xf8;
const SP: usize = 0x100;
const PC: usize = 0x108;
const CPSR: usize = 0x110;
const VECTOR_FLAVOR: usize = 0x118;
const VECTOR_COUNT: usize = 0x11c;
const Q0: usize = 0x120;
const FPSR: usize = 0x320;
const FPCR: usize = 0x324;

/// A captured or forged full register/status image exchanged at privilege
/// transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedContext {
    /// Saved-state flavor (first half of the tag).
    pub flavor: u32,
    /// Saved-state element count (second half of the tag).
    pub count: u32,
    /// General registers x0..x28.
    pub x: [u64; 29],
    /// Frame pointer (x29).
    pub fp: u64,
    /// Link register (x30).
    pub lr: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Program counter.
    pub pc: u64,
    /// Processor status/mode bits.
    pub cpsr: u32,
    /// Vector-state flavor.
    pub vector_flavor: u32,
    /// Vector-state element count.
    pub vector_count: u32,
    /// Vector registers q0..q31.
    pub q: [u128; 32],
    /// Floating-point status register.
    pub fpsr: u32,
    /// Floating-point control register.
    pub fpcr: u32,
}

impl Default for SavedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SavedContext {
    /// Size of the wire image in bytes.
    pub const SIZE: usize = 0x328;

    /// Tag word a trusted image must start with.
    pub const TAG: u64 = SAVED_STATE64_FLAVOR as u64 | ((SAVED_STATE64_COUNT as u64) << 32);

    /// Byte offset of the program counter within the wire image.
    pub const PC_OFFSET: u64 = PC as u64;

    /// Returns a zeroed context carrying valid tags.
    pub fn new() -> Self {
        Self {
            flavor: SAVED_STATE64_FLAVOR,
            count: SAVED_STATE64_COUNT,
            x: [0; 29],
            fp: 0,
            lr: 0,
            sp: 0,
            pc: 0,
            cpsr: 0,
            vector_flavor: VECTOR_STATE64_FLAVOR,
            vector_count: VECTOR_STATE64_COUNT,
            q: [0; 32],
            fpsr: 0,
            fpcr: 0,
        }
    }

    /// Returns general register `n` (0..=30; 29 and 30 alias fp and lr).
    pub fn gpr(&self, n: usize) -> u64 {
        match n {
            29 => self.fp,
            30 => self.lr,
            n => self.x[n],
        }
    }

    /// Sets general register `n` (0..=30; 29 and 30 alias fp and lr).
    pub fn set_gpr(&mut self, n: usize, value: u64) {
        match n {
            29 => self.fp = value,
            30 => self.lr = value,
            n => self.x[n] = value,
        }
    }

    /// Moves the program counter past the trapped instruction.
    ///
    /// There is no single-step facility once a privileged breakpoint has
    /// fired; handlers emulate the instruction's effect and then skip it.
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(4);
    }

    /// Decodes a wire image. Returns `Ok(None)` when the tag does not
    /// match; no other validation is performed.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let tag: u64 = bytes.pread_with(FLAVOR, LE)?;

        if tag != Self::TAG {
            return Ok(None);
        }

        let mut ctx = Self::new();

        ctx.flavor = bytes.pread_with(FLAVOR, LE)?;
        ctx.count = bytes.pread_with(COUNT, LE)?;

        let mut offset = X0;
        for reg in &mut ctx.x {
            *reg = bytes.gread_with(&mut offset, LE)?;
        }

        ctx.fp = bytes.pread_with(FP, LE)?;
        ctx.lr = bytes.pread_with(LR, LE)?;
        ctx.sp = bytes.pread_with(SP, LE)?;
        ctx.pc = bytes.pread_with(PC, LE)?;
        ctx.cpsr = bytes.pread_with(CPSR, LE)?;
        ctx.vector_flavor = bytes.pread_with(VECTOR_FLAVOR, LE)?;
        ctx.vector_count = bytes.pread_with(VECTOR_COUNT, LE)?;

        let mut offset = Q0;
        for reg in &mut ctx.q {
            let lo: u64 = bytes.gread_with(&mut offset, LE)?;
            let hi: u64 = bytes.gread_with(&mut offset, LE)?;
            *reg = (hi as u128) << 64 | lo as u128;
        }

        ctx.fpsr = bytes.pread_with(FPSR, LE)?;
        ctx.fpcr = bytes.pread_with(FPCR, LE)?;

        Ok(Some(ctx))
    }

    /// Encodes this context into its wire image.
    pub fn encode(&self) -> Result<[u8; Self::SIZE]> {
        let mut buf = [0u8; Self::SIZE];

        buf.pwrite_with(self.flavor, FLAVOR, LE)?;
        buf.pwrite_with(self.count, COUNT, LE)?;

        let mut offset = X0;
        for reg in &self.x {
            buf.gwrite_with(*reg, &mut offset, LE)?;
        }

        buf.pwrite_with(self.fp, FP, LE)?;
        buf.pwrite_with(self.lr, LR, LE)?;
        buf.pwrite_with(self.sp, SP, LE)?;
        buf.pwrite_with(self.pc, PC, LE)?;
        buf.pwrite_with(self.cpsr, CPSR, LE)?;
        buf.pwrite_with(self.vector_flavor, VECTOR_FLAVOR, LE)?;
        buf.pwrite_with(self.vector_count, VECTOR_COUNT, LE)?;

        let mut offset = Q0;
        for reg in &self.q {
            buf.gwrite_with(*reg as u64, &mut offset, LE)?;
            buf.gwrite_with((*reg >> 64) as u64, &mut offset, LE)?;
        }

        buf.pwrite_with(self.fpsr, FPSR, LE)?;
        buf.pwrite_with(self.fpcr, FPCR, LE)?;

        Ok(buf)
    }

    /// Decodes a context stored at a kernel address.
    pub fn read_from(kernel: &impl KernelMemory, addr: u64) -> Result<Option<Self>> {
        let mut buf = [0u8; Self::SIZE];
        kernel.copy_out(addr, &mut buf)?;
        Self::decode(&buf)
    }

    /// Encodes this context into kernel memory at the given address.
    pub fn write_to(&self, kernel: &impl KernelMemory, addr: u64) -> Result<()> {
        kernel.copy_in(addr, &self.encode()?)?;
        Ok(())
    }
}
