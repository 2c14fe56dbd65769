use crate::HookError;
use std::ops::RangeInclusive;

/// Fixed-capacity code arena. `origin` is the address the bytes will occupy
/// once copied out, so emitters can compute displacements from [`ip`].
///
/// [`ip`]: CodeBuffer::ip
pub struct CodeBuffer<const N: usize> {
    bytes: [u8; N],
    len: usize,
    origin: usize,
}

impl<const N: usize> CodeBuffer<N> {
    pub fn new(origin: usize) -> Self {
        Self {
            bytes: [0; N],
            len: 0,
            origin,
        }
    }

    /// Address of the next byte to be written.
    pub fn ip(&self) -> usize {
        self.origin.wrapping_add(self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        N - self.len
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), HookError> {
        if bytes.len() > self.remaining() {
            return Err(HookError::BufferOverflow);
        }
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Writes `byte` until the buffer holds `end` bytes.
    pub fn fill_to(&mut self, end: usize, byte: u8) -> Result<(), HookError> {
        if end > N {
            return Err(HookError::BufferOverflow);
        }
        if end > self.len {
            self.bytes[self.len..end].fill(byte);
            self.len = end;
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// One target instruction re-encoded for a new address.
#[derive(Debug, Clone)]
pub struct RelocatedInstruction {
    /// Length of the original encoding.
    pub source_len: usize,
    /// Encoding valid at the destination address.
    pub bytes: Vec<u8>,
    /// Control never falls through to the next instruction.
    pub terminator: bool,
}

impl RelocatedInstruction {
    /// Bytes the relocated form needs beyond the original length.
    pub fn extra(&self) -> usize {
        self.bytes.len().saturating_sub(self.source_len)
    }
}

/// Architecture specific code generation used by the trampoline builder and
/// the transaction commit.
pub trait CodePatcher {
    /// Size of the jump written over a target.
    const JMP_SIZE: usize;

    /// Copies the instruction at `src` so that it behaves the same when
    /// executed at `dst`.
    ///
    /// # Safety
    ///
    /// `src` must point at readable machine code.
    unsafe fn copy_instruction(
        &self,
        src: usize,
        dst: usize,
    ) -> Result<RelocatedInstruction, HookError>;

    /// Relative jump from the buffer's current ip to `to`.
    fn emit_jump<const N: usize>(&self, buf: &mut CodeBuffer<N>, to: usize)
    -> Result<(), HookError>;

    /// Indirect jump through the pointer stored at `slot`.
    fn emit_indirect_jump<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        slot: usize,
    ) -> Result<(), HookError>;

    /// Jump to `detour` that works from anywhere in memory.
    fn emit_detour_jump<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        detour: usize,
    ) -> Result<(), HookError>;

    /// Pads with breakpoints up to `end` bytes.
    fn emit_filler<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        end: usize,
    ) -> Result<(), HookError>;

    /// Follows linker generated stubs to the code that does the work.
    ///
    /// # Safety
    ///
    /// `code` must point at readable machine code.
    unsafe fn skip_forwarding_jump(&self, code: usize) -> usize;

    /// Addresses a trampoline for `code` may occupy.
    ///
    /// # Safety
    ///
    /// `code` must point at readable machine code.
    unsafe fn jump_bounds(&self, code: usize) -> RangeInclusive<usize>;
}
