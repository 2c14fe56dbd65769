use crate::HookError;
use crate::patcher::{CodeBuffer, CodePatcher};
use log::trace;
use std::mem::offset_of;
use std::ptr::{self, NonNull};

pub(crate) const TRAMPOLINE_CODE_SIZE: usize = 32;
pub(crate) const DETOUR_STUB_SIZE: usize = 16;

/// One trampoline slot.
///
/// `code` runs the target's relocated prologue and jumps to `remain`;
/// `detour_stub` is where the patched target jumps, and it continues at
/// `detour`.
#[repr(C, align(16))]
pub struct Trampoline {
    code: [u8; TRAMPOLINE_CODE_SIZE],
    detour_stub: [u8; DETOUR_STUB_SIZE],
    cb_target: u8,
    cb_code: u8,
    remain: usize,
    detour: usize,
}

impl Trampoline {
    pub(crate) const fn zeroed() -> Trampoline {
        Trampoline {
            code: [0; TRAMPOLINE_CODE_SIZE],
            detour_stub: [0; DETOUR_STUB_SIZE],
            cb_target: 0,
            cb_code: 0,
            remain: 0,
            detour: 0,
        }
    }

    /// Entry point that behaves like the unhooked target.
    pub fn code(&self) -> usize {
        self.code.as_ptr() as usize
    }

    /// Entry point the patched target jumps to.
    pub fn detour_stub(&self) -> usize {
        self.detour_stub.as_ptr() as usize
    }

    pub fn cb_target(&self) -> usize {
        self.cb_target as usize
    }

    pub fn cb_code(&self) -> usize {
        self.cb_code as usize
    }

    pub fn remain(&self) -> usize {
        self.remain
    }

    pub fn detour(&self) -> usize {
        self.detour
    }
}

/// Relocates the prologue of `target` into `slot` and wires up both exits.
/// The target itself is left untouched.
///
/// # Safety
///
/// `target` must point at executable code and `slot` at a writable
/// trampoline slot.
pub(crate) unsafe fn build<P: CodePatcher>(
    patcher: &P,
    slot: NonNull<Trampoline>,
    target: usize,
    detour: usize,
) -> Result<(), HookError> {
    let base = slot.as_ptr() as usize;
    let mut code = CodeBuffer::<TRAMPOLINE_CODE_SIZE>::new(base + offset_of!(Trampoline, code));

    let mut cb_target = 0;
    while cb_target < P::JMP_SIZE {
        let src = target + cb_target;
        let inst = unsafe { patcher.copy_instruction(src, code.ip()) }?;
        // keep room for the jump back to the target
        if inst.bytes.len() + P::JMP_SIZE > code.remaining() {
            return Err(HookError::OversizedPrologue(target));
        }
        code.push(&inst.bytes)?;
        cb_target += inst.source_len;
        if inst.terminator {
            break;
        }
    }

    if cb_target < P::JMP_SIZE {
        return Err(HookError::UndersizedPrologue {
            target,
            size: cb_target,
        });
    }

    let cb_code = code.len();
    let remain = target + cb_target;
    patcher.emit_jump(&mut code, remain)?;
    patcher.emit_filler(&mut code, TRAMPOLINE_CODE_SIZE)?;

    let mut stub =
        CodeBuffer::<DETOUR_STUB_SIZE>::new(base + offset_of!(Trampoline, detour_stub));
    patcher.emit_detour_jump(&mut stub, detour)?;
    patcher.emit_filler(&mut stub, DETOUR_STUB_SIZE)?;

    trace!(
        "trampoline {base:#x} for {target:#x}: {} | {}",
        hex::encode(code.as_slice()),
        hex::encode(stub.as_slice())
    );

    let mut trampoline = Trampoline::zeroed();
    trampoline.code.copy_from_slice(code.as_slice());
    trampoline.detour_stub.copy_from_slice(stub.as_slice());
    trampoline.cb_target = cb_target as u8;
    trampoline.cb_code = cb_code as u8;
    trampoline.remain = remain;
    trampoline.detour = detour;
    unsafe { ptr::write(slot.as_ptr(), trampoline) };
    Ok(())
}
