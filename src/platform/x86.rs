use crate::HookError;
use crate::disassembly;
use crate::patcher::{CodeBuffer, CodePatcher, RelocatedInstruction};
use crate::platform::is_imported;
use iced_x86::{Code, FlowControl, Instruction, OpKind, Register};
use log::trace;
use std::ops::RangeInclusive;
use std::{ptr, slice};

const X86_JMP_SIZE: usize = 5;
const X86_INDIRECT_JMP_SIZE: usize = 6;
pub const BREAKPOINT: u8 = 0xcc;

#[inline]
pub fn detour_2gb_below(addr: usize) -> usize {
    if addr > 0x7ff80000 {
        addr - 0x7ff80000
    } else {
        0x80000
    }
}

#[inline]
pub fn detour_2gb_above(addr: usize) -> usize {
    #[cfg(target_pointer_width = "64")]
    if addr < 0xffffffff80000000 {
        addr + 0x7ff80000
    } else {
        0xfffffffffff80000
    }

    #[cfg(target_pointer_width = "32")]
    if addr < 0x80000000 {
        addr + 0x7ff80000
    } else {
        0xfff80000
    }
}

/// Signed 32-bit displacement from `from` to `to`, if one exists.
#[inline]
fn rel32(from: usize, to: usize) -> Option<i32> {
    i32::try_from(to.wrapping_sub(from) as isize).ok()
}

/// `jmp`, `ret`, `int3` and indirect jumps end a function's straight-line
/// code.
pub fn is_function_terminator(inst: &Instruction) -> bool {
    match inst.flow_control() {
        FlowControl::UnconditionalBranch | FlowControl::IndirectBranch | FlowControl::Return => {
            true
        }
        FlowControl::Interrupt => inst.code() == Code::Int3,
        _ => false,
    }
}

/// Pointer slot read by a `jmp [slot]`.
fn jmp_slot(inst: &Instruction) -> Option<usize> {
    if !matches!(inst.code(), Code::Jmp_rm32 | Code::Jmp_rm64) || inst.op0_kind() != OpKind::Memory
    {
        return None;
    }
    if inst.is_ip_rel_memory_operand() {
        return Some(inst.ip_rel_memory_address() as usize);
    }
    if inst.memory_base() == Register::None && inst.memory_index() == Register::None {
        return Some(inst.memory_displacement64() as usize);
    }
    None
}

/// Follows `jmp [slot]` when the slot belongs to an import table.
unsafe fn skip_import_jmp(code: usize, inst: &Instruction) -> Option<usize> {
    let slot = jmp_slot(inst)?;
    if !is_imported(code, slot) {
        return None;
    }
    let real = unsafe { ptr::read_unaligned(slot as *const usize) };
    trace!("{code:#x} imports {real:#x} through {slot:#x}");
    Some(real)
}

/// Code generation for 32-bit x86 and x86-64.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86;

impl CodePatcher for X86 {
    const JMP_SIZE: usize = X86_JMP_SIZE;

    unsafe fn copy_instruction(
        &self,
        src: usize,
        dst: usize,
    ) -> Result<RelocatedInstruction, HookError> {
        let inst = unsafe { disassembly::decode_instruction(src) };
        if inst.is_invalid() {
            return Err(HookError::InvalidInstruction(src));
        }
        let bytes = disassembly::encode_at(&inst, dst)
            .map_err(|source| HookError::Relocation { ip: src, source })?;
        trace!(
            "relocate {src:#x} -> {dst:#x}: {} => {}",
            hex::encode(unsafe { slice::from_raw_parts(src as *const u8, inst.len()) }),
            hex::encode(&bytes)
        );
        Ok(RelocatedInstruction {
            source_len: inst.len(),
            bytes,
            terminator: is_function_terminator(&inst),
        })
    }

    fn emit_jump<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        to: usize,
    ) -> Result<(), HookError> {
        let from = buf.ip();
        let disp = rel32(from.wrapping_add(X86_JMP_SIZE), to)
            .ok_or(HookError::JumpOutOfRange { from, to })?;
        let mut jmp = [0xe9, 0, 0, 0, 0];
        jmp[1..].copy_from_slice(&disp.to_le_bytes());
        buf.push(&jmp)
    }

    fn emit_indirect_jump<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        slot: usize,
    ) -> Result<(), HookError> {
        let from = buf.ip();
        #[cfg(target_pointer_width = "64")]
        let operand = rel32(from.wrapping_add(X86_INDIRECT_JMP_SIZE), slot)
            .ok_or(HookError::JumpOutOfRange { from, to: slot })?
            .to_le_bytes();
        #[cfg(target_pointer_width = "32")]
        let operand = (slot as u32).to_le_bytes();

        let mut jmp = [0xff, 0x25, 0, 0, 0, 0];
        jmp[2..].copy_from_slice(&operand);
        buf.push(&jmp)
    }

    fn emit_detour_jump<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        detour: usize,
    ) -> Result<(), HookError> {
        #[cfg(target_pointer_width = "64")]
        {
            // jmp [rip+0]; dq detour
            if buf.remaining() < X86_INDIRECT_JMP_SIZE + size_of::<usize>() {
                return Err(HookError::BufferOverflow);
            }
            let slot = buf.ip() + X86_INDIRECT_JMP_SIZE;
            self.emit_indirect_jump(buf, slot)?;
            buf.push(&detour.to_le_bytes())
        }
        #[cfg(target_pointer_width = "32")]
        {
            self.emit_jump(buf, detour)
        }
    }

    fn emit_filler<const N: usize>(
        &self,
        buf: &mut CodeBuffer<N>,
        end: usize,
    ) -> Result<(), HookError> {
        buf.fill_to(end, BREAKPOINT)
    }

    unsafe fn skip_forwarding_jump(&self, code: usize) -> usize {
        let mut code = code;
        let mut inst = unsafe { disassembly::decode_instruction(code) };

        // the imported code may itself be an incremental linking stub
        if let Some(real) = unsafe { skip_import_jmp(code, &inst) } {
            code = real;
            inst = unsafe { disassembly::decode_instruction(code) };
        }

        if matches!(inst.code(), Code::Jmp_rel8_32 | Code::Jmp_rel8_64) {
            let code = inst.near_branch_target() as usize;
            let inst = unsafe { disassembly::decode_instruction(code) };

            if let Some(real) = unsafe { skip_import_jmp(code, &inst) } {
                return real;
            }
            if matches!(inst.code(), Code::Jmp_rel32_32 | Code::Jmp_rel32_64) {
                return inst.near_branch_target() as usize;
            }
            return code;
        }

        code
    }

    unsafe fn jump_bounds(&self, code: usize) -> RangeInclusive<usize> {
        let inst = unsafe { disassembly::decode_instruction(code) };
        let mut lo = detour_2gb_below(code);
        let mut hi = detour_2gb_above(code);
        if matches!(inst.code(), Code::Jmp_rel32_32 | Code::Jmp_rel32_64) {
            let new = inst.near_branch_target() as usize;
            if new < code {
                hi = detour_2gb_above(new);
            } else {
                lo = detour_2gb_below(new);
            }
        }
        lo..=hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disassembly::MAX_INSTRUCTION_SIZE;

    fn decode(bytes: &[u8]) -> Instruction {
        let mut padded = [BREAKPOINT; MAX_INSTRUCTION_SIZE];
        padded[..bytes.len()].copy_from_slice(bytes);
        unsafe { disassembly::decode_instruction(padded.as_ptr() as usize) }
    }

    #[test]
    fn jump_displacement_is_relative_to_next_instruction() {
        let mut buf = CodeBuffer::<8>::new(0x40_0000);
        X86.emit_jump(&mut buf, 0x40_0100).unwrap();
        assert_eq!(buf.as_slice(), &[0xe9, 0xfb, 0x00, 0x00, 0x00]);

        let mut buf = CodeBuffer::<8>::new(0x40_0100);
        X86.emit_jump(&mut buf, 0x40_0000).unwrap();
        assert_eq!(buf.as_slice(), &[0xe9, 0xfb, 0xfe, 0xff, 0xff]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn jump_out_of_range_is_rejected() {
        let mut buf = CodeBuffer::<8>::new(0x1000);
        let err = X86.emit_jump(&mut buf, 0x1_0000_1000).unwrap_err();
        assert!(matches!(err, HookError::JumpOutOfRange { from: 0x1000, .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn jump_needs_room() {
        let mut buf = CodeBuffer::<4>::new(0x1000);
        assert!(matches!(
            X86.emit_jump(&mut buf, 0x2000),
            Err(HookError::BufferOverflow)
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn detour_jump_is_absolute() {
        let mut buf = CodeBuffer::<16>::new(0x7000_0000_0000);
        X86.emit_detour_jump(&mut buf, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(
            buf.as_slice(),
            &[
                0xff, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11
            ]
        );
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn detour_jump_is_relative() {
        let mut buf = CodeBuffer::<16>::new(0x1000);
        X86.emit_detour_jump(&mut buf, 0x2000).unwrap();
        assert_eq!(buf.as_slice(), &[0xe9, 0xfb, 0x0f, 0, 0]);
    }

    #[test]
    fn filler_is_breakpoints() {
        let mut buf = CodeBuffer::<8>::new(0);
        buf.push(&[0x90]).unwrap();
        X86.emit_filler(&mut buf, 4).unwrap();
        assert_eq!(buf.as_slice(), &[0x90, 0xcc, 0xcc, 0xcc]);
    }

    #[test]
    fn terminators() {
        assert!(is_function_terminator(&decode(&[0xc3])));
        assert!(is_function_terminator(&decode(&[0xcc])));
        assert!(is_function_terminator(&decode(&[0xeb, 0x00])));
        assert!(is_function_terminator(&decode(&[0xe9, 0, 0, 0, 0])));
        // jmp eax
        assert!(is_function_terminator(&decode(&[0xff, 0xe0])));
        // fs: jmp [eax]
        assert!(is_function_terminator(&decode(&[0x64, 0xff, 0x20])));

        // push ebp / call rel32 / jz rel8
        assert!(!is_function_terminator(&decode(&[0x55])));
        assert!(!is_function_terminator(&decode(&[0xe8, 0, 0, 0, 0])));
        assert!(!is_function_terminator(&decode(&[0x74, 0x02])));
    }

    #[test]
    fn follows_short_jump_into_long_jump() {
        let mut code = [BREAKPOINT; 64];
        // 0: jmp short 5
        code[0] = 0xeb;
        code[1] = 0x03;
        // 5: jmp near 40
        code[5] = 0xe9;
        code[6..10].copy_from_slice(&30i32.to_le_bytes());
        let base = code.as_ptr() as usize;

        let real = unsafe { X86.skip_forwarding_jump(base) };
        assert_eq!(real, base + 40);
        assert_eq!(unsafe { X86.skip_forwarding_jump(real) }, real);
    }

    #[test]
    fn short_jump_alone_is_followed_once() {
        let mut code = [BREAKPOINT; 64];
        // 0: jmp short 4; 4: push ebp
        code[0] = 0xeb;
        code[1] = 0x02;
        code[4] = 0x55;
        let base = code.as_ptr() as usize;
        assert_eq!(unsafe { X86.skip_forwarding_jump(base) }, base + 4);
    }

    #[test]
    fn plain_code_is_left_alone() {
        let mut code = [BREAKPOINT; 32];
        code[0] = 0x55;
        let base = code.as_ptr() as usize;
        assert_eq!(unsafe { X86.skip_forwarding_jump(base) }, base);
    }

    #[test]
    fn bounds_cover_two_gigabytes() {
        let mut code = [BREAKPOINT; 32];
        code[0] = 0x55;
        let base = code.as_ptr() as usize;
        let bounds = unsafe { X86.jump_bounds(base) };
        assert_eq!(*bounds.start(), detour_2gb_below(base));
        assert_eq!(*bounds.end(), detour_2gb_above(base));
        assert!(bounds.contains(&base));
    }

    #[test]
    fn bounds_narrow_towards_jump_destination() {
        let mut code = [BREAKPOINT; 32];
        code[0] = 0xe9;
        code[1..5].copy_from_slice(&0x1000i32.to_le_bytes());
        let base = code.as_ptr() as usize;
        let bounds = unsafe { X86.jump_bounds(base) };
        assert_eq!(*bounds.start(), detour_2gb_below(base + 5 + 0x1000));
        assert_eq!(*bounds.end(), detour_2gb_above(base));
    }

    #[test]
    fn copy_keeps_position_independent_code() {
        let mut code = [BREAKPOINT; 32];
        // push (r|e)bp
        code[0] = 0x55;
        let src = code.as_ptr() as usize;
        let copied = unsafe { X86.copy_instruction(src, src + 0x100) }.unwrap();
        assert_eq!(copied.bytes, vec![0x55]);
        assert_eq!(copied.source_len, 1);
        assert_eq!(copied.extra(), 0);
        assert!(!copied.terminator);
    }

    #[test]
    fn copy_reports_growth_of_short_branches() {
        let mut code = [BREAKPOINT; 32];
        // jz +2
        code[0] = 0x74;
        code[1] = 0x02;
        let src = code.as_ptr() as usize;
        let copied = unsafe { X86.copy_instruction(src, src + 0x1000) }.unwrap();
        assert_eq!(copied.source_len, 2);
        assert_eq!(copied.extra(), 4);
    }

    /// Executable page followed by a read/write data page, both filled with
    /// breakpoints.
    #[cfg(all(unix, target_pointer_width = "64"))]
    fn code_and_data() -> (usize, usize) {
        use region::Protection;

        let page = region::page::size();
        let mut alloc = region::alloc(2 * page, Protection::READ_WRITE_EXECUTE).unwrap();
        let base = alloc.as_mut_ptr::<u8>();
        std::mem::forget(alloc);
        unsafe {
            ptr::write_bytes(base, BREAKPOINT, 2 * page);
            region::protect(base.add(page).cast_const(), page, Protection::READ_WRITE).unwrap();
        }
        (base as usize, base as usize + page)
    }

    /// Writes `jmp [rip+disp]` at `at` reading the pointer slot `slot`.
    #[cfg(all(unix, target_pointer_width = "64"))]
    fn write_import_jmp(at: usize, slot: usize) {
        let disp = i32::try_from(slot as isize - (at as isize + 6)).unwrap();
        let mut jmp = [0xff, 0x25, 0, 0, 0, 0];
        jmp[2..].copy_from_slice(&disp.to_le_bytes());
        unsafe { ptr::copy_nonoverlapping(jmp.as_ptr(), at as *mut u8, jmp.len()) };
    }

    #[cfg(all(unix, target_pointer_width = "64"))]
    #[test]
    fn follows_import_slot() {
        let (code, data) = code_and_data();
        let real = code + 0x100;
        unsafe {
            *(real as *mut u8) = 0x55;
            ptr::write_unaligned(data as *mut usize, real);
        }
        write_import_jmp(code, data);

        assert!(is_imported(code, data));
        assert_eq!(unsafe { X86.skip_forwarding_jump(code) }, real);
        assert_eq!(unsafe { X86.skip_forwarding_jump(real) }, real);
    }

    #[cfg(all(unix, target_pointer_width = "64"))]
    #[test]
    fn import_leading_to_short_jump_is_followed_through() {
        let (code, data) = code_and_data();
        let stub = code + 0x100;
        unsafe {
            // stub: jmp short +0x10; body: push rbp
            ptr::copy_nonoverlapping([0xebu8, 0x10].as_ptr(), stub as *mut u8, 2);
            *((stub + 0x12) as *mut u8) = 0x55;
            ptr::write_unaligned(data as *mut usize, stub);
        }
        write_import_jmp(code, data);

        let once = unsafe { X86.skip_forwarding_jump(code) };
        assert_eq!(once, stub + 0x12);
        assert_eq!(unsafe { X86.skip_forwarding_jump(once) }, once);
    }

    #[cfg(all(unix, target_pointer_width = "64"))]
    #[test]
    fn executable_slot_is_not_an_import() {
        let (code, _) = code_and_data();
        let slot = code + 0x200;
        unsafe { ptr::write_unaligned(slot as *mut usize, code + 0x100) };
        write_import_jmp(code, slot);

        assert!(!is_imported(code, slot));
        assert_eq!(unsafe { X86.skip_forwarding_jump(code) }, code);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn copy_rejects_garbage() {
        let mut code = [BREAKPOINT; 32];
        // push es does not exist in long mode
        code[0] = 0x06;
        let src = code.as_ptr() as usize;
        assert!(matches!(
            unsafe { X86.copy_instruction(src, src) },
            Err(HookError::InvalidInstruction(addr)) if addr == src
        ));
    }
}
