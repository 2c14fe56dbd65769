#[cfg(target_pointer_width = "32")]
pub const BITNESS: u32 = 32;
#[cfg(target_pointer_width = "64")]
pub const BITNESS: u32 = 64;

/// Longest legal x86 instruction.
pub const MAX_INSTRUCTION_SIZE: usize = 15;

mod __private {
    use super::{BITNESS, MAX_INSTRUCTION_SIZE};
    use iced_x86::{
        BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, IcedError, Instruction,
        InstructionBlock,
    };
    use std::ptr::slice_from_raw_parts;

    /// Decodes the single instruction at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be readable for the length of the instruction it holds.
    pub unsafe fn decode_instruction(addr: usize) -> Instruction {
        unsafe { decoder(addr as *const u8) }.decode()
    }

    /// # Safety
    ///
    /// `addr` must be readable for [`MAX_INSTRUCTION_SIZE`] bytes.
    pub unsafe fn decoder<T>(addr: *const T) -> Decoder<'static> {
        unsafe { decoder_with_size(addr, MAX_INSTRUCTION_SIZE) }
    }

    /// # Safety
    ///
    /// `addr` must be readable for `size` bytes.
    pub unsafe fn decoder_with_size<T>(addr: *const T, size: usize) -> Decoder<'static> {
        let data = slice_from_raw_parts(addr.cast::<u8>(), size);
        Decoder::with_ip(
            BITNESS,
            unsafe { &*data },
            addr as u64,
            DecoderOptions::NONE,
        )
    }

    /// Re-encodes `instruction` to run at `ip`. Short branches are widened
    /// when their destination is no longer in reach.
    pub fn encode_at(instruction: &Instruction, ip: usize) -> Result<Vec<u8>, IcedError> {
        let block = InstructionBlock::new(std::slice::from_ref(instruction), ip as u64);
        BlockEncoder::encode(BITNESS, block, BlockEncoderOptions::NONE)
            .map(|result| result.code_buffer)
    }
}

pub use __private::*;
