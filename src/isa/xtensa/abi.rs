//! Xtensa windowed-ABI register conventions and the helper-call bridge.
//!
//! Unlike RISC-V's flat register file, Xtensa LX rotates a sliding window of
//! physical registers on every `entry`/`call8`/`retw`: the registers a
//! function sees as `a0..a15` are a rotated view into a much larger physical
//! file, and the hardware -- not this compiler -- handles the save/restore
//! that a flat ABI would otherwise need explicit callee-saved spill code for.
//! This compiler always uses the 8-register window (`call8`/`entry`), never
//! `call4`/`call12`, to keep one fixed convention.

use crate::buffer::CodeBuffer;
use crate::error::CompileResult;
use crate::isa::xtensa::encode;
use crate::literal_pool::LiteralPool;
use log::trace;

/// Incoming instance pointer, landing in `a2` after the `entry` window
/// rotation (this compiler's callee signature is `void(instance, frame)`,
/// called through an 8-register window, same as RISC-V's `a0`/`a1`
/// convention in spirit).
pub const INSTANCE: u8 = 2;
/// Incoming frame-base pointer (`a3`), held for the function's lifetime --
/// the window itself keeps it live across helper calls, there is no spill
/// needed the way RISC-V's flat ABI spills `s1`.
pub const FRAME_BASE: u8 = 3;
/// Scratch registers free between opcodes; never assumed live across an
/// opcode boundary.
pub const SCRATCH_0: u8 = 4;
pub const SCRATCH_1: u8 = 5;
pub const SCRATCH_2: u8 = 6;
/// Register a helper-call's target address is loaded into before `callx8`.
pub const HELPER_ADDR_REG: u8 = 7;
/// Base of the outgoing-argument window: `callx8` rotates writes to
/// `a10..a15` into the callee's `a2..a7`, so outgoing argument `n` (0-based)
/// for `n < 6` goes in `OUTGOING_ARG0 + n`.
pub const OUTGOING_ARG0: u8 = 10;
/// Stack pointer; hardware-reserved as `a1` in every window.
pub const SP: u8 = 1;

/// Fixed stack-frame size this compiler reserves for every function: enough
/// for the one outgoing-argument spill slot a helper call with more than six
/// arguments needs, rounded up to `entry`'s required 8-byte granularity.
pub const FRAME_BYTES: u16 = 32;

/// A `l32r` instruction whose pool displacement isn't known yet: recorded so
/// the caller can patch it once the owning [`LiteralPool`] has been flushed.
#[derive(Debug, Clone, Copy)]
pub struct PendingLoad {
    pub native_offset: u32,
    pub pool_index: usize,
}

/// Emit the function prologue: `entry` allocates the register window and
/// the fixed stack frame in one instruction; no explicit register spills are
/// needed since the window itself preserves `INSTANCE`/`FRAME_BASE` across
/// any call this function makes.
pub fn emit_prologue(buf: &mut CodeBuffer) -> CompileResult<()> {
    encode::entry(buf, FRAME_BYTES)
}

/// Emit the function epilogue: `retw` deallocates the window and returns.
pub fn emit_epilogue(buf: &mut CodeBuffer) -> CompileResult<()> {
    encode::retw(buf);
    Ok(())
}

/// Emit a load of virtual register `vreg`'s low 32 bits into `dst`.
pub fn load_vreg32(buf: &mut CodeBuffer, dst: u8, vreg: u8) -> CompileResult<()> {
    let off = crate::frame::VRegFrame::offset_of(vreg) as i32;
    emit_scaled_load(buf, dst, off)
}

/// Emit a store of `src`'s low 32 bits into virtual register `vreg`,
/// zeroing the high word per the frame's 32-bit-typed-slot invariant.
/// `scratch` must differ from `src`.
pub fn store_vreg32(buf: &mut CodeBuffer, vreg: u8, src: u8, scratch: u8) -> CompileResult<()> {
    let off = crate::frame::VRegFrame::offset_of(vreg) as i32;
    emit_scaled_store(buf, off, src)?;
    encode::movi(buf, scratch, 0)?;
    emit_scaled_store(buf, off + 4, scratch)
}

/// Emit a load of virtual register `vreg`'s full 64 bits into
/// `(dst_lo, dst_hi)`.
pub fn load_vreg64(buf: &mut CodeBuffer, dst_lo: u8, dst_hi: u8, vreg: u8) -> CompileResult<()> {
    let off = crate::frame::VRegFrame::offset_of(vreg) as i32;
    emit_scaled_load(buf, dst_lo, off)?;
    emit_scaled_load(buf, dst_hi, off + 4)
}

/// Emit a store of `(src_lo, src_hi)` into virtual register `vreg`'s full 64
/// bits.
pub fn store_vreg64(buf: &mut CodeBuffer, vreg: u8, src_lo: u8, src_hi: u8) -> CompileResult<()> {
    let off = crate::frame::VRegFrame::offset_of(vreg) as i32;
    emit_scaled_store(buf, off, src_lo)?;
    emit_scaled_store(buf, off + 4, src_hi)
}

/// Frame offsets run well past `l32i`'s 10-bit scaled-immediate range
/// (255 * 4 = 1020 bytes) once a function uses the upper half of the 256
/// virtual registers, so both the load and store sides fall back to
/// computing the address in a scratch register when the offset is out of
/// range.
fn emit_scaled_load(buf: &mut CodeBuffer, dst: u8, byte_offset: i32) -> CompileResult<()> {
    if (0..1020).contains(&byte_offset) && byte_offset % 4 == 0 {
        encode::l32i(buf, dst, FRAME_BASE, byte_offset)
    } else {
        addr_into(buf, SCRATCH_2, byte_offset)?;
        encode::l32i(buf, dst, SCRATCH_2, 0)
    }
}

fn emit_scaled_store(buf: &mut CodeBuffer, byte_offset: i32, src: u8) -> CompileResult<()> {
    if (0..1020).contains(&byte_offset) && byte_offset % 4 == 0 {
        encode::s32i(buf, FRAME_BASE, src, byte_offset)
    } else {
        addr_into(buf, SCRATCH_2, byte_offset)?;
        encode::s32i(buf, SCRATCH_2, src, 0)
    }
}

/// Compute `FRAME_BASE + byte_offset` into `dst`, for frame slots too far
/// from the base for a direct scaled-immediate load/store.
fn addr_into(buf: &mut CodeBuffer, dst: u8, byte_offset: i32) -> CompileResult<()> {
    if (-128..128).contains(&byte_offset) {
        encode::addi(buf, dst, FRAME_BASE, byte_offset)
    } else {
        encode::movi(buf, dst, byte_offset.clamp(-2048, 2047))?;
        encode::add(buf, dst, dst, FRAME_BASE);
        Ok(())
    }
}

/// Emit a call to a helper function: load its address through the literal
/// pool (recording a [`PendingLoad`] for the caller to patch once `pool` is
/// flushed) and `callx8` through [`HELPER_ADDR_REG`].
///
/// Real `L32R` hardware can only reach backward, so this follows the same
/// convention as every other literal-pool consumer in this backend: the
/// pool is flushed forward of the load site and the load's displacement
/// field is patched afterward once the pool's final position is known,
/// rather than requiring the pool to already be behind the load (see
/// `DESIGN.md`).
pub fn emit_helper_call(buf: &mut CodeBuffer, pool: &mut LiteralPool, helper_addr: usize) -> CompileResult<PendingLoad> {
    let addr32 = helper_addr as u32;
    let pool_index = pool.find_or_add(addr32)?;
    let native_offset = buf.offset();
    trace!("helper call to {helper_addr:#x} at native offset {native_offset}: l32r+callx8, pool entry {pool_index}");
    encode::l32r(buf, HELPER_ADDR_REG, 0)?;
    encode::callx8(buf, HELPER_ADDR_REG);
    Ok(PendingLoad { native_offset, pool_index })
}

/// Patch a [`PendingLoad`]'s `l32r` displacement now that `pool` has been
/// flushed and the entry's final offset is known.
pub fn patch_pending_load(buf: &mut CodeBuffer, pool: &LiteralPool, pending: PendingLoad) -> CompileResult<()> {
    let entry_offset = pool.offset_of(pending.pool_index).ok_or_else(|| {
        crate::error::CompileError::InvalidState(format!("literal pool entry {} was never flushed", pending.pool_index))
    })?;
    // L32R's own PC-relative convention rounds the instruction address down
    // to a word boundary before applying the (word) displacement; this
    // encoder's `l32r` mirrors that by computing the delta from the
    // word-aligned instruction address, matching what `encode::l32r`
    // assumes when it packs the field.
    let insn_word = pending.native_offset & !3;
    let disp_words = (entry_offset as i64 - insn_word as i64) / 4;
    let disp_words: i16 = disp_words.try_into().map_err(|_| {
        crate::error::CompileError::EncodingError {
            mnemonic: "l32r",
            native_offset: pending.native_offset,
            displacement: disp_words,
        }
    })?;
    buf.store_u16(pending.native_offset + 1, disp_words as u16)
}

/// Move an outgoing helper-call argument into its rotated register slot.
/// Callers needing more than [`crate::helpers::HelperCallShape::MAX_REG_ARGS`]
/// arguments must spill the rest to the stack at `SP + 0` themselves, per
/// that type's `arg_on_stack` contract.
pub fn set_outgoing_arg(buf: &mut CodeBuffer, idx: u8, src: u8) {
    encode::mov_n(buf, OUTGOING_ARG0 + idx, src);
}

/// Spill the seventh (and, per `FRAME_BYTES`, only) outgoing argument past
/// the six-register window onto the stack, at the one slot the prologue's
/// `entry` reserved for it.
pub fn store_stack_arg(buf: &mut CodeBuffer, src: u8) -> CompileResult<()> {
    encode::s32i(buf, SP, src, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WordDiscipline;

    #[test]
    fn prologue_then_epilogue_round_trip() {
        let mut mem = [0u8; 16];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::WordAccumulated);
        emit_prologue(&mut buf).unwrap();
        emit_epilogue(&mut buf).unwrap();
        assert!(!buf.has_error());
    }

    #[test]
    fn vreg32_store_then_load_round_trips_through_encoded_offsets() {
        let mut mem = [0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::WordAccumulated);
        store_vreg32(&mut buf, 1, SCRATCH_0, SCRATCH_1).unwrap();
        load_vreg32(&mut buf, SCRATCH_0, 1).unwrap();
        assert!(!buf.has_error());
    }

    #[test]
    fn far_vreg_offset_falls_back_to_computed_address() {
        let mut mem = [0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::WordAccumulated);
        // vreg 200 -> byte offset 1600, well past the direct-encode range.
        load_vreg32(&mut buf, SCRATCH_0, 200).unwrap();
        assert!(!buf.has_error());
    }

    #[test]
    fn helper_call_records_a_pending_load_and_patches_cleanly() {
        let mut mem = [0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::WordAccumulated);
        let mut pool = LiteralPool::new();
        let pending = emit_helper_call(&mut buf, &mut pool, 0x4000_1000).unwrap();
        pool.flush(&mut buf, |buf, disp| {
            encode::j(buf, disp as i32)?;
            Ok(3)
        })
        .unwrap();
        patch_pending_load(&mut buf, &pool, pending).unwrap();
        assert!(!buf.has_error());
    }
}
