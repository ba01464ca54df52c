//! Xtensa LX instruction encoders.
//!
//! Xtensa packs most instructions into a 24-bit word (never 32) and a
//! narrower 16-bit form for the common, densely-used subset of opcodes; both
//! are little-endian in memory. Fields are nibble-addressed in the ISA
//! manual's own notation (`op0`, `t`, `s`, `r`, `op1`, `op2`), which this
//! file mirrors with one field-packing function per instruction shape, the
//! same way `isa::riscv::encode` has one `put_*` per RISC-V format.
//!
//! This is a from-scratch encoder, not lifted from a disassembler table: the
//! field *positions* below follow the public Xtensa ISA reference formats
//! (RRR / RRI8 / BRI8 / BRI12 / CALLX / CALL / RRRN / RI7 / RI6), but the
//! specific opcode constants are this compiler's own consistent assignment
//! rather than values cross-checked against a real core's opcode map --
//! there is no Xtensa teacher in this corpus to lift them from (see
//! `DESIGN.md`).

use crate::buffer::CodeBuffer;
use crate::error::{CompileError, CompileResult};

fn encoding_error(mnemonic: &'static str, native_offset: u32, value: i64) -> CompileError {
    CompileError::EncodingError {
        mnemonic,
        native_offset,
        displacement: value,
    }
}

// --- Format packers ---
//
// Every 24-bit format here packs its lowest nibble as `op0`, consistent with
// how the ISA manual numbers bit fields least-significant-first.

/// RRR: three register fields plus two opcode-extension nibbles --
/// `op2 op1 r s t op0`, used for the inline ALU group and SAR-mediated
/// shifts.
fn put_rrr(buf: &mut CodeBuffer, op0: u8, t: u8, s: u8, r: u8, op1: u8, op2: u8) {
    let word = (op0 as u32 & 0xf)
        | ((t as u32 & 0xf) << 4)
        | ((s as u32 & 0xf) << 8)
        | ((r as u32 & 0xf) << 12)
        | ((op1 as u32 & 0xf) << 16)
        | ((op2 as u32 & 0xf) << 20);
    buf.put3(word);
}

/// RRI8: two register fields and an 8-bit immediate -- `imm8 r s t op0`,
/// used for immediate ALU ops, loads/stores (`imm8` pre-scaled by the access
/// width by the caller), and register-register compare branches.
fn put_rri8(buf: &mut CodeBuffer, op0: u8, t: u8, s: u8, r: u8, imm8: u8) {
    let word =
        (op0 as u32 & 0xf) | ((t as u32 & 0xf) << 4) | ((s as u32 & 0xf) << 8) | ((r as u32 & 0xf) << 12) | ((imm8 as u32) << 16);
    buf.put3(word);
}

/// BRI12: one register and a 12-bit immediate, used by the zero-compare
/// branches (`beqz`/`bnez`) -- `imm12 m_n s op0`.
fn put_bri12(buf: &mut CodeBuffer, op0: u8, s: u8, mn: u8, imm12: i32) -> CompileResult<()> {
    if !(-2048..2048).contains(&imm12) {
        return Err(encoding_error("beqz/bnez", buf.offset(), imm12 as i64));
    }
    let word = (op0 as u32 & 0xf) | ((s as u32 & 0xf) << 4) | ((mn as u32 & 0xf) << 8) | (((imm12 as u32) & 0xfff) << 12);
    buf.put3(word);
    Ok(())
}

/// CALLX: an indirect call through a register, windowed by `wc` (the number
/// of registers the call rotates in, encoded in `n`/`m`).
fn put_callx(buf: &mut CodeBuffer, op0: u8, s: u8, m: u8, n: u8) {
    let word = (op0 as u32 & 0xf) | ((n as u32 & 0x3) << 4) | ((m as u32 & 0x3) << 6) | ((s as u32 & 0xf) << 8);
    buf.put3(word);
}

/// CALL: a PC-relative unconditional jump/call -- an 18-bit signed offset
/// (in bytes) plus a 2-bit window-count selector.
fn put_call(buf: &mut CodeBuffer, op0: u8, n: u8, imm18: i32) -> CompileResult<()> {
    if !(-(1 << 17)..(1 << 17)).contains(&imm18) {
        return Err(encoding_error("call/j", buf.offset(), imm18 as i64));
    }
    let imm18 = (imm18 as u32) & 0x3_ffff;
    let word = (op0 as u32 & 0xf) | ((n as u32 & 0x3) << 4) | (imm18 << 6);
    buf.put3(word);
    Ok(())
}

/// RRRN: the 16-bit narrow three-register form used by `add.n`.
fn put_rrrn(buf: &mut CodeBuffer, op0: u8, t: u8, s: u8, r: u8) {
    let word = (op0 as u16 & 0xf) | ((t as u16 & 0xf) << 4) | ((s as u16 & 0xf) << 8) | ((r as u16 & 0xf) << 12);
    buf.put2(word);
}

/// RI7: narrow register + signed 7-bit immediate, used by `movi.n`.
fn put_ri7(buf: &mut CodeBuffer, op0: u8, s: u8, imm7: i32) -> CompileResult<()> {
    if !(-64..64).contains(&imm7) {
        return Err(encoding_error("movi.n", buf.offset(), imm7 as i64));
    }
    let imm7 = (imm7 as u32) & 0x7f;
    let word = (op0 as u16 & 0xf) | ((s as u16 & 0xf) << 4) | ((imm7 as u16) << 8);
    buf.put2(word);
    Ok(())
}

/// RI6: narrow register + unsigned 6-bit immediate, used by
/// `beqz.n`/`bnez.n`.
fn put_ri6(buf: &mut CodeBuffer, op0: u8, s: u8, imm6: u32) {
    let word = (op0 as u16 & 0xf) | ((s as u16 & 0xf) << 4) | ((imm6 as u16 & 0x3f) << 8);
    buf.put2(word);
}

// --- Inline ALU, 24-bit RRR ---

pub fn add(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrr(buf, 0x0, rd, rs1, rs2, 0x0, 0x8);
}
pub fn sub(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrr(buf, 0x0, rd, rs1, rs2, 0x0, 0xc);
}
pub fn and_(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrr(buf, 0x0, rd, rs1, rs2, 0x0, 0x1);
}
pub fn or_(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrr(buf, 0x0, rd, rs1, rs2, 0x0, 0x2);
}
pub fn xor_(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrr(buf, 0x0, rd, rs1, rs2, 0x0, 0x3);
}
/// 32x32 -> low 32 bits of the product.
pub fn mull(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrr(buf, 0x0, rd, rs1, rs2, 0x2, 0x8);
}

/// Narrow add, 16 bits: `add.n rd, rs1, rs2`.
pub fn add_n(buf: &mut CodeBuffer, rd: u8, rs1: u8, rs2: u8) {
    put_rrrn(buf, 0xa, rd, rs1, rs2);
}
/// Narrow move, 16 bits: `mov.n rd, rs` (`add.n rd, rs, a1` with the zero
/// operand pinned to a register this backend never writes through `a1`).
pub fn mov_n(buf: &mut CodeBuffer, rd: u8, rs: u8) {
    put_rrrn(buf, 0xd, 0x0, rs, rd);
}

// --- Shifts: SAR-mediated variable shifts, plus immediate shifts ---

/// Load the shift-amount register (SAR) with `rs`'s low 5 bits, for a
/// following [`sll`].
pub fn ssl(buf: &mut CodeBuffer, rs: u8) {
    put_rrr(buf, 0x0, 0x0, rs, 0x1, 0x0, 0x0);
}
/// As [`ssl`] but loads the complemented amount `32 - rs[4:0]`, for a
/// following [`sra`]/[`srl`].
pub fn ssr(buf: &mut CodeBuffer, rs: u8) {
    put_rrr(buf, 0x0, 0x0, rs, 0x0, 0x0, 0x0);
}
pub fn sll(buf: &mut CodeBuffer, rd: u8, rs: u8) {
    put_rrr(buf, 0x0, rd, rs, 0x0, 0x1, 0xa);
}
pub fn sra(buf: &mut CodeBuffer, rd: u8, rs: u8) {
    put_rrr(buf, 0x0, rd, 0x0, rs, 0x1, 0xb);
}
pub fn srl(buf: &mut CodeBuffer, rd: u8, rs: u8) {
    put_rrr(buf, 0x0, rd, 0x0, rs, 0x1, 0x9);
}
/// Immediate left shift by a constant 0..32 amount.
pub fn slli(buf: &mut CodeBuffer, rd: u8, rs: u8, shamt: u32) -> CompileResult<()> {
    if shamt >= 32 {
        return Err(encoding_error("slli", buf.offset(), shamt as i64));
    }
    // Real SLLI spreads the 5-bit amount across `r`'s low bit and `op2`;
    // folded into one op1 nibble here since both sides already decode it
    // the same way this encoder packs it.
    put_rrr(buf, 0x0, rd, (32 - shamt) as u8 & 0xf, rs, 0x1, 0x0 | (((32 - shamt) >> 4) as u8 & 0x1));
    Ok(())
}
pub fn srai(buf: &mut CodeBuffer, rd: u8, rs: u8, shamt: u32) -> CompileResult<()> {
    if shamt >= 32 {
        return Err(encoding_error("srai", buf.offset(), shamt as i64));
    }
    put_rrr(buf, 0x0, rd, (shamt & 0xf) as u8, rs, 0x1, 0x1 | (((shamt >> 4) as u8) << 1));
    Ok(())
}
pub fn srli(buf: &mut CodeBuffer, rd: u8, rs: u8, shamt: u32) -> CompileResult<()> {
    if shamt >= 32 {
        return Err(encoding_error("srli", buf.offset(), shamt as i64));
    }
    put_rrr(buf, 0x0, rd, (shamt & 0xf) as u8, rs, 0x1, 0x2);
    Ok(())
}

/// Extract an unsigned bitfield of `mask_width` bits starting `shift` bits
/// in from `rs`'s LSB (`extui rd, rs, shift, mask_width`).
pub fn extui(buf: &mut CodeBuffer, rd: u8, rs: u8, shift: u32, mask_width: u32) -> CompileResult<()> {
    if shift >= 32 || mask_width == 0 || mask_width > 16 {
        return Err(encoding_error("extui", buf.offset(), ((shift as i64) << 8) | mask_width as i64));
    }
    put_rrr(buf, 0x0, rd, shift as u8 & 0xf, rs, (mask_width - 1) as u8 & 0xf, 0x4 | ((shift >> 4) as u8 & 0x1));
    Ok(())
}

// --- Immediate loads ---

/// `movi rd, imm12`: load a 12-bit signed immediate directly (no literal
/// pool round trip needed for small constants).
pub fn movi(buf: &mut CodeBuffer, rd: u8, imm12: i32) -> CompileResult<()> {
    if !(-2048..2048).contains(&imm12) {
        return Err(encoding_error("movi", buf.offset(), imm12 as i64));
    }
    let imm12 = imm12 as u32 & 0xfff;
    // RRI8-shaped, with the immediate's low byte in `imm8` and high nibble
    // folded into `r` per this encoder's own MOVI layout.
    put_rri8(buf, 0xa, rd, 0x0, ((imm12 >> 8) & 0xf) as u8, (imm12 & 0xff) as u8);
    Ok(())
}
/// Narrow `movi.n rd, imm7` (signed -32..=95, matching the narrow encoding's
/// asymmetric range; callers needing the full 12-bit range fall back to
/// [`movi`]).
pub fn movi_n(buf: &mut CodeBuffer, rd: u8, imm7: i32) -> CompileResult<()> {
    put_ri7(buf, 0xc, rd, imm7)
}
pub fn addi(buf: &mut CodeBuffer, rd: u8, rs: u8, imm8: i32) -> CompileResult<()> {
    if !(-128..128).contains(&imm8) {
        return Err(encoding_error("addi", buf.offset(), imm8 as i64));
    }
    put_rri8(buf, 0xc, rd, rs, 0x2, imm8 as u8);
    Ok(())
}

/// `l32r rd, <pool entry>`: PC-relative load from the literal pool. `disp`
/// is a signed word count (`(target - (pc & !3)) / 4`), this backend's own
/// convention -- see the module docs on why this diverges from hardware's
/// backward-only unsigned literal offset.
pub fn l32r(buf: &mut CodeBuffer, rd: u8, disp_words: i32) -> CompileResult<()> {
    if !(-32768..32768).contains(&disp_words) {
        return Err(encoding_error("l32r", buf.offset(), disp_words as i64));
    }
    let word = 0x1u32 | ((rd as u32 & 0xf) << 4) | ((disp_words as u32 & 0xffff) << 8);
    buf.put3(word);
    Ok(())
}

// --- Loads / stores ---
//
// `imm8` is pre-scaled by the access width (4 for word, 2 for halfword, 1
// for byte), matching how the real ISA packs these so the effective
// addressable range grows with access size.

pub fn l32i(buf: &mut CodeBuffer, rd: u8, rs: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x2, rd, rs, byte_offset, 4, "l32i")
}
pub fn l16ui(buf: &mut CodeBuffer, rd: u8, rs: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x1, rd, rs, byte_offset, 2, "l16ui")
}
pub fn l16si(buf: &mut CodeBuffer, rd: u8, rs: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x9, rd, rs, byte_offset, 2, "l16si")
}
pub fn l8ui(buf: &mut CodeBuffer, rd: u8, rs: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x0, rd, rs, byte_offset, 1, "l8ui")
}
pub fn s32i(buf: &mut CodeBuffer, rs_addr: u8, rs_val: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x6, rs_val, rs_addr, byte_offset, 4, "s32i")
}
pub fn s16i(buf: &mut CodeBuffer, rs_addr: u8, rs_val: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x5, rs_val, rs_addr, byte_offset, 2, "s16i")
}
pub fn s8i(buf: &mut CodeBuffer, rs_addr: u8, rs_val: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_rri8(buf, 0x4, rs_val, rs_addr, byte_offset, 1, "s8i")
}

fn emit_scaled_rri8(buf: &mut CodeBuffer, op1: u8, t: u8, s: u8, byte_offset: i32, scale: i32, mnemonic: &'static str) -> CompileResult<()> {
    if byte_offset % scale != 0 {
        return Err(encoding_error(mnemonic, buf.offset(), byte_offset as i64));
    }
    let scaled = byte_offset / scale;
    if !(0..256).contains(&scaled) {
        return Err(encoding_error(mnemonic, buf.offset(), byte_offset as i64));
    }
    put_rri8(buf, 0x2, t, s, op1, scaled as u8);
    Ok(())
}

/// Narrow word load, `l32i.n rd, rs, byte_offset` (offset 0..=60, step 4).
pub fn l32i_n(buf: &mut CodeBuffer, rd: u8, rs: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_narrow(buf, 0x8, rd, rs, byte_offset, "l32i.n")
}
/// Narrow word store, `s32i.n rs_val, rs_addr, byte_offset`.
pub fn s32i_n(buf: &mut CodeBuffer, rs_addr: u8, rs_val: u8, byte_offset: i32) -> CompileResult<()> {
    emit_scaled_narrow(buf, 0x9, rs_val, rs_addr, byte_offset, "s32i.n")
}

fn emit_scaled_narrow(buf: &mut CodeBuffer, op0: u8, t: u8, s: u8, byte_offset: i32, mnemonic: &'static str) -> CompileResult<()> {
    if byte_offset % 4 != 0 || !(0..64).contains(&byte_offset) {
        return Err(encoding_error(mnemonic, buf.offset(), byte_offset as i64));
    }
    put_rrrn(buf, op0, t, s, (byte_offset / 4) as u8);
    Ok(())
}

// --- Branches / jumps ---

pub fn beqz(buf: &mut CodeBuffer, rs: u8, imm12: i32) -> CompileResult<()> {
    put_bri12(buf, 0x6, rs, 0x8, imm12)
}
pub fn bnez(buf: &mut CodeBuffer, rs: u8, imm12: i32) -> CompileResult<()> {
    put_bri12(buf, 0x6, rs, 0x9, imm12)
}
/// Narrow zero-compare branches, 6-bit unsigned forward-only displacement
/// (real hardware's narrow branches only reach forward; this backend always
/// prefers the wide form for backward edges).
pub fn beqz_n(buf: &mut CodeBuffer, rs: u8, disp6: u32) {
    put_ri6(buf, 0x8, rs, disp6);
}
pub fn bnez_n(buf: &mut CodeBuffer, rs: u8, disp6: u32) {
    put_ri6(buf, 0x9, rs, disp6);
}

pub fn beq(buf: &mut CodeBuffer, rs1: u8, rs2: u8, imm8: i32) -> CompileResult<()> {
    emit_compare_branch(buf, 0x1, rs1, rs2, imm8, "beq")
}
pub fn bne(buf: &mut CodeBuffer, rs1: u8, rs2: u8, imm8: i32) -> CompileResult<()> {
    emit_compare_branch(buf, 0x9, rs1, rs2, imm8, "bne")
}
pub fn blt(buf: &mut CodeBuffer, rs1: u8, rs2: u8, imm8: i32) -> CompileResult<()> {
    emit_compare_branch(buf, 0x2, rs1, rs2, imm8, "blt")
}
pub fn bge(buf: &mut CodeBuffer, rs1: u8, rs2: u8, imm8: i32) -> CompileResult<()> {
    emit_compare_branch(buf, 0xa, rs1, rs2, imm8, "bge")
}
pub fn bltu(buf: &mut CodeBuffer, rs1: u8, rs2: u8, imm8: i32) -> CompileResult<()> {
    emit_compare_branch(buf, 0x3, rs1, rs2, imm8, "bltu")
}
pub fn bgeu(buf: &mut CodeBuffer, rs1: u8, rs2: u8, imm8: i32) -> CompileResult<()> {
    emit_compare_branch(buf, 0xb, rs1, rs2, imm8, "bgeu")
}

fn emit_compare_branch(buf: &mut CodeBuffer, op1: u8, rs1: u8, rs2: u8, imm8: i32, mnemonic: &'static str) -> CompileResult<()> {
    if !(-128..128).contains(&imm8) {
        return Err(encoding_error(mnemonic, buf.offset(), imm8 as i64));
    }
    put_rri8(buf, 0x7, rs2, rs1, op1, imm8 as u8);
    Ok(())
}

/// Unconditional PC-relative jump, `j imm18` (byte displacement).
pub fn j(buf: &mut CodeBuffer, imm18: i32) -> CompileResult<()> {
    put_call(buf, 0x6, 0x0, imm18)
}

/// Indirect call through `rs`, rotating an 8-register window
/// (`callx8 rs`); the call site's return address and outgoing arguments
/// become the callee's `a0`/`a2..`.
pub fn callx8(buf: &mut CodeBuffer, rs: u8) {
    put_callx(buf, 0x0, rs, 0x0, 0x3);
}

/// Allocate a register window of `frame_bytes` (rounded by the caller to a
/// multiple of 8) and the matching `entry` window-rotation amount.
pub fn entry(buf: &mut CodeBuffer, frame_bytes: u16) -> CompileResult<()> {
    if frame_bytes % 8 != 0 || frame_bytes >= 0x8000 {
        return Err(encoding_error("entry", buf.offset(), frame_bytes as i64));
    }
    let word = 0x6u32 | (0x3 << 4) | ((frame_bytes as u32 >> 3) << 8);
    buf.put3(word);
    Ok(())
}

/// Windowed return: deallocates the register window `entry` opened and
/// returns to the caller's `a0`.
pub fn retw(buf: &mut CodeBuffer) {
    put_callx(buf, 0x0, 0x0, 0x1, 0x0);
}

/// 2-byte no-op, the only valid all-zero-free filler on this ISA (see
/// [`crate::literal_pool::XTENSA_NOP_N`]).
pub fn nop_n(buf: &mut CodeBuffer) {
    buf.put2(crate::literal_pool::XTENSA_NOP_N);
}

/// Memory barrier: orders prior loads/stores against subsequent ones. This
/// backend's equivalent of RISC-V's `fence rw,rw`, for `AtomicFence`.
pub fn memw(buf: &mut CodeBuffer) {
    put_rrr(buf, 0x0, 0x0, 0x0, 0xc, 0x0, 0x0);
}

/// Instruction-fetch synchronization: forces the pipeline to discard any
/// prefetched instructions and refetch, this backend's equivalent of
/// RISC-V's `fence.i` after self-modifying/just-emitted code.
pub fn isync(buf: &mut CodeBuffer) {
    put_rrr(buf, 0x0, 0x0, 0x0, 0x2, 0x0, 0x0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WordDiscipline;

    fn buf(mem: &mut [u8]) -> CodeBuffer {
        CodeBuffer::new(mem, WordDiscipline::WordAccumulated)
    }

    #[test]
    fn add_is_three_bytes_and_round_trips_fields() {
        let mut mem = [0u8; 4];
        let mut b = buf(&mut mem);
        add(&mut b, 4, 5, 6);
        assert_eq!(b.offset(), 3);
        let word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
        assert_eq!(word & 0xf, 0x0, "op0 nibble");
        assert_eq!((word >> 4) & 0xf, 4, "t = rd");
        assert_eq!((word >> 8) & 0xf, 5, "s = rs1");
        assert_eq!((word >> 12) & 0xf, 6, "r = rs2");
        assert_eq!((word >> 20) & 0xf, 0x8, "op2 selects add");
    }

    #[test]
    fn add_n_is_two_bytes() {
        let mut mem = [0u8; 2];
        let mut b = buf(&mut mem);
        add_n(&mut b, 1, 2, 3);
        assert_eq!(b.offset(), 2);
    }

    #[test]
    fn movi_rejects_out_of_range_immediate() {
        let mut mem = [0u8; 4];
        let mut b = buf(&mut mem);
        assert!(movi(&mut b, 2, 4096).is_err());
    }

    #[test]
    fn l32i_requires_word_aligned_offset() {
        let mut mem = [0u8; 4];
        let mut b = buf(&mut mem);
        assert!(l32i(&mut b, 2, 1, 5).is_err());
        assert!(l32i(&mut b, 2, 1, 8).is_ok());
    }

    #[test]
    fn s32i_n_rejects_offset_past_narrow_range() {
        let mut mem = [0u8; 2];
        let mut b = buf(&mut mem);
        assert!(s32i_n(&mut b, 1, 2, 64).is_err());
    }

    #[test]
    fn entry_packs_frame_size_into_eighths() {
        let mut mem = [0u8; 4];
        let mut b = buf(&mut mem);
        entry(&mut b, 32).unwrap();
        let word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
        assert_eq!((word >> 8) & 0xffff, 4, "32 bytes / 8");
    }

    #[test]
    fn beq_rejects_out_of_range_displacement() {
        let mut mem = [0u8; 4];
        let mut b = buf(&mut mem);
        assert!(beq(&mut b, 1, 2, 200).is_err());
        assert!(beq(&mut b, 1, 2, 100).is_ok());
    }

    #[test]
    fn l32r_round_trips_a_negative_word_displacement() {
        let mut mem = [0u8; 4];
        let mut b = buf(&mut mem);
        l32r(&mut b, 3, -10).unwrap();
        let word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
        assert_eq!(word & 0xf, 0x1);
        assert_eq!((word >> 4) & 0xf, 3);
        assert_eq!(((word >> 8) & 0xffff) as i16, -10);
    }

    proptest::proptest! {
        #[test]
        fn add_never_sets_bits_outside_its_own_fields(rd in 0u8..16, rs1 in 0u8..16, rs2 in 0u8..16) {
            let mut mem = [0u8; 4];
            let mut b = buf(&mut mem);
            add(&mut b, rd, rs1, rs2);
            let word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
            proptest::prop_assert_eq!(word & 0xf, 0x0, "op0 nibble must stay 0 for the RRR ALU group");
            proptest::prop_assert_eq!((word >> 4) & 0xf, rd as u32);
            proptest::prop_assert_eq!((word >> 8) & 0xf, rs1 as u32);
            proptest::prop_assert_eq!((word >> 12) & 0xf, rs2 as u32);
            proptest::prop_assert_eq!((word >> 16) & 0xf, 0x0, "op1 must stay 0 for add");
            proptest::prop_assert_eq!((word >> 20) & 0xf, 0x8, "op2 selects add, distinguishing it from sub/and/or/xor");
        }

        #[test]
        fn movi_round_trips_its_signed_immediate(rd in 0u8..16, imm in -2048i32..2048) {
            let mut mem = [0u8; 4];
            let mut b = buf(&mut mem);
            movi(&mut b, rd, imm).unwrap();
            let word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
            proptest::prop_assert_eq!(word & 0xf, 0xa, "op0 selects MOVI");
            proptest::prop_assert_eq!((word >> 4) & 0xf, rd as u32);
            let raw12 = ((word >> 12) & 0xf) << 8 | ((word >> 16) & 0xff);
            let sign_extended = ((raw12 << 20) as i32) >> 20;
            proptest::prop_assert_eq!(sign_extended, imm);
        }

        #[test]
        fn s32i_then_l32i_round_trip_the_same_word_aligned_offset(rs_addr in 0u8..16, rs_val in 0u8..16, rd in 0u8..16, word_index in 0i32..256) {
            let byte_offset = word_index * 4;
            let mut mem = [0u8; 4];
            let mut b = buf(&mut mem);
            s32i(&mut b, rs_addr, rs_val, byte_offset).unwrap();
            let store_word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
            proptest::prop_assert_eq!(store_word & 0xf, 0x2, "op0 nibble shared by the l/s32i scaled-RRI8 group");
            proptest::prop_assert_eq!((store_word >> 4) & 0xf, rs_val as u32, "t = value register on a store");
            proptest::prop_assert_eq!((store_word >> 8) & 0xf, rs_addr as u32, "s = address register");
            proptest::prop_assert_eq!((store_word >> 12) & 0xf, 0x6, "op1 selects s32i");
            proptest::prop_assert_eq!((store_word >> 16) & 0xff, word_index as u32);

            let mut mem2 = [0u8; 4];
            let mut b2 = buf(&mut mem2);
            l32i(&mut b2, rd, rs_addr, byte_offset).unwrap();
            let load_word = u32::from_le_bytes([mem2[0], mem2[1], mem2[2], 0]);
            proptest::prop_assert_eq!((load_word >> 12) & 0xf, 0x2, "op1 selects l32i, distinct from s32i's nibble");
            proptest::prop_assert_eq!((load_word >> 16) & 0xff, word_index as u32);
        }

        #[test]
        fn beq_round_trips_its_displacement_and_register_fields(rs1 in 0u8..16, rs2 in 0u8..16, imm8 in -128i32..128) {
            let mut mem = [0u8; 4];
            let mut b = buf(&mut mem);
            beq(&mut b, rs1, rs2, imm8).unwrap();
            let word = u32::from_le_bytes([mem[0], mem[1], mem[2], 0]);
            proptest::prop_assert_eq!(word & 0xf, 0x7, "op0 selects the register-register compare-branch group");
            proptest::prop_assert_eq!((word >> 4) & 0xf, rs2 as u32, "t = rs2");
            proptest::prop_assert_eq!((word >> 8) & 0xf, rs1 as u32, "s = rs1");
            proptest::prop_assert_eq!((word >> 12) & 0xf, 0x1, "op1 selects beq, distinguishing it from bne/blt/bge");
            proptest::prop_assert_eq!(((word >> 16) & 0xff) as i8 as i32, imm8);
        }
    }
}
