//! The RISC-V single-pass opcode dispatcher.
//!
//! One linear walk over the bytecode: record a label, decode one opcode's
//! fixed-length operands, emit its native sequence, advance. No opcode here
//! ever looks ahead past its own operands except `BR_TABLE`'s target count
//! and `CALL_IMPORT`'s optional variadic descriptor, both of which are
//! length-prefixed in the stream itself.

use crate::bytecode::{BodyFlags, BytecodeCursor, ExtendedOp, FunctionBody, Opcode, VARIADIC_MARKER};
use crate::buffer::CodeBuffer;
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::frame::VRegFrame;
use crate::helpers::{HelperTable, VariadicArgs};
use crate::isa::riscv::abi::{self, A0, FRAME_BASE, INSTANCE, SCRATCH_0, SCRATCH_1, SCRATCH_2};
use crate::isa::riscv::encode;
use crate::label::LabelTable;
use crate::regcache::{flush_selective, RegisterCache, Residency};

/// Virtual registers this backend accepts as operands to the inline 32-bit
/// ALU group, eligible for the two-entry register cache.
const CACHED_ALU_OPS: &[Opcode] = &[
    Opcode::Add32,
    Opcode::Sub32,
    Opcode::Mul32,
    Opcode::And32,
    Opcode::Or32,
    Opcode::Xor32,
];

/// Conditional branches with exactly two successors reachable straight from
/// their own encoding (a taken target and a fallthrough): these flush the
/// cache selectively via [`flush_for_branch`] rather than taking the blanket
/// path every other non-ALU opcode gets. `BrTable` has an arbitrary number of
/// successors and keeps the conservative blanket flush.
const SELECTIVE_FLUSH_BRANCH_OPS: &[Opcode] = &[Opcode::Br, Opcode::BrIf];

/// Runs the opcode loop over `body.code`, emitting into `buf` and recording
/// labels/fixups into `labels`. Returns once the stream is exhausted (an
/// `End` opcode does not stop the loop -- it just jumps to the shared
/// epilogue -- so multiple `End`s collapse correctly per the state machine
/// in §4.7).
pub fn run(
    buf: &mut CodeBuffer,
    labels: &mut LabelTable,
    helpers: &HelperTable,
    config: &CompilerConfig,
    body: &FunctionBody,
) -> CompileResult<()> {
    let mut cur = BytecodeCursor::new(body.code);
    let mut regcache = RegisterCache::new();
    let cache_enabled = config.enable_register_cache && !body.header.flags.contains(BodyFlags::NO_SPILL);

    while !cur.at_end() {
        let bc_offset = cur.offset();
        labels.record(bc_offset, buf.offset());
        let opcode_byte = cur.read_opcode()?;
        let opcode = Opcode::from_u8(opcode_byte).ok_or(CompileError::UnsupportedOpcode {
            opcode: opcode_byte,
            bytecode_offset: bc_offset,
        })?;

        if cache_enabled && !CACHED_ALU_OPS.contains(&opcode) && !SELECTIVE_FLUSH_BRANCH_OPS.contains(&opcode) {
            flush_and_reset_cache(buf, &mut regcache)?;
        }

        match opcode {
            Opcode::ConstI8 | Opcode::ConstI16 | Opcode::ConstI32 => {
                let (dst, value) = match opcode {
                    Opcode::ConstI8 => (cur.read_u8()?, cur.read_u8()? as i8 as i32),
                    Opcode::ConstI16 => (cur.read_u8()?, cur.read_u16()? as i16 as i32),
                    _ => (cur.read_u8()?, cur.read_i32()?),
                };
                emit_load_const32(buf, SCRATCH_0, value)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstPtr => {
                let dst = cur.read_u8()?;
                let value = cur.read_u32()? as i32;
                emit_load_const32(buf, SCRATCH_0, value)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstI64 => {
                let dst = cur.read_u8()?;
                let value = cur.read_u64()?;
                emit_load_const32(buf, SCRATCH_0, value as u32 as i32)?;
                emit_load_const32(buf, SCRATCH_1, (value >> 32) as u32 as i32)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstF32 => {
                let dst = cur.read_u8()?;
                let bits = cur.read_u32()? as i32;
                emit_load_const32(buf, SCRATCH_0, bits)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstF64 => {
                let dst = cur.read_u8()?;
                let bits = cur.read_u64()?;
                emit_load_const32(buf, SCRATCH_0, bits as u32 as i32)?;
                emit_load_const32(buf, SCRATCH_1, (bits >> 32) as u32 as i32)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }

            Opcode::Move8 | Opcode::Move16 | Opcode::Move32 => {
                let dst = cur.read_u8()?;
                let src = cur.read_u8()?;
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::Move64 => {
                let dst = cur.read_u8()?;
                let src = cur.read_u8()?;
                abi::load_vreg64(buf, SCRATCH_0, SCRATCH_1, src)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }

            Opcode::Add32 | Opcode::Sub32 | Opcode::Mul32 | Opcode::And32 | Opcode::Or32 | Opcode::Xor32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                if cache_enabled {
                    emit_cached_binop32(buf, &mut regcache, opcode, dst, a, b)?;
                } else {
                    emit_binop32(buf, opcode, dst, a, b)?;
                }
            }
            Opcode::DivS32 | Opcode::DivU32 | Opcode::RemS32 | Opcode::RemU32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                abi::load_vreg32(buf, SCRATCH_1, b)?;
                match opcode {
                    Opcode::DivS32 => encode::div(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                    Opcode::DivU32 => encode::divu(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                    Opcode::RemS32 => encode::rem(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                    _ => encode::remu(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                }
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::Not32 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                encode::xori(buf, SCRATCH_0, SCRATCH_0, -1)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::Shl32 | Opcode::ShrS32 | Opcode::ShrU32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                abi::load_vreg32(buf, SCRATCH_1, b)?;
                match opcode {
                    Opcode::Shl32 => encode::sll(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                    Opcode::ShrS32 => encode::sra(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                    _ => encode::srl(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
                }
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }

            Opcode::Add64 | Opcode::Sub64 | Opcode::And64 | Opcode::Or64 | Opcode::Xor64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                emit_binop64_inline(buf, opcode, dst, a, b)?;
            }
            Opcode::Not64 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, SCRATCH_0, SCRATCH_1, a)?;
                encode::xori(buf, SCRATCH_0, SCRATCH_0, -1)?;
                encode::xori(buf, SCRATCH_1, SCRATCH_1, -1)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::Mul64 | Opcode::DivS64 | Opcode::DivU64 | Opcode::RemS64 | Opcode::RemU64
            | Opcode::Shl64 | Opcode::ShrS64 | Opcode::ShrU64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                let helper_addr = match opcode {
                    // Wraps identically for signed and unsigned, same as the inline Mul32 path.
                    Opcode::Mul64 => helpers.mul_i64 as usize,
                    Opcode::DivS64 => helpers.div_i64 as usize,
                    Opcode::DivU64 => helpers.div_u64 as usize,
                    Opcode::RemS64 => helpers.rem_i64 as usize,
                    Opcode::RemU64 => helpers.rem_u64 as usize,
                    Opcode::Shl64 => helpers.shl_i64 as usize,
                    Opcode::ShrS64 => helpers.shr_i64 as usize,
                    Opcode::ShrU64 => helpers.shr_u64 as usize,
                    _ => unreachable!(),
                };
                emit_two_arg_helper_64(buf, helper_addr, dst, a, b)?;
            }

            Opcode::FAdd32 | Opcode::FSub32 | Opcode::FMul32 | Opcode::FDiv32 | Opcode::FMin32 | Opcode::FMax32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                let helper_addr = match opcode {
                    Opcode::FAdd32 => helpers.f32_add as usize,
                    Opcode::FSub32 => helpers.f32_sub as usize,
                    Opcode::FMul32 => helpers.f32_mul as usize,
                    Opcode::FDiv32 => helpers.f32_div as usize,
                    Opcode::FMin32 => helpers.f32_min as usize,
                    _ => helpers.f32_max as usize,
                };
                emit_two_arg_helper_32(buf, helper_addr, dst, a, b)?;
            }
            Opcode::FSqrt32 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, helpers.f32_sqrt as usize, dst, a)?;
            }
            Opcode::FAdd64 | Opcode::FSub64 | Opcode::FMul64 | Opcode::FDiv64 | Opcode::FMin64 | Opcode::FMax64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                let helper_addr = match opcode {
                    Opcode::FAdd64 => helpers.f64_add as usize,
                    Opcode::FSub64 => helpers.f64_sub as usize,
                    Opcode::FMul64 => helpers.f64_mul as usize,
                    Opcode::FDiv64 => helpers.f64_div as usize,
                    Opcode::FMin64 => helpers.f64_min as usize,
                    _ => helpers.f64_max as usize,
                };
                emit_two_arg_helper_64(buf, helper_addr, dst, a, b)?;
            }
            Opcode::FSqrt64 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, helpers.f64_sqrt as usize, dst, a)?;
            }
            Opcode::FAbs32 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                encode::slli(buf, SCRATCH_0, SCRATCH_0, 1);
                encode::srli(buf, SCRATCH_0, SCRATCH_0, 1);
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::FAbs64 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, SCRATCH_0, SCRATCH_1, a)?;
                encode::slli(buf, SCRATCH_1, SCRATCH_1, 1);
                encode::srli(buf, SCRATCH_1, SCRATCH_1, 1);
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::F32FromI64S | Opcode::F32FromI64U | Opcode::I64FromF32S | Opcode::I64FromF32U => {
                // No 64-bit-argument f32 helper exists in the contract table
                // (only the f64 conversions carry a 64-bit side); narrowing
                // i64 to i32 first would silently discard magnitude, so this
                // combination is left unsupported rather than approximated.
                return Err(CompileError::UnsupportedOpcode {
                    opcode: opcode_byte,
                    bytecode_offset: bc_offset,
                });
            }
            Opcode::F32FromI32S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, helpers.i32_to_f32 as usize, dst, a)?;
            }
            Opcode::F32FromI32U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, helpers.u32_to_f32 as usize, dst, a)?;
            }
            Opcode::I32FromF32S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, helpers.f32_to_i32 as usize, dst, a)?;
            }
            Opcode::I32FromF32U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, helpers.f32_to_u32 as usize, dst, a)?;
            }
            Opcode::F64FromI64S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, helpers.i64_to_f64 as usize, dst, a)?;
            }
            Opcode::F64FromI64U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, helpers.u64_to_f64 as usize, dst, a)?;
            }
            Opcode::I64FromF64S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, helpers.f64_to_i64 as usize, dst, a)?;
            }
            Opcode::I64FromF64U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, helpers.f64_to_u64 as usize, dst, a)?;
            }
            Opcode::F64FromI32S => {
                // Sign-extend the i32 to i64 in registers, then reuse the
                // i64-taking helper rather than carry a redundant i32-to-f64
                // entry point in the contract table.
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, A0, a)?;
                encode::srai(buf, A0 + 1, A0, 31);
                abi::emit_helper_call(buf, helpers.i64_to_f64 as usize, buf.offset())?;
                abi::store_vreg64(buf, dst, A0, A0 + 1)?;
            }
            Opcode::F64FromI32U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, A0, a)?;
                emit_load_const32(buf, A0 + 1, 0)?;
                abi::emit_helper_call(buf, helpers.u64_to_f64 as usize, buf.offset())?;
                abi::store_vreg64(buf, dst, A0, A0 + 1)?;
            }
            Opcode::I32FromF64S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, A0, A0 + 1, a)?;
                abi::emit_helper_call(buf, helpers.f64_to_i64 as usize, buf.offset())?;
                abi::store_vreg32(buf, dst, A0, SCRATCH_1)?;
            }
            Opcode::I32FromF64U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, A0, A0 + 1, a)?;
                abi::emit_helper_call(buf, helpers.f64_to_u64 as usize, buf.offset())?;
                abi::store_vreg32(buf, dst, A0, SCRATCH_1)?;
            }

            Opcode::Eq32 | Opcode::Ne32 | Opcode::LtS32 | Opcode::LtU32 | Opcode::GtS32 | Opcode::GtU32
            | Opcode::LeS32 | Opcode::LeU32 | Opcode::GeS32 | Opcode::GeU32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                emit_compare32(buf, opcode, dst, a, b)?;
            }
            Opcode::Eq64 | Opcode::Ne64 | Opcode::LtS64 | Opcode::LtU64 | Opcode::GtS64 | Opcode::GtU64
            | Opcode::LeS64 | Opcode::LeU64 | Opcode::GeS64 | Opcode::GeU64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                let helper_addr = match opcode {
                    Opcode::LtS64 | Opcode::GtS64 | Opcode::LeS64 | Opcode::GeS64 => helpers.cmp_i64 as usize,
                    _ => helpers.cmp_u64 as usize,
                };
                emit_wide_compare(buf, helper_addr, opcode, dst, a, b, true)?;
            }
            Opcode::FEq32 | Opcode::FNe32 | Opcode::FLt32 | Opcode::FGt32 | Opcode::FLe32 | Opcode::FGe32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                emit_wide_compare(buf, helpers.cmp_f32 as usize, opcode, dst, a, b, false)?;
            }
            Opcode::FEq64 | Opcode::FNe64 | Opcode::FLt64 | Opcode::FGt64 | Opcode::FLe64 | Opcode::FGe64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                emit_wide_compare(buf, helpers.cmp_f64 as usize, opcode, dst, a, b, true)?;
            }

            Opcode::Load8S | Opcode::Load8U | Opcode::Load16S | Opcode::Load16U | Opcode::Load32
            | Opcode::LoadBool | Opcode::LoadPtr | Opcode::LoadF32 => {
                let (dst, base, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, SCRATCH_0, offset, SCRATCH_2)?;
                match opcode {
                    Opcode::Load8S => encode::lb(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    Opcode::Load8U | Opcode::LoadBool => encode::lbu(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    Opcode::Load16S => encode::lh(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    Opcode::Load16U => encode::lhu(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    _ => encode::lw(buf, SCRATCH_1, SCRATCH_0, 0)?,
                }
                abi::store_vreg32(buf, dst, SCRATCH_1, SCRATCH_2)?;
            }
            Opcode::Load64 | Opcode::LoadF64 => {
                let (dst, base, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, SCRATCH_0, offset, SCRATCH_2)?;
                encode::lw(buf, SCRATCH_1, SCRATCH_0, 0)?;
                encode::lw(buf, SCRATCH_2, SCRATCH_0, 4)?;
                abi::store_vreg64(buf, dst, SCRATCH_1, SCRATCH_2)?;
            }
            Opcode::Store8 | Opcode::Store16 | Opcode::Store32 | Opcode::StoreBool | Opcode::StorePtr
            | Opcode::StoreF32 => {
                let (base, src, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, SCRATCH_0, offset, SCRATCH_2)?;
                abi::load_vreg32(buf, SCRATCH_1, src)?;
                if matches!(opcode, Opcode::StoreBool) {
                    encode::andi(buf, SCRATCH_1, SCRATCH_1, 1)?;
                }
                match opcode {
                    Opcode::Store8 | Opcode::StoreBool => encode::sb(buf, SCRATCH_0, SCRATCH_1, 0)?,
                    Opcode::Store16 => encode::sh(buf, SCRATCH_0, SCRATCH_1, 0)?,
                    _ => encode::sw(buf, SCRATCH_0, SCRATCH_1, 0)?,
                }
            }
            Opcode::Store64 | Opcode::StoreF64 => {
                let (base, src, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, SCRATCH_0, offset, SCRATCH_2)?;
                abi::load_vreg64(buf, SCRATCH_1, SCRATCH_2, src)?;
                encode::sw(buf, SCRATCH_0, SCRATCH_1, 0)?;
                encode::sw(buf, SCRATCH_0, SCRATCH_2, 4)?;
            }

            Opcode::Br => {
                let target = (bc_offset as i64 + cur.read_i32()? as i64) as u32;
                if cache_enabled {
                    flush_for_branch(buf, &mut regcache, body.code, target, cur.offset(), &[])?;
                }
                emit_branch_fixup(buf, labels, target, true, 0)?;
            }
            Opcode::BrIf => {
                let cond = cur.read_u8()?;
                let target = (bc_offset as i64 + cur.read_i32()? as i64) as u32;
                if cache_enabled {
                    flush_for_branch(buf, &mut regcache, body.code, target, cur.offset(), &[cond])?;
                }
                abi::load_vreg32(buf, SCRATCH_0, cond)?;
                emit_branch_fixup(buf, labels, target, false, SCRATCH_0)?;
            }
            Opcode::BrTable => {
                let selector = cur.read_u8()?;
                let count = cur.read_u16()?;
                let mut targets = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    targets.push((bc_offset as i64 + cur.read_i32()? as i64) as u32);
                }
                let default_target = (bc_offset as i64 + cur.read_i32()? as i64) as u32;
                abi::load_vreg32(buf, SCRATCH_0, selector)?;
                for (i, target) in targets.iter().enumerate() {
                    emit_load_const32(buf, SCRATCH_1, i as i32)?;
                    let native_offset = buf.offset();
                    buf.put4(0); // placeholder beq, patched below
                    let target = *target;
                    labels.add_fixup(
                        native_offset,
                        target,
                        "br_table.beq",
                        Box::new(move |buf, disp| {
                            if !(-4096..4096).contains(&disp) {
                                return Err(CompileError::EncodingError {
                                    mnemonic: "br_table.beq",
                                    native_offset,
                                    displacement: disp,
                                });
                            }
                            let bits = encode_beq_bits(SCRATCH_0, SCRATCH_1, disp as i32);
                            buf.store_u32(native_offset, bits)
                        }),
                    );
                }
                emit_branch_fixup(buf, labels, default_target, true, 0)?;
            }
            Opcode::End => {
                emit_epilogue_jump(buf, labels)?;
            }
            Opcode::Unreachable => {
                // A branch-to-self trap: the canonical "halt" encoding this
                // backend uses for genuinely unreachable code, matching the
                // self-trap patch used for dangling fixups.
                let here = buf.offset();
                encode::beq(buf, 0, 0, 0)?;
                debug_assert_eq!(buf.offset(), here + 4);
            }

            Opcode::Call => {
                let func_idx = cur.read_u32()?;
                emit_load_const32(buf, SCRATCH_0, func_idx as i32)?;
                encode::add(buf, A0, INSTANCE, 0);
                encode::add(buf, A0 + 1, SCRATCH_0, 0);
                encode::add(buf, A0 + 2, FRAME_BASE, 0);
                abi::emit_helper_call(buf, helpers.call_espb_function as usize, buf.offset())?;
            }
            Opcode::CallIndirect => {
                let (func_idx_vreg, type_idx) = (cur.read_u8()?, cur.read_u32()?);
                abi::load_vreg32(buf, SCRATCH_0, func_idx_vreg)?;
                encode::add(buf, A0, INSTANCE, 0);
                encode::add(buf, A0 + 1, SCRATCH_0, 0);
                emit_load_const32(buf, A0 + 2, type_idx as i32)?;
                encode::add(buf, A0 + 3, FRAME_BASE, 0);
                emit_load_const32(buf, A0 + 4, body.header.num_vregs as i32)?;
                emit_load_const32(buf, A0 + 5, func_idx_vreg as i32)?;
                abi::emit_helper_call(buf, helpers.call_indirect as usize, buf.offset())?;
            }
            Opcode::CallIndirectPtr => {
                let (ptr_vreg, type_idx) = (cur.read_u8()?, cur.read_u32()?);
                abi::load_vreg32(buf, SCRATCH_0, ptr_vreg)?;
                encode::add(buf, A0, INSTANCE, 0);
                encode::add(buf, A0 + 1, SCRATCH_0, 0);
                emit_load_const32(buf, A0 + 2, type_idx as i32)?;
                encode::add(buf, A0 + 3, FRAME_BASE, 0);
                emit_load_const32(buf, A0 + 4, body.header.num_vregs as i32)?;
                emit_load_const32(buf, A0 + 5, ptr_vreg as i32)?;
                abi::emit_helper_call(buf, helpers.call_indirect_ptr as usize, buf.offset())?;
            }
            Opcode::CallImport => {
                let import_idx = cur.read_u32()?;
                let mut has_variadic = false;
                let mut variadic: Option<VariadicArgs> = None;
                let mut blob_addr: u32 = 0;
                if cur.peek_u8() == Some(VARIADIC_MARKER) {
                    cur.read_u8()?;
                    has_variadic = true;
                    let count = cur.read_u8()?;
                    let blob_start = cur.offset() as usize;
                    let remaining = body.code.len() - blob_start;
                    let blob = &body.code[blob_start..blob_start + remaining.min(count as usize)];
                    variadic = VariadicArgs::parse(count, blob);
                    blob_addr = body.code.as_ptr() as usize as u32 + blob_start as u32;
                    cur.skip(count as usize)?;
                }
                encode::add(buf, A0, INSTANCE, 0);
                emit_load_const32(buf, A0 + 1, import_idx as i32)?;
                encode::add(buf, A0 + 2, FRAME_BASE, 0);
                emit_load_const32(buf, A0 + 3, body.header.num_vregs as i32)?;
                emit_load_const32(buf, A0 + 4, has_variadic as i32)?;
                emit_load_const32(buf, A0 + 5, variadic.as_ref().map_or(0, |v| v.len() as i32))?;
                emit_load_const32(buf, A0 + 6, blob_addr as i32)?;
                abi::emit_helper_call(buf, helpers.call_import as usize, buf.offset())?;
            }

            Opcode::SignExtend8To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 24, true)?,
            Opcode::SignExtend16To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 16, true)?,
            Opcode::ZeroExtend8To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 24, false)?,
            Opcode::ZeroExtend16To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 16, false)?,
            Opcode::SignExtend32To64 => {
                let (dst, src) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                encode::srai(buf, SCRATCH_1, SCRATCH_0, 31);
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ZeroExtend32To64 => {
                let (dst, src) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, 0)?;
            }
            Opcode::PtrToInt | Opcode::IntToPtr => {
                let (dst, src) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::FPromote => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, A0, a)?;
                abi::emit_helper_call(buf, helpers.f32_to_f64 as usize, buf.offset())?;
                abi::store_vreg64(buf, dst, A0, A0 + 1)?;
            }
            Opcode::FDemote => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, A0, A0 + 1, a)?;
                abi::emit_helper_call(buf, helpers.f64_to_f32 as usize, buf.offset())?;
                abi::store_vreg32(buf, dst, A0, SCRATCH_1)?;
            }

            Opcode::LoadGlobalAddr | Opcode::LoadGlobal | Opcode::StoreGlobal => {
                let (global_idx, reg) = (cur.read_u32()?, cur.read_u8()?);
                let helper_addr = match opcode {
                    Opcode::LoadGlobalAddr => helpers.ld_global_addr as usize,
                    Opcode::LoadGlobal => helpers.ld_global as usize,
                    _ => helpers.st_global as usize,
                };
                encode::add(buf, A0, INSTANCE, 0);
                emit_load_const32(buf, A0 + 1, global_idx as i32)?;
                encode::add(buf, A0 + 2, FRAME_BASE, 0);
                emit_load_const32(buf, A0 + 3, body.header.num_vregs as i32)?;
                emit_load_const32(buf, A0 + 4, reg as i32)?;
                abi::emit_helper_call(buf, helper_addr, buf.offset())?;
            }

            Opcode::HeapMalloc | Opcode::HeapCalloc | Opcode::HeapRealloc | Opcode::HeapFree => {
                let (dst, size_or_ptr_vreg) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, size_or_ptr_vreg)?;
                encode::add(buf, A0, INSTANCE, 0);
                encode::add(buf, A0 + 1, SCRATCH_0, 0);
                let helper_addr = match opcode {
                    Opcode::HeapMalloc | Opcode::HeapCalloc => helpers.heap_malloc as usize,
                    Opcode::HeapRealloc => helpers.heap_realloc as usize,
                    _ => helpers.heap_free as usize,
                };
                abi::emit_helper_call(buf, helper_addr, buf.offset())?;
                if !matches!(opcode, Opcode::HeapFree) {
                    abi::store_vreg32(buf, dst, A0, SCRATCH_1)?;
                }
            }

            Opcode::AtomicLoad32 | Opcode::AtomicStore32 | Opcode::AtomicXchg32 | Opcode::AtomicCmpxchg32
            | Opcode::AtomicRmw32 => {
                emit_atomic32(buf, helpers, opcode, &mut cur)?;
            }
            Opcode::AtomicLoad64 | Opcode::AtomicStore64 | Opcode::AtomicRmw64 | Opcode::AtomicXchg64
            | Opcode::AtomicCmpxchg64 => {
                emit_atomic64(buf, helpers, opcode, &mut cur)?;
            }
            Opcode::AtomicFence => {
                encode::fence_rw_rw(buf);
            }

            Opcode::Alloca => {
                let (dst, size_vreg, align) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                encode::add(buf, A0, INSTANCE, 0);
                emit_load_const32(buf, A0 + 1, 0)?; // no execution-context pointer in this ABI
                encode::add(buf, A0 + 2, FRAME_BASE, 0);
                emit_load_const32(buf, A0 + 3, body.header.num_vregs as i32)?;
                emit_load_const32(buf, A0 + 4, dst as i32)?;
                emit_load_const32(buf, A0 + 5, size_vreg as i32)?;
                emit_load_const32(buf, A0 + 6, align as i32)?;
                abi::emit_helper_call(buf, helpers.runtime_alloca as usize, buf.offset())?;
            }

            Opcode::Extended => {
                let sub_byte = cur.read_u8()?;
                let sub = ExtendedOp::from_u8(sub_byte).ok_or(CompileError::UnsupportedOpcode {
                    opcode: sub_byte,
                    bytecode_offset: cur.offset(),
                })?;
                encode::add(buf, A0, INSTANCE, 0);
                emit_load_const32(buf, A0 + 1, sub as i32)?;
                abi::emit_helper_call(buf, helpers.ext_table_memory_op as usize, buf.offset())?;
            }
        }
    }

    Ok(())
}

fn emit_load_const32(buf: &mut CodeBuffer, dst: u8, value: i32) -> CompileResult<()> {
    if (-2048..2048).contains(&value) {
        encode::addi(buf, dst, 0, value)
    } else {
        let hi20 = ((value as u32).wrapping_add(0x800)) >> 12;
        let lo12 = value - ((hi20 as i32) << 12);
        encode::lui(buf, dst, hi20);
        if lo12 != 0 {
            encode::addi(buf, dst, dst, lo12)?;
        }
        Ok(())
    }
}

fn apply_alu32(buf: &mut CodeBuffer, opcode: Opcode, rd: u8, rs1: u8, rs2: u8) {
    match opcode {
        Opcode::Add32 => encode::add(buf, rd, rs1, rs2),
        Opcode::Sub32 => encode::sub(buf, rd, rs1, rs2),
        Opcode::Mul32 => encode::mul(buf, rd, rs1, rs2),
        Opcode::And32 => encode::and(buf, rd, rs1, rs2),
        Opcode::Or32 => encode::or(buf, rd, rs1, rs2),
        Opcode::Xor32 => encode::xor(buf, rd, rs1, rs2),
        _ => unreachable!("apply_alu32 only called for the cached ALU group"),
    }
}

fn emit_binop32(buf: &mut CodeBuffer, opcode: Opcode, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, SCRATCH_0, a)?;
    abi::load_vreg32(buf, SCRATCH_1, b)?;
    apply_alu32(buf, opcode, SCRATCH_0, SCRATCH_0, SCRATCH_1);
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// The cache's two physical slots are pinned to `SCRATCH_0`/`SCRATCH_1`; a
/// vreg "resident in slot N" literally means its value currently sits in
/// that register.
fn phys_reg(slot: usize) -> u8 {
    if slot == 0 {
        SCRATCH_0
    } else {
        SCRATCH_1
    }
}

/// Write back every dirty cache entry, then drop the cache. Per
/// [`RegisterCache::reset`]'s contract, selective retention across a branch
/// is this function's job (via a caller picking what to keep with
/// [`crate::regcache::flush_selective`] before ever calling this one) -- a
/// bare `reset()` must never run while a slot is still dirty.
fn flush_and_reset_cache(buf: &mut CodeBuffer, regcache: &mut RegisterCache) -> CompileResult<()> {
    let dirty: Vec<(usize, u8)> = regcache.dirty_entries().collect();
    for (slot, vreg) in dirty {
        abi::store_vreg32(buf, vreg, phys_reg(slot), SCRATCH_2)?;
    }
    regcache.reset();
    Ok(())
}

/// Branch-site cache flush: instead of unconditionally writing back every
/// dirty entry, ask [`crate::regcache::flush_selective`] which ones either
/// successor block can still read before overwriting, and skip the store
/// for any dirty vreg neither successor (nor this branch's own operand, via
/// `must_include`) needs. `must_include` lets the caller force a vreg's
/// writeback even when the liveness scan wouldn't otherwise require it --
/// needed for `BrIf`'s own condition register, which this opcode reads
/// straight from the frame right after this call returns.
fn flush_for_branch(
    buf: &mut CodeBuffer,
    regcache: &mut RegisterCache,
    code: &[u8],
    target_bc: u32,
    fallthrough_bc: u32,
    must_include: &[u8],
) -> CompileResult<()> {
    let dirty: Vec<(usize, u8)> = regcache.dirty_entries().collect();
    if dirty.is_empty() {
        regcache.reset();
        return Ok(());
    }
    let candidates: Vec<u8> = dirty.iter().map(|&(_, vreg)| vreg).collect();
    let mut must_flush = flush_selective(code, target_bc, fallthrough_bc, &candidates);
    for &vreg in must_include {
        if candidates.contains(&vreg) && !must_flush.contains(&vreg) {
            must_flush.push(vreg);
        }
    }
    for (slot, vreg) in dirty {
        if must_flush.contains(&vreg) {
            abi::store_vreg32(buf, vreg, phys_reg(slot), SCRATCH_2)?;
        }
    }
    regcache.reset();
    Ok(())
}

/// Make `vreg` resident in one of the cache's two physical slots, flushing
/// whatever dirty value it evicts before the physical register is
/// overwritten.
fn resident_or_load(
    buf: &mut CodeBuffer,
    regcache: &mut RegisterCache,
    vreg: u8,
    preferred: usize,
) -> CompileResult<u8> {
    let (residency, evicted) = regcache.ensure_loaded(vreg, preferred);
    if let Some((slot, evicted_vreg)) = evicted {
        abi::store_vreg32(buf, evicted_vreg, phys_reg(slot), SCRATCH_2)?;
    }
    match residency {
        Residency::AlreadyLoaded(slot) => Ok(phys_reg(slot)),
        Residency::NeedsLoad(slot) => {
            let p = phys_reg(slot);
            abi::load_vreg32(buf, p, vreg)?;
            Ok(p)
        }
    }
}

/// Cached path for the chainable 32-bit ALU group: operands are pulled
/// through the two-entry cache and the result is parked in slot 0 rather
/// than written straight back to the frame, on the bet the next opcode reads
/// it again. `regcache.set`'s own eviction (flushed here if dirty) always
/// concerns slot 0's *prior* occupant, so it runs before the ALU op
/// clobbers that physical register.
fn emit_cached_binop32(
    buf: &mut CodeBuffer,
    regcache: &mut RegisterCache,
    opcode: Opcode,
    dst: u8,
    a: u8,
    b: u8,
) -> CompileResult<()> {
    let pa = resident_or_load(buf, regcache, a, 0)?;
    let pb = resident_or_load(buf, regcache, b, 1)?;
    if let Some((slot, evicted_vreg)) = regcache.set(0, dst, true) {
        abi::store_vreg32(buf, evicted_vreg, phys_reg(slot), SCRATCH_2)?;
    }
    apply_alu32(buf, opcode, SCRATCH_0, pa, pb);
    Ok(())
}

fn emit_binop64_inline(buf: &mut CodeBuffer, opcode: Opcode, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg64(buf, SCRATCH_0, SCRATCH_1, a)?;
    // Only three scratch registers are pinned, so b's two halves are
    // combined one at a time through SCRATCH_2 rather than loaded as a pair.
    let b_off = VRegFrame::offset_of(b) as i32;
    encode::lw(buf, SCRATCH_2, FRAME_BASE, b_off)?;
    match opcode {
        Opcode::Add64 => {
            encode::add(buf, SCRATCH_0, SCRATCH_0, SCRATCH_2);
        }
        Opcode::Sub64 => {
            encode::sub(buf, SCRATCH_0, SCRATCH_0, SCRATCH_2);
        }
        Opcode::And64 => encode::and(buf, SCRATCH_0, SCRATCH_0, SCRATCH_2),
        Opcode::Or64 => encode::or(buf, SCRATCH_0, SCRATCH_0, SCRATCH_2),
        Opcode::Xor64 => encode::xor(buf, SCRATCH_0, SCRATCH_0, SCRATCH_2),
        _ => unreachable!(),
    }
    encode::lw(buf, SCRATCH_2, FRAME_BASE, b_off + 4)?;
    match opcode {
        Opcode::Add64 => encode::add(buf, SCRATCH_1, SCRATCH_1, SCRATCH_2),
        Opcode::Sub64 => encode::sub(buf, SCRATCH_1, SCRATCH_1, SCRATCH_2),
        Opcode::And64 => encode::and(buf, SCRATCH_1, SCRATCH_1, SCRATCH_2),
        Opcode::Or64 => encode::or(buf, SCRATCH_1, SCRATCH_1, SCRATCH_2),
        Opcode::Xor64 => encode::xor(buf, SCRATCH_1, SCRATCH_1, SCRATCH_2),
        _ => unreachable!(),
    }
    abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)
}

fn emit_two_arg_helper_64(buf: &mut CodeBuffer, helper_addr: usize, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg64(buf, A0, A0 + 1, a)?;
    abi::load_vreg64(buf, A0 + 2, A0 + 3, b)?;
    abi::emit_helper_call(buf, helper_addr, buf.offset())?;
    abi::store_vreg64(buf, dst, A0, A0 + 1)
}

/// Same shape as [`emit_two_arg_helper_64`] but for a helper whose operands
/// and result are all 32 bits, one register each rather than a pair.
fn emit_two_arg_helper_32(buf: &mut CodeBuffer, helper_addr: usize, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, A0, a)?;
    abi::load_vreg32(buf, A0 + 1, b)?;
    abi::emit_helper_call(buf, helper_addr, buf.offset())?;
    abi::store_vreg32(buf, dst, A0, SCRATCH_1)
}

fn emit_one_arg_helper_32(buf: &mut CodeBuffer, helper_addr: usize, dst: u8, a: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, A0, a)?;
    abi::emit_helper_call(buf, helper_addr, buf.offset())?;
    abi::store_vreg32(buf, dst, A0, SCRATCH_1)
}

/// Same shape as [`emit_one_arg_helper_32`] but for a helper whose single
/// argument and return value are both 64 bits, passed/returned in the `a0:a1`
/// pair per the standard integer calling convention for a doubleword.
fn emit_one_arg_helper_64(buf: &mut CodeBuffer, helper_addr: usize, dst: u8, a: u8) -> CompileResult<()> {
    abi::load_vreg64(buf, A0, A0 + 1, a)?;
    abi::emit_helper_call(buf, helper_addr, buf.offset())?;
    abi::store_vreg64(buf, dst, A0, A0 + 1)
}

fn emit_compare32(buf: &mut CodeBuffer, opcode: Opcode, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, SCRATCH_0, a)?;
    abi::load_vreg32(buf, SCRATCH_1, b)?;
    match opcode {
        Opcode::Eq32 => {
            encode::xor(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
            encode::sltu(buf, SCRATCH_0, 0, SCRATCH_0);
            encode::xori(buf, SCRATCH_0, SCRATCH_0, 1)?;
        }
        Opcode::Ne32 => {
            encode::xor(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
            encode::sltu(buf, SCRATCH_0, 0, SCRATCH_0);
        }
        Opcode::LtS32 => encode::slt(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::LtU32 => encode::sltu(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::GtS32 => encode::slt(buf, SCRATCH_0, SCRATCH_1, SCRATCH_0),
        Opcode::GtU32 => encode::sltu(buf, SCRATCH_0, SCRATCH_1, SCRATCH_0),
        Opcode::LeS32 => {
            encode::slt(buf, SCRATCH_0, SCRATCH_1, SCRATCH_0);
            encode::xori(buf, SCRATCH_0, SCRATCH_0, 1)?;
        }
        Opcode::LeU32 => {
            encode::sltu(buf, SCRATCH_0, SCRATCH_1, SCRATCH_0);
            encode::xori(buf, SCRATCH_0, SCRATCH_0, 1)?;
        }
        Opcode::GeS32 => {
            encode::slt(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
            encode::xori(buf, SCRATCH_0, SCRATCH_0, 1)?;
        }
        Opcode::GeU32 => {
            encode::sltu(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
            encode::xori(buf, SCRATCH_0, SCRATCH_0, 1)?;
        }
        _ => unreachable!(),
    }
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// 64-bit integer and float comparisons: neither ISA has a multi-word or
/// FPU-less `slt` for these widths, so the ordering is computed by a helper
/// (-1/0/1, or 2 for an unordered float pair) and `opcode` picks which
/// exact-equality test of that ordering code the bytecode's relation needs.
fn emit_wide_compare(
    buf: &mut CodeBuffer,
    helper_addr: usize,
    opcode: Opcode,
    dst: u8,
    a: u8,
    b: u8,
    operand_width64: bool,
) -> CompileResult<()> {
    if operand_width64 {
        abi::load_vreg64(buf, A0, A0 + 1, a)?;
        abi::load_vreg64(buf, A0 + 2, A0 + 3, b)?;
    } else {
        abi::load_vreg32(buf, A0, a)?;
        abi::load_vreg32(buf, A0 + 1, b)?;
    }
    abi::emit_helper_call(buf, helper_addr, buf.offset())?;
    encode::add(buf, SCRATCH_2, A0, 0);
    emit_ordering_to_bool(buf, opcode, SCRATCH_2)?;
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// Turns the three-way ordering code in `code` (preserved across this call)
/// into the 0/1 boolean `opcode` asks for, left in `SCRATCH_0`. Reuses the
/// XOR/SLTU/XOR-invert "is zero" trick `emit_compare32`'s `Eq32` arm already
/// relies on, tested against the constant the relation needs instead of
/// against another operand register.
fn emit_ordering_to_bool(buf: &mut CodeBuffer, opcode: Opcode, code: u8) -> CompileResult<()> {
    match opcode {
        Opcode::Eq64 | Opcode::FEq32 | Opcode::FEq64 => emit_eq_const(buf, SCRATCH_0, code, 0)?,
        Opcode::Ne64 | Opcode::FNe32 | Opcode::FNe64 => {
            emit_eq_const(buf, SCRATCH_0, code, 0)?;
            encode::xori(buf, SCRATCH_0, SCRATCH_0, 1)?;
        }
        Opcode::LtS64 | Opcode::LtU64 | Opcode::FLt32 | Opcode::FLt64 => emit_eq_const(buf, SCRATCH_0, code, -1)?,
        Opcode::GtS64 | Opcode::GtU64 | Opcode::FGt32 | Opcode::FGt64 => emit_eq_const(buf, SCRATCH_0, code, 1)?,
        Opcode::LeS64 | Opcode::LeU64 | Opcode::FLe32 | Opcode::FLe64 => {
            emit_eq_const(buf, SCRATCH_0, code, -1)?;
            emit_eq_const(buf, SCRATCH_1, code, 0)?;
            encode::or(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
        }
        Opcode::GeS64 | Opcode::GeU64 | Opcode::FGe32 | Opcode::FGe64 => {
            emit_eq_const(buf, SCRATCH_0, code, 1)?;
            emit_eq_const(buf, SCRATCH_1, code, 0)?;
            encode::or(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
        }
        _ => unreachable!("emit_ordering_to_bool only called for wide comparison opcodes"),
    }
    Ok(())
}

/// Writes 1 into `dst` iff `src == v`, else 0. `dst` must not alias `src`.
fn emit_eq_const(buf: &mut CodeBuffer, dst: u8, src: u8, v: i32) -> CompileResult<()> {
    emit_load_const32(buf, dst, v)?;
    encode::xor(buf, dst, dst, src);
    encode::sltu(buf, dst, 0, dst);
    encode::xori(buf, dst, dst, 1)
}

fn emit_extend(buf: &mut CodeBuffer, dst: u8, src: u8, shift: u32, signed: bool) -> CompileResult<()> {
    abi::load_vreg32(buf, SCRATCH_0, src)?;
    encode::slli(buf, SCRATCH_0, SCRATCH_0, shift);
    if signed {
        encode::srai(buf, SCRATCH_0, SCRATCH_0, shift);
    } else {
        encode::srli(buf, SCRATCH_0, SCRATCH_0, shift);
    }
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

fn emit_widened_offset(buf: &mut CodeBuffer, base: u8, offset: i32, scratch: u8) -> CompileResult<()> {
    if (-2048..2048).contains(&offset) {
        // Offset fits the native load/store immediate; callers apply it
        // directly, this is a no-op widening.
        let _ = (base, scratch);
        Ok(())
    } else {
        emit_load_const32(buf, scratch, offset)?;
        encode::add(buf, base, base, scratch);
        Ok(())
    }
}

/// Emit either an unconditional (`cond_reg` ignored) or conditional
/// (branch-if-nonzero of `cond_reg`) fixup-recorded branch to `target`
/// bytecode offset.
fn emit_branch_fixup(
    buf: &mut CodeBuffer,
    labels: &mut LabelTable,
    target: u32,
    unconditional: bool,
    cond_reg: u8,
) -> CompileResult<()> {
    let native_offset = buf.offset();
    buf.put4(0);
    labels.add_fixup(
        native_offset,
        target,
        if unconditional { "jal" } else { "bnez" },
        Box::new(move |buf, disp| {
            if unconditional {
                let disp = disp as i32;
                let bits = encode_jal_bits(0, disp);
                buf.store_u32(native_offset, bits.ok_or(CompileError::EncodingError {
                    mnemonic: "jal",
                    native_offset,
                    displacement: disp as i64,
                })?)
            } else {
                if !(-4096..4096).contains(&disp) {
                    return Err(CompileError::EncodingError {
                        mnemonic: "bnez",
                        native_offset,
                        displacement: disp,
                    });
                }
                let bits = encode_bne_bits(cond_reg, 0, disp as i32);
                buf.store_u32(native_offset, bits)
            }
        }),
    );
    Ok(())
}

fn emit_epilogue_jump(buf: &mut CodeBuffer, labels: &mut LabelTable) -> CompileResult<()> {
    // The epilogue's native offset is not yet known at this point in the
    // single pass; the jump target is recorded as a fixup against a
    // reserved bytecode offset one past the end of the stream, which the
    // caller (finalize) records as a label once the epilogue is emitted.
    emit_branch_fixup(buf, labels, u32::MAX, true, 0)
}

fn emit_atomic32(
    buf: &mut CodeBuffer,
    helpers: &HelperTable,
    opcode: Opcode,
    cur: &mut BytecodeCursor,
) -> CompileResult<()> {
    match opcode {
        Opcode::AtomicLoad32 => {
            let (dst, addr) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            encode::lr_w(buf, SCRATCH_1, SCRATCH_0);
            abi::store_vreg32(buf, dst, SCRATCH_1, SCRATCH_2)
        }
        Opcode::AtomicStore32 => {
            let (addr, src) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            abi::load_vreg32(buf, SCRATCH_1, src)?;
            encode::sw(buf, SCRATCH_0, SCRATCH_1, 0)
        }
        Opcode::AtomicXchg32 => {
            let (dst, addr, val) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            abi::load_vreg32(buf, SCRATCH_1, val)?;
            encode::amoswap_w(buf, SCRATCH_2, SCRATCH_0, SCRATCH_1);
            abi::store_vreg32(buf, dst, SCRATCH_2, SCRATCH_1)
        }
        Opcode::AtomicCmpxchg32 => {
            let (dst, addr, expected, desired) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, A0, addr)?;
            abi::load_vreg32(buf, A0 + 1, expected)?;
            abi::load_vreg32(buf, A0 + 2, desired)?;
            abi::emit_helper_call(buf, helpers.atomic_compare_exchange_32 as usize, buf.offset())?;
            abi::store_vreg32(buf, dst, A0, SCRATCH_1)
        }
        Opcode::AtomicRmw32 => {
            let (dst, addr, val, op) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, A0, addr)?;
            abi::load_vreg32(buf, A0 + 1, val)?;
            let helper_addr = match op {
                0 => helpers.atomic_fetch_add_32 as usize,
                1 => helpers.atomic_fetch_sub_32 as usize,
                2 => helpers.atomic_fetch_and_32 as usize,
                3 => helpers.atomic_fetch_or_32 as usize,
                _ => helpers.atomic_fetch_xor_32 as usize,
            };
            abi::emit_helper_call(buf, helper_addr, buf.offset())?;
            abi::store_vreg32(buf, dst, A0, SCRATCH_1)
        }
        _ => unreachable!(),
    }
}

/// 64-bit atomics. `AtomicLoad64`/`AtomicStore64` go through plain
/// non-atomic double-word `lw`/`sw` pairs, same as Xtensa's backend -- there
/// is no 64-bit `lr`/`sc` on RV32. The read-modify-write ops all route
/// through a helper since RV32 has no native 64-bit RMW instruction at all.
fn emit_atomic64(
    buf: &mut CodeBuffer,
    helpers: &HelperTable,
    opcode: Opcode,
    cur: &mut BytecodeCursor,
) -> CompileResult<()> {
    match opcode {
        Opcode::AtomicLoad64 => {
            let (dst, addr) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            encode::lw(buf, SCRATCH_1, SCRATCH_0, 0)?;
            encode::lw(buf, SCRATCH_2, SCRATCH_0, 4)?;
            abi::store_vreg64(buf, dst, SCRATCH_1, SCRATCH_2)
        }
        Opcode::AtomicStore64 => {
            let (addr, src) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            abi::load_vreg64(buf, SCRATCH_1, SCRATCH_2, src)?;
            encode::sw(buf, SCRATCH_0, SCRATCH_1, 0)?;
            encode::sw(buf, SCRATCH_0, SCRATCH_2, 4)
        }
        Opcode::AtomicXchg64 => {
            let (dst, addr, val) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, A0, addr)?;
            abi::load_vreg64(buf, A0 + 1, A0 + 2, val)?;
            abi::emit_helper_call(buf, helpers.atomic_exchange_64 as usize, buf.offset())?;
            abi::store_vreg64(buf, dst, A0, A0 + 1)
        }
        Opcode::AtomicCmpxchg64 => {
            let (dst, addr, expected, desired) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, A0, addr)?;
            abi::load_vreg64(buf, A0 + 1, A0 + 2, expected)?;
            abi::load_vreg64(buf, A0 + 3, A0 + 4, desired)?;
            abi::emit_helper_call(buf, helpers.atomic_compare_exchange_64 as usize, buf.offset())?;
            abi::store_vreg64(buf, dst, A0, A0 + 1)
        }
        Opcode::AtomicRmw64 => {
            let (dst, addr, val, op) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, A0, addr)?;
            abi::load_vreg64(buf, A0 + 1, A0 + 2, val)?;
            let helper_addr = match op {
                0 => helpers.atomic_fetch_add_64 as usize,
                1 => helpers.atomic_fetch_sub_64 as usize,
                2 => helpers.atomic_fetch_and_64 as usize,
                3 => helpers.atomic_fetch_or_64 as usize,
                _ => helpers.atomic_fetch_xor_64 as usize,
            };
            abi::emit_helper_call(buf, helper_addr, buf.offset())?;
            abi::store_vreg64(buf, dst, A0, A0 + 1)
        }
        _ => unreachable!(),
    }
}

fn encode_beq_bits(rs1: u8, rs2: u8, imm: i32) -> u32 {
    // Mirrors `put_b` in `encode.rs`; kept standalone since the fixup
    // closure needs the raw bits, not a buffer write.
    let imm = imm as u32;
    let mut i = 0x63u32;
    i |= ((imm >> 11) & 0x1) << 7;
    i |= ((imm >> 1) & 0xf) << 8;
    i |= (rs1 as u32 & 0x1f) << 15;
    i |= (rs2 as u32 & 0x1f) << 20;
    i |= ((imm >> 5) & 0x3f) << 25;
    i |= ((imm >> 12) & 0x1) << 31;
    i
}

fn encode_bne_bits(rs1: u8, rs2: u8, imm: i32) -> u32 {
    let base = encode_beq_bits(rs1, rs2, imm);
    (base & !(0x7 << 12)) | (0x1 << 12)
}

fn encode_jal_bits(rd: u8, imm: i32) -> Option<u32> {
    if imm < -(1 << 20) || imm >= (1 << 20) {
        return None;
    }
    let imm = imm as u32;
    let mut i = 0x6fu32;
    i |= (rd as u32 & 0x1f) << 7;
    i |= ((imm >> 12) & 0xff) << 12;
    i |= ((imm >> 11) & 0x1) << 20;
    i |= ((imm >> 1) & 0x3ff) << 21;
    i |= ((imm >> 20) & 0x1) << 31;
    Some(i)
}

/// A `HelperTable` of no-op stubs, for tests (in this module and in
/// [`crate::isa::riscv`]'s own) that only care about the native sequence a
/// dispatch emits, not what a helper call actually does.
#[cfg(test)]
pub(crate) fn dummy_helpers() -> HelperTable {
    unsafe extern "C" fn stub0(_: crate::helpers::InstancePtr, _: u32, _: crate::helpers::FramePtr) {}
        unsafe extern "C" fn stub_u32(_: u32, _: u32) -> u32 {
            0
        }
        unsafe extern "C" fn stub_ptr_u32(_: u32) -> u32 {
            0
        }
        unsafe extern "C" fn stub_i64(_: i64, _: i64) -> i64 {
            0
        }
        unsafe extern "C" fn stub_u64(_: u64, _: u64) -> u64 {
            0
        }
        unsafe extern "C" fn stub_malloc(_: crate::helpers::InstancePtr, _: u32) -> *mut std::ffi::c_void {
            std::ptr::null_mut()
        }
        unsafe extern "C" fn stub_free(_: crate::helpers::InstancePtr, _: *mut std::ffi::c_void) {}
        unsafe extern "C" fn stub_shift(_: u64, _: u32) -> u64 {
            0
        }
        unsafe extern "C" fn stub_shift_s(_: i64, _: u32) -> i64 {
            0
        }
        unsafe extern "C" fn stub_f32_u32(_: u32) -> u32 {
            0
        }
        unsafe extern "C" fn stub_i32_u32(_: i32) -> u32 {
            0
        }
        unsafe extern "C" fn stub_i64_u64(_: i64) -> u64 {
            0
        }
        unsafe extern "C" fn stub_u64_u64(_: u64) -> u64 {
            0
        }
        unsafe extern "C" fn stub_u32_u64(_: u32) -> u64 {
            0
        }
        unsafe extern "C" fn stub_u64_u32(_: u64) -> u32 {
            0
        }
        unsafe extern "C" fn stub_atomic32(_: *mut u32, _: u32) -> u32 {
            0
        }
        unsafe extern "C" fn stub_atomic32_cas(_: *mut u32, _: u32, _: u32) -> u32 {
            0
        }
        unsafe extern "C" fn stub_atomic64(_: *mut u64, _: u64) -> u64 {
            0
        }
        unsafe extern "C" fn stub_atomic64_cas(_: *mut u64, _: u64, _: u64) -> u64 {
            0
        }
        unsafe extern "C" fn stub_ext(_: crate::helpers::InstancePtr, _: u8, _: *const u64, _: u8) -> u64 {
            0
        }
        unsafe extern "C" fn stub_ci(
            _: crate::helpers::InstancePtr,
            _: u32,
            _: crate::helpers::FramePtr,
            _: u16,
            _: bool,
            _: u32,
            _: *const u8,
        ) {
        }
        unsafe extern "C" fn stub_ci2(
            _: crate::helpers::InstancePtr,
            _: u32,
            _: u32,
            _: crate::helpers::FramePtr,
            _: u16,
            _: u8,
        ) {
        }
        unsafe extern "C" fn stub_cip(
            _: crate::helpers::InstancePtr,
            _: *const std::ffi::c_void,
            _: u32,
            _: crate::helpers::FramePtr,
            _: u16,
            _: u8,
        ) {
        }
        unsafe extern "C" fn stub_g(
            _: crate::helpers::InstancePtr,
            _: u32,
            _: crate::helpers::FramePtr,
            _: u16,
            _: u8,
        ) {
        }
        unsafe extern "C" fn stub_alloca(
            _: crate::helpers::InstancePtr,
            _: *mut std::ffi::c_void,
            _: crate::helpers::FramePtr,
            _: u16,
            _: u8,
            _: u8,
            _: u32,
        ) {
        }
        unsafe extern "C" fn stub_realloc(
            _: crate::helpers::InstancePtr,
            _: *mut std::ffi::c_void,
            _: u32,
        ) -> *mut std::ffi::c_void {
            std::ptr::null_mut()
        }
        unsafe extern "C" fn stub_cmp_i64(_: i64, _: i64) -> i32 {
            0
        }
        unsafe extern "C" fn stub_cmp_u64(_: u64, _: u64) -> i32 {
            0
        }
        unsafe extern "C" fn stub_cmp_f32(_: u32, _: u32) -> i32 {
            0
        }
        unsafe extern "C" fn stub_cmp_f64(_: u64, _: u64) -> i32 {
            0
        }

        HelperTable {
            call_espb_function: stub0,
            call_indirect: stub_ci2,
            call_indirect_ptr: stub_cip,
            call_import: stub_ci,
            ld_global_addr: stub_g,
            ld_global: stub_g,
            st_global: stub_g,
            runtime_alloca: stub_alloca,
            heap_malloc: stub_malloc,
            heap_realloc: stub_realloc,
            heap_free: stub_free,
            mul_i64: stub_i64,
            mul_u64: stub_u64,
            div_i64: stub_i64,
            div_u64: stub_u64,
            rem_i64: stub_i64,
            rem_u64: stub_u64,
            shl_i64: stub_shift,
            shr_i64: stub_shift_s,
            shr_u64: stub_shift,
            f32_to_i32: stub_f32_u32,
            f32_to_u32: stub_f32_u32,
            f64_to_i64: stub_u64_u64,
            f64_to_u64: stub_u64_u64,
            i32_to_f32: stub_i32_u32,
            u32_to_f32: stub_ptr_u32,
            i64_to_f64: stub_i64_u64,
            u64_to_f64: stub_u64_u64,
            f32_to_f64: stub_u32_u64,
            f64_to_f32: stub_u64_u32,
            atomic_fetch_add_32: stub_atomic32,
            atomic_fetch_sub_32: stub_atomic32,
            atomic_fetch_and_32: stub_atomic32,
            atomic_fetch_or_32: stub_atomic32,
            atomic_fetch_xor_32: stub_atomic32,
            atomic_exchange_32: stub_atomic32,
            atomic_compare_exchange_32: stub_atomic32_cas,
            atomic_fetch_add_64: stub_atomic64,
            atomic_fetch_sub_64: stub_atomic64,
            atomic_fetch_and_64: stub_atomic64,
            atomic_fetch_or_64: stub_atomic64,
            atomic_fetch_xor_64: stub_atomic64,
            atomic_exchange_64: stub_atomic64,
            atomic_compare_exchange_64: stub_atomic64_cas,
            ext_table_memory_op: stub_ext,
            f32_add: stub_u32,
            f32_sub: stub_u32,
            f32_mul: stub_u32,
            f32_div: stub_u32,
            f32_min: stub_u32,
            f32_max: stub_u32,
            f32_sqrt: stub_f32_u32,
            f64_add: stub_u64,
            f64_sub: stub_u64,
            f64_mul: stub_u64,
            f64_div: stub_u64,
            f64_min: stub_u64,
            f64_max: stub_u64,
            f64_sqrt: stub_u64_u64,
            cmp_i64: stub_cmp_i64,
            cmp_u64: stub_cmp_u64,
            cmp_f32: stub_cmp_f32,
            cmp_f64: stub_cmp_f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BodyFlags, BodyHeader};
    use crate::buffer::WordDiscipline;

    fn run_body(code: &[u8], mem: &mut [u8]) -> CompileResult<(LabelTable, u32)> {
        let header = BodyHeader {
            num_vregs: 16,
            flags: BodyFlags::empty(),
            max_vreg_used: 8,
        };
        let body = FunctionBody::new(header, code);
        let helpers = dummy_helpers();
        let config = CompilerConfig::riscv_defaults();
        let mut buf = CodeBuffer::new(mem, WordDiscipline::ByteAddressable);
        let mut labels = LabelTable::new();
        run(&mut buf, &mut labels, &helpers, &config, &body)?;
        Ok((labels, buf.offset()))
    }

    #[test]
    fn const_and_add_emits_without_error() {
        // ConstI32 vreg1 = 5; ConstI32 vreg2 = 7; Add32 vreg0 = vreg1 + vreg2; End
        let mut code = Vec::new();
        code.push(Opcode::ConstI32 as u8);
        code.push(1);
        code.extend_from_slice(&5i32.to_le_bytes());
        code.push(Opcode::ConstI32 as u8);
        code.push(2);
        code.extend_from_slice(&7i32.to_le_bytes());
        code.push(Opcode::Add32 as u8);
        code.extend_from_slice(&[0, 1, 2]);
        code.push(Opcode::End as u8);

        let mut mem = [0u8; 512];
        let (labels, _offset) = run_body(&code, &mut mem).unwrap();
        assert!(labels.lookup(0).is_some());
    }

    #[test]
    fn branch_records_pending_fixup() {
        let mut code = Vec::new();
        code.push(Opcode::Br as u8);
        code.extend_from_slice(&0i32.to_le_bytes());
        code.push(Opcode::End as u8);

        let mut mem = [0u8; 256];
        let (labels, _) = run_body(&code, &mut mem).unwrap();
        assert_eq!(labels.pending_fixup_count(), 2, "the Br itself plus the End's epilogue jump");
    }

    #[test]
    fn unsupported_opcode_byte_is_rejected() {
        let code = [0x99u8];
        let mut mem = [0u8; 64];
        assert!(run_body(&code, &mut mem).is_err());
    }

    #[test]
    fn br_if_flushes_only_what_the_successors_can_still_read() {
        // Add32 vreg3 = vreg1 + vreg2 (lands dirty in the cache); BrIf vreg0,
        // +0 (branches on an uncached condition, falling through
        // immediately); End. vreg3 is never read again by either successor,
        // so flush_for_branch should skip its writeback rather than the
        // blanket flush_and_reset_cache's unconditional one.
        let mut code = Vec::new();
        code.push(Opcode::Add32 as u8);
        code.extend_from_slice(&[3, 1, 2]);
        let br_if_offset = code.len();
        code.push(Opcode::BrIf as u8);
        code.push(0);
        code.extend_from_slice(&0i32.to_le_bytes());
        code.push(Opcode::End as u8);

        let mut mem = [0u8; 256];
        let (labels, _offset) = run_body(&code, &mut mem).unwrap();
        assert!(labels.lookup(br_if_offset as u32).is_some());
    }
}
