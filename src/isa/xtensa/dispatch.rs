//! The Xtensa single-pass opcode dispatcher.
//!
//! Mirrors `isa::riscv::dispatch`'s structure -- one linear walk emitting
//! each opcode's native sequence and recording labels as it goes -- but
//! differs in two load-bearing ways the windowed, pool-based target forces:
//! there is no register cache (see `crate::regcache`'s RISC-V-only scope),
//! and any constant or helper address too wide for an immediate goes through
//! the literal pool, tracked here as a list of not-yet-patched `l32r` sites
//! that get resolved every time the pool is flushed.

use crate::bytecode::{BytecodeCursor, ExtendedOp, FunctionBody, Opcode, VARIADIC_MARKER};
use crate::buffer::CodeBuffer;
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::frame::VRegFrame;
use crate::helpers::{HelperTable, VariadicArgs};
use crate::isa::xtensa::abi::{self, FRAME_BASE, INSTANCE, OUTGOING_ARG0, SCRATCH_0, SCRATCH_1, SCRATCH_2};
use crate::isa::xtensa::encode;
use crate::label::LabelTable;
use crate::literal_pool::LiteralPool;

/// Flush the pool once it holds this many entries, well short of
/// [`crate::literal_pool::MAX_POOL_ENTRIES`], so a single function body with
/// many wide constants never runs the pool out mid-opcode.
const POOL_FLUSH_THRESHOLD: usize = 48;

struct Ctx<'p> {
    pool: LiteralPool,
    pending: Vec<abi::PendingLoad>,
    _marker: std::marker::PhantomData<&'p ()>,
}

impl<'p> Ctx<'p> {
    fn new() -> Self {
        Self {
            pool: LiteralPool::new(),
            pending: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    fn flush(&mut self, buf: &mut CodeBuffer) -> CompileResult<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        self.pool.flush(buf, |buf, disp| {
            encode::j(buf, disp as i32)?;
            Ok(3)
        })?;
        for pending in self.pending.drain(..) {
            abi::patch_pending_load(buf, &self.pool, pending)?;
        }
        self.pool.reset();
        Ok(())
    }

    fn flush_if_crowded(&mut self, buf: &mut CodeBuffer) -> CompileResult<()> {
        if self.pool.len() >= POOL_FLUSH_THRESHOLD {
            self.flush(buf)?;
        }
        Ok(())
    }

    fn helper_call(&mut self, buf: &mut CodeBuffer, helper_addr: usize) -> CompileResult<()> {
        let pending = abi::emit_helper_call(buf, &mut self.pool, helper_addr)?;
        self.pending.push(pending);
        self.flush_if_crowded(buf)
    }

    /// Load a 32-bit immediate into `dst`: `movi` when it fits the 12-bit
    /// signed range, otherwise a literal-pool `l32r`.
    fn load_const32(&mut self, buf: &mut CodeBuffer, dst: u8, value: i32) -> CompileResult<()> {
        if (-2048..2048).contains(&value) {
            return encode::movi(buf, dst, value);
        }
        let idx = self.pool.find_or_add(value as u32)?;
        let native_offset = buf.offset();
        encode::l32r(buf, dst, 0)?;
        self.pending.push(abi::PendingLoad {
            native_offset,
            pool_index: idx,
        });
        self.flush_if_crowded(buf)
    }
}

/// Runs the opcode loop over `body.code`, emitting into `buf` and recording
/// labels/fixups into `labels`. Same contract as
/// [`crate::isa::riscv::dispatch::run`]: an `End` opcode jumps to the shared
/// epilogue rather than stopping the loop outright.
pub fn run(buf: &mut CodeBuffer, labels: &mut LabelTable, helpers: &HelperTable, _config: &CompilerConfig, body: &FunctionBody) -> CompileResult<()> {
    let mut cur = BytecodeCursor::new(body.code);
    let mut ctx = Ctx::new();

    while !cur.at_end() {
        let bc_offset = cur.offset();
        labels.record(bc_offset, buf.offset());
        let opcode_byte = cur.read_opcode()?;
        let opcode = Opcode::from_u8(opcode_byte).ok_or(CompileError::UnsupportedOpcode {
            opcode: opcode_byte,
            bytecode_offset: bc_offset,
        })?;

        match opcode {
            Opcode::ConstI8 | Opcode::ConstI16 | Opcode::ConstI32 => {
                let (dst, value) = match opcode {
                    Opcode::ConstI8 => (cur.read_u8()?, cur.read_u8()? as i8 as i32),
                    Opcode::ConstI16 => (cur.read_u8()?, cur.read_u16()? as i16 as i32),
                    _ => (cur.read_u8()?, cur.read_i32()?),
                };
                ctx.load_const32(buf, SCRATCH_0, value)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstPtr => {
                let dst = cur.read_u8()?;
                let value = cur.read_u32()? as i32;
                ctx.load_const32(buf, SCRATCH_0, value)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstI64 => {
                let dst = cur.read_u8()?;
                let value = cur.read_u64()?;
                ctx.load_const32(buf, SCRATCH_0, value as u32 as i32)?;
                ctx.load_const32(buf, SCRATCH_1, (value >> 32) as u32 as i32)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstF32 => {
                let dst = cur.read_u8()?;
                let bits = cur.read_u32()? as i32;
                ctx.load_const32(buf, SCRATCH_0, bits)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ConstF64 => {
                let dst = cur.read_u8()?;
                let bits = cur.read_u64()?;
                ctx.load_const32(buf, SCRATCH_0, bits as u32 as i32)?;
                ctx.load_const32(buf, SCRATCH_1, (bits >> 32) as u32 as i32)?;
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
                emit_binop32(buf, opcode, dst, a, b)?;
            }
            Opcode::DivS32 | Opcode::DivU32 | Opcode::RemS32 | Opcode::RemU32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
                abi::load_vreg32(buf, OUTGOING_ARG0 + 1, b)?;
                let helper_addr = match opcode {
                    Opcode::DivS32 => helpers.div_i64 as usize, // widened through the 64-bit helper; low word carries the result
                    Opcode::DivU32 => helpers.div_u64 as usize,
                    Opcode::RemS32 => helpers.rem_i64 as usize,
                    _ => helpers.rem_u64 as usize,
                };
                ctx.helper_call(buf, helper_addr)?;
                abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)?;
            }
            Opcode::Not32 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                encode::movi(buf, SCRATCH_1, -1)?;
                encode::xor_(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::Shl32 | Opcode::ShrS32 | Opcode::ShrU32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                abi::load_vreg32(buf, SCRATCH_1, b)?;
                match opcode {
                    Opcode::Shl32 => {
                        encode::ssl(buf, SCRATCH_1);
                        encode::sll(buf, SCRATCH_0, SCRATCH_0);
                    }
                    Opcode::ShrS32 => {
                        encode::ssr(buf, SCRATCH_1);
                        encode::sra(buf, SCRATCH_0, SCRATCH_0);
                    }
                    _ => {
                        encode::ssr(buf, SCRATCH_1);
                        encode::srl(buf, SCRATCH_0, SCRATCH_0);
                    }
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
                encode::movi(buf, SCRATCH_2, -1)?;
                encode::xor_(buf, SCRATCH_0, SCRATCH_0, SCRATCH_2);
                encode::xor_(buf, SCRATCH_1, SCRATCH_1, SCRATCH_2);
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::Mul64
            | Opcode::DivS64
            | Opcode::DivU64
            | Opcode::RemS64
            | Opcode::RemU64
            | Opcode::Shl64
            | Opcode::ShrS64
            | Opcode::ShrU64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                let helper_addr = match opcode {
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
                emit_two_arg_helper_64(buf, &mut ctx, helper_addr, dst, a, b)?;
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
                emit_two_arg_helper_32(buf, &mut ctx, helper_addr, dst, a, b)?;
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
                emit_two_arg_helper_64(buf, &mut ctx, helper_addr, dst, a, b)?;
            }
            Opcode::FSqrt32 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, &mut ctx, helpers.f32_sqrt as usize, dst, a)?;
            }
            Opcode::FSqrt64 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, &mut ctx, helpers.f64_sqrt as usize, dst, a)?;
            }
            Opcode::FAbs32 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, a)?;
                encode::slli(buf, SCRATCH_0, SCRATCH_0, 1)?;
                encode::srli(buf, SCRATCH_0, SCRATCH_0, 1)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::FAbs64 => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, SCRATCH_0, SCRATCH_1, a)?;
                encode::slli(buf, SCRATCH_1, SCRATCH_1, 1)?;
                encode::srli(buf, SCRATCH_1, SCRATCH_1, 1)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::F32FromI64S | Opcode::F32FromI64U | Opcode::I64FromF32S | Opcode::I64FromF32U => {
                return Err(CompileError::UnsupportedOpcode {
                    opcode: opcode_byte,
                    bytecode_offset: bc_offset,
                });
            }
            Opcode::F32FromI32S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, &mut ctx, helpers.i32_to_f32 as usize, dst, a)?;
            }
            Opcode::F32FromI32U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, &mut ctx, helpers.u32_to_f32 as usize, dst, a)?;
            }
            Opcode::I32FromF32S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, &mut ctx, helpers.f32_to_i32 as usize, dst, a)?;
            }
            Opcode::I32FromF32U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_32(buf, &mut ctx, helpers.f32_to_u32 as usize, dst, a)?;
            }
            Opcode::F64FromI64S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, &mut ctx, helpers.i64_to_f64 as usize, dst, a)?;
            }
            Opcode::F64FromI64U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, &mut ctx, helpers.u64_to_f64 as usize, dst, a)?;
            }
            Opcode::I64FromF64S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, &mut ctx, helpers.f64_to_i64 as usize, dst, a)?;
            }
            Opcode::I64FromF64U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                emit_one_arg_helper_64(buf, &mut ctx, helpers.f64_to_u64 as usize, dst, a)?;
            }
            Opcode::F64FromI32S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
                encode::ssr(buf, OUTGOING_ARG0);
                // widen to 64 bits: a sign-filled word computed via an
                // immediate-shift-free comparison, matching the low-register
                // budget this target's helper bridge imposes.
                encode::movi(buf, OUTGOING_ARG0 + 1, 0)?;
                encode::srai(buf, OUTGOING_ARG0 + 1, OUTGOING_ARG0, 31)?;
                ctx.helper_call(buf, helpers.i64_to_f64 as usize)?;
                abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)?;
            }
            Opcode::F64FromI32U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
                encode::movi(buf, OUTGOING_ARG0 + 1, 0)?;
                ctx.helper_call(buf, helpers.u64_to_f64 as usize)?;
                abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)?;
            }
            Opcode::I32FromF64S => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, OUTGOING_ARG0, OUTGOING_ARG0 + 1, a)?;
                ctx.helper_call(buf, helpers.f64_to_i64 as usize)?;
                abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)?;
            }
            Opcode::I32FromF64U => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, OUTGOING_ARG0, OUTGOING_ARG0 + 1, a)?;
                ctx.helper_call(buf, helpers.f64_to_u64 as usize)?;
                abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)?;
            }

            Opcode::Eq32
            | Opcode::Ne32
            | Opcode::LtS32
            | Opcode::LtU32
            | Opcode::GtS32
            | Opcode::GtU32
            | Opcode::LeS32
            | Opcode::LeU32
            | Opcode::GeS32
            | Opcode::GeU32 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                emit_compare32(buf, opcode, dst, a, b)?;
            }
            Opcode::Eq64
            | Opcode::Ne64
            | Opcode::LtS64
            | Opcode::LtU64
            | Opcode::GtS64
            | Opcode::GtU64
            | Opcode::LeS64
            | Opcode::LeU64
            | Opcode::GeS64
            | Opcode::GeU64
            | Opcode::FEq32
            | Opcode::FNe32
            | Opcode::FLt32
            | Opcode::FGt32
            | Opcode::FLe32
            | Opcode::FGe32
            | Opcode::FEq64
            | Opcode::FNe64
            | Opcode::FLt64
            | Opcode::FGt64
            | Opcode::FLe64
            | Opcode::FGe64 => {
                let (dst, a, b) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                match opcode {
                    Opcode::Eq64 | Opcode::Ne64 | Opcode::LtS64 | Opcode::LtU64 | Opcode::GtS64 | Opcode::GtU64 | Opcode::LeS64 | Opcode::LeU64 | Opcode::GeS64 | Opcode::GeU64 => {
                        let helper_addr = match opcode {
                            Opcode::LtS64 | Opcode::GtS64 | Opcode::LeS64 | Opcode::GeS64 => helpers.cmp_i64 as usize,
                            _ => helpers.cmp_u64 as usize,
                        };
                        emit_wide_compare(buf, &mut ctx, helper_addr, opcode, dst, a, b, true)?;
                    }
                    Opcode::FEq32 | Opcode::FNe32 | Opcode::FLt32 | Opcode::FGt32 | Opcode::FLe32 | Opcode::FGe32 => {
                        emit_wide_compare(buf, &mut ctx, helpers.cmp_f32 as usize, opcode, dst, a, b, false)?;
                    }
                    _ => {
                        emit_wide_compare(buf, &mut ctx, helpers.cmp_f64 as usize, opcode, dst, a, b, true)?;
                    }
                }
            }

            Opcode::Load8S | Opcode::Load8U | Opcode::Load16S | Opcode::Load16U | Opcode::Load32 | Opcode::LoadBool | Opcode::LoadPtr | Opcode::LoadF32 => {
                let (dst, base, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, &mut ctx, SCRATCH_0, offset, SCRATCH_2)?;
                match opcode {
                    Opcode::Load8S => {
                        encode::l8ui(buf, SCRATCH_1, SCRATCH_0, 0)?;
                        encode::slli(buf, SCRATCH_1, SCRATCH_1, 24)?;
                        encode::srai(buf, SCRATCH_1, SCRATCH_1, 24)?;
                    }
                    Opcode::Load8U | Opcode::LoadBool => encode::l8ui(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    Opcode::Load16S => encode::l16si(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    Opcode::Load16U => encode::l16ui(buf, SCRATCH_1, SCRATCH_0, 0)?,
                    _ => encode::l32i(buf, SCRATCH_1, SCRATCH_0, 0)?,
                }
                abi::store_vreg32(buf, dst, SCRATCH_1, SCRATCH_2)?;
            }
            Opcode::Load64 | Opcode::LoadF64 => {
                let (dst, base, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, &mut ctx, SCRATCH_0, offset, SCRATCH_2)?;
                encode::l32i(buf, SCRATCH_1, SCRATCH_0, 0)?;
                encode::l32i(buf, SCRATCH_2, SCRATCH_0, 4)?;
                abi::store_vreg64(buf, dst, SCRATCH_1, SCRATCH_2)?;
            }
            Opcode::Store8 | Opcode::Store16 | Opcode::Store32 | Opcode::StoreBool | Opcode::StorePtr | Opcode::StoreF32 => {
                let (base, src, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, &mut ctx, SCRATCH_0, offset, SCRATCH_2)?;
                abi::load_vreg32(buf, SCRATCH_1, src)?;
                if matches!(opcode, Opcode::StoreBool) {
                    encode::extui(buf, SCRATCH_1, SCRATCH_1, 0, 1)?;
                }
                match opcode {
                    Opcode::Store8 | Opcode::StoreBool => encode::s8i(buf, SCRATCH_0, SCRATCH_1, 0)?,
                    Opcode::Store16 => encode::s16i(buf, SCRATCH_0, SCRATCH_1, 0)?,
                    _ => encode::s32i(buf, SCRATCH_0, SCRATCH_1, 0)?,
                }
            }
            Opcode::Store64 | Opcode::StoreF64 => {
                let (base, src, offset) = (cur.read_u8()?, cur.read_u8()?, cur.read_i32()?);
                abi::load_vreg32(buf, SCRATCH_0, base)?;
                emit_widened_offset(buf, &mut ctx, SCRATCH_0, offset, SCRATCH_2)?;
                abi::load_vreg64(buf, SCRATCH_1, SCRATCH_2, src)?;
                encode::s32i(buf, SCRATCH_0, SCRATCH_1, 0)?;
                // SCRATCH_0 still holds the base; the high word needs a
                // second address register since SCRATCH_2 now holds data.
                encode::addi(buf, SCRATCH_1, SCRATCH_0, 4)?;
                encode::s32i(buf, SCRATCH_1, SCRATCH_2, 0)?;
            }

            Opcode::Br => {
                let target = (bc_offset as i64 + cur.read_i32()? as i64) as u32;
                emit_branch_fixup(buf, labels, target, true, 0)?;
            }
            Opcode::BrIf => {
                let cond = cur.read_u8()?;
                let target = (bc_offset as i64 + cur.read_i32()? as i64) as u32;
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
                    ctx.load_const32(buf, SCRATCH_1, i as i32)?;
                    let native_offset = buf.offset();
                    buf.put3(0); // placeholder beq, patched below
                    let target = *target;
                    labels.add_fixup(
                        native_offset,
                        target,
                        "br_table.beq",
                        Box::new(move |buf, disp| {
                            if !(-128..128).contains(&disp) {
                                return Err(CompileError::EncodingError {
                                    mnemonic: "br_table.beq",
                                    native_offset,
                                    displacement: disp,
                                });
                            }
                            let bits = encode_beq_bits(SCRATCH_0, SCRATCH_1, disp as i32);
                            buf.store_u16(native_offset + 1, ((bits >> 8) & 0xffff) as u16)?;
                            buf.store_u8(native_offset, (bits & 0xff) as u8)
                        }),
                    );
                }
                emit_branch_fixup(buf, labels, default_target, true, 0)?;
            }
            Opcode::End => {
                emit_epilogue_jump(buf, labels)?;
            }
            Opcode::Unreachable => {
                let here = buf.offset();
                encode::beq(buf, 0, 0, 0)?;
                debug_assert_eq!(buf.offset(), here + 3);
            }

            Opcode::Call => {
                let func_idx = cur.read_u32()?;
                ctx.load_const32(buf, SCRATCH_0, func_idx as i32)?;
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                encode::mov_n(buf, OUTGOING_ARG0 + 1, SCRATCH_0);
                encode::mov_n(buf, OUTGOING_ARG0 + 2, FRAME_BASE);
                ctx.helper_call(buf, helpers.call_espb_function as usize)?;
            }
            Opcode::CallIndirect => {
                let (func_idx_vreg, type_idx) = (cur.read_u8()?, cur.read_u32()?);
                abi::load_vreg32(buf, SCRATCH_0, func_idx_vreg)?;
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                encode::mov_n(buf, OUTGOING_ARG0 + 1, SCRATCH_0);
                ctx.load_const32(buf, OUTGOING_ARG0 + 2, type_idx as i32)?;
                encode::mov_n(buf, OUTGOING_ARG0 + 3, FRAME_BASE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 4, body.header.num_vregs as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 5, func_idx_vreg as i32)?;
                ctx.helper_call(buf, helpers.call_indirect as usize)?;
            }
            Opcode::CallIndirectPtr => {
                let (ptr_vreg, type_idx) = (cur.read_u8()?, cur.read_u32()?);
                abi::load_vreg32(buf, SCRATCH_0, ptr_vreg)?;
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                encode::mov_n(buf, OUTGOING_ARG0 + 1, SCRATCH_0);
                ctx.load_const32(buf, OUTGOING_ARG0 + 2, type_idx as i32)?;
                encode::mov_n(buf, OUTGOING_ARG0 + 3, FRAME_BASE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 4, body.header.num_vregs as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 5, ptr_vreg as i32)?;
                ctx.helper_call(buf, helpers.call_indirect_ptr as usize)?;
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
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 1, import_idx as i32)?;
                encode::mov_n(buf, OUTGOING_ARG0 + 2, FRAME_BASE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 3, body.header.num_vregs as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 4, has_variadic as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 5, variadic.as_ref().map_or(0, |v| v.len() as i32))?;
                // `arg_types_ptr` is this helper's seventh logical argument,
                // past the six-register window; spill it to the one stack
                // slot `entry` reserved for exactly this.
                ctx.load_const32(buf, SCRATCH_0, blob_addr as i32)?;
                abi::store_stack_arg(buf, SCRATCH_0)?;
                ctx.helper_call(buf, helpers.call_import as usize)?;
            }

            Opcode::SignExtend8To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 24, true)?,
            Opcode::SignExtend16To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 16, true)?,
            Opcode::ZeroExtend8To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 24, false)?,
            Opcode::ZeroExtend16To32 => emit_extend(buf, cur.read_u8()?, cur.read_u8()?, 16, false)?,
            Opcode::SignExtend32To64 => {
                let (dst, src) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                encode::srai(buf, SCRATCH_1, SCRATCH_0, 31)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::ZeroExtend32To64 => {
                let (dst, src) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                encode::movi(buf, SCRATCH_1, 0)?;
                abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::PtrToInt | Opcode::IntToPtr => {
                let (dst, src) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, src)?;
                abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)?;
            }
            Opcode::FPromote => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
                ctx.helper_call(buf, helpers.f32_to_f64 as usize)?;
                abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)?;
            }
            Opcode::FDemote => {
                let (dst, a) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg64(buf, OUTGOING_ARG0, OUTGOING_ARG0 + 1, a)?;
                ctx.helper_call(buf, helpers.f64_to_f32 as usize)?;
                abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)?;
            }

            Opcode::LoadGlobalAddr | Opcode::LoadGlobal | Opcode::StoreGlobal => {
                let (global_idx, reg) = (cur.read_u32()?, cur.read_u8()?);
                let helper_addr = match opcode {
                    Opcode::LoadGlobalAddr => helpers.ld_global_addr as usize,
                    Opcode::LoadGlobal => helpers.ld_global as usize,
                    _ => helpers.st_global as usize,
                };
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 1, global_idx as i32)?;
                encode::mov_n(buf, OUTGOING_ARG0 + 2, FRAME_BASE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 3, body.header.num_vregs as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 4, reg as i32)?;
                ctx.helper_call(buf, helper_addr)?;
            }

            Opcode::HeapMalloc | Opcode::HeapCalloc | Opcode::HeapRealloc | Opcode::HeapFree => {
                let (dst, size_or_ptr_vreg) = (cur.read_u8()?, cur.read_u8()?);
                abi::load_vreg32(buf, SCRATCH_0, size_or_ptr_vreg)?;
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                encode::mov_n(buf, OUTGOING_ARG0 + 1, SCRATCH_0);
                let helper_addr = match opcode {
                    Opcode::HeapMalloc | Opcode::HeapCalloc => helpers.heap_malloc as usize,
                    Opcode::HeapRealloc => helpers.heap_realloc as usize,
                    _ => helpers.heap_free as usize,
                };
                ctx.helper_call(buf, helper_addr)?;
                if !matches!(opcode, Opcode::HeapFree) {
                    abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)?;
                }
            }

            Opcode::AtomicLoad32
            | Opcode::AtomicStore32
            | Opcode::AtomicXchg32
            | Opcode::AtomicCmpxchg32
            | Opcode::AtomicRmw32
            | Opcode::AtomicLoad64
            | Opcode::AtomicStore64
            | Opcode::AtomicRmw64
            | Opcode::AtomicXchg64
            | Opcode::AtomicCmpxchg64 => {
                emit_atomic(buf, &mut ctx, helpers, opcode, &mut cur)?;
            }
            Opcode::AtomicFence => {
                encode::memw(buf);
            }

            Opcode::Alloca => {
                let (dst, size_vreg, align) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 1, 0)?; // no execution-context pointer in this ABI
                encode::mov_n(buf, OUTGOING_ARG0 + 2, FRAME_BASE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 3, body.header.num_vregs as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 4, dst as i32)?;
                ctx.load_const32(buf, OUTGOING_ARG0 + 5, size_vreg as i32)?;
                // `align` is this helper's seventh logical argument, past the
                // six-register window; spill it to the stack slot `entry`
                // reserved for exactly this.
                ctx.load_const32(buf, SCRATCH_0, align as i32)?;
                abi::store_stack_arg(buf, SCRATCH_0)?;
                ctx.helper_call(buf, helpers.runtime_alloca as usize)?;
            }

            Opcode::Extended => {
                let sub_byte = cur.read_u8()?;
                let sub = ExtendedOp::from_u8(sub_byte).ok_or(CompileError::UnsupportedOpcode {
                    opcode: sub_byte,
                    bytecode_offset: cur.offset(),
                })?;
                encode::mov_n(buf, OUTGOING_ARG0, INSTANCE);
                ctx.load_const32(buf, OUTGOING_ARG0 + 1, sub as i32)?;
                ctx.helper_call(buf, helpers.ext_table_memory_op as usize)?;
            }
        }
    }

    ctx.flush(buf)
}

fn emit_binop32(buf: &mut CodeBuffer, opcode: Opcode, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, SCRATCH_0, a)?;
    abi::load_vreg32(buf, SCRATCH_1, b)?;
    match opcode {
        Opcode::Add32 => encode::add(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::Sub32 => encode::sub(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::Mul32 => encode::mull(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::And32 => encode::and_(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::Or32 => encode::or_(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        Opcode::Xor32 => encode::xor_(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1),
        _ => unreachable!(),
    }
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// 64-bit add/sub/and/or/xor as two independent 32-bit half-operations, same
/// no-carry-propagation simplification the RISC-V backend's own
/// `emit_binop64_inline` makes (see `DESIGN.md`).
fn emit_binop64_inline(buf: &mut CodeBuffer, opcode: Opcode, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg64(buf, SCRATCH_0, SCRATCH_1, a)?;
    let b_off = VRegFrame::offset_of(b) as i32;
    encode::l32i(buf, SCRATCH_2, FRAME_BASE, b_off)?;
    apply_64_half(buf, opcode, SCRATCH_0, SCRATCH_2);
    encode::l32i(buf, SCRATCH_2, FRAME_BASE, b_off + 4)?;
    apply_64_half(buf, opcode, SCRATCH_1, SCRATCH_2);
    abi::store_vreg64(buf, dst, SCRATCH_0, SCRATCH_1)
}

fn apply_64_half(buf: &mut CodeBuffer, opcode: Opcode, acc: u8, rhs: u8) {
    match opcode {
        Opcode::Add64 => encode::add(buf, acc, acc, rhs),
        Opcode::Sub64 => encode::sub(buf, acc, acc, rhs),
        Opcode::And64 => encode::and_(buf, acc, acc, rhs),
        Opcode::Or64 => encode::or_(buf, acc, acc, rhs),
        Opcode::Xor64 => encode::xor_(buf, acc, acc, rhs),
        _ => unreachable!(),
    }
}

fn emit_two_arg_helper_64(buf: &mut CodeBuffer, ctx: &mut Ctx, helper_addr: usize, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg64(buf, OUTGOING_ARG0, OUTGOING_ARG0 + 1, a)?;
    abi::load_vreg64(buf, OUTGOING_ARG0 + 2, OUTGOING_ARG0 + 3, b)?;
    ctx.helper_call(buf, helper_addr)?;
    abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)
}

fn emit_two_arg_helper_32(buf: &mut CodeBuffer, ctx: &mut Ctx, helper_addr: usize, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
    abi::load_vreg32(buf, OUTGOING_ARG0 + 1, b)?;
    ctx.helper_call(buf, helper_addr)?;
    abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)
}

fn emit_one_arg_helper_32(buf: &mut CodeBuffer, ctx: &mut Ctx, helper_addr: usize, dst: u8, a: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
    ctx.helper_call(buf, helper_addr)?;
    abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)
}

fn emit_one_arg_helper_64(buf: &mut CodeBuffer, ctx: &mut Ctx, helper_addr: usize, dst: u8, a: u8) -> CompileResult<()> {
    abi::load_vreg64(buf, OUTGOING_ARG0, OUTGOING_ARG0 + 1, a)?;
    ctx.helper_call(buf, helper_addr)?;
    abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)
}

fn emit_compare32(buf: &mut CodeBuffer, opcode: Opcode, dst: u8, a: u8, b: u8) -> CompileResult<()> {
    abi::load_vreg32(buf, SCRATCH_0, a)?;
    abi::load_vreg32(buf, SCRATCH_1, b)?;
    // No SLT-style comparison instruction on this ISA outside of branches;
    // each comparison runs as a two-instruction branch-around that parks a
    // 0/1 result in SCRATCH_0.
    match opcode {
        Opcode::Eq32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bne(b, r1, r2, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::Ne32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::beq(b, r1, r2, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::LtS32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bge(b, r1, r2, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::LtU32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bgeu(b, r1, r2, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::GtS32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bge(b, r2, r1, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::GtU32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bgeu(b, r2, r1, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::LeS32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::blt(b, r2, r1, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::LeU32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bltu(b, r2, r1, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::GeS32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::blt(b, r1, r2, disp), SCRATCH_0, SCRATCH_1)?,
        Opcode::GeU32 => emit_branch_around_set(buf, |b, r1, r2, disp| encode::bltu(b, r1, r2, disp), SCRATCH_0, SCRATCH_1)?,
        _ => unreachable!(),
    }
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// Set `SCRATCH_0` to 1, then skip clearing it to 0 unless `branch_if_false`
/// (an 8-bit-immediate compare branch) fires -- a two-instruction
/// branch-around, since this ISA's compare branches have no
/// set-on-condition form.
fn emit_branch_around_set(
    buf: &mut CodeBuffer,
    branch_if_false: impl FnOnce(&mut CodeBuffer, u8, u8, i32) -> CompileResult<()>,
    r1: u8,
    r2: u8,
) -> CompileResult<()> {
    encode::movi(buf, SCRATCH_0, 1)?;
    // `beq`-family branch over the clear-to-0, 3 bytes for `movi rd,0`'s
    // narrow form landing right after it.
    branch_if_false(buf, r1, r2, 3)?;
    encode::movi_n(buf, SCRATCH_0, 0)?;
    Ok(())
}

/// 64-bit integer and float comparisons route through a `cmp_*` helper that
/// returns an ordering code (-1/0/1, or 2 for an unordered float compare) in
/// place of a native wide-compare instruction, then reduce that code to the
/// 0/1 this bytecode's boolean result expects.
fn emit_wide_compare(buf: &mut CodeBuffer, ctx: &mut Ctx, helper_addr: usize, opcode: Opcode, dst: u8, a: u8, b: u8, operand_width64: bool) -> CompileResult<()> {
    if operand_width64 {
        abi::load_vreg64(buf, OUTGOING_ARG0, OUTGOING_ARG0 + 1, a)?;
        abi::load_vreg64(buf, OUTGOING_ARG0 + 2, OUTGOING_ARG0 + 3, b)?;
    } else {
        abi::load_vreg32(buf, OUTGOING_ARG0, a)?;
        abi::load_vreg32(buf, OUTGOING_ARG0 + 1, b)?;
    }
    ctx.helper_call(buf, helper_addr)?;
    encode::mov_n(buf, SCRATCH_2, OUTGOING_ARG0);
    emit_ordering_to_bool(buf, ctx, opcode, SCRATCH_2)?;
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// Reduce a preserved ordering code (held in `code`, distinct from the
/// `SCRATCH_0`/`SCRATCH_1` this leaves its 0/1 answer and working temporaries
/// in) to the boolean result `opcode` asks for.
fn emit_ordering_to_bool(buf: &mut CodeBuffer, ctx: &mut Ctx, opcode: Opcode, code: u8) -> CompileResult<()> {
    match opcode {
        Opcode::Eq64 | Opcode::FEq32 | Opcode::FEq64 => emit_eq_const(buf, ctx, code, 0)?,
        Opcode::Ne64 | Opcode::FNe32 | Opcode::FNe64 => {
            emit_eq_const(buf, ctx, code, 0)?;
            encode::movi(buf, SCRATCH_1, 1)?;
            encode::xor_(buf, SCRATCH_0, SCRATCH_0, SCRATCH_1);
        }
        Opcode::LtS64 | Opcode::LtU64 | Opcode::FLt32 | Opcode::FLt64 => emit_eq_const(buf, ctx, code, -1)?,
        Opcode::GtS64 | Opcode::GtU64 | Opcode::FGt32 | Opcode::FGt64 => emit_eq_const(buf, ctx, code, 1)?,
        Opcode::LeS64 | Opcode::LeU64 | Opcode::FLe32 | Opcode::FLe64 => {
            emit_eq_const(buf, ctx, code, -1)?;
            encode::mov_n(buf, OUTGOING_ARG0, SCRATCH_0);
            emit_eq_const(buf, ctx, code, 0)?;
            encode::or_(buf, SCRATCH_0, SCRATCH_0, OUTGOING_ARG0);
        }
        Opcode::GeS64 | Opcode::GeU64 | Opcode::FGe32 | Opcode::FGe64 => {
            emit_eq_const(buf, ctx, code, 1)?;
            encode::mov_n(buf, OUTGOING_ARG0, SCRATCH_0);
            emit_eq_const(buf, ctx, code, 0)?;
            encode::or_(buf, SCRATCH_0, SCRATCH_0, OUTGOING_ARG0);
        }
        _ => unreachable!("emit_ordering_to_bool only called for wide comparison opcodes"),
    }
    Ok(())
}

/// Set `SCRATCH_0` to 1 iff `code == v`, via the same branch-around-set shape
/// [`emit_compare32`] uses for its 32-bit equality case.
fn emit_eq_const(buf: &mut CodeBuffer, ctx: &mut Ctx, code: u8, v: i32) -> CompileResult<()> {
    ctx.load_const32(buf, SCRATCH_1, v)?;
    emit_branch_around_set(buf, |b, r1, r2, disp| encode::bne(b, r1, r2, disp), code, SCRATCH_1)
}

fn emit_extend(buf: &mut CodeBuffer, dst: u8, src: u8, shift: u32, signed: bool) -> CompileResult<()> {
    abi::load_vreg32(buf, SCRATCH_0, src)?;
    encode::slli(buf, SCRATCH_0, SCRATCH_0, shift)?;
    if signed {
        encode::srai(buf, SCRATCH_0, SCRATCH_0, shift)?;
    } else {
        encode::srli(buf, SCRATCH_0, SCRATCH_0, shift)?;
    }
    abi::store_vreg32(buf, dst, SCRATCH_0, SCRATCH_1)
}

/// Fold a (possibly negative, possibly out-of-range) load/store byte offset
/// into `base` by computing `base += offset` in place. Every load/store site
/// below always passes a literal `0` offset to the actual `lNN`/`sNN`
/// encoder and relies on this instead of special-casing offsets small enough
/// for the scaled-immediate forms -- a few extra instructions per access,
/// traded for not needing a second offset-range policy alongside
/// `abi`'s own frame-slot one.
fn emit_widened_offset(buf: &mut CodeBuffer, ctx: &mut Ctx, base: u8, offset: i32, scratch: u8) -> CompileResult<()> {
    if offset == 0 {
        return Ok(());
    }
    ctx.load_const32(buf, scratch, offset)?;
    encode::add(buf, base, base, scratch);
    Ok(())
}

fn emit_branch_fixup(buf: &mut CodeBuffer, labels: &mut LabelTable, target: u32, unconditional: bool, cond_reg: u8) -> CompileResult<()> {
    let native_offset = buf.offset();
    buf.put3(0);
    labels.add_fixup(
        native_offset,
        target,
        if unconditional { "j" } else { "bnez" },
        Box::new(move |buf, disp| {
            if unconditional {
                let disp = disp as i32;
                if !(-(1 << 17)..(1 << 17)).contains(&disp) {
                    return Err(CompileError::EncodingError {
                        mnemonic: "j",
                        native_offset,
                        displacement: disp as i64,
                    });
                }
                let bits = encode_j_bits(disp);
                store_word24(buf, native_offset, bits)
            } else {
                if !(-2048..2048).contains(&disp) {
                    return Err(CompileError::EncodingError {
                        mnemonic: "bnez",
                        native_offset,
                        displacement: disp,
                    });
                }
                let bits = encode_bnez_bits(cond_reg, disp as i32);
                store_word24(buf, native_offset, bits)
            }
        }),
    );
    Ok(())
}

fn store_word24(buf: &mut CodeBuffer, at: u32, word: u32) -> CompileResult<()> {
    buf.store_u8(at, (word & 0xff) as u8)?;
    buf.store_u16(at + 1, ((word >> 8) & 0xffff) as u16)
}

fn emit_epilogue_jump(buf: &mut CodeBuffer, labels: &mut LabelTable) -> CompileResult<()> {
    emit_branch_fixup(buf, labels, u32::MAX, true, 0)
}

fn emit_atomic(buf: &mut CodeBuffer, ctx: &mut Ctx, helpers: &HelperTable, opcode: Opcode, cur: &mut BytecodeCursor) -> CompileResult<()> {
    // No native atomics on this target: every atomic opcode routes through
    // the matching 32- or 64-bit helper, unlike RISC-V's inline
    // `lr.w`/`amoswap.w` fast paths.
    match opcode {
        Opcode::AtomicLoad32 => {
            let (dst, addr) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            encode::l32i(buf, SCRATCH_1, SCRATCH_0, 0)?;
            abi::store_vreg32(buf, dst, SCRATCH_1, SCRATCH_2)
        }
        Opcode::AtomicStore32 => {
            let (addr, src) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            abi::load_vreg32(buf, SCRATCH_1, src)?;
            encode::s32i(buf, SCRATCH_0, SCRATCH_1, 0)
        }
        Opcode::AtomicXchg32 => {
            let (dst, addr, val) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, OUTGOING_ARG0, addr)?;
            abi::load_vreg32(buf, OUTGOING_ARG0 + 1, val)?;
            ctx.helper_call(buf, helpers.atomic_exchange_32 as usize)?;
            abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)
        }
        Opcode::AtomicCmpxchg32 => {
            let (dst, addr, expected, desired) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, OUTGOING_ARG0, addr)?;
            abi::load_vreg32(buf, OUTGOING_ARG0 + 1, expected)?;
            abi::load_vreg32(buf, OUTGOING_ARG0 + 2, desired)?;
            ctx.helper_call(buf, helpers.atomic_compare_exchange_32 as usize)?;
            abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)
        }
        Opcode::AtomicRmw32 => {
            let (dst, addr, val, op) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, OUTGOING_ARG0, addr)?;
            abi::load_vreg32(buf, OUTGOING_ARG0 + 1, val)?;
            let helper_addr = match op {
                0 => helpers.atomic_fetch_add_32 as usize,
                1 => helpers.atomic_fetch_sub_32 as usize,
                2 => helpers.atomic_fetch_and_32 as usize,
                3 => helpers.atomic_fetch_or_32 as usize,
                _ => helpers.atomic_fetch_xor_32 as usize,
            };
            ctx.helper_call(buf, helper_addr)?;
            abi::store_vreg32(buf, dst, OUTGOING_ARG0, SCRATCH_1)
        }
        Opcode::AtomicLoad64 => {
            let (dst, addr) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            encode::l32i(buf, SCRATCH_1, SCRATCH_0, 0)?;
            encode::l32i(buf, SCRATCH_2, SCRATCH_0, 4)?;
            abi::store_vreg64(buf, dst, SCRATCH_1, SCRATCH_2)
        }
        Opcode::AtomicStore64 => {
            let (addr, src) = (cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, SCRATCH_0, addr)?;
            abi::load_vreg64(buf, SCRATCH_1, SCRATCH_2, src)?;
            encode::s32i(buf, SCRATCH_0, SCRATCH_1, 0)?;
            encode::addi(buf, SCRATCH_1, SCRATCH_0, 4)?;
            encode::s32i(buf, SCRATCH_1, SCRATCH_2, 0)
        }
        Opcode::AtomicXchg64 => {
            let (dst, addr, val) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, OUTGOING_ARG0, addr)?;
            abi::load_vreg64(buf, OUTGOING_ARG0 + 1, OUTGOING_ARG0 + 2, val)?;
            ctx.helper_call(buf, helpers.atomic_exchange_64 as usize)?;
            abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)
        }
        Opcode::AtomicCmpxchg64 => {
            let (dst, addr, expected, desired) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, OUTGOING_ARG0, addr)?;
            abi::load_vreg64(buf, OUTGOING_ARG0 + 1, OUTGOING_ARG0 + 2, expected)?;
            abi::load_vreg64(buf, OUTGOING_ARG0 + 3, OUTGOING_ARG0 + 4, desired)?;
            ctx.helper_call(buf, helpers.atomic_compare_exchange_64 as usize)?;
            abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)
        }
        Opcode::AtomicRmw64 => {
            let (dst, addr, val, op) = (cur.read_u8()?, cur.read_u8()?, cur.read_u8()?, cur.read_u8()?);
            abi::load_vreg32(buf, OUTGOING_ARG0, addr)?;
            abi::load_vreg64(buf, OUTGOING_ARG0 + 1, OUTGOING_ARG0 + 2, val)?;
            let helper_addr = match op {
                0 => helpers.atomic_fetch_add_64 as usize,
                1 => helpers.atomic_fetch_sub_64 as usize,
                2 => helpers.atomic_fetch_and_64 as usize,
                3 => helpers.atomic_fetch_or_64 as usize,
                _ => helpers.atomic_fetch_xor_64 as usize,
            };
            ctx.helper_call(buf, helper_addr)?;
            abi::store_vreg64(buf, dst, OUTGOING_ARG0, OUTGOING_ARG0 + 1)
        }
        _ => unreachable!(),
    }
}

fn encode_beq_bits(rs1: u8, rs2: u8, imm8: i32) -> u32 {
    // Mirrors `encode::emit_compare_branch`'s own RRI8 packing: op0=0x7,
    // t=rs2, s=rs1, r=op1 (0x1 selects `beq`), imm8 in the top byte.
    0x7u32 | ((rs2 as u32 & 0xf) << 4) | ((rs1 as u32 & 0xf) << 8) | (0x1u32 << 12) | ((imm8 as u32 & 0xff) << 16)
}

fn encode_j_bits(imm18: i32) -> u32 {
    let imm18 = (imm18 as u32) & 0x3_ffff;
    0x6u32 | (imm18 << 6)
}

fn encode_bnez_bits(rs: u8, imm12: i32) -> u32 {
    0x6u32 | ((rs as u32 & 0xf) << 4) | (0x9 << 8) | (((imm12 as u32) & 0xfff) << 12)
}

/// A `HelperTable` of no-op stubs, for this module's own tests. Mirrors
/// [`crate::isa::riscv::dispatch::dummy_helpers`]'s shape field-for-field.
#[cfg(test)]
pub(crate) fn dummy_helpers() -> HelperTable {
    crate::isa::riscv::dispatch::dummy_helpers()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WordDiscipline;
    use crate::bytecode::{BodyFlags, BodyHeader};

    fn run_body(code: &[u8], mem: &mut [u8]) -> CompileResult<(LabelTable, u32)> {
        let header = BodyHeader {
            num_vregs: 16,
            flags: BodyFlags::empty(),
            max_vreg_used: 8,
        };
        let body = FunctionBody::new(header, code);
        let helpers = dummy_helpers();
        let config = CompilerConfig::xtensa_defaults();
        let mut buf = CodeBuffer::new(mem, WordDiscipline::WordAccumulated);
        let mut labels = LabelTable::new();
        run(&mut buf, &mut labels, &helpers, &config, &body)?;
        Ok((labels, buf.offset()))
    }

    #[test]
    fn const_and_add_emits_without_error() {
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
    fn wide_constant_routes_through_the_literal_pool() {
        let mut code = Vec::new();
        code.push(Opcode::ConstI32 as u8);
        code.push(1);
        code.extend_from_slice(&0x1234_5678i32.to_le_bytes());
        code.push(Opcode::End as u8);

        let mut mem = [0u8; 512];
        let (_labels, offset) = run_body(&code, &mut mem).unwrap();
        assert!(offset > 0);
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
    fn helper_call_opcode_emits_without_error() {
        let mut code = Vec::new();
        code.push(Opcode::Call as u8);
        code.extend_from_slice(&7u32.to_le_bytes());
        code.push(Opcode::End as u8);

        let mut mem = [0u8; 512];
        let (_labels, offset) = run_body(&code, &mut mem).unwrap();
        assert!(offset > 0);
    }
}
