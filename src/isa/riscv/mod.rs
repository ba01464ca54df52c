//! RISC-V RV32IMAC(+C) backend: ties the allocator, dispatcher, and label
//! table into the single `compile` entry point [`crate::isa::mod@compile`]
//! dispatches to.
//!
//! Grounded on `cranelift-jit`'s `JITModule::finish_function`: allocate,
//! emit into the raw allocation directly (no intermediate buffer to copy
//! out of), patch, sync the instruction cache, optionally hand back unused
//! tail pages.

pub mod abi;
pub mod dispatch;
pub mod encode;

use crate::alloc::ExecutableAllocator;
use crate::buffer::{CodeBuffer, WordDiscipline};
use crate::bytecode::FunctionBody;
use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult};
use crate::helpers::HelperTable;
use crate::isa::CompiledFunction;
use crate::label::LabelTable;

/// Bytecode offset the dispatcher's `End` handling uses as the jump target
/// for every epilogue fixup -- one past any real offset in the stream, so it
/// can never collide with an actual label.
const EPILOGUE_LABEL: u32 = u32::MAX;

/// Rough upper bound on native bytes per bytecode byte, generous enough that
/// no opcode's worst-case lowering (a 64-bit helper-call bridge, or a
/// `br_table` arm) can overflow it. The allocator is sized to this estimate
/// and then shrunk back down to the bytes actually emitted.
const BYTES_PER_BYTECODE_BYTE: usize = 8;
/// Prologue, epilogue, and the trailing `fence.i`, rounded well past their
/// actual fixed cost.
const FIXED_OVERHEAD_BYTES: usize = 64;

fn estimate_code_size(body: &FunctionBody) -> usize {
    FIXED_OVERHEAD_BYTES + body.code.len() * BYTES_PER_BYTECODE_BYTE
}

/// Compile one function body to native RV32IMAC(+C) code.
///
/// Single pass: prologue, the dispatcher's opcode walk, the epilogue, then
/// fixup resolution against the now-complete label table. The code buffer is
/// over-allocated per [`estimate_code_size`] and, per `config.shrink_to_fit`,
/// handed back to the allocator to trim to the bytes actually emitted --
/// safe here because [`crate::alloc::MmapAllocator::realloc`] never moves the
/// base address, so none of the branches and calls already encoded need
/// re-patching.
pub fn compile(
    alloc: &dyn ExecutableAllocator,
    helpers: &HelperTable,
    config: &CompilerConfig,
    body: &FunctionBody,
) -> CompileResult<CompiledFunction> {
    let mut exec = alloc.alloc(estimate_code_size(body))?;
    // SAFETY: `exec` was just allocated by `alloc` and is writable until the
    // buffer below is dropped; nothing else holds a reference to it.
    let slice = unsafe { exec.as_slice_mut() };
    let mut buf = CodeBuffer::new(slice, WordDiscipline::ByteAddressable);
    let mut labels = LabelTable::new();

    abi::emit_prologue(&mut buf)?;
    dispatch::run(&mut buf, &mut labels, helpers, config, body)?;
    labels.record(EPILOGUE_LABEL, buf.offset());
    abi::emit_epilogue(&mut buf)?;
    encode::fence_i(&mut buf);

    // A fixup with no recorded label targets unreachable bytecode; patch it
    // to jump to itself (displacement 0) rather than leave a dangling
    // reference into whatever garbage follows the buffer.
    labels.resolve_all(&mut buf, |_native_offset| 0i64)?;

    if buf.has_error() {
        return Err(CompileError::InvalidState(format!(
            "code buffer overflowed its {}-byte estimate for a {}-byte bytecode body",
            estimate_code_size(body),
            body.code.len()
        )));
    }

    let final_len = buf.offset() as usize;
    alloc.sync(&exec, final_len);

    if config.shrink_to_fit {
        exec = alloc.realloc(exec, final_len);
    }

    Ok(CompiledFunction {
        code_ptr: exec.as_ptr(),
        code_size: final_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::MmapAllocator;
    use crate::bytecode::{BodyFlags, BodyHeader, Opcode};

    fn helpers_stub() -> HelperTable {
        dispatch::dummy_helpers()
    }

    #[test]
    fn compiles_empty_body_to_a_bare_prologue_epilogue() {
        let header = BodyHeader {
            num_vregs: 4,
            flags: BodyFlags::empty(),
            max_vreg_used: 0,
        };
        let code = [Opcode::End as u8];
        let body = FunctionBody::new(header, &code);
        let alloc = MmapAllocator::new();
        let helpers = helpers_stub();
        let config = CompilerConfig::riscv_defaults();
        let compiled = compile(&alloc, &helpers, &config, &body).unwrap();
        assert!(!compiled.code_ptr.is_null());
        assert!(compiled.code_size > 0);
    }

    #[test]
    fn compiles_a_const_and_return_body() {
        let header = BodyHeader {
            num_vregs: 4,
            flags: BodyFlags::empty(),
            max_vreg_used: 1,
        };
        let mut code = Vec::new();
        code.push(Opcode::ConstI32 as u8);
        code.push(0); // dst vreg
        code.extend_from_slice(&42i32.to_le_bytes());
        code.push(Opcode::End as u8);
        let body = FunctionBody::new(header, &code);
        let alloc = MmapAllocator::new();
        let helpers = helpers_stub();
        let config = CompilerConfig::riscv_defaults();
        let compiled = compile(&alloc, &helpers, &config, &body).unwrap();
        assert!(compiled.code_size >= 8, "at least the const load plus epilogue jump");
    }

    #[test]
    fn shrink_to_fit_truncates_the_allocation_to_emitted_bytes() {
        let header = BodyHeader {
            num_vregs: 4,
            flags: BodyFlags::empty(),
            max_vreg_used: 0,
        };
        let code = [Opcode::End as u8];
        let body = FunctionBody::new(header, &code);
        let alloc = MmapAllocator::new();
        let helpers = helpers_stub();
        let mut config = CompilerConfig::riscv_defaults();
        config.shrink_to_fit = true;
        let compiled = compile(&alloc, &helpers, &config, &body).unwrap();
        assert!(compiled.code_size < estimate_code_size(&body));
    }
}
