//! Xtensa LX windowed-ABI backend: ties the allocator, dispatcher, and label
//! table into the single `compile` entry point [`crate::isa::mod@compile`]
//! dispatches to.
//!
//! Mirrors [`crate::isa::riscv`]'s `compile` shape almost exactly; the two
//! differences this backend's ABI forces are a word-accumulated code buffer
//! (Xtensa's IRAM only takes whole-word stores) and `isync` in place of
//! RISC-V's `fence.i` for post-emission instruction-cache coherence.

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
/// can never collide with an actual label. Same sentinel RISC-V's backend
/// uses, kept in sync by convention rather than a shared constant since the
/// two backends never share a module.
const EPILOGUE_LABEL: u32 = u32::MAX;

/// Rough upper bound on native bytes per bytecode byte. Xtensa's helper-call
/// bridge runs a few instructions longer than RISC-V's (no compressed
/// encoding to offset the windowed-call overhead), so this carries a wider
/// margin than RISC-V's own estimate.
const BYTES_PER_BYTECODE_BYTE: usize = 10;
/// Prologue, epilogue, the trailing `isync`, and the final literal-pool
/// flush, rounded well past their actual fixed cost.
const FIXED_OVERHEAD_BYTES: usize = 96;

fn estimate_code_size(body: &FunctionBody) -> usize {
    FIXED_OVERHEAD_BYTES + body.code.len() * BYTES_PER_BYTECODE_BYTE
}

/// Compile one function body to native Xtensa LX code.
///
/// Single pass: prologue, the dispatcher's opcode walk (which owns the
/// function's literal pool internally and flushes it as needed), the
/// epilogue, then fixup resolution against the now-complete label table.
/// Over-allocated per [`estimate_code_size`] and, per `config.shrink_to_fit`,
/// handed back to the allocator to trim -- though [`config::xtensa_defaults`]
/// turns that off by default, since a post-emission `realloc` that moved the
/// allocation would invalidate every `l32r` displacement already patched
/// against this buffer's base address.
pub fn compile(alloc: &dyn ExecutableAllocator, helpers: &HelperTable, config: &CompilerConfig, body: &FunctionBody) -> CompileResult<CompiledFunction> {
    let mut exec = alloc.alloc(estimate_code_size(body))?;
    // SAFETY: `exec` was just allocated by `alloc` and is writable until the
    // buffer below is dropped; nothing else holds a reference to it.
    let slice = unsafe { exec.as_slice_mut() };
    let mut buf = CodeBuffer::new(slice, WordDiscipline::WordAccumulated);
    let mut labels = LabelTable::new();

    abi::emit_prologue(&mut buf)?;
    dispatch::run(&mut buf, &mut labels, helpers, config, body)?;
    labels.record(EPILOGUE_LABEL, buf.offset());
    abi::emit_epilogue(&mut buf)?;
    buf.flush();
    encode::isync(&mut buf);

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
