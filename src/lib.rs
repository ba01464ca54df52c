//! Single-pass native code generator for the ESPB bytecode VM.
//!
//! Takes one function body at a time and emits it directly into executable
//! memory -- no intermediate IR, no optimizing passes, one linear walk over
//! the opcode stream per function. [`isa::riscv`] targets RV32IMAC(+C);
//! [`isa::xtensa`] targets the windowed-register Xtensa LX core ESP32-class
//! chips use. The two backends share only the bytecode contract
//! ([`bytecode`], [`frame`], [`helpers`]) and the allocator/label/error
//! plumbing below; neither reaches into the other's instruction encoders.
//!
//! Grounded throughout on `cranelift-codegen`/`cranelift-jit`'s shape: a
//! `CodeSink`-like buffer, per-ISA instruction encoders lifted from their bit
//! layout, and a `JITModule`-style allocate/emit/patch/sync pipeline --
//! scaled down to a template-free single-pass compiler with no register
//! allocator, since the bytecode's own virtual-register frame is the only
//! storage either backend ever addresses.

pub mod alloc;
pub mod buffer;
pub mod bytecode;
pub mod config;
pub mod error;
pub mod frame;
pub mod helpers;
pub mod isa;
pub mod label;
pub mod literal_pool;
pub mod regcache;

pub use alloc::{ExecutableAllocator, MmapAllocator};
pub use bytecode::FunctionBody;
pub use config::CompilerConfig;
pub use error::{CompileError, CompileResult};
pub use helpers::HelperTable;
pub use isa::{CompiledFunction, Target};

/// Compile one bytecode function body into native code for `target`.
///
/// This is the crate's single entry point: given an executable allocator,
/// a resolved helper table, and a compiler configuration, it walks `body`'s
/// opcode stream once and returns a [`CompiledFunction`] ready to call
/// through the ABI documented on [`isa::riscv::abi`] / [`isa::xtensa::abi`].
///
/// The returned function's code lives in memory owned by `alloc`; freeing it
/// is the caller's responsibility once it reconstructs the allocation (this
/// crate does not track live compiled functions for the caller).
pub fn compile(
    target: Target,
    alloc: &dyn ExecutableAllocator,
    helpers: &HelperTable,
    config: &CompilerConfig,
    body: &FunctionBody,
) -> CompileResult<CompiledFunction> {
    isa::compile(target, alloc, helpers, config, body)
}
