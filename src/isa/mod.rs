//! The ISA module boundary: RISC-V and Xtensa are independent modules
//! sharing only the bytecode contract, never a shared instruction-level
//! trait. Polymorphism lives here, at the module boundary, and nowhere
//! deeper -- per the design note against inheritance or dynamic dispatch
//! inside either backend.

pub mod riscv;
pub mod xtensa;

use crate::alloc::ExecutableAllocator;
use crate::bytecode::FunctionBody;
use crate::config::CompilerConfig;
use crate::error::CompileResult;
use crate::helpers::HelperTable;

/// A compiled function: an executable code pointer and its size, owned by
/// the caller per the data model's lifecycle (the bytecode body itself
/// holds only a non-owning pointer and size once handed back).
#[derive(Debug, Copy, Clone)]
pub struct CompiledFunction {
    pub code_ptr: *const u8,
    pub code_size: usize,
}

/// Which of the two supported targets to compile for. Selecting the wrong
/// one for the host that will execute the result is the caller's mistake,
/// not something this crate can check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Target {
    #[cfg(feature = "riscv")]
    RiscV,
    #[cfg(feature = "xtensa")]
    Xtensa,
}

/// Entry point shared by both backends: compile one bytecode function body
/// into native code using the given allocator and helper table.
pub fn compile(
    target: Target,
    alloc: &dyn ExecutableAllocator,
    helpers: &HelperTable,
    config: &CompilerConfig,
    body: &FunctionBody,
) -> CompileResult<CompiledFunction> {
    match target {
        #[cfg(feature = "riscv")]
        Target::RiscV => riscv::compile(alloc, helpers, config, body),
        #[cfg(feature = "xtensa")]
        Target::Xtensa => xtensa::compile(alloc, helpers, config, body),
    }
}
