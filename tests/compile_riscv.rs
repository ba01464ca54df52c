//! End-to-end tests against the RISC-V backend's public `compile` entry
//! point. These exercise structural properties -- code gets emitted, forward
//! and backward branches resolve, malformed bodies are rejected -- rather
//! than exact instruction bytes, which are already covered by each encoder's
//! own unit tests inside `src/isa/riscv/encode.rs`.

mod support;

use espb_native_codegen::bytecode::{BodyFlags, BodyHeader, FunctionBody, Opcode};
use espb_native_codegen::{compile, CompilerConfig, MmapAllocator, Target};

fn header(num_vregs: u16, max_vreg_used: u8) -> BodyHeader {
    BodyHeader {
        num_vregs,
        flags: BodyFlags::empty(),
        max_vreg_used,
    }
}

#[test]
fn loop_with_a_conditional_back_edge_compiles_and_resolves_the_branch() {
    // vreg0 = counter, vreg3 = decrement amount. Loop body decrements vreg0
    // and branches back to loop_start while nonzero -- the control-flow
    // shape an iterative fibonacci-style loop needs (a backward branch whose
    // target label was already recorded by the time the fixup resolves).
    let mut code = Vec::new();
    code.push(Opcode::ConstI32 as u8);
    code.push(0);
    code.extend_from_slice(&20i32.to_le_bytes());

    let loop_start = code.len() as u32;
    code.push(Opcode::ConstI32 as u8);
    code.push(3);
    code.extend_from_slice(&1i32.to_le_bytes());
    code.push(Opcode::Sub32 as u8);
    code.push(0);
    code.push(0);
    code.push(3);

    let br_if_bc_offset = code.len() as u32;
    code.push(Opcode::BrIf as u8);
    code.push(0); // condition vreg
    let displacement = loop_start as i64 - br_if_bc_offset as i64;
    code.extend_from_slice(&(displacement as i32).to_le_bytes());
    code.push(Opcode::End as u8);

    let body = FunctionBody::new(header(4, 3), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::riscv_defaults();

    let compiled = compile(Target::RiscV, &alloc, &helpers, &config, &body).unwrap();
    assert!(compiled.code_size > 0);
    assert!(!compiled.code_ptr.is_null());
}

#[test]
fn branch_table_with_four_targets_and_a_default_compiles_cleanly() {
    // A br_table selecting on vreg[0] with four explicit forward targets
    // plus a default, mirroring the branch-table shape a jump-dispatch
    // opcode needs.
    let mut code = Vec::new();
    code.push(Opcode::ConstI32 as u8);
    code.push(0);
    code.extend_from_slice(&2i32.to_le_bytes());

    let br_table_bc_offset = code.len() as u32;
    code.push(Opcode::BrTable as u8);
    code.push(0); // selector vreg
    code.extend_from_slice(&4u16.to_le_bytes()); // target count

    // Every target and the default point at the same later `End` opcode;
    // reserve the displacement slots now and fill them in once its
    // bytecode offset is known.
    let targets_start = code.len();
    for _ in 0..4 {
        code.extend_from_slice(&0i32.to_le_bytes());
    }
    code.extend_from_slice(&0i32.to_le_bytes()); // default

    let end_bc_offset = code.len() as u32;
    code.push(Opcode::End as u8);

    let disp = end_bc_offset as i64 - br_table_bc_offset as i64;
    for i in 0..5usize {
        let at = targets_start + i * 4;
        code[at..at + 4].copy_from_slice(&(disp as i32).to_le_bytes());
    }

    let body = FunctionBody::new(header(2, 0), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::riscv_defaults();

    let compiled = compile(Target::RiscV, &alloc, &helpers, &config, &body);
    assert!(compiled.is_ok());
}

#[test]
fn direct_call_leaves_the_frame_base_register_usable_afterward() {
    // A direct call by function index, followed by a frame access, checks
    // that the helper-call bridge does not clobber FRAME_BASE across the
    // call -- the caller's own vreg reads after the call must still work.
    let mut code = Vec::new();
    code.push(Opcode::Call as u8);
    code.extend_from_slice(&7u32.to_le_bytes()); // function index

    code.push(Opcode::ConstI32 as u8);
    code.push(1);
    code.extend_from_slice(&99i32.to_le_bytes());
    code.push(Opcode::End as u8);

    let body = FunctionBody::new(header(2, 1), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::riscv_defaults();

    let compiled = compile(Target::RiscV, &alloc, &helpers, &config, &body).unwrap();
    assert!(compiled.code_size > 0);
}

#[test]
fn truncated_body_reports_a_bytecode_fault_not_a_panic() {
    // ConstI32 needs a vreg byte plus 4 immediate bytes; supply neither.
    let code = vec![Opcode::ConstI32 as u8];
    let body = FunctionBody::new(header(1, 0), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::riscv_defaults();

    let err = compile(Target::RiscV, &alloc, &helpers, &config, &body).unwrap_err();
    assert!(err.is_bytecode_fault());
}

#[test]
fn compiling_the_same_body_twice_is_idempotent() {
    let mut code = Vec::new();
    code.push(Opcode::ConstI32 as u8);
    code.push(0);
    code.extend_from_slice(&7i32.to_le_bytes());
    code.push(Opcode::End as u8);

    let body = FunctionBody::new(header(2, 0), &code);
    let helpers = support::noop_helpers();
    let config = CompilerConfig::riscv_defaults();

    let alloc_a = MmapAllocator::new();
    let a = compile(Target::RiscV, &alloc_a, &helpers, &config, &body).unwrap();
    let alloc_b = MmapAllocator::new();
    let b = compile(Target::RiscV, &alloc_b, &helpers, &config, &body).unwrap();

    assert_eq!(a.code_size, b.code_size);
    // SAFETY: both buffers were just written by `compile` and are at least
    // `code_size` bytes long; neither is read past that length.
    let (sa, sb) = unsafe {
        (
            std::slice::from_raw_parts(a.code_ptr, a.code_size),
            std::slice::from_raw_parts(b.code_ptr, b.code_size),
        )
    };
    assert_eq!(sa, sb);
}
