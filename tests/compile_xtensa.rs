//! End-to-end tests against the Xtensa LX backend's public `compile` entry
//! point. Same structural focus as `compile_riscv.rs`: branch resolution,
//! literal-pool routing for wide constants, and malformed-body rejection,
//! not exact instruction bytes (covered by `src/isa/xtensa/encode.rs`'s own
//! unit tests).

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
    code.push(0);
    let displacement = loop_start as i64 - br_if_bc_offset as i64;
    code.extend_from_slice(&(displacement as i32).to_le_bytes());
    code.push(Opcode::End as u8);

    let body = FunctionBody::new(header(4, 3), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::xtensa_defaults();

    let compiled = compile(Target::Xtensa, &alloc, &helpers, &config, &body).unwrap();
    assert!(compiled.code_size > 0);
    assert!(!compiled.code_ptr.is_null());
}

#[test]
fn wide_constant_routes_through_the_literal_pool_and_still_compiles() {
    // A value outside movi's +/-2048 range forces the literal pool path
    // through ConstI32's emission.
    let mut code = Vec::new();
    code.push(Opcode::ConstI32 as u8);
    code.push(0);
    code.extend_from_slice(&0x1234_5678i32.to_le_bytes());
    code.push(Opcode::End as u8);

    let body = FunctionBody::new(header(2, 0), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::xtensa_defaults();

    let compiled = compile(Target::Xtensa, &alloc, &helpers, &config, &body).unwrap();
    assert!(compiled.code_size > 0);
}

#[test]
fn branch_table_with_four_targets_and_a_default_compiles_cleanly() {
    let mut code = Vec::new();
    code.push(Opcode::ConstI32 as u8);
    code.push(0);
    code.extend_from_slice(&2i32.to_le_bytes());

    let br_table_bc_offset = code.len() as u32;
    code.push(Opcode::BrTable as u8);
    code.push(0);
    code.extend_from_slice(&4u16.to_le_bytes());

    let targets_start = code.len();
    for _ in 0..4 {
        code.extend_from_slice(&0i32.to_le_bytes());
    }
    code.extend_from_slice(&0i32.to_le_bytes());

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
    let config = CompilerConfig::xtensa_defaults();

    let compiled = compile(Target::Xtensa, &alloc, &helpers, &config, &body);
    assert!(compiled.is_ok());
}

#[test]
fn direct_call_through_the_helper_bridge_compiles_and_frame_base_survives() {
    let mut code = Vec::new();
    code.push(Opcode::Call as u8);
    code.extend_from_slice(&7u32.to_le_bytes());

    code.push(Opcode::ConstI32 as u8);
    code.push(1);
    code.extend_from_slice(&99i32.to_le_bytes());
    code.push(Opcode::End as u8);

    let body = FunctionBody::new(header(2, 1), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::xtensa_defaults();

    let compiled = compile(Target::Xtensa, &alloc, &helpers, &config, &body).unwrap();
    assert!(compiled.code_size > 0);
}

#[test]
fn truncated_body_reports_a_bytecode_fault_not_a_panic() {
    let code = vec![Opcode::ConstI32 as u8];
    let body = FunctionBody::new(header(1, 0), &code);
    let alloc = MmapAllocator::new();
    let helpers = support::noop_helpers();
    let config = CompilerConfig::xtensa_defaults();

    let err = compile(Target::Xtensa, &alloc, &helpers, &config, &body).unwrap_err();
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
    let config = CompilerConfig::xtensa_defaults();

    let alloc_a = MmapAllocator::new();
    let a = compile(Target::Xtensa, &alloc_a, &helpers, &config, &body).unwrap();
    let alloc_b = MmapAllocator::new();
    let b = compile(Target::Xtensa, &alloc_b, &helpers, &config, &body).unwrap();

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
