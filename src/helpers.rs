//! The helper call bridge's contract: a table of raw function pointers to
//! runtime-provided C helpers, resolved once per instance and handed to the
//! dispatcher by reference.
//!
//! Modeled on the narrow, `extern "C"`-typed collaborator tables
//! `cranelift-jit`'s `JITModule` builds for its own runtime symbols (malloc,
//! memset, and the like) rather than a trait object: every signature here is
//! contract-fixed by the VM's ABI, so there is no polymorphism to express and
//! a raw pointer table is both the simplest and the fastest thing to call
//! from emitted code.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Opaque instance handle, passed through to every helper untouched by this
/// crate. The compiler never dereferences it.
pub type InstancePtr = *mut std::ffi::c_void;

/// Opaque virtual-register-frame base pointer.
pub type FramePtr = *mut u64;

/// Raw function-pointer signatures for every contract-fixed helper the
/// compiled code may call. Field names match the helper names.
///
/// All fields are plain function pointers rather than `Option<fn(...)>`:
/// a `HelperTable` with an unresolved helper is not a valid table to compile
/// against, so resolution failure must be handled by the caller before
/// constructing one (see [`HelperTable::new`]).
#[derive(Debug, Copy, Clone)]
pub struct HelperTable {
    pub call_espb_function: unsafe extern "C" fn(InstancePtr, u32, FramePtr),
    pub call_indirect: unsafe extern "C" fn(InstancePtr, u32, u32, FramePtr, u16, u8),
    pub call_indirect_ptr: unsafe extern "C" fn(InstancePtr, *const std::ffi::c_void, u32, FramePtr, u16, u8),
    pub call_import: unsafe extern "C" fn(InstancePtr, u32, FramePtr, u16, bool, u32, *const u8),
    pub ld_global_addr: unsafe extern "C" fn(InstancePtr, u32, FramePtr, u16, u8),
    pub ld_global: unsafe extern "C" fn(InstancePtr, u32, FramePtr, u16, u8),
    pub st_global: unsafe extern "C" fn(InstancePtr, u32, FramePtr, u16, u8),
    pub runtime_alloca: unsafe extern "C" fn(InstancePtr, *mut std::ffi::c_void, FramePtr, u16, u8, u8, u32),

    pub heap_malloc: unsafe extern "C" fn(InstancePtr, u32) -> *mut std::ffi::c_void,
    pub heap_realloc: unsafe extern "C" fn(InstancePtr, *mut std::ffi::c_void, u32) -> *mut std::ffi::c_void,
    pub heap_free: unsafe extern "C" fn(InstancePtr, *mut std::ffi::c_void),

    pub mul_i64: unsafe extern "C" fn(i64, i64) -> i64,
    pub mul_u64: unsafe extern "C" fn(u64, u64) -> u64,
    pub div_i64: unsafe extern "C" fn(i64, i64) -> i64,
    pub div_u64: unsafe extern "C" fn(u64, u64) -> u64,
    pub rem_i64: unsafe extern "C" fn(i64, i64) -> i64,
    pub rem_u64: unsafe extern "C" fn(u64, u64) -> u64,
    pub shl_i64: unsafe extern "C" fn(u64, u32) -> u64,
    pub shr_i64: unsafe extern "C" fn(i64, u32) -> i64,
    pub shr_u64: unsafe extern "C" fn(u64, u32) -> u64,

    pub f32_to_i32: unsafe extern "C" fn(u32) -> u32,
    pub f32_to_u32: unsafe extern "C" fn(u32) -> u32,
    pub f64_to_i64: unsafe extern "C" fn(u64) -> u64,
    pub f64_to_u64: unsafe extern "C" fn(u64) -> u64,
    pub i32_to_f32: unsafe extern "C" fn(i32) -> u32,
    pub u32_to_f32: unsafe extern "C" fn(u32) -> u32,
    pub i64_to_f64: unsafe extern "C" fn(i64) -> u64,
    pub u64_to_f64: unsafe extern "C" fn(u64) -> u64,
    /// `f32.promote` / `f64.demote`: argument and return value are each
    /// carried as the bit pattern of the narrower or wider float, not
    /// reinterpreted through an integer conversion helper.
    pub f32_to_f64: unsafe extern "C" fn(u32) -> u64,
    pub f64_to_f32: unsafe extern "C" fn(u64) -> u32,

    /// IEEE-754 `f32` arithmetic, bit patterns in and out. Operands and
    /// result all pass as `u32` for the same reason `f32_to_f64` does: a
    /// plain `f32` argument would round-trip through the hardware FPU ABI,
    /// which RV32IMAC and Xtensa LX's base ISAs don't have.
    pub f32_add: unsafe extern "C" fn(u32, u32) -> u32,
    pub f32_sub: unsafe extern "C" fn(u32, u32) -> u32,
    pub f32_mul: unsafe extern "C" fn(u32, u32) -> u32,
    pub f32_div: unsafe extern "C" fn(u32, u32) -> u32,
    pub f32_min: unsafe extern "C" fn(u32, u32) -> u32,
    pub f32_max: unsafe extern "C" fn(u32, u32) -> u32,
    pub f32_sqrt: unsafe extern "C" fn(u32) -> u32,

    /// IEEE-754 `f64` arithmetic, bit patterns in and out.
    pub f64_add: unsafe extern "C" fn(u64, u64) -> u64,
    pub f64_sub: unsafe extern "C" fn(u64, u64) -> u64,
    pub f64_mul: unsafe extern "C" fn(u64, u64) -> u64,
    pub f64_div: unsafe extern "C" fn(u64, u64) -> u64,
    pub f64_min: unsafe extern "C" fn(u64, u64) -> u64,
    pub f64_max: unsafe extern "C" fn(u64, u64) -> u64,
    pub f64_sqrt: unsafe extern "C" fn(u64) -> u64,

    /// Three-way ordering for the widths the register encoders can't
    /// express a single-instruction compare for: 64-bit integers (no
    /// multi-word `slt` on either ISA) and both float widths (no native FPU
    /// comparison on either base ISA). Returns -1/0/1 the way `i64::cmp`
    /// would for the integer pair; the float variants additionally return
    /// `2` for an IEEE-754 unordered result (either operand NaN), which the
    /// dispatcher's post-call derivation treats as failing every relational
    /// comparison except `Ne`.
    pub cmp_i64: unsafe extern "C" fn(i64, i64) -> i32,
    pub cmp_u64: unsafe extern "C" fn(u64, u64) -> i32,
    pub cmp_f32: unsafe extern "C" fn(u32, u32) -> i32,
    pub cmp_f64: unsafe extern "C" fn(u64, u64) -> i32,

    pub atomic_fetch_add_32: unsafe extern "C" fn(*mut u32, u32) -> u32,
    pub atomic_fetch_sub_32: unsafe extern "C" fn(*mut u32, u32) -> u32,
    pub atomic_fetch_and_32: unsafe extern "C" fn(*mut u32, u32) -> u32,
    pub atomic_fetch_or_32: unsafe extern "C" fn(*mut u32, u32) -> u32,
    pub atomic_fetch_xor_32: unsafe extern "C" fn(*mut u32, u32) -> u32,
    pub atomic_exchange_32: unsafe extern "C" fn(*mut u32, u32) -> u32,
    pub atomic_compare_exchange_32: unsafe extern "C" fn(*mut u32, u32, u32) -> u32,

    pub atomic_fetch_add_64: unsafe extern "C" fn(*mut u64, u64) -> u64,
    pub atomic_fetch_sub_64: unsafe extern "C" fn(*mut u64, u64) -> u64,
    pub atomic_fetch_and_64: unsafe extern "C" fn(*mut u64, u64) -> u64,
    pub atomic_fetch_or_64: unsafe extern "C" fn(*mut u64, u64) -> u64,
    pub atomic_fetch_xor_64: unsafe extern "C" fn(*mut u64, u64) -> u64,
    pub atomic_exchange_64: unsafe extern "C" fn(*mut u64, u64) -> u64,
    pub atomic_compare_exchange_64: unsafe extern "C" fn(*mut u64, u64, u64) -> u64,

    /// Single dispatch point for the extended-prefix memory/table operation
    /// group (`memory.init`, `table.grow`, and the rest of §4.7's extended
    /// opcodes). The contract table gives each of the other groups its own
    /// fixed signature but leaves this group as "each is a helper call"
    /// without enumerating fourteen near-identical signatures; one
    /// `(instance, subopcode, args, nargs)` entry point, mirroring how a real
    /// runtime's extended-opcode table is usually one function keyed by a
    /// subopcode byte rather than fourteen separate symbols.
    pub ext_table_memory_op: unsafe extern "C" fn(InstancePtr, u8, *const u64, u8) -> u64,
}

impl HelperTable {
    /// Build a table from already-resolved function pointers. Resolution
    /// (symbol lookup against the host's helper library) is the caller's
    /// job, once per instance; this type only asserts the signatures are
    /// right, it doesn't do the looking-up itself, since that mechanism is
    /// entirely host-specific (static linking, dynamic symbol table, or a
    /// board's fixed ROM vector table) and outside this crate's scope. It
    /// takes an already-built `HelperTable` rather than one field at a time
    /// because every field is mandatory: a table with any unresolved helper
    /// is not a valid table to compile against.
    ///
    /// # Safety
    /// Every function pointer must genuinely match the signature declared
    /// here and remain valid for the lifetime of every compiled function
    /// that may call it.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new_unchecked(table: HelperTable) -> Self {
        table
    }
}

/// Pure-Rust reference implementations of the atomic helper contracts,
/// usable both as a real `no_std`-incompatible fallback on hosts without
/// native atomic instructions, and directly in tests to exercise the
/// sequential-consistency contract without going through emitted code.
pub mod atomics {
    use super::*;

    /// # Safety
    /// `ptr` must be valid for reads and writes of a `u32` for the duration
    /// of the call and properly aligned; callers route this only through
    /// values already known to be frame-owned or heap-owned words.
    pub unsafe extern "C" fn fetch_add_32(ptr: *mut u32, val: u32) -> u32 {
        (*(ptr as *mut AtomicU32)).fetch_add(val, Ordering::SeqCst)
    }

    /// # Safety
    /// See [`fetch_add_32`].
    pub unsafe extern "C" fn compare_exchange_32(ptr: *mut u32, expected: u32, desired: u32) -> u32 {
        match (*(ptr as *mut AtomicU32)).compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of a `u64`, 8-byte aligned.
    pub unsafe extern "C" fn fetch_add_64(ptr: *mut u64, val: u64) -> u64 {
        (*(ptr as *mut AtomicU64)).fetch_add(val, Ordering::SeqCst)
    }

    /// # Safety
    /// See [`fetch_add_64`].
    pub unsafe extern "C" fn compare_exchange_64(ptr: *mut u64, expected: u64, desired: u64) -> u64 {
        match (*(ptr as *mut AtomicU64)).compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(old) => old,
            Err(old) => old,
        }
    }
}

/// Which ABI argument-register slots a given helper call's arguments land
/// in, expressed in terms of the *logical* ABI argument position (0-based)
/// rather than a physical register number -- each ISA's bridge maps this to
/// its own registers (RISC-V `a0..a7`, Xtensa windowed `a10..a15` plus an
/// outgoing stack slot for the seventh argument).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HelperCallShape {
    /// Number of logical arguments, including `instance` if the helper takes
    /// one.
    pub arg_count: u8,
    /// Whether the call returns a value in the conventional return register.
    pub returns_value: bool,
}

impl HelperCallShape {
    /// The maximum number of arguments passable entirely in registers before
    /// Xtensa's windowed ABI forces the seventh argument onto the outgoing
    /// stack slot at `a1+0`.
    pub const MAX_REG_ARGS: u8 = 6;

    /// Whether argument index `idx` (0-based) must go on the stack rather
    /// than in a register, under the windowed-ABI argument limit.
    pub fn arg_on_stack(&self, idx: u8) -> bool {
        idx >= Self::MAX_REG_ARGS
    }
}

/// Marshals a variadic import call's argument-type descriptor blob, as read
/// from the bytecode stream after the `0xAA` variadic marker: a count byte
/// followed by one type tag per argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariadicArgs {
    pub type_tags: Vec<u8>,
}

impl VariadicArgs {
    /// Parse `count` type tags from `bytes`, failing if the slice is short.
    pub fn parse(count: u8, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < count as usize {
            return None;
        }
        Some(Self {
            type_tags: bytes[..count as usize].to_vec(),
        })
    }

    /// Number of variadic arguments described.
    pub fn len(&self) -> usize {
        self.type_tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.type_tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn variadic_args_parses_type_tags() {
        let blob = [1u8, 2, 3, 0xff];
        let args = VariadicArgs::parse(3, &blob).unwrap();
        assert_eq!(args.type_tags, vec![1, 2, 3]);
    }

    #[test]
    fn variadic_args_rejects_short_blob() {
        assert!(VariadicArgs::parse(5, &[1, 2]).is_none());
    }

    #[test]
    fn helper_call_shape_spills_seventh_argument() {
        let shape = HelperCallShape {
            arg_count: 7,
            returns_value: false,
        };
        assert!(!shape.arg_on_stack(5));
        assert!(shape.arg_on_stack(6));
    }

    #[test]
    fn atomic_fetch_add_is_sequentially_consistent_under_contention() {
        let word = Arc::new(StdAtomicU32::new(0));
        let ptr = word.as_ptr();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ptr = ptr as usize;
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    unsafe { atomics::fetch_add_32(ptr as *mut u32, 1) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(word.load(Ordering::SeqCst), 4000);
    }

    #[test]
    fn atomic_compare_exchange_reports_prior_value() {
        let word = StdAtomicU32::new(5);
        let ptr = word.as_ptr();
        let old = unsafe { atomics::compare_exchange_32(ptr, 5, 7) };
        assert_eq!(old, 5);
        assert_eq!(word.load(Ordering::SeqCst), 7);
        let old2 = unsafe { atomics::compare_exchange_32(ptr, 5, 9) };
        assert_eq!(old2, 7, "CAS against a stale expected value fails and reports the current value");
    }
}
