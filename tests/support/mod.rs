//! Shared test-only helper table: every entry is a trivial `extern "C"` stub,
//! since these integration tests check the compiler's emitted structure, not
//! the runtime behavior of the helpers it calls into.

use espb_native_codegen::helpers::{FramePtr, HelperTable, InstancePtr};
use std::ffi::c_void;

unsafe extern "C" fn call_espb_function(_i: InstancePtr, _idx: u32, _f: FramePtr) {}
unsafe extern "C" fn call_indirect(_i: InstancePtr, _sig: u32, _idx: u32, _f: FramePtr, _r: u16, _n: u8) {}
unsafe extern "C" fn call_indirect_ptr(_i: InstancePtr, _p: *const c_void, _idx: u32, _f: FramePtr, _r: u16, _n: u8) {}
unsafe extern "C" fn call_import(_i: InstancePtr, _idx: u32, _f: FramePtr, _r: u16, _var: bool, _n: u32, _blob: *const u8) {}
unsafe extern "C" fn ld_global_addr(_i: InstancePtr, _idx: u32, _f: FramePtr, _r: u16, _dst: u8) {}
unsafe extern "C" fn ld_global(_i: InstancePtr, _idx: u32, _f: FramePtr, _r: u16, _dst: u8) {}
unsafe extern "C" fn st_global(_i: InstancePtr, _idx: u32, _f: FramePtr, _r: u16, _src: u8) {}
unsafe extern "C" fn runtime_alloca(_i: InstancePtr, _ctx: *mut c_void, _f: FramePtr, _r: u16, _rd: u8, _rs_size: u8, _align: u32) {}

unsafe extern "C" fn heap_malloc(_i: InstancePtr, _size: u32) -> *mut c_void {
    std::ptr::null_mut()
}
unsafe extern "C" fn heap_realloc(_i: InstancePtr, p: *mut c_void, _size: u32) -> *mut c_void {
    p
}
unsafe extern "C" fn heap_free(_i: InstancePtr, _p: *mut c_void) {}

unsafe extern "C" fn mul_i64(a: i64, b: i64) -> i64 {
    a.wrapping_mul(b)
}
unsafe extern "C" fn mul_u64(a: u64, b: u64) -> u64 {
    a.wrapping_mul(b)
}
unsafe extern "C" fn div_i64(a: i64, b: i64) -> i64 {
    if b == 0 { 0 } else { a.wrapping_div(b) }
}
unsafe extern "C" fn div_u64(a: u64, b: u64) -> u64 {
    if b == 0 { 0 } else { a / b }
}
unsafe extern "C" fn rem_i64(a: i64, b: i64) -> i64 {
    if b == 0 { 0 } else { a.wrapping_rem(b) }
}
unsafe extern "C" fn rem_u64(a: u64, b: u64) -> u64 {
    if b == 0 { 0 } else { a % b }
}
unsafe extern "C" fn shl_i64(a: u64, s: u32) -> u64 {
    a.wrapping_shl(s)
}
unsafe extern "C" fn shr_i64(a: i64, s: u32) -> i64 {
    a.wrapping_shr(s)
}
unsafe extern "C" fn shr_u64(a: u64, s: u32) -> u64 {
    a.wrapping_shr(s)
}

unsafe extern "C" fn f32_to_i32(bits: u32) -> u32 {
    (f32::from_bits(bits) as i32) as u32
}
unsafe extern "C" fn f32_to_u32(bits: u32) -> u32 {
    f32::from_bits(bits) as u32
}
unsafe extern "C" fn f64_to_i64(bits: u64) -> u64 {
    (f64::from_bits(bits) as i64) as u64
}
unsafe extern "C" fn f64_to_u64(bits: u64) -> u64 {
    f64::from_bits(bits) as u64
}
unsafe extern "C" fn i32_to_f32(v: i32) -> u32 {
    (v as f32).to_bits()
}
unsafe extern "C" fn u32_to_f32(v: u32) -> u32 {
    (v as f32).to_bits()
}
unsafe extern "C" fn i64_to_f64(v: i64) -> u64 {
    (v as f64).to_bits()
}
unsafe extern "C" fn u64_to_f64(v: u64) -> u64 {
    (v as f64).to_bits()
}
unsafe extern "C" fn f32_to_f64(bits: u32) -> u64 {
    (f32::from_bits(bits) as f64).to_bits()
}
unsafe extern "C" fn f64_to_f32(bits: u64) -> u32 {
    (f64::from_bits(bits) as f32).to_bits()
}

unsafe extern "C" fn atomic_fetch_add_32(p: *mut u32, v: u32) -> u32 {
    espb_native_codegen::helpers::atomics::fetch_add_32(p, v)
}
unsafe extern "C" fn atomic_fetch_sub_32(p: *mut u32, v: u32) -> u32 {
    let old = *p;
    *p = old.wrapping_sub(v);
    old
}
unsafe extern "C" fn atomic_fetch_and_32(p: *mut u32, v: u32) -> u32 {
    let old = *p;
    *p &= v;
    old
}
unsafe extern "C" fn atomic_fetch_or_32(p: *mut u32, v: u32) -> u32 {
    let old = *p;
    *p |= v;
    old
}
unsafe extern "C" fn atomic_fetch_xor_32(p: *mut u32, v: u32) -> u32 {
    let old = *p;
    *p ^= v;
    old
}
unsafe extern "C" fn atomic_exchange_32(p: *mut u32, v: u32) -> u32 {
    std::mem::replace(&mut *p, v)
}
unsafe extern "C" fn atomic_compare_exchange_32(p: *mut u32, expected: u32, desired: u32) -> u32 {
    espb_native_codegen::helpers::atomics::compare_exchange_32(p, expected, desired)
}

unsafe extern "C" fn atomic_fetch_add_64(p: *mut u64, v: u64) -> u64 {
    espb_native_codegen::helpers::atomics::fetch_add_64(p, v)
}
unsafe extern "C" fn atomic_fetch_sub_64(p: *mut u64, v: u64) -> u64 {
    let old = *p;
    *p = old.wrapping_sub(v);
    old
}
unsafe extern "C" fn atomic_fetch_and_64(p: *mut u64, v: u64) -> u64 {
    let old = *p;
    *p &= v;
    old
}
unsafe extern "C" fn atomic_fetch_or_64(p: *mut u64, v: u64) -> u64 {
    let old = *p;
    *p |= v;
    old
}
unsafe extern "C" fn atomic_fetch_xor_64(p: *mut u64, v: u64) -> u64 {
    let old = *p;
    *p ^= v;
    old
}
unsafe extern "C" fn atomic_exchange_64(p: *mut u64, v: u64) -> u64 {
    std::mem::replace(&mut *p, v)
}
unsafe extern "C" fn atomic_compare_exchange_64(p: *mut u64, expected: u64, desired: u64) -> u64 {
    espb_native_codegen::helpers::atomics::compare_exchange_64(p, expected, desired)
}

unsafe extern "C" fn ext_table_memory_op(_i: InstancePtr, _sub: u8, _args: *const u64, _n: u8) -> u64 {
    0
}

unsafe extern "C" fn f32_add(a: u32, b: u32) -> u32 {
    (f32::from_bits(a) + f32::from_bits(b)).to_bits()
}
unsafe extern "C" fn f32_sub(a: u32, b: u32) -> u32 {
    (f32::from_bits(a) - f32::from_bits(b)).to_bits()
}
unsafe extern "C" fn f32_mul(a: u32, b: u32) -> u32 {
    (f32::from_bits(a) * f32::from_bits(b)).to_bits()
}
unsafe extern "C" fn f32_div(a: u32, b: u32) -> u32 {
    (f32::from_bits(a) / f32::from_bits(b)).to_bits()
}
unsafe extern "C" fn f32_min(a: u32, b: u32) -> u32 {
    f32::from_bits(a).min(f32::from_bits(b)).to_bits()
}
unsafe extern "C" fn f32_max(a: u32, b: u32) -> u32 {
    f32::from_bits(a).max(f32::from_bits(b)).to_bits()
}
unsafe extern "C" fn f32_sqrt(bits: u32) -> u32 {
    f32::from_bits(bits).sqrt().to_bits()
}
unsafe extern "C" fn f64_add(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) + f64::from_bits(b)).to_bits()
}
unsafe extern "C" fn f64_sub(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) - f64::from_bits(b)).to_bits()
}
unsafe extern "C" fn f64_mul(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) * f64::from_bits(b)).to_bits()
}
unsafe extern "C" fn f64_div(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) / f64::from_bits(b)).to_bits()
}
unsafe extern "C" fn f64_min(a: u64, b: u64) -> u64 {
    f64::from_bits(a).min(f64::from_bits(b)).to_bits()
}
unsafe extern "C" fn f64_max(a: u64, b: u64) -> u64 {
    f64::from_bits(a).max(f64::from_bits(b)).to_bits()
}
unsafe extern "C" fn f64_sqrt(bits: u64) -> u64 {
    f64::from_bits(bits).sqrt().to_bits()
}

unsafe extern "C" fn cmp_i64(a: i64, b: i64) -> i32 {
    a.cmp(&b) as i32
}
unsafe extern "C" fn cmp_u64(a: u64, b: u64) -> i32 {
    a.cmp(&b) as i32
}
unsafe extern "C" fn cmp_f32(a: u32, b: u32) -> i32 {
    match f32::from_bits(a).partial_cmp(&f32::from_bits(b)) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Greater) => 1,
        Some(std::cmp::Ordering::Equal) => 0,
        None => 2,
    }
}
unsafe extern "C" fn cmp_f64(a: u64, b: u64) -> i32 {
    match f64::from_bits(a).partial_cmp(&f64::from_bits(b)) {
        Some(std::cmp::Ordering::Less) => -1,
        Some(std::cmp::Ordering::Greater) => 1,
        Some(std::cmp::Ordering::Equal) => 0,
        None => 2,
    }
}

/// Build a `HelperTable` of trivial stubs, sufficient for compiling any
/// bytecode body without a real host runtime behind it.
pub fn noop_helpers() -> HelperTable {
    // SAFETY: every stub above matches the signature of its `HelperTable`
    // field exactly.
    unsafe {
        HelperTable::new_unchecked(HelperTable {
            call_espb_function,
            call_indirect,
            call_indirect_ptr,
            call_import,
            ld_global_addr,
            ld_global,
            st_global,
            runtime_alloca,
            heap_malloc,
            heap_realloc,
            heap_free,
            mul_i64,
            mul_u64,
            div_i64,
            div_u64,
            rem_i64,
            rem_u64,
            shl_i64,
            shr_i64,
            shr_u64,
            f32_to_i32,
            f32_to_u32,
            f64_to_i64,
            f64_to_u64,
            i32_to_f32,
            u32_to_f32,
            i64_to_f64,
            u64_to_f64,
            f32_to_f64,
            f64_to_f32,
            atomic_fetch_add_32,
            atomic_fetch_sub_32,
            atomic_fetch_and_32,
            atomic_fetch_or_32,
            atomic_fetch_xor_32,
            atomic_exchange_32,
            atomic_compare_exchange_32,
            atomic_fetch_add_64,
            atomic_fetch_sub_64,
            atomic_fetch_and_64,
            atomic_fetch_or_64,
            atomic_fetch_xor_64,
            atomic_exchange_64,
            atomic_compare_exchange_64,
            ext_table_memory_op,
            f32_add,
            f32_sub,
            f32_mul,
            f32_div,
            f32_min,
            f32_max,
            f32_sqrt,
            f64_add,
            f64_sub,
            f64_mul,
            f64_div,
            f64_min,
            f64_max,
            f64_sqrt,
            cmp_i64,
            cmp_u64,
            cmp_f32,
            cmp_f64,
        })
    }
}
