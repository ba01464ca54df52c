//! Executable memory allocator: page-aligned, executable buffers, a
//! shrink-to-fit resize, and an instruction-cache sync primitive.
//!
//! Modeled on `cranelift-jit`'s memory manager, which leans on `libc`
//! (mmap/mprotect) for the actual pages and serializes allocation behind a
//! mutex rather than building a lock-free arena the teacher itself doesn't
//! use. A real board port backing ESP32 IRAM would implement the same
//! [`ExecutableAllocator`] trait over a static region instead of mmap; the
//! dispatcher and patching code never know which implementation they got.

use crate::error::{CompileError, CompileResult};
use std::sync::Mutex;

/// An executable memory region owned by the allocator that produced it.
/// Non-owning from the caller's perspective until [`ExecutableAllocator::free`]
/// is called -- per the data model, the bytecode function body holds only a
/// pointer and size, not this handle.
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
    /// Size actually mapped, which may exceed `len` until a shrink-to-fit.
    mapped_len: usize,
}

impl ExecBuffer {
    /// Raw pointer to the start of the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mutable raw pointer, for emission.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// A writable slice over the whole usable region. Safe because the
    /// allocator guarantees the mapping is writable until [`finalize`] is
    /// called on it to flip it to exec-only (see `mprotect` note on `sync`).
    ///
    /// # Safety
    /// The caller must not retain this slice past a call to `free`.
    pub unsafe fn as_slice_mut(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Tiered memory-region preference, per §4.1: on platforms with a dedicated
/// fast-RAM region for code, try internal 32-bit-only executable RAM first,
/// then executable RAM of any width, then any executable region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryTier {
    /// Internal 32-bit-only fast executable RAM (e.g. ESP32 IRAM).
    Internal32Bit,
    /// Executable RAM of any bus width.
    AnyWidthRam,
    /// Any executable region at all (fallback).
    AnyExecutable,
}

/// Supplies executable memory and keeps the instruction cache coherent with
/// it. A hosted implementation backs this with `mmap`; an embedded board
/// port would back it with a static carve-out, but the interface is the
/// same either way so the rest of the compiler doesn't care which it got.
pub trait ExecutableAllocator: Send + Sync {
    /// Allocate at least `size` bytes, walking tiers in preference order and
    /// failing only once every tier is exhausted.
    fn alloc(&self, size: usize) -> CompileResult<ExecBuffer>;

    /// Shrink `buf` to `new_size` bytes, preserving its base address so
    /// PC-relative references already baked into the code remain valid. If
    /// the implementation cannot guarantee that, it must leave `buf`
    /// unchanged rather than move it.
    fn realloc(&self, buf: ExecBuffer, new_size: usize) -> ExecBuffer;

    /// Release the buffer back to the allocator.
    fn free(&self, buf: ExecBuffer);

    /// Writeback the data cache and invalidate the instruction cache over
    /// `buf[..size]`. A no-op on architectures with coherent caches.
    fn sync(&self, buf: &ExecBuffer, size: usize);
}

/// Host-backed allocator using `mmap`/`mprotect`, serialized behind a
/// mutex so concurrent compilations on the same process don't race each
/// other's bookkeeping -- the simplest implementation the design calls out
/// as sufficient when the host runs concurrent compilations.
pub struct MmapAllocator {
    /// Guards nothing but allocation bookkeeping; the mapped pages
    /// themselves, once `sync`ed, are safe to execute concurrently from any
    /// number of threads without holding this lock.
    lock: Mutex<()>,
}

impl Default for MmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapAllocator {
    /// A fresh allocator with no outstanding allocations.
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    fn page_size() -> usize {
        #[cfg(unix)]
        {
            // SAFETY: sysconf with _SC_PAGESIZE never fails on a platform
            // that has a notion of pages at all.
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    fn round_up_to_page(size: usize) -> usize {
        let page = Self::page_size();
        (size + page - 1) / page * page
    }
}

#[cfg(unix)]
impl ExecutableAllocator for MmapAllocator {
    fn alloc(&self, size: usize) -> CompileResult<ExecBuffer> {
        let _guard = self.lock.lock().unwrap();
        let mapped_len = Self::round_up_to_page(size.max(1));
        // SAFETY: standard anonymous, private, read/write/exec mapping. The
        // design's memory tiers (internal fast RAM vs. general RAM) don't
        // exist as distinct `mmap` targets on a hosted platform; a board
        // port implementing this trait over static IRAM/DRAM carve-outs is
        // where that tiering actually happens.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CompileError::OutOfMemory { requested: size });
        }
        Ok(ExecBuffer {
            ptr: addr as *mut u8,
            len: size,
            mapped_len,
        })
    }

    fn realloc(&self, buf: ExecBuffer, new_size: usize) -> ExecBuffer {
        // Shrinking in place never moves the base address: we just record a
        // smaller logical length and leave the mapping as-is, matching the
        // design's requirement that PC-relative references stay valid.
        // Unmapping the freed tail with `munmap` would also preserve the
        // base address, but risks racing a concurrent reader of the tail
        // during the brief window before `sync`; leaving it mapped but
        // unused is simpler and costs only address space.
        if new_size <= buf.len {
            ExecBuffer {
                ptr: buf.ptr,
                len: new_size,
                mapped_len: buf.mapped_len,
            }
        } else {
            buf
        }
    }

    fn free(&self, buf: ExecBuffer) {
        let _guard = self.lock.lock().unwrap();
        unsafe {
            libc::munmap(buf.ptr as *mut libc::c_void, buf.mapped_len);
        }
    }

    fn sync(&self, buf: &ExecBuffer, size: usize) {
        sync_icache(buf.ptr, size);
    }
}

/// Instruction-cache sync for the host architecture. Grounded on the same
/// job `wasmtime-jit-icache-coherence` does for Cranelift-compiled code:
/// writeback the data cache, invalidate the instruction cache, over the
/// given range. Architectures with coherent instruction caches (most
/// contemporary x86_64/aarch64 hosts) make this a no-op; RISC-V and Xtensa,
/// the two targets this compiler actually emits code *for*, require it when
/// the emitting CPU and executing CPU share an instruction cache, which is
/// always true for a JIT.
#[cfg(target_arch = "x86_64")]
fn sync_icache(_ptr: *mut u8, _len: usize) {
    // x86_64 has a coherent icache; nothing to do.
}

#[cfg(target_arch = "aarch64")]
fn sync_icache(ptr: *mut u8, len: usize) {
    // SAFETY: `ptr..ptr+len` was just written by this thread and is a valid
    // mapping of at least `len` bytes.
    unsafe {
        let start = ptr as usize;
        let end = start + len;
        std::arch::asm!(
            "1:",
            "dc cvau, {0}",
            "add {0}, {0}, #64",
            "cmp {0}, {1}",
            "b.lo 1b",
            "dsb ish",
            "2:",
            "ic ivau, {2}",
            "add {2}, {2}, #64",
            "cmp {2}, {1}",
            "b.lo 2b",
            "dsb ish",
            "isb",
            inout(reg) start => _,
            in(reg) end,
            inout(reg) start => _,
        );
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn sync_icache(_ptr: *mut u8, _len: usize) {
    // Best-effort fallback for hosts this crate's own test suite doesn't
    // run on; the RISC-V and Xtensa *targets* get their sync emitted as
    // `fence.i` / a platform primitive directly into the generated code
    // (see the ISA `finalize` paths), not here.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn alloc_returns_writable_executable_memory() {
        let alloc = MmapAllocator::new();
        let mut buf = alloc.alloc(64).unwrap();
        unsafe {
            let slice = buf.as_slice_mut();
            slice[0] = 0x90;
        }
        alloc.sync(&buf, 64);
        assert_eq!(buf.len(), 64);
        alloc.free(buf);
    }

    #[test]
    #[cfg(unix)]
    fn realloc_shrink_preserves_base_address() {
        let alloc = MmapAllocator::new();
        let buf = alloc.alloc(256).unwrap();
        let base = buf.as_ptr();
        let shrunk = alloc.realloc(buf, 32);
        assert_eq!(shrunk.as_ptr(), base);
        assert_eq!(shrunk.len(), 32);
        alloc.free(shrunk);
    }
}
