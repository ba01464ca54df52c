//! Xtensa literal pool: a bounded set of deduplicated 32-bit constants,
//! flushed into the code stream as data islands with a jump over them.
//!
//! RISC-V has no equivalent: it reaches constants via `lui`+`addi` sequences
//! or PC-relative `auipc`-based loads, never a pool (see §4.4 of the spec).

use crate::buffer::CodeBuffer;
use crate::error::{CompileError, CompileResult};
use log::{debug, trace};
use smallvec::SmallVec;

/// Maximum number of live entries before a pool must be flushed regardless
/// of whether any load actually needs a backward reference yet.
pub const MAX_POOL_ENTRIES: usize = 64;

/// A Xtensa NOP encoding (`nop.n`, 2 bytes) used as the pool's trailing
/// alignment padding -- never raw zero bytes, which are not a valid
/// instruction on this ISA.
pub const XTENSA_NOP_N: u16 = 0x003d;

#[derive(Clone, Copy)]
struct PendingEntry {
    value: u32,
    /// Native offset once emitted; `None` while still pending.
    offset: Option<u32>,
}

/// One pool's worth of constants.
pub struct LiteralPool {
    entries: SmallVec<[PendingEntry; MAX_POOL_ENTRIES]>,
}

impl Default for LiteralPool {
    fn default() -> Self {
        Self::new()
    }
}

impl LiteralPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self {
            entries: SmallVec::new(),
        }
    }

    /// Whether the pool has reached its capacity and must be flushed before
    /// another entry can be added.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_POOL_ENTRIES
    }

    /// Number of entries currently pending or emitted in this pool.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an existing entry with this value, or add a new pending one.
    /// Returns the entry's index within this pool.
    pub fn find_or_add(&mut self, value: u32) -> CompileResult<usize> {
        if let Some(idx) = self.entries.iter().position(|e| e.value == value) {
            trace!("literal pool reused entry {idx} for value 0x{value:08x}");
            return Ok(idx);
        }
        if self.is_full() {
            return Err(CompileError::InvalidState(
                "literal pool full; caller must flush before adding".to_string(),
            ));
        }
        self.entries.push(PendingEntry { value, offset: None });
        let idx = self.entries.len() - 1;
        trace!("literal pool added entry {idx} for value 0x{value:08x}");
        Ok(idx)
    }

    /// Native offset of entry `idx`, if it has been emitted (i.e. the pool
    /// has been flushed since it was added).
    pub fn offset_of(&self, idx: usize) -> Option<u32> {
        self.entries[idx].offset
    }

    /// Whether entry `idx` has already been emitted.
    pub fn has_position(&self, idx: usize) -> bool {
        self.entries[idx].offset.is_some()
    }

    /// Flush all pending entries into the code stream as a data island:
    ///
    /// 1. Pad so the jump-over instruction's continuation address is
    ///    word-aligned.
    /// 2. Emit an unconditional jump over the pool.
    /// 3. Emit each pending entry as 4 raw bytes, recording its offset.
    /// 4. Emit trailing NOP padding so the next instruction is word-aligned.
    ///
    /// `emit_jump` is supplied by the Xtensa dispatcher/encoder and must
    /// emit a `j` (or equivalent) instruction whose displacement is the pool
    /// size plus alignment padding, rounded up to a multiple of 4; it
    /// returns the number of bytes it wrote so this function can compute
    /// continuation alignment.
    pub fn flush(
        &mut self,
        buf: &mut CodeBuffer,
        mut emit_jump: impl FnMut(&mut CodeBuffer, u32) -> CompileResult<u32>,
    ) -> CompileResult<()> {
        buf.flush();
        if self.entries.is_empty() {
            return Ok(());
        }
        debug!("flushing literal pool: {} entries at native offset {}", self.entries.len(), buf.offset());

        let pool_bytes = (self.entries.len() * 4) as u32;

        // The jump instruction (3 bytes on Xtensa) must land such that the
        // address right after it -- where the pool data starts -- is
        // word-aligned, since the pool entries themselves must be
        // word-aligned for a correct PC-relative L32R read.
        let jump_len_estimate = 3u32;
        let mut probe = buf.offset() + jump_len_estimate;
        let mut pre_pad = 0u32;
        while probe % 4 != 0 {
            probe += 1;
            pre_pad += 1;
        }

        let written = emit_jump(buf, pool_bytes + pre_pad)?;
        debug_assert_eq!(written, jump_len_estimate, "jump encoding length mismatch with alignment probe");
        for _ in 0..pre_pad {
            buf.put1(0); // padding before the data island; never executed
        }

        debug_assert_eq!(buf.offset() % 4, 0, "literal pool entries must be word-aligned");

        for entry in self.entries.iter_mut() {
            let off = buf.offset();
            buf.put4(entry.value);
            entry.offset = Some(off);
        }

        while buf.offset() % 4 != 0 {
            buf.put2(XTENSA_NOP_N);
        }

        Ok(())
    }

    /// Start a fresh, empty pool (called after a flush).
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WordDiscipline;

    #[test]
    fn dedup_returns_same_index_for_repeated_value() {
        let mut pool = LiteralPool::new();
        let a = pool.find_or_add(0x1234_5678).unwrap();
        let b = pool.find_or_add(0x1234_5678).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn flush_emits_word_aligned_entries_with_nop_padding() {
        let mut pool = LiteralPool::new();
        pool.find_or_add(0xaabb_ccdd).unwrap();
        let mut mem = [0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::WordAccumulated);
        buf.put1(0); // force the jump to start at an unaligned-ish offset
        pool.flush(&mut buf, |buf, _disp| {
            buf.put3(0); // stand-in 3-byte jump encoding
            Ok(3)
        })
        .unwrap();
        assert_eq!(pool.offset_of(0).unwrap() % 4, 0);
        assert_eq!(buf.offset() % 4, 0, "buffer lands word-aligned after flush");
    }

    #[test]
    fn full_pool_rejects_further_additions() {
        let mut pool = LiteralPool::new();
        for i in 0..MAX_POOL_ENTRIES as u32 {
            pool.find_or_add(i).unwrap();
        }
        assert!(pool.is_full());
        assert!(pool.find_or_add(0xffff_ffff).is_err());
    }
}
