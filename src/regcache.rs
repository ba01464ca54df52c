//! RISC-V register cache / peephole: an optional two-entry cache pinning
//! virtual registers to physical temporaries within a basic block, plus a
//! companion single-slot cache for 64-bit values pinned to a register pair.
//!
//! Xtensa has no equivalent -- its windowed ABI rotates physical register
//! numbers on every call, which makes a cross-opcode physical pin far less
//! profitable, so the spec scopes this component to RISC-V only.

use crate::bytecode::{BytecodeCursor, Opcode};

/// One binding in the two-entry cache: which virtual register currently
/// mirrors a physical temporary, and whether it has been written since it
/// was loaded (and so needs writing back before it can be evicted).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Slot {
    vreg: u8,
    dirty: bool,
}

/// The "hot pair" cache: two physical temporaries, each optionally bound to
/// a 32-bit virtual register.
#[derive(Default)]
pub struct RegisterCache {
    slots: [Option<Slot>; 2],
}

/// Outcome of asking the cache to make a virtual register available in a
/// physical temporary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Residency {
    /// Already resident in physical slot index 0 or 1.
    AlreadyLoaded(usize),
    /// Not resident; caller must emit a load from the frame into the
    /// returned physical slot index, which may have required evicting (and
    /// flushing, if dirty) a previous occupant.
    NeedsLoad(usize),
}

impl RegisterCache {
    /// A cache with both slots empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `vreg` is resident in one of the two physical slots,
    /// preferring `preferred` if it is free or already holds `vreg`.
    /// Evicts (and reports if the evictee was dirty) when both slots are
    /// occupied by a different register.
    pub fn ensure_loaded(&mut self, vreg: u8, preferred: usize) -> (Residency, Option<(usize, u8)>) {
        debug_assert!(preferred < 2);
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(s) = slot {
                if s.vreg == vreg {
                    return (Residency::AlreadyLoaded(i), None);
                }
            }
        }
        let target = if self.slots[preferred].is_none() {
            preferred
        } else if self.slots[1 - preferred].is_none() {
            1 - preferred
        } else {
            preferred
        };
        let evicted = self.slots[target].take().and_then(|s| s.dirty.then_some((target, s.vreg)));
        self.slots[target] = Some(Slot { vreg, dirty: false });
        (Residency::NeedsLoad(target), evicted)
    }

    /// Record that physical slot `phys` now holds `vreg`, marking it dirty
    /// by default since this is the write path (an ALU result landing in a
    /// cached register). Returns the evicted occupant, if any and if dirty,
    /// so the caller can flush it first.
    pub fn set(&mut self, phys: usize, vreg: u8, dirty: bool) -> Option<(usize, u8)> {
        let evicted = self.slots[phys].take().and_then(|s| s.dirty.then_some((phys, s.vreg)));
        self.slots[phys] = Some(Slot { vreg, dirty });
        evicted
    }

    /// All dirty entries, each paired with its physical slot index, for the
    /// caller to write back to the frame. Does not itself clear the dirty
    /// bits or the slots -- call [`RegisterCache::reset`] after flushing.
    pub fn dirty_entries(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Some(s) if s.dirty => Some((i, s.vreg)),
            _ => None,
        })
    }

    /// Clear both slots, as happens at the top of every non-ALU opcode and
    /// at every branch (the design's blanket reset point; selective
    /// retention across branches is handled by [`flush_selective`] choosing
    /// what to write back first, not by keeping entries live past a
    /// branch).
    pub fn reset(&mut self) {
        self.slots = [None, None];
    }

    /// Whether either slot currently holds `vreg`.
    pub fn contains(&self, vreg: u8) -> bool {
        self.slots.iter().flatten().any(|s| s.vreg == vreg)
    }
}

/// Conservatively scan the bytecode of both successor basic blocks (the
/// branch target and the fallthrough) starting at the given bytecode
/// offsets, and report which of `candidates` is read before it is
/// overwritten in *either* successor. Entries not read before being
/// overwritten in both successors don't need flushing before the branch;
/// everything else does, which is the conservative (safe) default when a
/// successor's scan runs off the end of the supplied code without settling
/// the question.
///
/// This is a per-opcode decode pass, not a real liveness analysis: it reads
/// just enough of each opcode's fixed-size operand encoding to tell whether
/// the candidate register appears as a source or is clobbered as a
/// destination, then stops at the first branch/call/end it encounters in
/// that successor (conservatively treating the candidate as "still live"
/// past that point, since the scan doesn't follow further edges).
pub fn flush_selective(code: &[u8], target_bc: u32, fallthrough_bc: u32, candidates: &[u8]) -> Vec<u8> {
    let mut must_flush = Vec::new();
    for &vreg in candidates {
        let live_at_target = scan_reads_before_overwrite(code, target_bc, vreg);
        let live_at_fallthrough = scan_reads_before_overwrite(code, fallthrough_bc, vreg);
        if live_at_target || live_at_fallthrough {
            must_flush.push(vreg);
        }
    }
    must_flush
}

/// Scan forward from `start` looking for the first read or write of `vreg`.
/// Returns `true` if a read is found before any overwrite (or if the scan
/// exhausts the buffer or hits a branch/call without settling -- the
/// conservative default).
fn scan_reads_before_overwrite(code: &[u8], start: u32, vreg: u8) -> bool {
    if start as usize >= code.len() {
        return true;
    }
    let mut cur = BytecodeCursor::new(&code[start as usize..]);
    // A handful of opcode shapes are enough to answer the common case: a
    // two-operand ALU op (dst, src1, src2), a move (dst, src), or a branch
    // (cond reg). Anything else is treated conservatively as "still live".
    while !cur.at_end() {
        let Ok(op_byte) = cur.read_opcode() else { return true };
        let Some(op) = Opcode::from_u8(op_byte) else { return true };
        match op {
            Opcode::Add32
            | Opcode::Sub32
            | Opcode::Mul32
            | Opcode::And32
            | Opcode::Or32
            | Opcode::Xor32 => {
                let (Ok(dst), Ok(a), Ok(b)) = (cur.read_u8(), cur.read_u8(), cur.read_u8()) else {
                    return true;
                };
                if a == vreg || b == vreg {
                    return true;
                }
                if dst == vreg {
                    return false;
                }
            }
            Opcode::Move32 | Opcode::Move64 => {
                let (Ok(dst), Ok(src)) = (cur.read_u8(), cur.read_u8()) else { return true };
                if src == vreg {
                    return true;
                }
                if dst == vreg {
                    return false;
                }
            }
            Opcode::BrIf => {
                let Ok(cond) = cur.read_u8() else { return true };
                let _ = cur.read_i32();
                if cond == vreg {
                    return true;
                }
                // Conservatively stop here: we don't follow the edge.
                return true;
            }
            Opcode::Br | Opcode::End | Opcode::Unreachable | Opcode::Call | Opcode::CallIndirect => {
                return true;
            }
            _ => return true,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_loaded_reports_hit_when_already_resident() {
        let mut cache = RegisterCache::new();
        cache.set(0, 5, false);
        let (residency, evicted) = cache.ensure_loaded(5, 0);
        assert_eq!(residency, Residency::AlreadyLoaded(0));
        assert!(evicted.is_none());
    }

    #[test]
    fn ensure_loaded_evicts_dirty_occupant_of_both_slots() {
        let mut cache = RegisterCache::new();
        cache.set(0, 1, true);
        cache.set(1, 2, true);
        let (residency, evicted) = cache.ensure_loaded(3, 0);
        assert_eq!(residency, Residency::NeedsLoad(0));
        assert_eq!(evicted, Some((0, 1)));
    }

    #[test]
    fn reset_clears_both_slots() {
        let mut cache = RegisterCache::new();
        cache.set(0, 1, true);
        cache.reset();
        assert!(!cache.contains(1));
    }

    #[test]
    fn dirty_entries_lists_only_dirty_slots() {
        let mut cache = RegisterCache::new();
        cache.set(0, 1, true);
        cache.set(1, 2, false);
        let dirty: Vec<_> = cache.dirty_entries().collect();
        assert_eq!(dirty, vec![(0, 1)]);
    }

    #[test]
    fn flush_selective_drops_a_candidate_overwritten_before_any_read_in_both_successors() {
        // Both successors write vreg 3 (via Move32) before ever reading it,
        // so it needs no writeback ahead of the branch.
        let mut target = Vec::new();
        target.push(Opcode::Move32 as u8);
        target.extend_from_slice(&[3, 9]);
        target.push(Opcode::End as u8);

        let mut fallthrough = Vec::new();
        fallthrough.push(Opcode::Move32 as u8);
        fallthrough.extend_from_slice(&[3, 9]);
        fallthrough.push(Opcode::End as u8);

        // Lay both blocks out back to back in one buffer.
        let target_bc = 0u32;
        let fallthrough_bc = target.len() as u32;
        let mut code = target;
        code.extend_from_slice(&fallthrough);

        let must_flush = flush_selective(&code, target_bc, fallthrough_bc, &[3]);
        assert!(must_flush.is_empty());
    }

    #[test]
    fn flush_selective_keeps_a_candidate_read_before_being_overwritten() {
        let mut target = Vec::new();
        target.push(Opcode::Move32 as u8);
        target.extend_from_slice(&[3, 9]); // overwrites vreg 3, never reads it
        target.push(Opcode::End as u8);

        let mut fallthrough = Vec::new();
        fallthrough.push(Opcode::Add32 as u8);
        fallthrough.extend_from_slice(&[9, 3, 3]); // reads vreg 3 as a source
        fallthrough.push(Opcode::End as u8);

        let target_bc = 0u32;
        let fallthrough_bc = target.len() as u32;
        let mut code = target;
        code.extend_from_slice(&fallthrough);

        let must_flush = flush_selective(&code, target_bc, fallthrough_bc, &[3]);
        assert_eq!(must_flush, vec![3]);
    }
}
