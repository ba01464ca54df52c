//! Label & fixup table: the map from bytecode offset to native offset, and
//! the pending-fixup list for forward branches resolved at the end of
//! compilation.
//!
//! First-write-wins on label recording is the correctness invariant here:
//! jumps must land on the first native byte of an opcode, never mid-opcode,
//! so [`LabelTable::record`] silently ignores a second recording of the same
//! bytecode offset (which can legitimately happen if two different forward
//! branches independently re-derive the same target).

use crate::buffer::CodeBuffer;
use crate::error::{CompileError, CompileResult};
use log::{debug, trace, warn};
use std::collections::HashMap;

/// How a branch encodes its displacement once the target is known, and
/// where in the instruction stream that displacement lives. Each ISA's
/// dispatcher supplies a small closure that knows how to re-encode its own
/// branch at patch time; the label table only tracks *when* to call it.
pub type PatchFn = Box<dyn FnOnce(&mut CodeBuffer, i64) -> CompileResult<()>>;

/// A deferred patch of a branch instruction whose target bytecode offset
/// was not yet known at emission time.
pub struct Fixup {
    /// Native offset of the start of the branch instruction, used only for
    /// diagnostics (the patch closure already knows exactly which bytes to
    /// rewrite).
    pub native_offset: u32,
    /// The bytecode offset the branch should eventually reach.
    pub target_bytecode_offset: u32,
    /// Mnemonic, for error messages.
    pub mnemonic: &'static str,
    patch: PatchFn,
}

impl std::fmt::Debug for Fixup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixup")
            .field("native_offset", &self.native_offset)
            .field("target_bytecode_offset", &self.target_bytecode_offset)
            .field("mnemonic", &self.mnemonic)
            .finish()
    }
}

/// Bytecode-offset -> native-offset map, plus the queue of not-yet-resolved
/// forward branches.
#[derive(Default)]
pub struct LabelTable {
    labels: HashMap<u32, u32>,
    fixups: Vec<Fixup>,
}

impl LabelTable {
    /// A fresh, empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that bytecode offset `bc_offset` begins at `native_offset`,
    /// unless it has already been recorded (first write wins).
    pub fn record(&mut self, bc_offset: u32, native_offset: u32) {
        if self.labels.entry(bc_offset).or_insert(native_offset) == &native_offset {
            trace!("label recorded: bytecode offset {bc_offset} -> native offset {native_offset}");
        }
    }

    /// Native offset previously recorded for a bytecode offset, if any.
    pub fn lookup(&self, bc_offset: u32) -> Option<u32> {
        self.labels.get(&bc_offset).copied()
    }

    /// Enqueue a forward branch to be patched once the label table is
    /// complete. `patch` receives the code buffer and the resolved
    /// displacement (native target minus native offset of the branch,
    /// computed by the caller in whatever units the ISA's branch wants --
    /// typically bytes) and re-encodes the branch bytes in place.
    pub fn add_fixup(
        &mut self,
        native_offset: u32,
        target_bytecode_offset: u32,
        mnemonic: &'static str,
        patch: PatchFn,
    ) {
        trace!("fixup queued: {mnemonic} at native offset {native_offset} targets bytecode offset {target_bytecode_offset}");
        self.fixups.push(Fixup {
            native_offset,
            target_bytecode_offset,
            mnemonic,
            patch,
        });
    }

    /// Number of fixups still pending. Exposed for tests.
    pub fn pending_fixup_count(&self) -> usize {
        self.fixups.len()
    }

    /// Resolve every pending fixup against the label table.
    ///
    /// A fixup whose target has no recorded label means the branch targets
    /// unreachable code; per the design, that is patched to a
    /// branch-to-self trap rather than left dangling, and a warning is
    /// logged. `self_trap_offset` lets the caller supply, for each such
    /// fixup, the displacement that makes the branch target its own native
    /// offset.
    pub fn resolve_all(
        &mut self,
        buf: &mut CodeBuffer,
        self_trap_displacement: impl Fn(u32) -> i64,
    ) -> CompileResult<()> {
        buf.flush();
        debug!("resolving {} pending fixup(s) against {} recorded label(s)", self.fixups.len(), self.labels.len());
        for fixup in self.fixups.drain(..) {
            let displacement = match self.labels.get(&fixup.target_bytecode_offset) {
                Some(&native_target) => native_target as i64 - fixup.native_offset as i64,
                None => {
                    warn!(
                        "fixup at native offset {} ({}) targets unreachable bytecode offset {}; \
                         patching to a self-trap",
                        fixup.native_offset, fixup.mnemonic, fixup.target_bytecode_offset
                    );
                    self_trap_displacement(fixup.native_offset)
                }
            };
            (fixup.patch)(buf, displacement).map_err(|e| match e {
                CompileError::EncodingError { .. } => e,
                other => other,
            })?;
        }
        Ok(())
    }

    /// Every label table entry, for tests that assert on the full set of
    /// recorded labels.
    #[cfg(test)]
    pub fn labels(&self) -> &HashMap<u32, u32> {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WordDiscipline;

    #[test]
    fn first_write_wins() {
        let mut t = LabelTable::new();
        t.record(10, 100);
        t.record(10, 200);
        assert_eq!(t.lookup(10), Some(100));
    }

    #[test]
    fn resolves_forward_branch_to_known_label() {
        let mut t = LabelTable::new();
        let mut mem = [0u8; 32];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::ByteAddressable);
        buf.put4(0); // placeholder branch at native offset 0
        t.record(4, 16); // target bytecode offset 4 lands at native offset 16
        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        t.add_fixup(
            0,
            4,
            "beq",
            Box::new(move |buf, disp| {
                *seen2.borrow_mut() = Some(disp);
                buf.store_u32(0, disp as u32)
            }),
        );
        t.resolve_all(&mut buf, |native| -native as i64).unwrap();
        assert_eq!(*seen.borrow(), Some(16));
    }

    #[test]
    fn unresolved_fixup_patches_to_self_trap() {
        let mut t = LabelTable::new();
        let mut mem = [0u8; 32];
        let mut buf = CodeBuffer::new(&mut mem, WordDiscipline::ByteAddressable);
        buf.put4(0);
        let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
        let seen2 = seen.clone();
        t.add_fixup(
            0,
            999, // never recorded as a label
            "jal",
            Box::new(move |buf, disp| {
                *seen2.borrow_mut() = Some(disp);
                buf.store_u32(0, disp as u32)
            }),
        );
        t.resolve_all(&mut buf, |_native| 0).unwrap();
        assert_eq!(*seen.borrow(), Some(0), "self-trap displacement of 0 == branch to self");
    }
}
