//! Cross-cutting compiler knobs, passed by reference into [`crate::isa::compile`]
//! rather than read from global state -- the global bytecode module and
//! table are likewise always borrowed references, never a process-wide
//! singleton, per the design's stance on global mutable state.

/// Compiler-wide configuration. Every field defaults to the value the
/// design calls out as the right one for that target; callers override
/// individual fields only when they have a specific reason to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Whether to shrink the executable allocation down to the emitted size
    /// after compilation. Safe by default on RISC-V, where
    /// [`crate::alloc::MmapAllocator::realloc`] only truncates the tail and
    /// never moves the base address; left off by default on Xtensa, where a
    /// move would invalidate literal-pool PC-relative references that this
    /// crate does not re-patch after the fact.
    pub shrink_to_fit: bool,
    /// Whether the RISC-V register cache (§4.6) is active. A function body
    /// flagged `NO_SPILL` still disables it regardless of this setting; the
    /// dispatcher treats a disabled cache as permanently empty rather than
    /// running a second code path.
    pub enable_register_cache: bool,
    /// Maximum live entries in a Xtensa literal pool before a flush is
    /// forced regardless of whether a load needs one yet.
    pub literal_pool_capacity: usize,
}

impl CompilerConfig {
    /// Defaults tuned for RISC-V: shrink-to-fit on, register cache on.
    pub fn riscv_defaults() -> Self {
        Self {
            shrink_to_fit: true,
            enable_register_cache: true,
            literal_pool_capacity: crate::literal_pool::MAX_POOL_ENTRIES,
        }
    }

    /// Defaults tuned for Xtensa: shrink-to-fit off (see field doc), no
    /// register cache (RISC-V only).
    pub fn xtensa_defaults() -> Self {
        Self {
            shrink_to_fit: false,
            enable_register_cache: false,
            literal_pool_capacity: crate::literal_pool::MAX_POOL_ENTRIES,
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::riscv_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xtensa_defaults_disable_shrink_to_fit_and_register_cache() {
        let cfg = CompilerConfig::xtensa_defaults();
        assert!(!cfg.shrink_to_fit);
        assert!(!cfg.enable_register_cache);
    }

    #[test]
    fn riscv_defaults_enable_both() {
        let cfg = CompilerConfig::riscv_defaults();
        assert!(cfg.shrink_to_fit);
        assert!(cfg.enable_register_cache);
    }
}
