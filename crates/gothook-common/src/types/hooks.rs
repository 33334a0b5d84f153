//! Hook rule and patch types

use crate::types::memory::Address;
use serde::{Deserialize, Serialize};

/// Unique identifier for a registered hook rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u32);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rule_{}", self.0)
    }
}

/// How a relocation slot gets filled by the dynamic linker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocKind {
    /// PLT jump slot, possibly still pointing at a lazy-binding stub
    JumpSlot,
    /// GOT entry resolved at load time
    GlobalData,
    /// Word-sized absolute data relocation
    Absolute,
}

impl RelocKind {
    pub fn is_lazy_plt(&self) -> bool {
        matches!(self, RelocKind::JumpSlot)
    }
}

impl std::fmt::Display for RelocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelocKind::JumpSlot => write!(f, "JUMP_SLOT"),
            RelocKind::GlobalData => write!(f, "GLOB_DAT"),
            RelocKind::Absolute => write!(f, "ABS"),
        }
    }
}

/// Synchronous or detached refresh pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    Sync,
    Async,
}

impl RefreshMode {
    pub fn from_async_flag(is_async: bool) -> Self {
        if is_async {
            RefreshMode::Async
        } else {
            RefreshMode::Sync
        }
    }
}

/// A first-time patch of one relocation slot by one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub rule: RuleId,
    pub image_path: String,
    pub symbol: String,
    pub slot: Address,
    pub kind: RelocKind,
    /// Value the slot held before this rule patched it
    pub original: Address,
    pub replacement: Address,
}

/// Outcome counters of one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Monotonic pass number
    pub pass: u64,
    /// Eligible images in the snapshot
    pub images_seen: usize,
    /// Images evaluated in this pass (new, reloaded or under a newer rule epoch)
    pub images_evaluated: usize,
    /// Images whose metadata was parsed because some rule matched their path
    pub images_parsed: usize,
    /// Slots whose value changed in this pass
    pub slots_patched: usize,
    /// Slots skipped because an ignore rule matched
    pub slots_ignored: usize,
    /// Slots skipped because their protection could not be changed
    pub protection_failures: usize,
    /// Images aborted by a parse error
    pub image_failures: usize,
    /// Images aborted by a memory fault
    pub faulted_images: usize,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.protection_failures == 0 && self.image_failures == 0 && self.faulted_images == 0
    }
}
