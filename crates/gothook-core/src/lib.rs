//! gothook Core Library
//!
//! In-process PLT/GOT hook engine. Loaded images are discovered from the process mapping
//! list, their dynamic relocation metadata is parsed straight from memory, and every slot
//! whose symbol matches a registered rule is redirected to the replacement function.

pub mod api;
pub mod elf;
pub mod engine;
pub mod fault;
pub mod maps;
pub mod packed_reloc;
pub mod patch;
pub mod protect;
pub mod rules;
pub mod traits;

pub use elf::{ElfMetadata, Relocation};
pub use engine::HookEngine;
pub use fault::{CheckedMemory, FaultGuard, RawMemory};
pub use gothook_common::{Error, Result};
pub use maps::{MapsReader, MapsSnapshot, ProcMaps};
pub use patch::PatchOutcome;
pub use protect::ProtectionController;
pub use rules::{Decision, HookRegistration, RuleRegistry, RuleSet};
pub use traits::*;
