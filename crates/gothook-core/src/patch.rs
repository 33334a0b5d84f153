//! Patch Applier

use crate::elf::{ElfMetadata, Relocation};
use crate::traits::ForeignMemory;
use gothook_common::{Address, Result};
use std::ffi::CString;
use tracing::trace;

/// Result of writing one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Value held by the slot before the call
    pub previous: Address,
    /// False when the slot already held the replacement
    pub changed: bool,
}

/// Point `slot` at `replacement`, returning what it held before
///
/// Writes are serialized by the engine, so a plain read followed by an atomic store is
/// enough.
pub fn apply(mem: &dyn ForeignMemory, slot: Address, replacement: Address) -> Result<PatchOutcome> {
    let previous = Address::new(mem.read_word(slot)?);
    if previous == replacement {
        trace!(target: "gothook::patch", slot = %slot, "slot already patched");
        return Ok(PatchOutcome {
            previous,
            changed: false,
        });
    }
    mem.write_word(slot, replacement.get())?;
    Ok(PatchOutcome {
        previous,
        changed: true,
    })
}

/// The value a registrant should forward to after patching `reloc`
///
/// A lazy PLT slot that still points into its own image holds a resolver stub; calling
/// through it would let the dynamic linker resolve the symbol and overwrite the hook.
/// Resolve the symbol eagerly instead and keep the stub only when that fails.
pub fn forward_target(
    meta: &ElfMetadata,
    reloc: &Relocation,
    symbol: &str,
    previous: Address,
) -> Address {
    if !reloc.kind.is_lazy_plt() || !meta.contains(previous) {
        return previous;
    }
    match resolve_symbol(symbol) {
        Some(resolved) => {
            trace!(
                target: "gothook::patch",
                symbol,
                stub = %previous,
                resolved = %resolved,
                "settled lazy PLT slot"
            );
            resolved
        }
        None => previous,
    }
}

/// Global lookup of `symbol` through the dynamic linker
pub fn resolve_symbol(symbol: &str) -> Option<Address> {
    let name = CString::new(symbol).ok()?;
    // SAFETY: `name` is NUL-terminated and outlives the call.
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(Address::new(addr as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::CheckedMemory;
    use gothook_common::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_apply_replaces_and_returns_previous() {
        let slot = Box::new(AtomicUsize::new(0x1000));
        let addr = Address::new(&*slot as *const AtomicUsize as usize);

        let outcome = apply(&CheckedMemory, addr, Address::new(0x2000)).unwrap();
        assert_eq!(outcome.previous, Address::new(0x1000));
        assert!(outcome.changed);
        assert_eq!(slot.load(Ordering::SeqCst), 0x2000);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let slot = Box::new(AtomicUsize::new(0x2000));
        let addr = Address::new(&*slot as *const AtomicUsize as usize);

        let outcome = apply(&CheckedMemory, addr, Address::new(0x2000)).unwrap();
        assert_eq!(outcome.previous, Address::new(0x2000));
        assert!(!outcome.changed);
        assert_eq!(slot.load(Ordering::SeqCst), 0x2000);
    }

    #[test]
    fn test_apply_to_unmapped_slot_faults() {
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);
        let err = apply(&CheckedMemory, Address::new(page as usize), Address::new(1)).unwrap_err();
        assert!(matches!(err, Error::FaultSignaled { .. }));
    }

    #[test]
    fn test_resolve_symbol() {
        assert!(resolve_symbol("malloc").is_some());
        assert!(resolve_symbol("gothook_no_such_symbol_anywhere").is_none());
        assert!(resolve_symbol("bad\0name").is_none());
    }
}
