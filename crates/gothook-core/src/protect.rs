//! Protection Controller
//!
//! Makes a relocation slot writable for the duration of one patch and puts the original
//! page protection back on every exit path.

use crate::maps::MapsReader;
use gothook_common::{Address, Error, Protection, Result};
use once_cell::sync::Lazy;
use tracing::{error, trace};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

/// System page size
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn mprotect(start: Address, len: usize, protection: Protection) -> std::io::Result<()> {
    // SAFETY: the range is page-aligned and belongs to a mapping observed in the
    // mapping list; only its protection bits change.
    let rc = unsafe {
        libc::mprotect(
            start.get() as *mut libc::c_void,
            len,
            protection.to_prot_flags(),
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Puts a page range back to its original protection when dropped
struct RestoreGuard {
    start: Address,
    len: usize,
    original: Protection,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        match mprotect(self.start, self.len, self.original) {
            Ok(()) => trace!(
                target: "gothook::protect",
                start = %self.start,
                len = self.len,
                protection = %self.original,
                "protection restored"
            ),
            Err(e) => error!(
                target: "gothook::protect",
                start = %self.start,
                len = self.len,
                protection = %self.original,
                "failed to restore protection: {}",
                e
            ),
        }
    }
}

/// Scoped writability for patch targets
pub struct ProtectionController<'a> {
    maps: &'a MapsReader,
    page_size: usize,
}

impl<'a> ProtectionController<'a> {
    pub fn new(maps: &'a MapsReader) -> Self {
        Self {
            maps,
            page_size: page_size(),
        }
    }

    /// Run `body` with `[addr, addr + len)` writable
    ///
    /// The instruction cache over the range is flushed after `body` succeeds, before the
    /// original protection comes back.
    pub fn with_writable<T, F>(&self, addr: Address, len: usize, path: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let end = addr.checked_add(len).ok_or_else(|| Error::Protection {
            address: addr.get(),
            message: "range overflows the address space".into(),
        })?;
        let original = self.maps.get_protection(addr, len, path)?;

        let _restore = if original.write {
            None
        } else {
            let start = addr.page_start(self.page_size);
            let span_end = Address::new(end.get() + self.page_size - 1).page_start(self.page_size);
            let span = span_end.get() - start.get();
            mprotect(start, span, original.with_write()).map_err(|e| Error::Protection {
                address: addr.get(),
                message: format!("mprotect({}) failed: {}", original.with_write(), e),
            })?;
            trace!(
                target: "gothook::protect",
                start = %start,
                len = span,
                from = %original,
                "made writable"
            );
            Some(RestoreGuard {
                start,
                len: span,
                original,
            })
        };

        let value = body()?;
        flush_icache(addr, len);
        Ok(value)
    }
}

/// Synchronize the instruction view of `[addr, addr + len)` with data writes
pub fn flush_icache(addr: Address, len: usize) {
    let start = addr.get() as *const u8;
    let end = start.wrapping_add(len);
    // SAFETY: cache maintenance only; the range was just written.
    if !unsafe { clear_cache::clear_cache(start, end) } {
        trace!(target: "gothook::protect", addr = %addr, len, "instruction cache flush failed");
    }
}
