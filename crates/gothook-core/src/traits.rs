//! Core trait definitions for gothook
//!
//! These traits are the seams between the hook engine and the process it lives in:
//! where the mapping list comes from, how pathnames are matched, and how memory that
//! may not be mapped is touched.

use gothook_common::{Address, Result};

/// Source of the textual process mapping list (`/proc/self/maps` format)
pub trait MapSource: Send + Sync {
    /// Read the full mapping list
    fn read_maps(&self) -> Result<String>;
}

/// Compiled pathname pattern
pub trait PatternMatcher: Send + Sync {
    /// Source text the matcher was compiled from
    fn pattern(&self) -> &str;

    /// Whether `text` matches anywhere
    fn is_match(&self, text: &str) -> bool;
}

/// Access to memory of this process whose mapping is not trusted
///
/// Implementations decide whether an invalid access is reported as
/// `Error::FaultSignaled` or left to the process's default fault handling.
pub trait ForeignMemory {
    /// Copy `len` bytes starting at `addr`
    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>>;

    /// Read one native word
    fn read_word(&self, addr: Address) -> Result<usize> {
        let bytes = self.read_bytes(addr, std::mem::size_of::<usize>())?;
        let mut buf = [0u8; std::mem::size_of::<usize>()];
        buf.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(buf))
    }

    /// Store one native word atomically; `addr` must be word-aligned and writable
    fn write_word(&self, addr: Address, value: usize) -> Result<()>;
}
