//! Memory-related types

use serde::{Deserialize, Serialize};

/// An address inside this process's address space
///
/// Opaque on purpose: only the ELF parser and the patch applier turn it back into a
/// pointer, and only through the checked accessors of the fault guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, offset: usize) -> Option<Address> {
        self.0.checked_add(offset).map(Address)
    }

    pub fn is_aligned(self, align: usize) -> bool {
        align != 0 && self.0 % align == 0
    }

    /// Round down to the start of the page containing this address
    pub fn page_start(self, page_size: usize) -> Address {
        Address(self.0 & !(page_size - 1))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Address(value)
    }
}

/// Half-open address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.get().saturating_sub(self.start.get())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Whether `[addr, addr + len)` lies entirely inside this range
    pub fn covers(&self, addr: Address, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }
}

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const READ_WRITE: Protection = Protection {
        read: true,
        write: true,
        execute: false,
    };

    pub fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }

    /// Parse the first three characters of a mapping permission field (`r-xp`)
    pub fn from_perms(perms: &str) -> Option<Self> {
        let bytes = perms.as_bytes();
        if bytes.len() < 3 {
            return None;
        }
        let flag = |b: u8, set: u8| -> Option<bool> {
            match b {
                b'-' => Some(false),
                _ if b == set => Some(true),
                _ => None,
            }
        };
        Some(Self {
            read: flag(bytes[0], b'r')?,
            write: flag(bytes[1], b'w')?,
            execute: flag(bytes[2], b'x')?,
        })
    }

    /// Flags for `mprotect`
    pub fn to_prot_flags(self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.execute {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    /// Keep only the flags present in both
    pub fn intersect(self, other: Protection) -> Protection {
        Protection {
            read: self.read && other.read,
            write: self.write && other.write,
            execute: self.execute && other.execute,
        }
    }

    pub fn with_write(self) -> Protection {
        Protection {
            write: true,
            ..self
        }
    }
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}
