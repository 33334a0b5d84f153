//! Loaded image types

use crate::types::memory::{Address, AddressRange, Protection};
use serde::{Deserialize, Serialize};

/// One line of the process mapping list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSegment {
    pub range: AddressRange,
    pub protection: Protection,
    /// Private (copy-on-write) rather than shared mapping
    pub private: bool,
    /// Offset of the mapping in the backing file
    pub offset: u64,
    pub dev: u64,
    pub inode: u64,
    /// Normalized backing path, `None` for anonymous mappings
    pub path: Option<String>,
}

impl MapSegment {
    /// Pseudo-paths such as `[vdso]` or `[stack]`
    pub fn is_pseudo(&self) -> bool {
        self.path.as_deref().is_some_and(|p| p.starts_with('['))
    }
}

/// Stable identity of a loaded image across refresh passes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageIdentity {
    pub path: String,
    pub dev: u64,
    pub inode: u64,
}

impl std::fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:x}:{})", self.path, self.dev, self.inode)
    }
}

/// A candidate image built from one mapping snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub identity: ImageIdentity,
    /// Start of the file-offset-0 mapping, where the ELF header lives
    pub base: Address,
    pub segments: Vec<MapSegment>,
}

impl ImageRecord {
    pub fn path(&self) -> &str {
        &self.identity.path
    }

    /// Span from the lowest to the highest mapped address of this image
    pub fn mapped_range(&self) -> AddressRange {
        let start = self
            .segments
            .iter()
            .map(|s| s.range.start)
            .min()
            .unwrap_or(self.base);
        let end = self
            .segments
            .iter()
            .map(|s| s.range.end)
            .max()
            .unwrap_or(self.base);
        AddressRange::new(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: usize, end: usize, perms: &str, path: Option<&str>) -> MapSegment {
        MapSegment {
            range: AddressRange::new(Address::new(start), Address::new(end)),
            protection: Protection::from_perms(perms).unwrap(),
            private: true,
            offset: 0,
            dev: 0xfd01,
            inode: 42,
            path: path.map(str::to_string),
        }
    }

    #[test]
    fn test_pseudo_paths() {
        assert!(segment(0, 0x1000, "r-x", Some("[vdso]")).is_pseudo());
        assert!(!segment(0, 0x1000, "r-x", Some("/lib/libc.so.6")).is_pseudo());
        assert!(!segment(0, 0x1000, "rw-", None).is_pseudo());
    }

    #[test]
    fn test_mapped_range() {
        let image = ImageRecord {
            identity: ImageIdentity {
                path: "/lib/libdemo.so".into(),
                dev: 0xfd01,
                inode: 42,
            },
            base: Address::new(0x10000),
            segments: vec![
                segment(0x10000, 0x11000, "r--", Some("/lib/libdemo.so")),
                segment(0x11000, 0x13000, "r-x", Some("/lib/libdemo.so")),
                segment(0x13000, 0x14000, "rw-", Some("/lib/libdemo.so")),
            ],
        };
        let range = image.mapped_range();
        assert_eq!(range.start, Address::new(0x10000));
        assert_eq!(range.end, Address::new(0x14000));
        assert_eq!(image.path(), "/lib/libdemo.so");
    }

    #[test]
    fn test_identity_display() {
        let id = ImageIdentity {
            path: "/lib/libm.so.6".into(),
            dev: 0x803,
            inode: 1234,
        };
        assert_eq!(id.to_string(), "/lib/libm.so.6 (803:1234)");
    }
}
