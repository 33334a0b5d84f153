//! Image Map Reader
//!
//! Parses the live mapping list into segments and candidate images, and keeps the last
//! snapshot around for protection lookups. A lookup the cached snapshot cannot answer
//! triggers a fresh snapshot before giving up.

use crate::traits::MapSource;
use gothook_common::{
    Address, AddressRange, Error, ImageIdentity, ImageRecord, MapSegment, Protection, Result,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

const DELETED_SUFFIX: &str = " (deleted)";

/// Reads the mapping list from a procfs file
#[derive(Debug, Clone)]
pub struct ProcMaps {
    path: PathBuf,
}

impl ProcMaps {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ProcMaps {
    fn default() -> Self {
        Self::new("/proc/self/maps")
    }
}

impl MapSource for ProcMaps {
    fn read_maps(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Maps(format!("Failed to read {}: {}", self.path.display(), e)))
    }
}

/// Parse one mapping line; `None` for malformed lines
///
/// Format: `start-end perms offset major:minor inode [path]`
pub fn parse_maps_line(line: &str) -> Option<MapSegment> {
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    let path = fields.next().map(str::trim).unwrap_or("");

    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if end <= start {
        return None;
    }

    let protection = Protection::from_perms(perms)?;
    let private = perms.as_bytes().get(3) == Some(&b'p');
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let (major, minor) = dev.split_once(':')?;
    let major = u32::from_str_radix(major, 16).ok()?;
    let minor = u32::from_str_radix(minor, 16).ok()?;
    let inode = inode.parse::<u64>().ok()?;

    Some(MapSegment {
        range: AddressRange::new(Address::new(start), Address::new(end)),
        protection,
        private,
        offset,
        dev: libc::makedev(major, minor) as u64,
        inode,
        path: if path.is_empty() {
            None
        } else {
            Some(path.to_string())
        },
    })
}

/// Whether a segment can start a candidate image
fn is_image_start(segment: &MapSegment) -> bool {
    let Some(path) = segment.path.as_deref() else {
        return false;
    };
    segment.protection.read
        && segment.private
        && segment.offset == 0
        && !segment.is_pseudo()
        && !path.ends_with(DELETED_SUFFIX)
}

/// Resolve a mapping path to its canonical on-disk form when it exists
fn normalize_path(path: &str, memo: &mut HashMap<String, String>) -> String {
    if !path.starts_with('/') || path.ends_with(DELETED_SUFFIX) {
        return path.to_string();
    }
    memo.entry(path.to_string())
        .or_insert_with(|| match std::fs::canonicalize(path) {
            Ok(canonical) => canonical.to_string_lossy().into_owned(),
            Err(_) => path.to_string(),
        })
        .clone()
}

/// One parsed view of the mapping list
#[derive(Debug, Clone, Default)]
pub struct MapsSnapshot {
    segments: Vec<MapSegment>,
    images: Vec<ImageRecord>,
}

impl MapsSnapshot {
    /// Parse a full mapping list, skipping lines that do not parse
    pub fn parse(content: &str) -> Self {
        let mut memo = HashMap::new();
        let mut segments = Vec::new();
        let mut skipped = 0usize;

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match parse_maps_line(line) {
                Some(mut segment) => {
                    segment.path = segment
                        .path
                        .as_deref()
                        .map(|p| normalize_path(p, &mut memo));
                    segments.push(segment);
                }
                None => {
                    skipped += 1;
                    trace!(target: "gothook::maps", line, "skipping malformed mapping line");
                }
            }
        }
        segments.sort_by_key(|s| s.range.start);

        let images = Self::collect_images(&segments);
        debug!(
            target: "gothook::maps",
            segments = segments.len(),
            images = images.len(),
            skipped,
            "mapping snapshot taken"
        );
        Self { segments, images }
    }

    fn collect_images(segments: &[MapSegment]) -> Vec<ImageRecord> {
        let mut images = Vec::new();
        for (index, head) in segments.iter().enumerate() {
            if !is_image_start(head) {
                continue;
            }
            let Some(path) = head.path.clone() else {
                continue;
            };

            // The image spans every following mapping of the same file until the file
            // is mapped again from offset 0.
            let mut owned = vec![head.clone()];
            for segment in &segments[index + 1..] {
                if segment.path.as_deref() != Some(path.as_str()) {
                    continue;
                }
                if segment.offset == 0 {
                    break;
                }
                owned.push(segment.clone());
            }

            images.push(ImageRecord {
                identity: ImageIdentity {
                    path,
                    dev: head.dev,
                    inode: head.inode,
                },
                base: head.range.start,
                segments: owned,
            });
        }
        images
    }

    pub fn segments(&self) -> &[MapSegment] {
        &self.segments
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.images
    }

    /// Protection of `[addr, addr + len)`, intersected over every mapping of `path` that
    /// covers it; `None` if the range is not fully covered
    pub fn protection_of(&self, addr: Address, len: usize, path: &str) -> Option<Protection> {
        let end = addr.checked_add(len.max(1))?;
        let mut cursor = addr;
        let mut protection: Option<Protection> = None;

        for segment in self
            .segments
            .iter()
            .filter(|s| s.path.as_deref() == Some(path))
        {
            if segment.range.end <= cursor {
                continue;
            }
            if !segment.range.contains(cursor) {
                // Gap before the next mapping of this file.
                return None;
            }
            protection = Some(match protection {
                None => segment.protection,
                Some(p) => p.intersect(segment.protection),
            });
            cursor = segment.range.end;
            if cursor >= end {
                return protection;
            }
        }
        None
    }
}

/// Mapping list reader with a lazily refreshed snapshot cache
pub struct MapsReader {
    source: Box<dyn MapSource>,
    cache: RwLock<Option<Arc<MapsSnapshot>>>,
}

impl MapsReader {
    pub fn new(source: Box<dyn MapSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// Reader over `/proc/self/maps`
    pub fn proc_self() -> Self {
        Self::new(Box::new(ProcMaps::default()))
    }

    /// Take a fresh snapshot and make it the cached one
    pub fn snapshot(&self) -> Result<Arc<MapsSnapshot>> {
        let content = self.source.read_maps()?;
        let snapshot = Arc::new(MapsSnapshot::parse(&content));
        *self.cache.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Cached snapshot, taking one if none exists
    pub fn cached(&self) -> Result<Arc<MapsSnapshot>> {
        if let Some(snapshot) = self.cache.read().as_ref() {
            return Ok(snapshot.clone());
        }
        self.snapshot()
    }

    /// Drop the cached snapshot
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    /// Current protection of a range belonging to the file at `path`
    pub fn get_protection(&self, addr: Address, len: usize, path: &str) -> Result<Protection> {
        if let Some(protection) = self.cached()?.protection_of(addr, len, path) {
            return Ok(protection);
        }

        trace!(target: "gothook::maps", addr = %addr, len, path, "protection cache miss");
        if let Some(protection) = self.snapshot()?.protection_of(addr, len, path) {
            return Ok(protection);
        }

        Err(Error::Protection {
            address: addr.get(),
            message: format!("range of {} bytes not mapped from {}", len, path),
        })
    }
}

impl std::fmt::Debug for MapsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapsReader")
            .field("cached", &self.cache.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const SAMPLE: &str = "\
5580a000-5580b000 r--p 00000000 fd:01 1001                       /nonexistent/bin/demo
5580b000-5580d000 r-xp 00001000 fd:01 1001                       /nonexistent/bin/demo
5580d000-5580e000 r--p 00003000 fd:01 1001                       /nonexistent/bin/demo
5580e000-5580f000 rw-p 00004000 fd:01 1001                       /nonexistent/bin/demo
7f0000000000-7f0000001000 rw-p 00000000 00:00 0
7f1000000000-7f1000002000 r--p 00000000 fd:01 2002                       /nonexistent/lib/libgone.so (deleted)
7f2000000000-7f2000001000 r--s 00000000 fd:01 3003                       /nonexistent/lib/libshared.so
7f3000000000-7f3000001000 r-xp 00000000 00:00 0                          [vdso]
this line is garbage
7f4000000000-7f4000001000 ---p 00000000 fd:01 4004                       /nonexistent/lib/libguard.so
";

    struct StaticMaps(Mutex<String>);

    impl MapSource for StaticMaps {
        fn read_maps(&self) -> Result<String> {
            Ok(self.0.lock().clone())
        }
    }

    #[test]
    fn test_parse_line() {
        let segment = parse_maps_line(
            "7f9a1c200000-7f9a1c228000 r--p 00000000 08:02 1835082    /usr/lib/libc.so.6",
        )
        .unwrap();
        assert_eq!(segment.range.start, Address::new(0x7f9a1c200000));
        assert_eq!(segment.range.len(), 0x28000);
        assert!(segment.protection.read);
        assert!(!segment.protection.write);
        assert!(segment.private);
        assert_eq!(segment.offset, 0);
        assert_eq!(segment.inode, 1835082);
        assert_eq!(segment.path.as_deref(), Some("/usr/lib/libc.so.6"));
    }

    #[test]
    fn test_parse_line_anonymous_and_malformed() {
        let anon = parse_maps_line("7f0000000000-7f0000001000 rw-p 00000000 00:00 0").unwrap();
        assert!(anon.path.is_none());
        assert!(parse_maps_line("garbage").is_none());
        assert!(parse_maps_line("2000-1000 r--p 00000000 00:00 0").is_none());
        assert!(parse_maps_line("1000-2000 rq-p 00000000 00:00 0").is_none());
    }

    #[test]
    fn test_path_with_spaces() {
        let segment =
            parse_maps_line("1000-2000 r--p 00000000 fd:01 9  /data/app/My App/lib.so").unwrap();
        assert_eq!(segment.path.as_deref(), Some("/data/app/My App/lib.so"));
    }

    #[test]
    fn test_snapshot_images() {
        let snapshot = MapsSnapshot::parse(SAMPLE);
        assert_eq!(snapshot.segments().len(), 9);

        let images = snapshot.images();
        assert_eq!(images.len(), 1);
        let demo = &images[0];
        assert_eq!(demo.path(), "/nonexistent/bin/demo");
        assert_eq!(demo.base, Address::new(0x5580a000));
        assert_eq!(demo.segments.len(), 4);
        assert_eq!(demo.identity.inode, 1001);
        assert_eq!(demo.mapped_range().end, Address::new(0x5580f000));
    }

    #[test]
    fn test_protection_intersection() {
        let snapshot = MapsSnapshot::parse(SAMPLE);
        let path = "/nonexistent/bin/demo";

        let text = snapshot
            .protection_of(Address::new(0x5580b100), 8, path)
            .unwrap();
        assert_eq!(text, Protection::new(true, false, true));

        // Straddles r-x and r--
        let straddle = snapshot
            .protection_of(Address::new(0x5580cffc), 8, path)
            .unwrap();
        assert_eq!(straddle, Protection::new(true, false, false));

        assert!(snapshot
            .protection_of(Address::new(0x5580f000), 8, path)
            .is_none());
        assert!(snapshot
            .protection_of(Address::new(0x5580b100), 8, "/other")
            .is_none());
    }

    #[test]
    fn test_reader_resnapshots_on_miss() {
        let source = Box::new(StaticMaps(Mutex::new(SAMPLE.to_string())));
        let reader = MapsReader::new(source);
        reader.snapshot().unwrap();

        let err = reader
            .get_protection(Address::new(0x9000_0000), 8, "/nonexistent/lib/libnew.so")
            .unwrap_err();
        assert!(matches!(err, Error::Protection { .. }));
    }

    #[test]
    fn test_reader_picks_up_new_mapping() {
        let maps = Arc::new(Mutex::new(SAMPLE.to_string()));

        struct Shared(Arc<Mutex<String>>);
        impl MapSource for Shared {
            fn read_maps(&self) -> Result<String> {
                Ok(self.0.lock().clone())
            }
        }

        let reader = MapsReader::new(Box::new(Shared(maps.clone())));
        reader.snapshot().unwrap();

        maps.lock().push_str(
            "90000000-90001000 rw-p 00000000 fd:01 5005  /nonexistent/lib/libnew.so\n",
        );
        let protection = reader
            .get_protection(Address::new(0x9000_0010), 8, "/nonexistent/lib/libnew.so")
            .unwrap();
        assert_eq!(protection, Protection::READ_WRITE);
        assert_eq!(reader.cached().unwrap().images().len(), 2);
    }

    #[test]
    fn test_proc_self_maps_is_readable() {
        let reader = MapsReader::proc_self();
        let snapshot = reader.snapshot().unwrap();
        assert!(!snapshot.segments().is_empty());
        assert!(!snapshot.images().is_empty());
    }

    #[test]
    fn test_missing_maps_file() {
        let err = ProcMaps::new("/nonexistent/maps").read_maps().unwrap_err();
        assert!(matches!(err, Error::Maps(_)));
    }
}
