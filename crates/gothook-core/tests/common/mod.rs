//! Shared fixtures for hook engine integration tests
//!
//! `SyntheticImage` lays out a minimal 64-bit shared object in page-aligned anonymous
//! memory: one PT_LOAD, a dynamic section, two symbols, a JMPREL entry targeting slot 0
//! and a RELA entry targeting slot 1. `SyntheticMaps` serves the real `/proc/self/maps`
//! with extra lines that name those mappings, so the engine sees them as file-backed
//! images.

#![allow(dead_code)]

use gothook_common::{Error, Result};
use gothook_core::elf::{DYN_SIZE, ELF_CLASS, ELF_DATA, NATIVE, RELA_SIZE};
use gothook_core::maps::parse_maps_line;
use gothook_core::MapSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SYM_SIZE: usize = 24;

const DYNAMIC_OFF: usize = 0x100;
const SYMTAB_OFF: usize = 0x200;
const STRTAB_OFF: usize = 0x300;
const JMPREL_OFF: usize = 0x400;
const RELA_OFF: usize = 0x480;
/// Slot 0 (JUMP_SLOT) and slot 1 (GLOB_DAT or ABS)
pub const SLOT_OFF: usize = 0x800;
/// Spare space inside the image, used as a fake lazy-binding stub
pub const STUB_OFF: usize = 0x900;

static TEST_LOCK: Mutex<()> = Mutex::new(());
static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Serialize tests that change page protection
pub fn serial() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Unique path under a synthetic directory
pub fn unique_path(dir: &str, stem: &str) -> String {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    format!("/{}/{}-{}.so", dir, stem, id)
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn map_anonymous(len: usize, prot: i32) -> usize {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(addr, libc::MAP_FAILED, "mmap failed");
    addr as usize
}

fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

fn r_info(sym: u64, r_type: u32) -> u64 {
    (sym << 32) | r_type as u64
}

/// A mapping the fake mapping list names
#[derive(Debug, Clone)]
pub struct Region {
    pub start: usize,
    pub len: usize,
    pub path: String,
    /// Permissions to report instead of the real ones
    pub perms: Option<&'static str>,
}

#[derive(Debug)]
pub struct SyntheticImage {
    pub base: usize,
    pub len: usize,
    pub path: String,
}

impl SyntheticImage {
    /// Build an image importing `symbols[0]` through the PLT and `symbols[1]` through the
    /// GOT, with the slots initialized to `values`
    pub fn build(path: &str, symbols: [&str; 2], values: [usize; 2]) -> Self {
        let len = page_size() * 2;
        let mut img = vec![0u8; len];

        // ELF header
        put(&mut img, 0, b"\x7fELF");
        img[4] = ELF_CLASS;
        img[5] = ELF_DATA;
        img[6] = 1;
        put(&mut img, 16, &3u16.to_ne_bytes());
        put(&mut img, 18, &NATIVE.machine.to_ne_bytes());
        put(&mut img, 20, &1u32.to_ne_bytes());
        put(&mut img, 32, &(EHDR_SIZE as u64).to_ne_bytes());
        put(&mut img, 52, &(EHDR_SIZE as u16).to_ne_bytes());
        put(&mut img, 54, &(PHDR_SIZE as u16).to_ne_bytes());
        put(&mut img, 56, &2u16.to_ne_bytes());

        // PT_LOAD covering the whole image
        let ph = EHDR_SIZE;
        put(&mut img, ph, &1u32.to_ne_bytes());
        put(&mut img, ph + 8, &0u64.to_ne_bytes());
        put(&mut img, ph + 16, &0u64.to_ne_bytes());
        put(&mut img, ph + 40, &(len as u64).to_ne_bytes());

        // PT_DYNAMIC
        let ph = EHDR_SIZE + PHDR_SIZE;
        put(&mut img, ph, &2u32.to_ne_bytes());
        put(&mut img, ph + 8, &(DYNAMIC_OFF as u64).to_ne_bytes());
        put(&mut img, ph + 16, &(DYNAMIC_OFF as u64).to_ne_bytes());
        put(&mut img, ph + 40, &(9 * DYN_SIZE as u64).to_ne_bytes());

        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for name in symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        put(&mut img, STRTAB_OFF, &strtab);

        let dynamic: [(u64, u64); 8] = [
            (5, STRTAB_OFF as u64),
            (10, strtab.len() as u64),
            (6, SYMTAB_OFF as u64),
            (23, JMPREL_OFF as u64),
            (2, RELA_SIZE as u64),
            (20, 7),
            (7, RELA_OFF as u64),
            (8, RELA_SIZE as u64),
        ];
        for (i, (tag, value)) in dynamic.iter().enumerate() {
            put(&mut img, DYNAMIC_OFF + i * DYN_SIZE, &tag.to_ne_bytes());
            put(&mut img, DYNAMIC_OFF + i * DYN_SIZE + 8, &value.to_ne_bytes());
        }

        for (i, offset) in name_offsets.iter().enumerate() {
            put(&mut img, SYMTAB_OFF + (i + 1) * SYM_SIZE, &offset.to_ne_bytes());
        }

        put(&mut img, JMPREL_OFF, &(SLOT_OFF as u64).to_ne_bytes());
        put(&mut img, JMPREL_OFF + 8, &r_info(1, NATIVE.jump_slot).to_ne_bytes());
        let dyn_type = NATIVE.glob_dat.unwrap_or(NATIVE.abs);
        put(&mut img, RELA_OFF, &((SLOT_OFF + 8) as u64).to_ne_bytes());
        put(&mut img, RELA_OFF + 8, &r_info(2, dyn_type).to_ne_bytes());

        let base = map_anonymous(len, libc::PROT_READ | libc::PROT_WRITE);
        unsafe { std::ptr::copy_nonoverlapping(img.as_ptr(), base as *mut u8, len) };

        let image = Self {
            base,
            len,
            path: path.to_string(),
        };
        image.write_slot(0, values[0]);
        image.write_slot(1, values[1]);
        image
    }

    /// Image with two symbols that do not exist anywhere in the process
    pub fn demo(path: &str) -> Self {
        Self::build(path, ["demo_open", "demo_close"], [ORIGINAL_OPEN, ORIGINAL_CLOSE])
    }

    pub fn slot_addr(&self, index: usize) -> usize {
        self.base + SLOT_OFF + index * 8
    }

    pub fn read_slot(&self, index: usize) -> usize {
        unsafe { std::ptr::read_volatile(self.slot_addr(index) as *const usize) }
    }

    /// Requires the slot page to be writable
    pub fn write_slot(&self, index: usize, value: usize) {
        unsafe { std::ptr::write_volatile(self.slot_addr(index) as *mut usize, value) };
    }

    pub fn protect(&self, prot: i32) {
        let rc = unsafe { libc::mprotect(self.base as *mut libc::c_void, self.len, prot) };
        assert_eq!(rc, 0, "mprotect failed");
    }

    /// Overwrite raw bytes of the image; requires it to be writable
    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), (self.base + offset) as *mut u8, bytes.len())
        };
    }

    pub fn region(&self) -> Region {
        Region {
            start: self.base,
            len: self.len,
            path: self.path.clone(),
            perms: None,
        }
    }
}

/// Values outside every synthetic image
pub const ORIGINAL_OPEN: usize = 0x0000_1000_0000_1110;
pub const ORIGINAL_CLOSE: usize = 0x0000_1000_0000_2220;

/// An inaccessible page the fake mapping list claims is a readable image
pub fn broken_region(path: &str) -> Region {
    let start = map_anonymous(page_size(), libc::PROT_NONE);
    Region {
        start,
        len: page_size(),
        path: path.to_string(),
        perms: Some("r--p"),
    }
}

/// Holds every mapping-list read until opened
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

/// Real mapping list decorated with synthetic image lines
#[derive(Default)]
pub struct SyntheticMaps {
    regions: Mutex<Vec<Region>>,
    reads: AtomicUsize,
    gate: Option<Arc<Gate>>,
}

impl SyntheticMaps {
    pub fn new(regions: Vec<Region>) -> Arc<Self> {
        Arc::new(Self {
            regions: Mutex::new(regions),
            ..Default::default()
        })
    }

    pub fn gated(regions: Vec<Region>, gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            regions: Mutex::new(regions),
            reads: AtomicUsize::new(0),
            gate: Some(gate),
        })
    }

    pub fn source(self: &Arc<Self>) -> Box<dyn MapSource> {
        Box::new(SharedMaps(self.clone()))
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn add(&self, region: Region) {
        self.regions.lock().unwrap().push(region);
    }

    pub fn remove(&self, path: &str) {
        self.regions.lock().unwrap().retain(|r| r.path != path);
    }

    fn render(&self) -> Result<String> {
        let real = std::fs::read_to_string("/proc/self/maps")
            .map_err(|e| Error::Maps(e.to_string()))?;
        let mut out = real.clone();
        let regions = self.regions.lock().unwrap().clone();

        for region in &regions {
            let end = region.start + region.len;
            for segment in real.lines().filter_map(parse_maps_line) {
                let s = segment.range.start.get().max(region.start);
                let e = segment.range.end.get().min(end);
                if s >= e {
                    continue;
                }
                let perms = match region.perms {
                    Some(perms) => perms.to_string(),
                    None => format!("{}p", segment.protection),
                };
                out.push_str(&format!(
                    "{:x}-{:x} {} {:08x} 00:00 0 {}\n",
                    s,
                    e,
                    perms,
                    s - region.start,
                    region.path
                ));
            }
        }
        Ok(out)
    }
}

struct SharedMaps(Arc<SyntheticMaps>);

impl MapSource for SharedMaps {
    fn read_maps(&self) -> Result<String> {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.0.gate {
            gate.wait();
        }
        self.0.render()
    }
}
