//! ELF Metadata Parser
//!
//! Reads a loaded image's headers, dynamic section, symbol and string tables, and
//! relocation tables straight from process memory. Every table is fetched with one
//! checked read and decoded from the local copy; nothing is trusted until the header has
//! been validated and every derived address has been checked against the image's load
//! range.
//!
//! Only images of the running process's own class, byte order and machine are accepted,
//! so both ELF32 and ELF64 go through the same code using native-width fields.

use crate::packed_reloc;
use crate::protect::page_size;
use crate::traits::ForeignMemory;
use gothook_common::{Address, AddressRange, Error, RelocKind, Result};
use std::collections::BTreeMap;
use tracing::{debug, trace};

const WORD: usize = std::mem::size_of::<usize>();

#[cfg(target_pointer_width = "64")]
mod layout {
    pub const CLASS: u8 = 2;
    pub const EHDR_SIZE: usize = 64;
    pub const PHDR_SIZE: usize = 56;
    pub const PHDR_OFFSET_FIELD: usize = 8;
    pub const SYM_SIZE: usize = 24;
    pub const INFO_SYM_SHIFT: u32 = 32;
    pub const INFO_TYPE_MASK: usize = 0xffff_ffff;
}

#[cfg(target_pointer_width = "32")]
mod layout {
    pub const CLASS: u8 = 1;
    pub const EHDR_SIZE: usize = 52;
    pub const PHDR_SIZE: usize = 32;
    pub const PHDR_OFFSET_FIELD: usize = 4;
    pub const SYM_SIZE: usize = 16;
    pub const INFO_SYM_SHIFT: u32 = 8;
    pub const INFO_TYPE_MASK: usize = 0xff;
}

use layout::*;

pub const ELF_CLASS: u8 = CLASS;
pub const DYN_SIZE: usize = 2 * WORD;
pub const REL_SIZE: usize = 2 * WORD;
pub const RELA_SIZE: usize = 3 * WORD;

#[cfg(target_endian = "little")]
pub const ELF_DATA: u8 = 1;
#[cfg(target_endian = "big")]
pub const ELF_DATA: u8 = 2;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: isize = 0;
const DT_PLTRELSZ: isize = 2;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;
const DT_RELA: isize = 7;
const DT_RELASZ: isize = 8;
const DT_RELAENT: isize = 9;
const DT_STRSZ: isize = 10;
const DT_SYMENT: isize = 11;
const DT_REL: isize = 17;
const DT_RELSZ: isize = 18;
const DT_RELENT: isize = 19;
const DT_PLTREL: isize = 20;
const DT_JMPREL: isize = 23;
const DT_ANDROID_REL: isize = 0x6000_000f;
const DT_ANDROID_RELSZ: isize = 0x6000_0010;
const DT_ANDROID_RELA: isize = 0x6000_0011;
const DT_ANDROID_RELASZ: isize = 0x6000_0012;

/// Largest table read from one image
const MAX_TABLE_SIZE: usize = 64 << 20;

/// Relocation types the engine rewrites, for one machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocTypes {
    pub machine: u16,
    pub jump_slot: u32,
    pub glob_dat: Option<u32>,
    pub abs: u32,
}

#[cfg(target_arch = "x86_64")]
pub const NATIVE: RelocTypes = RelocTypes {
    machine: 62,
    jump_slot: 7,
    glob_dat: Some(6),
    abs: 1,
};

#[cfg(target_arch = "aarch64")]
pub const NATIVE: RelocTypes = RelocTypes {
    machine: 183,
    jump_slot: 1026,
    glob_dat: Some(1025),
    abs: 257,
};

#[cfg(target_arch = "arm")]
pub const NATIVE: RelocTypes = RelocTypes {
    machine: 40,
    jump_slot: 22,
    glob_dat: Some(21),
    abs: 2,
};

#[cfg(target_arch = "x86")]
pub const NATIVE: RelocTypes = RelocTypes {
    machine: 3,
    jump_slot: 7,
    glob_dat: Some(6),
    abs: 1,
};

#[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))]
pub const NATIVE: RelocTypes = RelocTypes {
    machine: 243,
    jump_slot: 5,
    glob_dat: None,
    #[cfg(target_arch = "riscv64")]
    abs: 2,
    #[cfg(target_arch = "riscv32")]
    abs: 1,
};

/// Which table a relocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Plt,
    Dyn,
}

impl RelocTypes {
    fn classify(&self, table: Table, r_type: u32) -> Option<RelocKind> {
        match table {
            Table::Plt if r_type == self.jump_slot => Some(RelocKind::JumpSlot),
            Table::Dyn if Some(r_type) == self.glob_dat => Some(RelocKind::GlobalData),
            Table::Dyn if r_type == self.abs => Some(RelocKind::Absolute),
            _ => None,
        }
    }
}

/// Split `r_info` into (symbol index, type)
pub fn split_info(info: usize) -> (u32, u32) {
    (
        (info >> INFO_SYM_SHIFT) as u32,
        (info & INFO_TYPE_MASK) as u32,
    )
}

/// One rewritable relocation slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub slot: Address,
    pub sym_index: u32,
    pub kind: RelocKind,
}

/// A referenced dynamic symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynSymbol {
    pub name: String,
    pub index: u32,
}

/// Native-endian field access over a local copy
struct Fields<'a>(&'a [u8]);

impl Fields<'_> {
    fn u16(&self, off: usize) -> u16 {
        u16::from_ne_bytes([self.0[off], self.0[off + 1]])
    }

    fn u32(&self, off: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.0[off..off + 4]);
        u32::from_ne_bytes(buf)
    }

    fn word(&self, off: usize) -> usize {
        let mut buf = [0u8; WORD];
        buf.copy_from_slice(&self.0[off..off + WORD]);
        usize::from_ne_bytes(buf)
    }
}

/// Raw dynamic-section values before normalization
#[derive(Debug, Default)]
struct DynamicInfo {
    strtab: Option<usize>,
    strsz: Option<usize>,
    symtab: Option<usize>,
    syment: Option<usize>,
    jmprel: Option<usize>,
    pltrelsz: usize,
    pltrel: Option<usize>,
    rel: Option<usize>,
    relsz: usize,
    relent: Option<usize>,
    rela: Option<usize>,
    relasz: usize,
    relaent: Option<usize>,
    android_rel: Option<usize>,
    android_relsz: usize,
    android_rela: Option<usize>,
    android_relasz: usize,
}

/// Parsed relocation metadata of one loaded image
#[derive(Debug, Clone)]
pub struct ElfMetadata {
    path: String,
    base: Address,
    bias: usize,
    load_range: AddressRange,
    machine: u16,
    symbols: Vec<DynSymbol>,
    strtab: Vec<u8>,
    relocations: BTreeMap<String, Vec<Relocation>>,
}

struct Parser<'a> {
    mem: &'a dyn ForeignMemory,
    path: &'a str,
    bias: usize,
    load_range: AddressRange,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(self.path, message)
    }

    /// Turn a dynamic-section pointer into an absolute address inside the image
    ///
    /// Some loaders rewrite these entries in place to absolute addresses; others leave
    /// the link-time value and expect the bias to be added.
    fn pointer(&self, value: usize, what: &str) -> Result<Address> {
        let raw = Address::new(value);
        if self.load_range.contains(raw) {
            return Ok(raw);
        }
        match raw.checked_add(self.bias) {
            Some(addr) if self.load_range.contains(addr) => Ok(addr),
            _ => Err(self.error(format!("{} pointer {:#x} outside image", what, value))),
        }
    }

    /// Read a whole table after checking it lies inside the image
    fn table(&self, addr: Address, size: usize, what: &str) -> Result<Vec<u8>> {
        if size > MAX_TABLE_SIZE {
            return Err(self.error(format!("{} size {:#x} too large", what, size)));
        }
        if !self.load_range.covers(addr, size) {
            return Err(self.error(format!("{} at {} runs past the image", what, addr)));
        }
        self.mem.read_bytes(addr, size)
    }
}

impl ElfMetadata {
    /// Parse the image whose ELF header is mapped at `base`
    pub fn parse(mem: &dyn ForeignMemory, base: Address, path: &str) -> Result<Self> {
        let header = mem.read_bytes(base, EHDR_SIZE)?;
        let machine = validate_header(&header, path)?;
        let ehdr = Fields(&header);

        let phoff = ehdr.word(24 + WORD);
        let phentsize = ehdr.u16(30 + 3 * WORD) as usize;
        let phnum = ehdr.u16(32 + 3 * WORD) as usize;
        if phentsize != PHDR_SIZE {
            return Err(Error::parse(path, format!("unexpected phentsize {}", phentsize)));
        }
        if phnum == 0 || phoff == 0 || phoff > page_size() * 16 {
            return Err(Error::parse(path, "missing program headers"));
        }
        let phdr_addr = base
            .checked_add(phoff)
            .ok_or_else(|| Error::parse(path, "program header offset overflows"))?;
        let phdrs = mem.read_bytes(phdr_addr, phnum * PHDR_SIZE)?;

        let (bias, load_range, dynamic) = layout_from_phdrs(&phdrs, phnum, base, path)?;
        let parser = Parser {
            mem,
            path,
            bias,
            load_range,
        };

        let (dyn_vaddr, dyn_size) = dynamic;
        let dyn_addr = Address::new(bias.wrapping_add(dyn_vaddr));
        let dyn_size = dyn_size - dyn_size % DYN_SIZE;
        let dyn_bytes = parser.table(dyn_addr, dyn_size, "dynamic section")?;
        let info = read_dynamic(&dyn_bytes);

        let strtab_addr = parser.pointer(
            info.strtab.ok_or_else(|| parser.error("no DT_STRTAB"))?,
            "DT_STRTAB",
        )?;
        let strsz = info.strsz.ok_or_else(|| parser.error("no DT_STRSZ"))?;
        let symtab_addr = parser.pointer(
            info.symtab.ok_or_else(|| parser.error("no DT_SYMTAB"))?,
            "DT_SYMTAB",
        )?;
        if let Some(syment) = info.syment {
            if syment != SYM_SIZE {
                return Err(parser.error(format!("unexpected DT_SYMENT {}", syment)));
            }
        }
        let strtab = parser.table(strtab_addr, strsz, "string table")?;

        let mut raw = Vec::new();
        collect_tables(&parser, &info, &mut raw)?;

        let max_sym = raw.iter().map(|r| r.sym).max().unwrap_or(0) as usize;
        let symtab = if max_sym == 0 {
            Vec::new()
        } else {
            parser.table(symtab_addr, (max_sym + 1) * SYM_SIZE, "symbol table")?
        };

        let mut meta = ElfMetadata {
            path: path.to_string(),
            base,
            bias,
            load_range,
            machine,
            symbols: Vec::new(),
            strtab,
            relocations: BTreeMap::new(),
        };
        meta.index(&parser, raw, &symtab)?;

        debug!(
            target: "gothook::elf",
            path,
            base = %base,
            bias = format_args!("{:#x}", bias),
            symbols = meta.symbols.len(),
            slots = meta.slot_count(),
            "parsed image"
        );
        Ok(meta)
    }

    fn index(&mut self, parser: &Parser<'_>, raw: Vec<RawReloc>, symtab: &[u8]) -> Result<()> {
        let syms = Fields(symtab);
        let mut names: BTreeMap<u32, Option<String>> = BTreeMap::new();

        for entry in raw {
            if entry.sym == 0 {
                continue;
            }
            let name = match names.get(&entry.sym) {
                Some(name) => name.clone(),
                None => {
                    let st_name = syms.u32(entry.sym as usize * SYM_SIZE) as usize;
                    let name = self.string_at(st_name);
                    names.insert(entry.sym, name.clone());
                    name
                }
            };
            let Some(name) = name else {
                continue;
            };

            let slot = match entry.offset.checked_add(parser.bias) {
                Some(slot) => Address::new(slot),
                None => return Err(parser.error("relocation offset overflows")),
            };
            if !parser.load_range.covers(slot, WORD) {
                return Err(parser.error(format!("relocation slot {} outside image", slot)));
            }
            if !slot.is_aligned(WORD) {
                trace!(target: "gothook::elf", path = parser.path, slot = %slot, "skipping unaligned slot");
                continue;
            }

            self.relocations.entry(name).or_default().push(Relocation {
                slot,
                sym_index: entry.sym,
                kind: entry.kind,
            });
        }

        self.symbols = names
            .into_iter()
            .filter_map(|(index, name)| name.map(|name| DynSymbol { name, index }))
            .collect();
        Ok(())
    }

    /// NUL-terminated string at `offset` in the string table
    fn string_at(&self, offset: usize) -> Option<String> {
        let bytes = self.strtab.get(offset..)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        if end == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Difference between run-time and link-time addresses
    pub fn bias(&self) -> usize {
        self.bias
    }

    pub fn load_range(&self) -> AddressRange {
        self.load_range
    }

    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Referenced dynamic symbols, ordered by symbol index
    pub fn symbols(&self) -> &[DynSymbol] {
        &self.symbols
    }

    /// Names with at least one rewritable slot
    pub fn symbol_names(&self) -> impl Iterator<Item = &str> {
        self.relocations.keys().map(String::as_str)
    }

    /// Rewritable slots referencing `name`
    pub fn relocations_for(&self, name: &str) -> &[Relocation] {
        self.relocations.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All symbol names with their slots
    pub fn relocations(&self) -> impl Iterator<Item = (&str, &[Relocation])> {
        self.relocations
            .iter()
            .map(|(name, relocs)| (name.as_str(), relocs.as_slice()))
    }

    pub fn slot_count(&self) -> usize {
        self.relocations.values().map(Vec::len).sum()
    }

    /// Whether `addr` lies inside this image's loaded range
    pub fn contains(&self, addr: Address) -> bool {
        self.load_range.contains(addr)
    }
}

/// Check the identification bytes and header fields; returns `e_machine`
fn validate_header(header: &[u8], path: &str) -> Result<u16> {
    if &header[..4] != ELF_MAGIC {
        return Err(Error::parse(path, "bad ELF magic"));
    }
    if header[4] != CLASS {
        return Err(Error::parse(path, format!("unsupported class {}", header[4])));
    }
    if header[5] != ELF_DATA {
        return Err(Error::parse(path, format!("unsupported byte order {}", header[5])));
    }
    if header[6] != EV_CURRENT {
        return Err(Error::parse(path, format!("unsupported ident version {}", header[6])));
    }

    let fields = Fields(header);
    let e_type = fields.u16(16);
    let e_machine = fields.u16(18);
    let e_version = fields.u32(20);
    if e_version != EV_CURRENT as u32 {
        return Err(Error::parse(path, format!("unsupported version {}", e_version)));
    }
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(Error::parse(path, format!("unsupported type {}", e_type)));
    }
    if e_machine != NATIVE.machine {
        return Err(Error::parse(path, format!("foreign machine {}", e_machine)));
    }
    Ok(e_machine)
}

/// Load bias, load range and `(p_vaddr, p_memsz)` of `PT_DYNAMIC`
fn layout_from_phdrs(
    phdrs: &[u8],
    phnum: usize,
    base: Address,
    path: &str,
) -> Result<(usize, AddressRange, (usize, usize))> {
    let page = page_size();
    let mut first_load: Option<usize> = None;
    let mut min_vaddr = usize::MAX;
    let mut max_vaddr = 0usize;
    let mut dynamic = None;

    for i in 0..phnum {
        let ph = Fields(&phdrs[i * PHDR_SIZE..(i + 1) * PHDR_SIZE]);
        let p_type = ph.u32(0);
        let p_offset = ph.word(PHDR_OFFSET_FIELD);
        let p_vaddr = ph.word(PHDR_OFFSET_FIELD + WORD);
        let p_memsz = ph.word(PHDR_OFFSET_FIELD + 4 * WORD);

        match p_type {
            PT_LOAD => {
                if p_offset == 0 && first_load.is_none() {
                    first_load = Some(p_vaddr);
                }
                let end = p_vaddr
                    .checked_add(p_memsz)
                    .ok_or_else(|| Error::parse(path, "PT_LOAD overflows"))?;
                min_vaddr = min_vaddr.min(p_vaddr & !(page - 1));
                max_vaddr = max_vaddr.max(end);
            }
            PT_DYNAMIC => dynamic = Some((p_vaddr, p_memsz)),
            _ => {}
        }
    }

    let first_load =
        first_load.ok_or_else(|| Error::parse(path, "no PT_LOAD segment at file offset 0"))?;
    let dynamic = dynamic.ok_or_else(|| Error::parse(path, "no PT_DYNAMIC segment"))?;

    let bias = base.get().wrapping_sub(first_load & !(page - 1));
    let start = bias.wrapping_add(min_vaddr);
    let aligned_end = max_vaddr
        .checked_add(page - 1)
        .ok_or_else(|| Error::parse(path, "load range overflows"))?
        & !(page - 1);
    let end = bias
        .checked_add(aligned_end)
        .ok_or_else(|| Error::parse(path, "load range overflows"))?;
    if end <= start {
        return Err(Error::parse(path, "empty load range"));
    }
    Ok((
        bias,
        AddressRange::new(Address::new(start), Address::new(end)),
        dynamic,
    ))
}

fn read_dynamic(bytes: &[u8]) -> DynamicInfo {
    let mut info = DynamicInfo::default();
    for entry in bytes.chunks_exact(DYN_SIZE) {
        let fields = Fields(entry);
        let tag = fields.word(0) as isize;
        let value = fields.word(WORD);
        match tag {
            DT_NULL => break,
            DT_STRTAB => info.strtab = Some(value),
            DT_STRSZ => info.strsz = Some(value),
            DT_SYMTAB => info.symtab = Some(value),
            DT_SYMENT => info.syment = Some(value),
            DT_JMPREL => info.jmprel = Some(value),
            DT_PLTRELSZ => info.pltrelsz = value,
            DT_PLTREL => info.pltrel = Some(value),
            DT_REL => info.rel = Some(value),
            DT_RELSZ => info.relsz = value,
            DT_RELENT => info.relent = Some(value),
            DT_RELA => info.rela = Some(value),
            DT_RELASZ => info.relasz = value,
            DT_RELAENT => info.relaent = Some(value),
            DT_ANDROID_REL => info.android_rel = Some(value),
            DT_ANDROID_RELSZ => info.android_relsz = value,
            DT_ANDROID_RELA => info.android_rela = Some(value),
            DT_ANDROID_RELASZ => info.android_relasz = value,
            _ => {}
        }
    }
    info
}

/// Relocation before symbol lookup; `offset` is link-time
#[derive(Debug, Clone, Copy)]
struct RawReloc {
    offset: usize,
    sym: u32,
    kind: RelocKind,
}

fn collect_tables(parser: &Parser<'_>, info: &DynamicInfo, out: &mut Vec<RawReloc>) -> Result<()> {
    if let Some(jmprel) = info.jmprel {
        let is_rela = info.pltrel == Some(DT_RELA as usize);
        let addr = parser.pointer(jmprel, "DT_JMPREL")?;
        let bytes = parser.table(addr, info.pltrelsz, "PLT relocations")?;
        decode_table(parser, &bytes, is_rela, Table::Plt, out)?;
    }

    if let Some(rela) = info.rela {
        if info.relaent.is_some_and(|e| e != RELA_SIZE) {
            return Err(parser.error("unexpected DT_RELAENT"));
        }
        let addr = parser.pointer(rela, "DT_RELA")?;
        let bytes = parser.table(addr, info.relasz, "RELA relocations")?;
        decode_table(parser, &bytes, true, Table::Dyn, out)?;
    }

    if let Some(rel) = info.rel {
        if info.relent.is_some_and(|e| e != REL_SIZE) {
            return Err(parser.error("unexpected DT_RELENT"));
        }
        let addr = parser.pointer(rel, "DT_REL")?;
        let bytes = parser.table(addr, info.relsz, "REL relocations")?;
        decode_table(parser, &bytes, false, Table::Dyn, out)?;
    }

    for (table, size, is_rela) in [
        (info.android_rela, info.android_relasz, true),
        (info.android_rel, info.android_relsz, false),
    ] {
        let Some(table) = table else {
            continue;
        };
        let addr = parser.pointer(table, "packed relocations")?;
        let bytes = parser.table(addr, size, "packed relocations")?;
        let packed = packed_reloc::decode(parser.path, &bytes, is_rela)?;
        for reloc in packed {
            push_reloc(reloc.offset, reloc.info, Table::Dyn, out);
        }
    }
    Ok(())
}

fn decode_table(
    parser: &Parser<'_>,
    bytes: &[u8],
    is_rela: bool,
    table: Table,
    out: &mut Vec<RawReloc>,
) -> Result<()> {
    let entsize = if is_rela { RELA_SIZE } else { REL_SIZE };
    if bytes.len() % entsize != 0 {
        return Err(parser.error(format!(
            "relocation table size {:#x} not a multiple of {}",
            bytes.len(),
            entsize
        )));
    }
    for entry in bytes.chunks_exact(entsize) {
        let fields = Fields(entry);
        push_reloc(fields.word(0), fields.word(WORD), table, out);
    }
    Ok(())
}

fn push_reloc(offset: usize, info: usize, table: Table, out: &mut Vec<RawReloc>) {
    let (sym, r_type) = split_info(info);
    if let Some(kind) = NATIVE.classify(table, r_type) {
        out.push(RawReloc { offset, sym, kind });
    }
}
