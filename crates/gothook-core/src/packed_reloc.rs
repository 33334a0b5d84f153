//! Android packed relocation decoder (`APS2`)
//!
//! The table is a `APS2` magic followed by a stream of SLEB128 numbers: the relocation
//! count, the initial offset, then groups of relocations that share some of their
//! fields.

use gothook_common::{Error, Result};

const MAGIC: &[u8; 4] = b"APS2";

const GROUPED_BY_INFO: u64 = 1;
const GROUPED_BY_OFFSET_DELTA: u64 = 2;
const GROUPED_BY_ADDEND: u64 = 4;
const GROUP_HAS_ADDEND: u64 = 8;

/// Upper bound on relocations accepted from one table
const MAX_RELOCATIONS: u64 = 1 << 24;

/// One decoded relocation, fields at native width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedRelocation {
    pub offset: usize,
    pub info: usize,
    pub addend: isize,
}

struct Sleb128<'a> {
    path: &'a str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Sleb128<'a> {
    fn new(path: &'a str, data: &'a [u8]) -> Self {
        Self { path, data, pos: 0 }
    }

    fn next(&mut self) -> Result<i64> {
        let mut value: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| malformed(self.path, "truncated SLEB128 stream"))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(malformed(self.path, "SLEB128 value too wide"));
            }
            value |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
        }
    }
}

fn malformed(path: &str, message: &str) -> Error {
    Error::parse(path, format!("packed relocations: {}", message))
}

/// Decode an `APS2` table of the image at `path`; `is_rela` selects whether addends may
/// be present
pub fn decode(path: &str, data: &[u8], is_rela: bool) -> Result<Vec<PackedRelocation>> {
    if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(malformed(path, "missing APS2 magic"));
    }
    let mut stream = Sleb128::new(path, &data[MAGIC.len()..]);

    let count = stream.next()? as u64;
    if count > MAX_RELOCATIONS {
        return Err(malformed(path, "relocation count out of range"));
    }
    let mut offset = stream.next()? as usize;
    let mut info = 0usize;
    let mut addend = 0isize;
    // Every relocation takes at least one byte of the stream.
    let mut out = Vec::with_capacity((count as usize).min(data.len()));

    while (out.len() as u64) < count {
        let group_size = stream.next()? as u64;
        let flags = stream.next()? as u64;
        if group_size == 0 || group_size > count - out.len() as u64 {
            return Err(malformed(path, "group size out of range"));
        }

        let offset_delta = if flags & GROUPED_BY_OFFSET_DELTA != 0 {
            Some(stream.next()? as usize)
        } else {
            None
        };
        if flags & GROUPED_BY_INFO != 0 {
            info = stream.next()? as usize;
        }
        let has_addend = flags & GROUP_HAS_ADDEND != 0;
        if has_addend && !is_rela {
            return Err(malformed(path, "addend in a REL table"));
        }
        if has_addend && flags & GROUPED_BY_ADDEND != 0 {
            addend = addend.wrapping_add(stream.next()? as isize);
        } else if !has_addend {
            addend = 0;
        }

        for _ in 0..group_size {
            offset = match offset_delta {
                Some(delta) => offset.wrapping_add(delta),
                None => offset.wrapping_add(stream.next()? as usize),
            };
            if flags & GROUPED_BY_INFO == 0 {
                info = stream.next()? as usize;
            }
            if has_addend && flags & GROUPED_BY_ADDEND == 0 {
                addend = addend.wrapping_add(stream.next()? as isize);
            }
            out.push(PackedRelocation {
                offset,
                info,
                addend,
            });
        }
    }

    Ok(out)
}
