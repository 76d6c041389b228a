//! Decodes a CPython bytecode-offset-to-source-location table.
//!
//! Three dialects are supported, selected by the target's version descriptor.
//! This is a direct translation of `original_source/src/frame.h`'s
//! `_read_varint`/`_read_signed_varint`/`_frame_remote` — the teacher's
//! `stack_trace.rs::get_line_number` only implements the pre-3.11 `lnotab`
//! forms, so the 3.11+ compact-table dialect here has no teacher
//! counterpart and is grounded entirely on the original C source.

/// A resolved bytecode location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub line_end: u32,
    pub column: u32,
    pub column_end: u32,
}

/// A cached frame record: `{ key, filename_ref, scope_ref, line, line_end, column, column_end }`.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub key: u64,
    pub filename_ref: u64,
    pub scope_ref: u64,
    pub location: Location,
}

/// A cached code record: `{ key = code_remote_address, filename_ref, scope_ref, line_table_bytes, first_line }`.
#[derive(Debug, Clone)]
pub struct CodeRecord {
    pub key: u64,
    pub filename_ref: u64,
    pub scope_ref: u64,
    pub line_table: Vec<u8>,
    pub first_line: u32,
}

/// `((code_remote_address & 0xFFFF_FFFF) << 16) | lasti`, exactly the
/// original's `py_frame_key` macro.
pub fn frame_key(code_raddr: u64, lasti: i64) -> u64 {
    ((code_raddr & 0xFFFF_FFFF) << 16) | (lasti as u64 & 0xFFFF)
}

/// Reads an unsigned continuation-encoded varint starting at `*i` (which is
/// pre-incremented, matching the original's `lnotab[++*i]` idiom) and leaves
/// `*i` at the last byte consumed.
fn read_varint(table: &[u8], i: &mut usize) -> u32 {
    *i += 1;
    let mut val = (table[*i] & 63) as u32;
    let mut shift = 0;
    while table[*i] & 64 != 0 {
        shift += 6;
        *i += 1;
        val |= ((table[*i] & 63) as u32) << shift;
    }
    val
}

fn read_signed_varint(table: &[u8], i: &mut usize) -> i32 {
    let val = read_varint(table, i) as i32;
    if val & 1 != 0 {
        -(val >> 1)
    } else {
        val >> 1
    }
}

/// Decode the 3.11+ compact-locations table, producing the location in
/// effect at `lasti`.
fn decode_compact(table: &[u8], first_line: u32, lasti: i64) -> anyhow::Result<Location> {
    if table.is_empty() {
        anyhow::bail!("empty code location table");
    }

    let mut lineno = first_line as i64;
    let mut line_end = 0u32;
    let mut column = 0u32;
    let mut column_end = 0u32;

    let mut i = 0usize;
    let mut bc: i64 = 0;
    while i < table.len() {
        bc += ((table[i] & 7) + 1) as i64;
        let code = (table[i] >> 3) & 15;
        match code {
            15 => {}
            14 => {
                // Long form.
                lineno += read_signed_varint(table, &mut i) as i64;
                line_end = (lineno + read_varint(table, &mut i) as i64) as u32;
                column = read_varint(table, &mut i);
                column_end = read_varint(table, &mut i);
            }
            13 => {
                // No column data.
                lineno += read_signed_varint(table, &mut i) as i64;
                line_end = lineno as u32;
                column = 0;
                column_end = 0;
            }
            10..=12 => {
                lineno += (code as i64) - 10;
                line_end = lineno as u32;
                i += 1;
                column = 1 + table[i] as u32;
                i += 1;
                column_end = 1 + table[i] as u32;
            }
            _ => {
                i += 1;
                let next_byte = table[i];
                line_end = lineno as u32;
                column = 1 + ((code as u32) << 3) + ((next_byte as u32 >> 4) & 7);
                column_end = column + (next_byte as u32 & 15);
            }
        }

        if bc > lasti {
            break;
        }
        i += 1;
    }

    Ok(Location {
        line: lineno as u32,
        line_end,
        column,
        column_end,
    })
}

/// Decode the 3.10 `co_lnotab` dialect (`lasti` scaled by 2, terminator byte
/// `0xFF`, signed 8-bit line deltas).
fn decode_lnotab_310(table: &[u8], first_line: u32, lasti: i64) -> Location {
    let mut lineno = first_line as i64;
    let lasti = lasti << 1;
    let mut bc: i64 = 0;
    let mut i = 0usize;
    while i < table.len() {
        let sdelta = table[i] as i64;
        i += 1;
        if sdelta == 0xff {
            break;
        }
        bc += sdelta;

        let ldelta = table.get(i).copied().unwrap_or(0) as i64;
        let ldelta = if ldelta == 0x80 {
            0
        } else {
            if ldelta > 0x80 {
                lineno -= 0x100;
            }
            ldelta
        };
        i += 1;
        lineno += ldelta;

        if bc > lasti {
            break;
        }
    }
    Location {
        line: lineno as u32,
        line_end: lineno as u32,
        column: 0,
        column_end: 0,
    }
}

/// Decode the pre-3.10 `co_lnotab` dialect: same pair encoding, but `lasti`
/// is not scaled.
fn decode_lnotab_legacy(table: &[u8], first_line: u32, lasti: i64) -> Location {
    let mut lineno = first_line as i64;
    let mut bc: i64 = 0;
    let mut i = 0usize;
    while i < table.len() {
        bc += table[i] as i64;
        i += 1;
        if bc > lasti {
            break;
        }
        if i >= table.len() {
            break;
        }
        let delta = table[i] as i64;
        if delta >= 0x80 {
            lineno -= 0x100;
        }
        lineno += delta;
        i += 1;
    }
    Location {
        line: lineno as u32,
        line_end: lineno as u32,
        column: 0,
        column_end: 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Compact311,
    Lnotab310,
    LnotabLegacy,
}

impl Dialect {
    pub fn for_version(major: u64, minor: u64) -> Dialect {
        if (major, minor) >= (3, 11) {
            Dialect::Compact311
        } else if (major, minor) >= (3, 10) {
            Dialect::Lnotab310
        } else {
            Dialect::LnotabLegacy
        }
    }
}

pub fn decode(dialect: Dialect, table: &[u8], first_line: u32, lasti: i64) -> anyhow::Result<Location> {
    if table.is_empty() {
        anyhow::bail!("invalid code location table");
    }
    match dialect {
        Dialect::Compact311 => decode_compact(table, first_line, lasti),
        Dialect::Lnotab310 => Ok(decode_lnotab_310(table, first_line, lasti)),
        Dialect::LnotabLegacy => Ok(decode_lnotab_legacy(table, first_line, lasti)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_key_matches_original_macro() {
        // code & 0xFFFFFFFF shifted left 16, or lasti.
        assert_eq!(frame_key(0x1_0000_0004, 30), (0x4u64 << 16) | 30);
    }

    #[test]
    fn legacy_lnotab_tracks_line_increments() {
        // lnotab [0,1,10,1,8,1,4,1] starting at firstlineno 3, expect lineno 7 at lasti 30.
        let lnotab = [0u8, 1, 10, 1, 8, 1, 4, 1];
        let loc = decode_lnotab_legacy(&lnotab, 3, 30);
        assert_eq!(loc.line, 7);
    }

    #[test]
    fn compact_dialect_no_location_record() {
        // code 15 (no location) with bc_delta 1 should leave the base line untouched.
        let table = [(15u8 << 3) | 0];
        let loc = decode_compact(&table, 10, 0).unwrap();
        assert_eq!(loc.line, 10);
    }

    #[test]
    fn compact_dialect_implicit_line_delta_form() {
        // code 11 => lineno += 1, followed by two raw column bytes.
        let table = [(11u8 << 3) | 0, 4, 9];
        let loc = decode_compact(&table, 10, 0).unwrap();
        assert_eq!(loc.line, 11);
        assert_eq!(loc.column, 5);
        assert_eq!(loc.column_end, 10);
    }

    #[test]
    fn dialect_selection_by_version() {
        assert_eq!(Dialect::for_version(3, 9), Dialect::LnotabLegacy);
        assert_eq!(Dialect::for_version(3, 10), Dialect::Lnotab310);
        assert_eq!(Dialect::for_version(3, 11), Dialect::Compact311);
        assert_eq!(Dialect::for_version(3, 13), Dialect::Compact311);
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(decode(Dialect::Compact311, &[], 1, 0).is_err());
    }
}
