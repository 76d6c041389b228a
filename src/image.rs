//! Parses the on-disk image of a target's Python binary (and, where present,
//! its `libpython` shared library) to locate the BSS region, an optional
//! `.PyRuntime` section, and a small closed set of well-known symbols.
//!
//! Grounded on the teacher's `binary_parser.rs` (goblin-based ELF/PE/Mach-O
//! handling) and `python_process_info.rs` (the main-binary/libpython split,
//! docker path rewriting, OSX dyld fallback). Unlike the teacher, which
//! inserts every symbol from the object file into a `HashMap<String, u64>`,
//! this module only classifies the handful of names the locator needs
//! (`SPEC_FULL.md` §9, "Symbol matching": an order-sensitive closed table,
//! not a linear `strcmp` scan at use time).

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use goblin::Object;
use memmap2::Mmap;

use crate::error::{to_anyhow, Kind};

/// Well-known symbol slots the locator consults. Order here is the
/// classification order: the first matching name wins a slot.
pub const WANTED_SYMBOLS: &[&str] = &[
    "_PyRuntime",
    "interp_head",
    "_PyThreadState_Current",
    "Py_GetVersion.version",
    "_mh_execute_header",
];

#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub symbols: HashMap<&'static str, u64>,
    pub bss_addr: u64,
    pub bss_size: u64,
    pub pyruntime_addr: u64,
    pub pyruntime_size: u64,
    pub load_offset: u64,
}

impl ImageInfo {
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

fn classify(name: &str) -> Option<&'static str> {
    // Mach-O prefixes exported C symbols with an extra underscore.
    let name = name.strip_prefix('_').unwrap_or(name);
    WANTED_SYMBOLS
        .iter()
        .find(|&&w| w.trim_start_matches('_') == name || w == name)
        .copied()
}

/// Parse a binary file on disk, given the base address and size it is mapped
/// at in the target's address space. The file is mapped read-only rather
/// than read into an owned buffer: only a handful of sections and symbols
/// are ever touched, and Python executables/`libpython`s can run to tens of
/// megabytes.
pub fn parse_binary(filename: &Path, base: u64, _size: u64) -> anyhow::Result<ImageInfo> {
    let fd = File::open(filename)
        .map_err(|e| to_anyhow(Kind::Io, format!("cannot open {}: {}", filename.display(), e)))?;
    let buffer = unsafe { Mmap::map(&fd) }
        .map_err(|e| to_anyhow(Kind::Io, format!("cannot map {}: {}", filename.display(), e)))?;

    match Object::parse(&buffer)
        .map_err(|e| to_anyhow(Kind::Binary, format!("{}: {}", filename.display(), e)))?
    {
        Object::Elf(elf) => parse_elf(&elf, base),
        Object::PE(pe) => parse_pe(&pe, base),
        Object::Mach(goblin::mach::Mach::Binary(macho)) => parse_macho(&macho, base),
        Object::Mach(goblin::mach::Mach::Fat(fat)) => {
            let arch = fat
                .iter_arches()
                .find_map(|a| a.ok().filter(|a| a.is_64()))
                .ok_or_else(|| to_anyhow(Kind::Binary, "no 64-bit arch in FAT archive"))?;
            let bytes = &buffer[arch.offset as usize..][..arch.size as usize];
            let macho = goblin::mach::MachO::parse(bytes, 0)
                .map_err(|e| to_anyhow(Kind::Binary, e.to_string()))?;
            parse_macho(&macho, base)
        }
        _ => Err(to_anyhow(Kind::Binary, "unhandled binary type")),
    }
}

fn parse_elf(elf: &goblin::elf::Elf, base: u64) -> anyhow::Result<ImageInfo> {
    let bss_header = elf
        .section_headers
        .iter()
        .find(|h| h.sh_type == goblin::elf::section_header::SHT_NOBITS)
        .ok_or_else(|| to_anyhow(Kind::Binary, "no BSS section in ELF binary"))?;

    let pyruntime_header = elf.section_headers.iter().find(|h| {
        elf.shdr_strtab
            .get_at(h.sh_name)
            .map(|n| n == ".PyRuntime")
            .unwrap_or(false)
    });

    let program_header = elf
        .program_headers
        .iter()
        .find(|h| {
            h.p_type == goblin::elf::program_header::PT_LOAD
                && h.p_flags & goblin::elf::program_header::PF_X != 0
        })
        .ok_or_else(|| to_anyhow(Kind::Binary, "no executable PT_LOAD header in ELF binary"))?;

    let load_offset = base - program_header.p_vaddr;

    let mut symbols = HashMap::new();
    for sym in elf.syms.iter() {
        if sym.st_value == 0 {
            continue;
        }
        if let Some(name) = elf.strtab.get_at(sym.st_name) {
            if let Some(slot) = classify(name) {
                symbols
                    .entry(slot)
                    .or_insert(sym.st_value + load_offset);
            }
        }
    }

    let (pyruntime_addr, pyruntime_size) = pyruntime_header
        .map(|h| (h.sh_addr + load_offset, h.sh_size))
        .unwrap_or((0, 0));

    Ok(ImageInfo {
        symbols,
        bss_addr: bss_header.sh_addr + load_offset,
        bss_size: bss_header.sh_size,
        pyruntime_addr,
        pyruntime_size,
        load_offset,
    })
}

fn parse_pe(pe: &goblin::pe::PE, base: u64) -> anyhow::Result<ImageInfo> {
    let mut symbols = HashMap::new();
    for export in &pe.exports {
        if let (Some(name), Some(offset)) = (export.name, export.rva.checked_sub(0)) {
            if let Some(slot) = classify(name) {
                symbols.entry(slot).or_insert(offset as u64 + base);
            }
        }
    }

    let data_section = pe
        .sections
        .iter()
        .find(|s| s.name().map(|n| n.starts_with(".data")).unwrap_or(false))
        .ok_or_else(|| to_anyhow(Kind::Binary, "no .data section in PE binary"))?;

    Ok(ImageInfo {
        symbols,
        bss_addr: data_section.virtual_address as u64 + base,
        bss_size: data_section.virtual_size as u64,
        pyruntime_addr: 0,
        pyruntime_size: 0,
        load_offset: base,
    })
}

fn parse_macho(macho: &goblin::mach::MachO, base: u64) -> anyhow::Result<ImageInfo> {
    let mut bss_addr = 0;
    let mut bss_size = 0;
    let mut pyruntime_addr = 0;
    let mut pyruntime_size = 0;
    for segment in &macho.segments {
        if let Ok(sections) = segment.sections() {
            for (section, _) in sections {
                match section.name() {
                    Ok("__bss") => {
                        bss_addr = section.addr + base;
                        bss_size = section.size;
                    }
                    Ok("__pyruntime") => {
                        pyruntime_addr = section.addr + base;
                        pyruntime_size = section.size;
                    }
                    _ => {}
                }
            }
        }
    }

    let mut symbols = HashMap::new();
    if let Some(syms) = &macho.symbols {
        for symbol in syms.iter().flatten() {
            let (name, value) = symbol;
            if let Some(slot) = classify(name) {
                symbols.entry(slot).or_insert(value.n_value + base);
            }
        }
    }

    Ok(ImageInfo {
        symbols,
        bss_addr,
        bss_size,
        pyruntime_addr,
        pyruntime_size,
        load_offset: base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_symbols() {
        assert_eq!(classify("_PyRuntime"), Some("_PyRuntime"));
        assert_eq!(classify("interp_head"), Some("interp_head"));
        assert_eq!(classify("_interp_head"), Some("interp_head"));
        assert_eq!(classify("some_unrelated_symbol"), None);
    }
}
