//! ELF loader and static ELF probes.
//!
//! Accepts little-endian ELF32/ELF64 executables for RISC-V. Loadable
//! segments are copied to their physical address (falling back to the
//! virtual address when the physical one is zero) and their bss tail is
//! zero-filled. Function and object symbols are collected into the memory's
//! symbol table; well-known names like `_start` and `tohost` are left for
//! the driver to interpret.

use super::LoadError;
use crate::memory::Memory;
use crate::symbols::Symbol;
use goblin::elf::header::{EI_CLASS, ELFCLASS32, ELFCLASS64, ELFMAG, EM_RISCV};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::sym::{STT_FUNC, STT_OBJECT};
use goblin::elf::Elf;
use log::{debug, info, warn};
use std::fs;
use std::path::Path;

/// Placement summary of a loaded ELF file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ElfImage {
    /// Entry point from the file header.
    pub entry: u64,
    /// One past the highest loaded address.
    pub end: u64,
    /// Lowest loaded address.
    pub min_addr: u64,
    /// Highest loaded address.
    pub max_addr: u64,
}

/// Class and machine of an ELF file, taken from the header alone.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ElfFlags {
    pub is_32: bool,
    pub is_64: bool,
    pub is_riscv: bool,
}

pub(crate) fn load_file(
    memory: &mut Memory,
    path: &Path,
    register_width: u32,
) -> Result<ElfImage, LoadError> {
    let expect_64 = match register_width {
        32 => false,
        64 => true,
        other => return Err(LoadError::RegisterWidth(other)),
    };
    let bytes = read(path)?;
    let elf = parse(&bytes, path)?;
    if elf.is_64 != expect_64 {
        return Err(LoadError::ElfClass {
            path: path.into(),
            expected: register_width,
            found: if elf.is_64 { 64 } else { 32 },
        });
    }
    if elf.header.e_machine != EM_RISCV {
        return Err(LoadError::ElfMachine {
            path: path.into(),
            machine: elf.header.e_machine,
        });
    }

    let mut min_addr = u64::MAX;
    let mut max_addr = 0;
    let mut loaded = false;
    let mut skipped: u64 = 0;

    let segments = elf
        .program_headers
        .iter()
        .enumerate()
        .filter(|(_, header)| header.p_type == PT_LOAD);
    for (index, header) in segments {
        let dest = if header.p_paddr != 0 {
            header.p_paddr
        } else {
            header.p_vaddr
        };
        let data = bytes
            .get(header.file_range())
            .ok_or_else(|| LoadError::ElfFormat {
                path: path.into(),
                reason: format!("segment {index} file range is out of bounds"),
            })?;
        debug!(
            "loading segment {}: file range {:#x}..{:#x} to memory range {:#x}..{:#x}",
            index,
            header.p_offset,
            header.p_offset.saturating_add(header.p_filesz),
            dest,
            dest.saturating_add(header.p_memsz),
        );

        for (offset, &byte) in data.iter().enumerate() {
            place_byte(
                memory,
                path,
                index,
                dest.checked_add(offset as u64),
                byte,
                &mut skipped,
            )?;
        }
        // Zero-fill the bss tail.
        for offset in header.p_filesz..header.p_memsz {
            place_byte(memory, path, index, dest.checked_add(offset), 0, &mut skipped)?;
        }

        if header.p_memsz > 0 {
            loaded = true;
            min_addr = min_addr.min(dest);
            max_addr = max_addr.max(dest.saturating_add(header.p_memsz - 1));
        }
    }
    if !loaded {
        return Err(LoadError::ElfFormat {
            path: path.into(),
            reason: "no loadable segments".into(),
        });
    }
    if skipped > 0 {
        warn!(
            "{}: skipped {} bytes falling on unmapped pages",
            path.display(),
            skipped
        );
    }

    let mut symbol_count = 0;
    for sym in elf.syms.iter() {
        if sym.st_type() != STT_FUNC && sym.st_type() != STT_OBJECT {
            continue;
        }
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        memory.symbols_mut().insert(
            name.to_owned(),
            Symbol {
                address: sym.st_value,
                size: sym.st_size,
            },
        );
        symbol_count += 1;
    }

    info!(
        "{}: loaded {:#x}..{:#x}, entry {:#x}, {} symbols",
        path.display(),
        min_addr,
        max_addr + 1,
        elf.header.e_entry,
        symbol_count,
    );

    Ok(ElfImage {
        entry: elf.header.e_entry,
        end: max_addr + 1,
        min_addr,
        max_addr,
    })
}

/// Poke one loaded byte, honoring the unmapped-byte policy. `address` is
/// `None` when the segment placement overflowed the address space.
fn place_byte(
    memory: &Memory,
    path: &Path,
    index: usize,
    address: Option<u64>,
    byte: u8,
    skipped: &mut u64,
) -> Result<(), LoadError> {
    let failed_at = match address {
        Some(address) => match memory.poke_byte(address, byte) {
            Ok(()) => return Ok(()),
            Err(_) => address,
        },
        None => u64::MAX,
    };
    if memory.check_unmapped_elf() {
        return Err(LoadError::SegmentUnmapped {
            path: path.into(),
            index,
            address: failed_at,
        });
    }
    *skipped += 1;
    Ok(())
}

/// The `[min, max]` address range covered by the `PT_LOAD` segments of an
/// ELF file. Parses only the file; never touches simulated memory.
pub fn file_bounds(path: &Path) -> Result<(u64, u64), LoadError> {
    let bytes = read(path)?;
    let elf = parse(&bytes, path)?;
    let mut min = u64::MAX;
    let mut max = 0;
    let mut any = false;
    let segments = elf
        .program_headers
        .iter()
        .filter(|header| header.p_type == PT_LOAD && header.p_memsz > 0);
    for header in segments {
        let dest = if header.p_paddr != 0 {
            header.p_paddr
        } else {
            header.p_vaddr
        };
        any = true;
        min = min.min(dest);
        max = max.max(dest.saturating_add(header.p_memsz - 1));
    }
    if !any {
        return Err(LoadError::ElfFormat {
            path: path.into(),
            reason: "no loadable segments".into(),
        });
    }
    Ok((min, max))
}

/// Class and machine flags of an ELF file, from the identification bytes and
/// header fields only.
pub fn file_flags(path: &Path) -> Result<ElfFlags, LoadError> {
    let bytes = read(path)?;
    if bytes.len() < 20 || !bytes.starts_with(ELFMAG) {
        return Err(LoadError::ElfFormat {
            path: path.into(),
            reason: "not an ELF file".into(),
        });
    }
    let class = bytes[EI_CLASS];
    let machine = u16::from_le_bytes([bytes[18], bytes[19]]);
    Ok(ElfFlags {
        is_32: class == ELFCLASS32,
        is_64: class == ELFCLASS64,
        is_riscv: machine == EM_RISCV,
    })
}

/// True if the ELF file's symbol table contains a symbol named `name`.
pub fn file_has_symbol(path: &Path, name: &str) -> Result<bool, LoadError> {
    let bytes = read(path)?;
    let elf = parse(&bytes, path)?;
    Ok(elf
        .syms
        .iter()
        .any(|sym| elf.strtab.get_at(sym.st_name) == Some(name)))
}

fn read(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|source| LoadError::Io {
        path: path.into(),
        source,
    })
}

fn parse<'a>(bytes: &'a [u8], path: &Path) -> Result<Elf<'a>, LoadError> {
    Elf::parse(bytes).map_err(|error| LoadError::ElfFormat {
        path: path.into(),
        reason: error.to_string(),
    })
}
