//! Program loaders that populate simulated memory.
//!
//! Both loaders write through the byte poke path, so load placement bypasses
//! write permissions but still respects page mapping. A failed load leaves
//! memory partially populated; callers must treat it as unrecoverable and
//! rebuild the memory.

pub mod elf;
pub mod hex;

pub use elf::{ElfFlags, ElfImage};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a HEX or ELF load failed.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{line}: {reason}", path.display())]
    HexSyntax {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("{}:{line}: byte at {address:#x} lands outside mapped memory", path.display())]
    HexUnmapped {
        path: PathBuf,
        line: usize,
        address: u64,
    },
    #[error("{}: invalid ELF: {reason}", path.display())]
    ElfFormat { path: PathBuf, reason: String },
    #[error("unsupported register width {0}, expected 32 or 64")]
    RegisterWidth(u32),
    #[error("{}: ELF class mismatch: file is {found}-bit, expected {expected}-bit", path.display())]
    ElfClass {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("{}: not a RISC-V ELF (machine {machine:#x})", path.display())]
    ElfMachine { path: PathBuf, machine: u16 },
    #[error("{}: segment {index} places a byte at {address:#x} outside mapped memory", path.display())]
    SegmentUnmapped {
        path: PathBuf,
        index: usize,
        address: u64,
    },
}
