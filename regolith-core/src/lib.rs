//! Physical memory substrate for a multi-hart RISC-V simulator.
//!
//! This crate models the flat, byte-addressable physical memory a hart
//! executes against: per-page physical memory attributes (PMAs), closely
//! coupled memories (ICCM/DCCM), memory-mapped registers with per-word write
//! masks, LR/SC reservation tracking, per-hart last-write records for
//! tracing, and the ELF/HEX loaders and snapshot I/O that populate and
//! preserve memory contents.
//!
//! The crate deliberately stops at the memory boundary: instruction decode,
//! register files, CSRs, and the run loop live in collaborating crates and
//! talk to this one through [`Memory`] and the per-hart [`HartPort`].

#[macro_use]
extern crate static_assertions;

pub mod loader;
pub mod memory;
pub mod mmr;
pub mod pma;
pub mod snapshot;
pub mod symbols;

mod reservation;
mod storage;
mod trace;

pub use loader::{ElfImage, LoadError};
pub use memory::{AccessError, Config, HartPort, Memory};
pub use pma::{ConfigError, Pma};
pub use symbols::{Symbol, SymbolTable};
pub use trace::WriteRecord;

pub mod unit {
    //! Collection of the units in which memory can be addressed (in bytes).

    /// A _byte_ is 8 bits.
    pub const BYTE: u64 = 1;

    /// A _halfword_ is 16 bits (2 bytes).
    pub const HALFWORD: u64 = 2;

    /// A _word_ is 32 bits (4 bytes).
    pub const WORD: u64 = 4;

    /// A _doubleword_ is 64 bits (8 bytes).
    pub const DOUBLEWORD: u64 = 8;
}

/// Returns `true` if `address` is a multiple of `size`, which must be a
/// power of two.
#[inline]
pub(crate) fn is_aligned(address: u64, size: u64) -> bool {
    debug_assert!(size.is_power_of_two());
    address & (size - 1) == 0
}
