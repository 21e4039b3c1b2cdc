//! Per-page physical memory attributes (PMAs).
//!
//! Memory is organized in regions (default 256 MiB), each region in pages
//! (default 4 KiB). Every page carries a packed attribute record that decides
//! which accesses the page supports. Closely coupled memories (ICCM/DCCM) and
//! memory-mapped register areas are carved out of this default during the
//! configuration phase and are immutable once a hart starts executing.

use crate::is_aligned;
use rangemap::RangeInclusiveMap;
use std::fmt;
use thiserror::Error;

/// Packed physical memory attributes of one page.
///
/// Six independent capability bits packed in a byte, so the per-page table
/// stays compact even with small page sizes. Two values compare equal iff all
/// six bits match.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Pma(u8);

impl Pma {
    const READ: u8 = 1 << 0;
    const WRITE: u8 = 1 << 1;
    const EXEC: u8 = 1 << 2;
    const MMR: u8 = 1 << 3;
    const ICCM: u8 = 1 << 4;
    const DCCM: u8 = 1 << 5;

    /// Attributes of an unconfigured, inaccessible page.
    pub const UNMAPPED: Self = Self(0);

    /// Default attributes of memory external to the core: readable, writable,
    /// and executable.
    pub const EXTERNAL: Self = Self(Self::READ | Self::WRITE | Self::EXEC);

    /// Attributes of an instruction closely coupled memory page.
    pub(crate) const ICCM_PAGE: Self = Self(Self::READ | Self::EXEC | Self::ICCM);

    /// Attributes of a data closely coupled memory page.
    pub(crate) const DCCM_PAGE: Self = Self(Self::READ | Self::WRITE | Self::DCCM);

    /// Attributes of a memory-mapped register page.
    pub(crate) const MMR_PAGE: Self = Self(Self::READ | Self::WRITE | Self::MMR);

    /// True if the page can be used for data reads (load instructions).
    pub fn is_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    /// True if the page can be used for data writes (store instructions).
    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// True if the page can be used for instruction fetch.
    pub fn is_exec(self) -> bool {
        self.0 & Self::EXEC != 0
    }

    /// True if the page holds memory-mapped registers.
    pub fn is_mem_mapped_reg(self) -> bool {
        self.0 & Self::MMR != 0
    }

    /// True if the page belongs to an ICCM area.
    pub fn is_iccm(self) -> bool {
        self.0 & Self::ICCM != 0
    }

    /// True if the page belongs to a DCCM area.
    pub fn is_dccm(self) -> bool {
        self.0 & Self::DCCM != 0
    }

    /// True if the page is usable at all.
    pub fn is_mapped(self) -> bool {
        self.0 & (Self::READ | Self::WRITE | Self::EXEC) != 0
    }

    /// True if the page is external to the core (not core-local data memory
    /// and not a memory-mapped register page).
    pub fn is_external(self) -> bool {
        self.0 & (Self::DCCM | Self::MMR) == 0
    }

    /// The same attributes with data read/write access added. Used for cores
    /// that allow load/store access to their instruction memory.
    pub(crate) fn with_data_access(self) -> Self {
        Self(self.0 | Self::READ | Self::WRITE)
    }
}

/// The kinds of special areas that can be carved out of external memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AreaKind {
    Iccm,
    Dccm,
    MemMappedRegs,
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            AreaKind::Iccm => "iccm",
            AreaKind::Dccm => "dccm",
            AreaKind::MemMappedRegs => "memory-mapped register",
        })
    }
}

/// Map of each page of the simulated address space to its attributes.
///
/// Lifecycle: all pages start as [`Pma::EXTERNAL`]; `define_*` calls replace
/// page attributes during configuration; [`PmaTable::finish_ccm_config`]
/// closes the configuration phase. The table is read-only afterwards.
#[derive(Debug)]
pub struct PmaTable {
    pages: Box<[Pma]>,
    page_size: u64,
    page_shift: u32,
    region_size: u64,
    region_shift: u32,
    size: u64,
    /// Configured special areas, kept to reject overlapping definitions.
    areas: RangeInclusiveMap<u64, AreaKind>,
}

impl PmaTable {
    /// Create a table for a memory of `size` bytes with all pages external.
    ///
    /// `size` must be a positive multiple of `page_size`; `page_size` must be
    /// a power of two of at least 4 bytes; `region_size` must be a
    /// power-of-two multiple of `page_size`.
    pub fn new(size: u64, page_size: u64, region_size: u64) -> Result<Self, ConfigError> {
        if !page_size.is_power_of_two() || page_size < 4 {
            return Err(ConfigError::InvalidPageSize(page_size));
        }
        if !region_size.is_power_of_two() || region_size < page_size {
            return Err(ConfigError::InvalidRegionSize(region_size));
        }
        if size == 0 || size % page_size != 0 {
            return Err(ConfigError::InvalidMemorySize(size));
        }
        const_assert!(usize::BITS >= 64);
        let page_count = (size / page_size) as usize;
        Ok(Self {
            pages: vec![Pma::EXTERNAL; page_count].into_boxed_slice(),
            page_size,
            page_shift: page_size.trailing_zeros(),
            region_size,
            region_shift: region_size.trailing_zeros(),
            size,
            areas: RangeInclusiveMap::new(),
        })
    }

    /// Attributes of the page containing `address`.
    ///
    /// Addresses past the end of memory report [`Pma::UNMAPPED`].
    pub fn pma(&self, address: u64) -> Pma {
        self.pages
            .get((address >> self.page_shift) as usize)
            .copied()
            .unwrap_or(Pma::UNMAPPED)
    }

    /// Size of the covered memory in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Number of the region containing `address`.
    pub fn region_of(&self, address: u64) -> u64 {
        address >> self.region_shift
    }

    /// Define an instruction closely coupled memory area. Pages become
    /// fetchable (and readable) core-local instruction memory.
    pub fn define_iccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.define_area(AreaKind::Iccm, address, size, Pma::ICCM_PAGE)
    }

    /// Define a data closely coupled memory area. Pages become readable and
    /// writable core-local data memory.
    pub fn define_dccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.define_area(AreaKind::Dccm, address, size, Pma::DCCM_PAGE)
    }

    /// Define a memory-mapped register area. Pages only support word-sized,
    /// word-aligned data access.
    pub fn define_mmr_area(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.define_area(AreaKind::MemMappedRegs, address, size, Pma::MMR_PAGE)
    }

    /// Close the configuration phase.
    ///
    /// If `iccm_rw` is set, ICCM pages additionally get data read/write
    /// access, for cores that allow load/store access to their instruction
    /// memory.
    pub fn finish_ccm_config(&mut self, iccm_rw: bool) {
        if iccm_rw {
            for pma in self.pages.iter_mut().filter(|pma| pma.is_iccm()) {
                *pma = pma.with_data_access();
            }
        }
    }

    fn define_area(
        &mut self,
        kind: AreaKind,
        address: u64,
        size: u64,
        attributes: Pma,
    ) -> Result<(), ConfigError> {
        if size == 0 || !is_aligned(address, self.page_size) || !is_aligned(size, self.page_size) {
            return Err(ConfigError::MisalignedArea {
                kind,
                address,
                size,
            });
        }
        let end = address
            .checked_add(size - 1)
            .filter(|&end| end < self.size)
            .ok_or(ConfigError::AreaOutOfBounds {
                kind,
                address,
                size,
            })?;
        if self.region_of(address) != self.region_of(end) {
            return Err(ConfigError::AreaCrossesRegion {
                kind,
                address,
                size,
            });
        }
        if self.areas.overlaps(&(address..=end)) {
            return Err(ConfigError::AreaOverlap { kind, address });
        }
        self.areas.insert(address..=end, kind);

        let first = (address >> self.page_shift) as usize;
        let count = (size >> self.page_shift) as usize;
        self.pages[first..first + count].fill(attributes);
        Ok(())
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("memory size {0:#x} is not a positive multiple of the page size")]
    InvalidMemorySize(u64),
    #[error("page size {0:#x} is not a power of two of at least four bytes")]
    InvalidPageSize(u64),
    #[error("region size {0:#x} is not a power-of-two multiple of the page size")]
    InvalidRegionSize(u64),
    #[error("{kind} area at {address:#x} with size {size:#x} is not page-aligned")]
    MisalignedArea {
        kind: AreaKind,
        address: u64,
        size: u64,
    },
    #[error("{kind} area at {address:#x} with size {size:#x} extends past the end of memory")]
    AreaOutOfBounds {
        kind: AreaKind,
        address: u64,
        size: u64,
    },
    #[error("{kind} area at {address:#x} with size {size:#x} spans more than one region")]
    AreaCrossesRegion {
        kind: AreaKind,
        address: u64,
        size: u64,
    },
    #[error("{kind} area at {address:#x} overlaps a previously configured area")]
    AreaOverlap { kind: AreaKind, address: u64 },
    #[error("no memory-mapped register at {0:#x}")]
    NotMemMapped(u64),
    #[error("memory-mapped register address {0:#x} is not word-aligned")]
    MisalignedRegister(u64),
    #[error("hart count must be at least one")]
    NoHarts,
}
