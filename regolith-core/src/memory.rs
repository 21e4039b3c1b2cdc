//! The physical memory a hart executes against.
//!
//! [`Memory`] combines the backing store, the per-page attribute table, the
//! memory-mapped register masks, the LR/SC reservation set, and the per-hart
//! last-write records behind a single checked access surface. Every typed
//! read, fetch, write, and poke funnels through one predicate-parameterized
//! checker, so the alignment and attribute-crossing rules have a single audit
//! surface.
//!
//! Lifecycle: `Memory::new` → `define_*` / loaders → `finish_ccm_config` →
//! hart threads run. Configuration takes `&mut self` and happens on one
//! thread; all run-time access goes through `&self` and is safe to share.

use crate::loader::{elf, hex, ElfImage, LoadError};
use crate::mmr::MaskTable;
use crate::pma::{ConfigError, Pma, PmaTable};
use crate::reservation::ReservationSet;
use crate::snapshot::{self, SnapshotError};
use crate::storage::Storage;
use crate::symbols::SymbolTable;
use crate::trace::{WriteRecord, WriteTrace};
use crate::{is_aligned, unit};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Geometry and policy of a simulated physical memory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Memory size in bytes. Must be a positive multiple of the page size.
    pub size: u64,
    /// Page size in bytes; the granularity of attribute tracking. Must be a
    /// power of two of at least four bytes.
    pub page_size: u64,
    /// Region size in bytes; closely coupled memories and memory-mapped
    /// register areas must each fit inside a single region. Must be a
    /// power-of-two multiple of the page size.
    pub region_size: u64,
    /// Number of harts sharing this memory. Decides how many reservation and
    /// last-write slots exist.
    pub hart_count: usize,
    /// When set, loads and snapshot restores fail if a byte lands on an
    /// unmapped page; otherwise such bytes are skipped and counted.
    pub check_unmapped_elf: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size: 1 << 32,
            page_size: 4 * 1024,
            region_size: 256 * 1024 * 1024,
            hart_count: 1,
            check_unmapped_elf: true,
        }
    }
}

/// Why a memory access was refused.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessError {
    /// The access extends past the end of the simulated memory.
    #[error("access at {0:#x} is out of memory bounds")]
    OutOfBounds(u64),
    /// The page attributes do not grant the requested capability.
    #[error("page at {0:#x} does not grant the requested access")]
    Unmapped(u64),
    /// A misaligned access straddles pages with differing attributes.
    #[error("misaligned access at {0:#x} crosses pages with different attributes")]
    CrossesPmaBoundary(u64),
    /// Memory-mapped registers only support aligned word-sized data access.
    #[error("memory-mapped registers at {0:#x} require aligned word access")]
    MmrAccess(u64),
}

/// An unsigned integer that can move between a hart and the backing store.
///
/// Monomorphizing the checker over the access width keeps the hot paths free
/// of width dispatch.
trait Scalar: Copy {
    const SIZE: u64;
    fn load(storage: &Storage, address: u64) -> Self;
    fn store(self, storage: &Storage, address: u64);
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_scalar {
    ($($u:ident => $load:ident, $store:ident);* $(;)?) => {
        $(
            impl Scalar for $u {
                const SIZE: u64 = std::mem::size_of::<$u>() as u64;

                fn load(storage: &Storage, address: u64) -> Self {
                    storage.$load(address)
                }

                fn store(self, storage: &Storage, address: u64) {
                    storage.$store(address, self)
                }

                fn to_bits(self) -> u64 {
                    self as u64
                }

                fn from_bits(bits: u64) -> Self {
                    bits as $u
                }
            }
        )*
    };
}

impl_scalar! {
    u8 => load_byte, store_byte;
    u16 => load_halfword, store_halfword;
    u32 => load_word, store_word;
    u64 => load_doubleword, store_doubleword;
}

macro_rules! read_poke_fns {
    ($($read_fn:ident, $poke_fn:ident => $u:ident),* $(,)?) => {
        $(
            /// Read a little-endian value from memory.
            pub fn $read_fn(&self, address: u64) -> Result<$u, AccessError> {
                self.read_scalar(address)
            }

            /// Write a value without a store-permission check or last-write
            /// recording. The page must be mapped. Conflicting reservations
            /// of every hart are invalidated. Used by loaders, the debugger,
            /// and snapshot restore.
            pub fn $poke_fn(&self, address: u64, value: $u) -> Result<(), AccessError> {
                self.poke_scalar(address, value)
            }
        )*
    };
}

/// Simulated physical memory shared by all harts of the system.
#[derive(Debug)]
pub struct Memory {
    storage: Storage,
    pma: PmaTable,
    mmr: MaskTable,
    /// The `lr_mutex`: guards all reservation operations and is held across
    /// store commit plus invalidation in the write path.
    reservations: Mutex<ReservationSet>,
    /// The `amo_mutex`: serializes atomic read-modify-write sequences.
    amo_lock: Mutex<()>,
    trace: WriteTrace,
    symbols: SymbolTable,
    hart_count: usize,
    check_unmapped_elf: bool,
}

impl Memory {
    /// Create a zero-initialized memory with all pages external
    /// (readable, writable, executable).
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        if config.hart_count == 0 {
            return Err(ConfigError::NoHarts);
        }
        let pma = PmaTable::new(config.size, config.page_size, config.region_size)?;
        Ok(Self {
            storage: Storage::new(config.size),
            pma,
            mmr: MaskTable::new(),
            reservations: Mutex::new(ReservationSet::new(config.hart_count)),
            amo_lock: Mutex::new(()),
            trace: WriteTrace::new(config.hart_count),
            symbols: SymbolTable::new(),
            hart_count: config.hart_count,
            check_unmapped_elf: config.check_unmapped_elf,
        })
    }

    /// Memory size in bytes.
    pub fn size(&self) -> u64 {
        self.storage.size()
    }

    /// Number of harts this memory was configured for.
    pub fn hart_count(&self) -> usize {
        self.hart_count
    }

    /// Attributes of the page containing `address`.
    pub fn pma(&self, address: u64) -> Pma {
        self.pma.pma(address)
    }

    /// Symbols collected from all loaded ELF files.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The privileged per-hart handle, or `None` if `hart` is not below the
    /// configured hart count.
    ///
    /// The plain `&Memory` surface only exposes reads, fetches, and pokes;
    /// stores, reservations, and last-write tracking need the hart's
    /// identity and go through this handle.
    pub fn hart_port(&self, hart: usize) -> Option<HartPort<'_>> {
        (hart < self.hart_count).then_some(HartPort { memory: self, hart })
    }

    // -------------------------------------------------------------------
    // Configuration phase
    // -------------------------------------------------------------------

    /// Define an instruction closely coupled memory area.
    pub fn define_iccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.pma.define_iccm(address, size)
    }

    /// Define a data closely coupled memory area.
    pub fn define_dccm(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.pma.define_dccm(address, size)
    }

    /// Define a memory-mapped register area. All write masks start as
    /// all-ones.
    pub fn define_mmr_area(&mut self, address: u64, size: u64) -> Result<(), ConfigError> {
        self.pma.define_mmr_area(address, size)?;
        self.mmr.add_area(address, size);
        Ok(())
    }

    /// Replace the write mask of the memory-mapped register at `address`.
    pub fn set_mmr_mask(&mut self, address: u64, mask: u32) -> Result<(), ConfigError> {
        self.mmr.set_mask(address, mask)
    }

    /// Write mask of the word containing `address` (all-ones outside
    /// memory-mapped register areas).
    pub fn mmr_mask(&self, address: u64) -> u32 {
        self.mmr.mask(address)
    }

    /// Reset all memory-mapped registers to zero.
    pub fn reset_mmr_registers(&mut self) {
        for (base, size) in self.mmr.areas() {
            self.storage.fill_zero(base, size);
        }
    }

    /// Close the configuration phase; with `iccm_rw` set, ICCM pages also
    /// allow data access.
    pub fn finish_ccm_config(&mut self, iccm_rw: bool) {
        self.pma.finish_ccm_config(iccm_rw);
    }

    /// Copy the overlapping prefix of another memory's contents into this
    /// one. Attributes and symbols are not copied.
    pub fn copy_from(&mut self, other: &Memory) {
        self.storage.copy_from(&other.storage);
    }

    // -------------------------------------------------------------------
    // Loaders and snapshots
    // -------------------------------------------------------------------

    /// Load a HEX file: `@<hex>` lines move the byte cursor, two-digit hex
    /// tokens write consecutive bytes. `#` starts a comment.
    pub fn load_hex_file(&mut self, path: &Path) -> Result<(), LoadError> {
        hex::load_file(self, path)
    }

    /// Load a RISC-V ELF file of the given register width (32 or 64),
    /// placing all `PT_LOAD` segments and collecting symbols.
    pub fn load_elf_file(&mut self, path: &Path, register_width: u32) -> Result<ElfImage, LoadError> {
        elf::load_file(self, path, register_width)
    }

    /// Write the given `[begin, end)` byte ranges to a snapshot file, in
    /// order.
    pub fn save_snapshot(&self, path: &Path, blocks: &[(u64, u64)]) -> Result<(), SnapshotError> {
        snapshot::save(self, path, blocks)
    }

    /// Restore memory blocks from a snapshot file. Returns the number of
    /// bytes skipped because they fell on unmapped pages (always zero when
    /// unmapped checking is enabled; unmapped bytes fail the load instead).
    pub fn load_snapshot(&self, path: &Path) -> Result<u64, SnapshotError> {
        snapshot::load(self, path)
    }

    // -------------------------------------------------------------------
    // Checked access paths
    // -------------------------------------------------------------------

    read_poke_fns! {
        read_byte, poke_byte => u8,
        read_halfword, poke_halfword => u16,
        read_word, poke_word => u32,
        read_doubleword, poke_doubleword => u64,
    }

    /// Fetch a 16-bit instruction parcel.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit
    /// > little-endian parcels, regardless of memory system endianness.
    ///
    /// The page must be fetchable; a misaligned parcel may not straddle
    /// pages with differing attributes.
    pub fn fetch_halfword(&self, address: u64) -> Result<u16, AccessError> {
        self.check_bounds(address, unit::HALFWORD)?;
        let pma = self.pma.pma(address);
        if !pma.is_exec() {
            return Err(AccessError::Unmapped(address));
        }
        if !is_aligned(address, unit::HALFWORD) && pma != self.pma.pma(address + 1) {
            return Err(AccessError::CrossesPmaBoundary(address));
        }
        Ok(self.storage.load_halfword(address))
    }

    /// Fetch a 32-bit instruction.
    ///
    /// With the compressed extension a 32-bit instruction may start on any
    /// halfword boundary, so a misaligned fetch is allowed as long as all
    /// four bytes share the same attributes (it may not, for example, run
    /// off the end of an ICCM).
    pub fn fetch_word(&self, address: u64) -> Result<u32, AccessError> {
        self.check_bounds(address, unit::WORD)?;
        let pma = self.pma.pma(address);
        if !pma.is_exec() {
            return Err(AccessError::Unmapped(address));
        }
        if !is_aligned(address, unit::WORD) && pma != self.pma.pma(address + 3) {
            return Err(AccessError::CrossesPmaBoundary(address));
        }
        Ok(self.storage.load_word(address))
    }

    fn check_bounds(&self, address: u64, size: u64) -> Result<(), AccessError> {
        if address >= self.size() || size > self.size() - address {
            return Err(AccessError::OutOfBounds(address));
        }
        Ok(())
    }

    /// Shared attribute and alignment checks for data access. Returns the
    /// attributes of the first byte's page.
    fn check_data_access<T: Scalar>(
        &self,
        address: u64,
        granted: impl Fn(Pma) -> bool,
    ) -> Result<Pma, AccessError> {
        self.check_bounds(address, T::SIZE)?;
        let pma = self.pma.pma(address);
        if !granted(pma) {
            return Err(AccessError::Unmapped(address));
        }
        if !is_aligned(address, T::SIZE) && pma != self.pma.pma(address + T::SIZE - 1) {
            return Err(AccessError::CrossesPmaBoundary(address));
        }
        if pma.is_mem_mapped_reg() && (T::SIZE != unit::WORD || !is_aligned(address, unit::WORD)) {
            return Err(AccessError::MmrAccess(address));
        }
        Ok(pma)
    }

    fn read_scalar<T: Scalar>(&self, address: u64) -> Result<T, AccessError> {
        let pma = self.check_data_access::<T>(address, Pma::is_read)?;
        if pma.is_mem_mapped_reg() {
            // Word-sized by the check above; registers read back the last
            // committed masked value.
            return Ok(T::from_bits(self.storage.load_word(address) as u64));
        }
        Ok(T::load(&self.storage, address))
    }

    fn write_scalar<T: Scalar>(
        &self,
        hart: usize,
        address: u64,
        value: T,
    ) -> Result<(), AccessError> {
        let pma = self.check_data_access::<T>(address, Pma::is_write)?;
        if pma.is_mem_mapped_reg() {
            let masked = value.to_bits() as u32 & self.mmr.mask(address);
            let prev = self.storage.load_word(address);
            self.trace
                .record(hart, address, unit::WORD as u32, masked as u64, prev as u64);
            self.storage.store_word(address, masked);
            return Ok(());
        }
        let prev = T::load(&self.storage, address);
        // Lock ordering: the last-write record is updated before the store
        // commits, and the lock is held across commit plus invalidation, so
        // a hart that observes its own store still holds its reservation and
        // a tracer that queries after `write` returns sees the new value.
        let mut reservations = self.lock_reservations();
        self.trace
            .record(hart, address, T::SIZE as u32, value.to_bits(), prev.to_bits());
        value.store(&self.storage, address);
        reservations.invalidate_conflicts(hart, address, T::SIZE as u32);
        Ok(())
    }

    fn poke_scalar<T: Scalar>(&self, address: u64, value: T) -> Result<(), AccessError> {
        let pma = self.check_data_access::<T>(address, Pma::is_mapped)?;
        if pma.is_mem_mapped_reg() {
            let masked = value.to_bits() as u32 & self.mmr.mask(address);
            self.storage.store_word(address, masked);
        } else {
            value.store(&self.storage, address);
        }
        self.lock_reservations()
            .invalidate_all_conflicts(address, T::SIZE as u32);
        Ok(())
    }

    fn check_write_scalar<T: Scalar>(&self, address: u64, value: T) -> Result<T, AccessError> {
        let pma = self.check_data_access::<T>(address, Pma::is_write)?;
        if pma.is_mem_mapped_reg() {
            return Ok(T::from_bits(
                (value.to_bits() as u32 & self.mmr.mask(address)) as u64,
            ));
        }
        Ok(value)
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub(crate) fn check_unmapped_elf(&self) -> bool {
        self.check_unmapped_elf
    }

    fn lock_reservations(&self) -> MutexGuard<'_, ReservationSet> {
        // Reservation state is plain data; a panicked hart thread cannot
        // leave it inconsistent.
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

macro_rules! write_check_fns {
    ($($write_fn:ident, $check_fn:ident => $u:ident),* $(,)?) => {
        $(
            /// Store a little-endian value, recording it in the hart's
            /// last-write slot and invalidating conflicting reservations of
            /// other harts. Stores to memory-mapped registers are masked.
            pub fn $write_fn(&self, address: u64, value: $u) -> Result<(), AccessError> {
                self.memory.write_scalar(self.hart, address, value)
            }

            /// Dry run of the matching write: performs every check and
            /// returns the value that would be committed (masked for
            /// memory-mapped registers) without any side effect.
            pub fn $check_fn(&self, address: u64, value: $u) -> Result<$u, AccessError> {
                self.memory.check_write_scalar(address, value)
            }
        )*
    };
}

/// Privileged per-hart view of a [`Memory`].
///
/// Obtained from [`Memory::hart_port`]; carries the hart identity that
/// stores, reservations, and last-write tracking need. One port (and one OS
/// thread) per hart id.
#[derive(Debug, Copy, Clone)]
pub struct HartPort<'m> {
    memory: &'m Memory,
    hart: usize,
}

impl<'m> HartPort<'m> {
    /// The hart id this port was created for.
    pub fn hart(&self) -> usize {
        self.hart
    }

    /// The shared memory behind this port.
    pub fn memory(&self) -> &'m Memory {
        self.memory
    }

    write_check_fns! {
        write_byte, check_write_byte => u8,
        write_halfword, check_write_halfword => u16,
        write_word, check_write_word => u32,
        write_doubleword, check_write_doubleword => u64,
    }

    /// Establish an LR reservation over `size` bytes at `address`,
    /// replacing any previous reservation of this hart.
    pub fn make_reservation(&self, address: u64, size: u32) {
        self.memory.lock_reservations().make(self.hart, address, size);
    }

    /// Drop this hart's reservation.
    pub fn clear_reservation(&self) {
        self.memory.lock_reservations().invalidate(self.hart);
    }

    /// True if this hart still holds a valid reservation for exactly
    /// `address`. The run loop checks this before committing an SC.
    pub fn has_reservation(&self, address: u64) -> bool {
        self.memory.lock_reservations().has(self.hart, address)
    }

    /// The most recent store of this hart and the value it wrote, or `None`
    /// if there was none since the last clear.
    pub fn last_write(&self) -> Option<WriteRecord> {
        self.memory.trace.last_new(self.hart)
    }

    /// The most recent store of this hart and the value it replaced.
    pub fn last_write_prev(&self) -> Option<WriteRecord> {
        self.memory.trace.last_prev(self.hart)
    }

    /// Forget this hart's last-write record.
    pub fn clear_last_write(&self) {
        self.memory.trace.clear(self.hart);
    }

    /// Serialize an atomic read-modify-write: hold the returned guard for
    /// the duration of the load-modify-store sequence.
    ///
    /// This makes AMOs atomic with respect to other AMOs, but not to plain
    /// stores, matching the RISC-V memory model.
    pub fn amo_guard(&self) -> AmoGuard<'m> {
        AmoGuard {
            _guard: self
                .memory
                .amo_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Lock guard serializing atomic read-modify-write sequences.
#[derive(Debug)]
pub struct AmoGuard<'m> {
    _guard: MutexGuard<'m, ()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    /// 16 MiB memory with 4 KiB pages, 4 MiB regions, and two harts.
    fn memory() -> Memory {
        Memory::new(Config {
            size: 16 * MIB,
            page_size: 4096,
            region_size: 4 * MIB,
            hart_count: 2,
            check_unmapped_elf: true,
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_all_widths() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        hart.write_byte(0x100, 0xab).unwrap();
        assert_eq!(0xab, memory.read_byte(0x100).unwrap());
        hart.write_halfword(0x102, 0xbeef).unwrap();
        assert_eq!(0xbeef, memory.read_halfword(0x102).unwrap());
        hart.write_word(0x104, 0xdead_beef).unwrap();
        assert_eq!(0xdead_beef, memory.read_word(0x104).unwrap());
        hart.write_doubleword(0x108, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(0x0123_4567_89ab_cdef, memory.read_doubleword(0x108).unwrap());
    }

    #[test]
    fn test_endianness() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        hart.write_word(0x200, 0x0403_0201).unwrap();
        for i in 0..4 {
            assert_eq!(i as u8 + 1, memory.read_byte(0x200 + i).unwrap());
        }
    }

    #[test]
    fn test_misaligned_access_within_uniform_attributes() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        hart.write_word(0x1001, 0x1122_3344).unwrap();
        assert_eq!(0x1122_3344, memory.read_word(0x1001).unwrap());
        // Crossing a page boundary is fine while the attributes match.
        hart.write_doubleword(0x1ffc, u64::MAX).unwrap();
        assert_eq!(u64::MAX, memory.read_doubleword(0x1ffc).unwrap());
    }

    #[test]
    fn test_out_of_bounds() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        let size = memory.size();
        assert_eq!(Err(AccessError::OutOfBounds(size)), memory.read_byte(size));
        assert_eq!(
            Err(AccessError::OutOfBounds(size - 2)),
            memory.read_word(size - 2)
        );
        assert_eq!(
            Err(AccessError::OutOfBounds(size - 4)),
            hart.write_doubleword(size - 4, 0)
        );
        assert_eq!(
            Err(AccessError::OutOfBounds(u64::MAX)),
            memory.read_word(u64::MAX)
        );
        // The last valid word still works.
        hart.write_word(size - 4, 7).unwrap();
        assert_eq!(7, memory.read_word(size - 4).unwrap());
    }

    #[test]
    fn test_misaligned_store_across_dccm_boundary() {
        let mut memory = memory();
        memory.define_dccm(0x1000, 0x1000).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();

        // Within the DCCM everything works.
        hart.write_word(0x1ff8, 0x5555_aaaa).unwrap();
        assert_eq!(0x5555_aaaa, memory.read_word(0x1ff8).unwrap());

        // A word at 0x1ffe would straddle DCCM and external pages.
        assert_eq!(
            Err(AccessError::CrossesPmaBoundary(0x1ffe)),
            hart.write_word(0x1ffe, 0xdead_beef)
        );
        assert_eq!(
            Err(AccessError::CrossesPmaBoundary(0x1ffe)),
            memory.read_word(0x1ffe)
        );
        // Nothing was committed on either side of the boundary.
        assert_eq!(0, memory.read_byte(0x1ffe).unwrap());
        assert_eq!(0, memory.read_byte(0x2001).unwrap());
    }

    #[test]
    fn test_dccm_is_not_fetchable() {
        let mut memory = memory();
        memory.define_dccm(0x1000, 0x1000).unwrap();
        memory.finish_ccm_config(false);
        assert_eq!(Err(AccessError::Unmapped(0x1000)), memory.fetch_word(0x1000));
        assert_eq!(
            Err(AccessError::Unmapped(0x1ffe)),
            memory.fetch_halfword(0x1ffe)
        );
    }

    #[test]
    fn test_iccm_fetch_only_by_default() {
        let mut memory = memory();
        memory.define_iccm(0x0, 0x1000).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();
        memory.fetch_word(0x10).unwrap();
        assert_eq!(Err(AccessError::Unmapped(0x10)), hart.write_word(0x10, 1));
        // Reads are allowed; stores are not.
        assert_eq!(0, memory.read_word(0x10).unwrap());
    }

    #[test]
    fn test_iccm_rw_grants_data_access() {
        let mut memory = memory();
        memory.define_iccm(0x0, 0x1000).unwrap();
        memory.finish_ccm_config(true);
        let hart = memory.hart_port(0).unwrap();
        hart.write_word(0x10, 0x13).unwrap();
        assert_eq!(0x13, memory.read_word(0x10).unwrap());
        assert_eq!(0x13, memory.fetch_word(0x10).unwrap());
    }

    #[test]
    fn test_compressed_fetch_at_ccm_boundary() {
        let mut memory = memory();
        memory.define_iccm(0x0, 0x1000).unwrap();
        memory.finish_ccm_config(false);

        // The last halfword of the ICCM is fetchable...
        memory.fetch_halfword(0xffe).unwrap();
        // ...but a 32-bit fetch there would straddle ICCM and external pages.
        assert_eq!(
            Err(AccessError::CrossesPmaBoundary(0xffe)),
            memory.fetch_word(0xffe)
        );
        // An aligned word fully inside the ICCM is fine, as is a misaligned
        // one that stays inside.
        memory.fetch_word(0xff8).unwrap();
        memory.fetch_word(0xffa).unwrap();
    }

    #[test]
    fn test_mmr_word_only_access() {
        let mut memory = memory();
        memory.define_mmr_area(0x80_0000, 0x1000).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();

        hart.write_word(0x80_0000, 0x1234_5678).unwrap();
        assert_eq!(0x1234_5678, memory.read_word(0x80_0000).unwrap());

        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0000)),
            hart.write_byte(0x80_0000, 0x55)
        );
        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0000)),
            hart.write_halfword(0x80_0000, 0x55)
        );
        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0000)),
            hart.write_doubleword(0x80_0000, 0x55)
        );
        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0002)),
            hart.write_word(0x80_0002, 0x55)
        );
        assert_eq!(Err(AccessError::MmrAccess(0x80_0000)), memory.read_byte(0x80_0000));
        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0002)),
            memory.read_word(0x80_0002)
        );
        // Not fetchable either.
        assert_eq!(
            Err(AccessError::Unmapped(0x80_0000)),
            memory.fetch_word(0x80_0000)
        );
    }

    #[test]
    fn test_mmr_write_mask() {
        let mut memory = memory();
        memory.define_mmr_area(0x80_0000, 0x1000).unwrap();
        memory.set_mmr_mask(0x80_0000, 0x0000_00ff).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();

        assert_eq!(0x0000_00ff, memory.mmr_mask(0x80_0000));
        hart.write_word(0x80_0000, 0xaaaa_bbcc).unwrap();
        assert_eq!(0x0000_00cc, memory.read_word(0x80_0000).unwrap());

        // Neighbouring registers keep the default all-ones mask.
        hart.write_word(0x80_0004, 0xaaaa_bbcc).unwrap();
        assert_eq!(0xaaaa_bbcc, memory.read_word(0x80_0004).unwrap());
    }

    #[test]
    fn test_mmr_poke_applies_mask() {
        let mut memory = memory();
        memory.define_mmr_area(0x80_0000, 0x1000).unwrap();
        memory.set_mmr_mask(0x80_0000, 0xff00).unwrap();
        memory.finish_ccm_config(false);

        memory.poke_word(0x80_0000, 0xffff_ffff).unwrap();
        assert_eq!(0xff00, memory.read_word(0x80_0000).unwrap());
        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0000)),
            memory.poke_byte(0x80_0000, 1)
        );
    }

    #[test]
    fn test_mmr_reset_zeroes_registers() {
        let mut memory = memory();
        memory.define_mmr_area(0x80_0000, 0x1000).unwrap();
        memory.finish_ccm_config(false);
        memory.poke_word(0x80_0000, 0x1234_5678).unwrap();
        memory.poke_word(0x80_0ffc, 0x9abc_def0).unwrap();
        memory.reset_mmr_registers();
        assert_eq!(0, memory.read_word(0x80_0000).unwrap());
        assert_eq!(0, memory.read_word(0x80_0ffc).unwrap());
    }

    #[test]
    fn test_check_write_is_effect_free() {
        let mut memory = memory();
        memory.define_mmr_area(0x80_0000, 0x1000).unwrap();
        memory.set_mmr_mask(0x80_0000, 0xff).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();

        // Plain memory: the value is returned unchanged.
        assert_eq!(Ok(0x1234), hart.check_write_word(0x100, 0x1234));
        assert_eq!(0, memory.read_word(0x100).unwrap());
        assert_eq!(None, hart.last_write());

        // Memory-mapped register: the masked value is returned, nothing is
        // committed.
        assert_eq!(Ok(0xcc), hart.check_write_word(0x80_0000, 0xaaaa_bbcc));
        assert_eq!(0, memory.read_word(0x80_0000).unwrap());

        assert_eq!(
            Err(AccessError::MmrAccess(0x80_0000)),
            hart.check_write_byte(0x80_0000, 1)
        );
    }

    #[test]
    fn test_lr_invalidated_by_other_harts_store() {
        let memory = memory();
        let hart0 = memory.hart_port(0).unwrap();
        let hart1 = memory.hart_port(1).unwrap();

        hart0.make_reservation(0x2000, 4);
        assert!(hart0.has_reservation(0x2000));
        hart1.write_word(0x2000, 0x1).unwrap();
        assert!(!hart0.has_reservation(0x2000));
    }

    #[test]
    fn test_lr_survives_own_store() {
        let memory = memory();
        let hart0 = memory.hart_port(0).unwrap();
        hart0.make_reservation(0x2000, 4);
        hart0.write_word(0x2000, 0x1).unwrap();
        assert!(hart0.has_reservation(0x2000));
    }

    #[test]
    fn test_lr_invalidated_by_partial_overlap() {
        let memory = memory();
        let hart0 = memory.hart_port(0).unwrap();
        let hart1 = memory.hart_port(1).unwrap();
        hart0.make_reservation(0x2000, 8);
        hart1.write_byte(0x2007, 1).unwrap();
        assert!(!hart0.has_reservation(0x2000));

        hart0.make_reservation(0x2000, 8);
        hart1.write_byte(0x2008, 1).unwrap();
        assert!(hart0.has_reservation(0x2000));
    }

    #[test]
    fn test_poke_invalidates_all_reservations() {
        let memory = memory();
        let hart0 = memory.hart_port(0).unwrap();
        hart0.make_reservation(0x2000, 4);
        memory.poke_word(0x2000, 0).unwrap();
        assert!(!hart0.has_reservation(0x2000));
    }

    #[test]
    fn test_clear_reservation() {
        let memory = memory();
        let hart0 = memory.hart_port(0).unwrap();
        hart0.make_reservation(0x2000, 4);
        hart0.clear_reservation();
        assert!(!hart0.has_reservation(0x2000));
    }

    #[test]
    fn test_last_write_records_new_and_previous() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        hart.write_word(0x300, 0x1111_1111).unwrap();
        hart.write_word(0x300, 0x2222_2222).unwrap();
        assert_eq!(
            Some(WriteRecord {
                address: 0x300,
                size: 4,
                value: 0x2222_2222,
            }),
            hart.last_write()
        );
        assert_eq!(
            Some(WriteRecord {
                address: 0x300,
                size: 4,
                value: 0x1111_1111,
            }),
            hart.last_write_prev()
        );
        hart.clear_last_write();
        assert_eq!(None, hart.last_write());
    }

    #[test]
    fn test_last_write_records_masked_mmr_value() {
        let mut memory = memory();
        memory.define_mmr_area(0x80_0000, 0x1000).unwrap();
        memory.set_mmr_mask(0x80_0000, 0xff).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();
        hart.write_word(0x80_0000, 0xaaaa_bbcc).unwrap();
        assert_eq!(
            Some(WriteRecord {
                address: 0x80_0000,
                size: 4,
                value: 0xcc,
            }),
            hart.last_write()
        );
    }

    #[test]
    fn test_poke_does_not_record_last_write() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        memory.poke_word(0x300, 0x1234).unwrap();
        assert_eq!(None, hart.last_write());
    }

    #[test]
    fn test_last_write_is_per_hart() {
        let memory = memory();
        let hart0 = memory.hart_port(0).unwrap();
        let hart1 = memory.hart_port(1).unwrap();
        hart0.write_word(0x300, 1).unwrap();
        assert_eq!(None, hart1.last_write());
    }

    #[test]
    fn test_failed_write_leaves_no_record() {
        let mut memory = memory();
        memory.define_iccm(0x0, 0x1000).unwrap();
        memory.finish_ccm_config(false);
        let hart = memory.hart_port(0).unwrap();
        assert!(hart.write_word(0x10, 1).is_err());
        assert_eq!(None, hart.last_write());
    }

    #[test]
    fn test_hart_port_out_of_range() {
        let memory = memory();
        assert!(memory.hart_port(1).is_some());
        assert!(memory.hart_port(2).is_none());
    }

    #[test]
    fn test_amo_guard_serializes() {
        let memory = memory();
        let hart = memory.hart_port(0).unwrap();
        {
            let _guard = hart.amo_guard();
            // Load-modify-store under the guard.
            let value = memory.read_word(0x400).unwrap();
            hart.write_word(0x400, value.wrapping_add(1)).unwrap();
        }
        let _second = hart.amo_guard();
        assert_eq!(1, memory.read_word(0x400).unwrap());
    }

    #[test]
    fn test_copy_from() {
        let mut a = memory();
        let b = memory();
        b.poke_word(0x500, 0xfeed_face).unwrap();
        a.copy_from(&b);
        assert_eq!(0xfeed_face, a.read_word(0x500).unwrap());
    }

    #[test]
    fn test_zero_harts_rejected() {
        let result = Memory::new(Config {
            size: MIB,
            hart_count: 0,
            ..Config::default()
        });
        assert!(matches!(result, Err(ConfigError::NoHarts)));
    }
}
