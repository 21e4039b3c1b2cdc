//! Raw memory snapshots.
//!
//! A snapshot file holds a header followed by the raw bytes of a list of
//! `[begin, end)` memory blocks, everything little-endian:
//!
//! ```text
//! magic "WHMS" | u32 version | u64 memory size | u32 block count
//! then per block: u64 begin | u64 end | bytes[end - begin]
//! ```
//!
//! Restore writes through the byte poke path, so it bypasses write
//! permissions but respects page mapping, and it invalidates LR reservations
//! like any other poke.

use crate::memory::Memory;
use log::{info, warn};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"WHMS";
const VERSION: u32 = 1;

/// Why a snapshot save or restore failed.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: not a memory snapshot (bad magic)", path.display())]
    BadMagic { path: PathBuf },
    #[error("{}: unsupported snapshot version {found}", path.display())]
    BadVersion { path: PathBuf, found: u32 },
    #[error(
        "{}: snapshot of a {file_size:#x} byte memory does not fit in {memory_size:#x} bytes",
        path.display()
    )]
    SizeMismatch {
        path: PathBuf,
        file_size: u64,
        memory_size: u64,
    },
    #[error("{}: invalid block [{begin:#x}, {end:#x})", path.display())]
    BadBlock { path: PathBuf, begin: u64, end: u64 },
    #[error("{}: block byte at {address:#x} falls outside mapped memory", path.display())]
    Unmapped { path: PathBuf, address: u64 },
}

pub(crate) fn save(
    memory: &Memory,
    path: &Path,
    blocks: &[(u64, u64)],
) -> Result<(), SnapshotError> {
    for &(begin, end) in blocks {
        if begin >= end || end > memory.size() {
            return Err(SnapshotError::BadBlock {
                path: path.into(),
                begin,
                end,
            });
        }
    }

    let file = File::create(path).map_err(|source| io_error(path, source))?;
    let mut out = BufWriter::new(file);
    let write = |out: &mut BufWriter<File>, bytes: &[u8]| {
        out.write_all(bytes).map_err(|source| io_error(path, source))
    };

    write(&mut out, &MAGIC)?;
    write(&mut out, &VERSION.to_le_bytes())?;
    write(&mut out, &memory.size().to_le_bytes())?;
    write(&mut out, &(blocks.len() as u32).to_le_bytes())?;

    let mut buffer = vec![0u8; 64 * 1024];
    for &(begin, end) in blocks {
        write(&mut out, &begin.to_le_bytes())?;
        write(&mut out, &end.to_le_bytes())?;
        let mut address = begin;
        while address < end {
            let chunk = buffer.len().min((end - address) as usize);
            memory.storage().read(address, &mut buffer[..chunk]);
            write(&mut out, &buffer[..chunk])?;
            address += chunk as u64;
        }
    }
    out.flush().map_err(|source| io_error(path, source))?;

    info!(
        "{}: saved {} blocks of a {:#x} byte memory",
        path.display(),
        blocks.len(),
        memory.size()
    );
    Ok(())
}

pub(crate) fn load(memory: &Memory, path: &Path) -> Result<u64, SnapshotError> {
    let file = File::open(path).map_err(|source| io_error(path, source))?;
    let mut input = BufReader::new(file);

    let mut magic = [0u8; 4];
    read_exact(&mut input, path, &mut magic)?;
    if magic != MAGIC {
        return Err(SnapshotError::BadMagic { path: path.into() });
    }
    let version = read_u32(&mut input, path)?;
    if version != VERSION {
        return Err(SnapshotError::BadVersion {
            path: path.into(),
            found: version,
        });
    }
    let file_size = read_u64(&mut input, path)?;
    if file_size > memory.size() {
        return Err(SnapshotError::SizeMismatch {
            path: path.into(),
            file_size,
            memory_size: memory.size(),
        });
    }
    let block_count = read_u32(&mut input, path)?;

    let mut skipped: u64 = 0;
    let mut buffer = vec![0u8; 64 * 1024];
    for _ in 0..block_count {
        let begin = read_u64(&mut input, path)?;
        let end = read_u64(&mut input, path)?;
        if begin >= end || end > memory.size() {
            return Err(SnapshotError::BadBlock {
                path: path.into(),
                begin,
                end,
            });
        }
        let mut address = begin;
        while address < end {
            let chunk = buffer.len().min((end - address) as usize);
            read_exact(&mut input, path, &mut buffer[..chunk])?;
            for (offset, &byte) in buffer[..chunk].iter().enumerate() {
                match memory.poke_byte(address + offset as u64, byte) {
                    Ok(()) => {}
                    Err(_) if !memory.check_unmapped_elf() => skipped += 1,
                    Err(_) => {
                        return Err(SnapshotError::Unmapped {
                            path: path.into(),
                            address: address + offset as u64,
                        });
                    }
                }
            }
            address += chunk as u64;
        }
    }

    if skipped > 0 {
        warn!(
            "{}: skipped {} snapshot bytes falling on unmapped pages",
            path.display(),
            skipped
        );
    }
    Ok(skipped)
}

fn io_error(path: &Path, source: io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.into(),
        source,
    }
}

fn read_exact(input: &mut impl Read, path: &Path, buf: &mut [u8]) -> Result<(), SnapshotError> {
    input.read_exact(buf).map_err(|source| io_error(path, source))
}

fn read_u32(input: &mut impl Read, path: &Path) -> Result<u32, SnapshotError> {
    let mut bytes = [0u8; 4];
    read_exact(input, path, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(input: &mut impl Read, path: &Path) -> Result<u64, SnapshotError> {
    let mut bytes = [0u8; 8];
    read_exact(input, path, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Config;
    use tempfile::tempdir;

    fn memory(size: u64) -> Memory {
        Memory::new(Config {
            size,
            region_size: 1 << 20,
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn test_save_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.snap");

        let source = memory(1 << 20);
        source.poke_word(0x1000, 0xdead_beef).unwrap();
        source.poke_word(0x8ffc, 0xcafe_f00d).unwrap();
        source
            .save_snapshot(&path, &[(0x1000, 0x2000), (0x8000, 0x9000)])
            .unwrap();

        let target = memory(1 << 20);
        target.poke_word(0x1000, 0x1111_1111).unwrap();
        assert_eq!(0, target.load_snapshot(&path).unwrap());
        assert_eq!(0xdead_beef, target.read_word(0x1000).unwrap());
        assert_eq!(0xcafe_f00d, target.read_word(0x8ffc).unwrap());
        // Outside the saved blocks nothing changed.
        assert_eq!(0, target.read_word(0x3000).unwrap());
    }

    #[test]
    fn test_restore_into_larger_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.snap");
        let source = memory(1 << 20);
        source.poke_byte(0x42, 0x5a).unwrap();
        source.save_snapshot(&path, &[(0x0, 0x100)]).unwrap();

        let target = memory(2 << 20);
        target.load_snapshot(&path).unwrap();
        assert_eq!(0x5a, target.read_byte(0x42).unwrap());
    }

    #[test]
    fn test_restore_into_smaller_memory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.snap");
        let source = memory(2 << 20);
        source.save_snapshot(&path, &[(0x0, 0x100)]).unwrap();

        let target = memory(1 << 20);
        assert!(matches!(
            target.load_snapshot(&path),
            Err(SnapshotError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_save_rejects_bad_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.snap");
        let source = memory(1 << 20);
        assert!(matches!(
            source.save_snapshot(&path, &[(0x2000, 0x1000)]),
            Err(SnapshotError::BadBlock { .. })
        ));
        assert!(matches!(
            source.save_snapshot(&path, &[(0x0, (1 << 20) + 1)]),
            Err(SnapshotError::BadBlock { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.snap");
        std::fs::write(&path, b"NOPE").unwrap();
        let target = memory(1 << 20);
        assert!(matches!(
            target.load_snapshot(&path),
            Err(SnapshotError::Io { .. }) | Err(SnapshotError::BadMagic { .. })
        ));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"WHMS");
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&(1u64 << 20).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            target.load_snapshot(&path),
            Err(SnapshotError::BadVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_restore_invalidates_reservations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mem.snap");
        let source = memory(1 << 20);
        source.save_snapshot(&path, &[(0x1000, 0x1010)]).unwrap();

        let target = memory(1 << 20);
        let hart = target.hart_port(0).unwrap();
        hart.make_reservation(0x1008, 4);
        target.load_snapshot(&path).unwrap();
        assert!(!hart.has_reservation(0x1008));
    }
}
