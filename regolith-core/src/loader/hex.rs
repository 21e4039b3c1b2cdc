//! Loader for the line-oriented HEX format.
//!
//! A line holds either `@<hex>`, which moves the byte-write cursor to the
//! given address, or whitespace-separated tokens of exactly two hex digits,
//! each written at the cursor which then advances by one. `#` starts a
//! comment running to the end of the line; blank lines are allowed. Anything
//! else fails the load.

use super::LoadError;
use crate::memory::Memory;
use log::info;
use std::fs;
use std::path::Path;

pub(crate) fn load_file(memory: &mut Memory, path: &Path) -> Result<(), LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.into(),
        source,
    })?;

    let mut cursor: u64 = 0;
    let mut written: u64 = 0;
    for (index, raw_line) in text.lines().enumerate() {
        let line = index + 1;
        let content = match raw_line.find('#') {
            Some(comment) => &raw_line[..comment],
            None => raw_line,
        };
        for token in content.split_whitespace() {
            if let Some(address) = token.strip_prefix('@') {
                let digits = address
                    .strip_prefix("0x")
                    .or_else(|| address.strip_prefix("0X"))
                    .unwrap_or(address);
                cursor = u64::from_str_radix(digits, 16).map_err(|_| LoadError::HexSyntax {
                    path: path.into(),
                    line,
                    reason: format!("invalid address token `{token}`"),
                })?;
            } else if token.len() == 2 {
                let byte = u8::from_str_radix(token, 16).map_err(|_| LoadError::HexSyntax {
                    path: path.into(),
                    line,
                    reason: format!("malformed byte token `{token}`"),
                })?;
                memory
                    .poke_byte(cursor, byte)
                    .map_err(|_| LoadError::HexUnmapped {
                        path: path.into(),
                        line,
                        address: cursor,
                    })?;
                cursor += 1;
                written += 1;
            } else {
                return Err(LoadError::HexSyntax {
                    path: path.into(),
                    line,
                    reason: format!("unrecognized token `{token}`"),
                });
            }
        }
    }

    info!("{}: wrote {} bytes", path.display(), written);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::memory::{Config, Memory};
    use crate::LoadError;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn memory() -> Memory {
        Memory::new(Config {
            size: 1 << 20,
            region_size: 1 << 20,
            ..Config::default()
        })
        .unwrap()
    }

    fn load(memory: &mut Memory, content: &str) -> Result<(), LoadError> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        memory.load_hex_file(file.path())
    }

    #[test]
    fn test_cursor_and_bytes() {
        let mut memory = memory();
        load(&mut memory, "@0x100\n01 02 03 04\n").unwrap();
        assert_eq!(0x0403_0201, memory.read_word(0x100).unwrap());
    }

    #[test]
    fn test_address_without_prefix() {
        let mut memory = memory();
        load(&mut memory, "@200\nff\n").unwrap();
        assert_eq!(0xff, memory.read_byte(0x200).unwrap());
    }

    #[test]
    fn test_cursor_moves_between_runs() {
        let mut memory = memory();
        load(&mut memory, "@10\naa bb\n@20\ncc\n").unwrap();
        assert_eq!(0xaa, memory.read_byte(0x10).unwrap());
        assert_eq!(0xbb, memory.read_byte(0x11).unwrap());
        assert_eq!(0xcc, memory.read_byte(0x20).unwrap());
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let mut memory = memory();
        load(
            &mut memory,
            "# header comment\n\n@0x40 # set cursor\nde ad # two bytes\n",
        )
        .unwrap();
        assert_eq!(0xde, memory.read_byte(0x40).unwrap());
        assert_eq!(0xad, memory.read_byte(0x41).unwrap());
    }

    #[test]
    fn test_malformed_byte_token() {
        let mut memory = memory();
        let err = load(&mut memory, "@0\n0 1\n").unwrap_err();
        assert!(matches!(err, LoadError::HexSyntax { line: 2, .. }));
        let err = load(&mut memory, "zz\n").unwrap_err();
        assert!(matches!(err, LoadError::HexSyntax { line: 1, .. }));
        let err = load(&mut memory, "012\n").unwrap_err();
        assert!(matches!(err, LoadError::HexSyntax { line: 1, .. }));
    }

    #[test]
    fn test_invalid_address_token() {
        let mut memory = memory();
        let err = load(&mut memory, "@wat\n").unwrap_err();
        assert!(matches!(err, LoadError::HexSyntax { line: 1, .. }));
    }

    #[test]
    fn test_write_past_end_of_memory() {
        let mut memory = memory();
        let err = load(&mut memory, "@0xfffff\n01 02\n").unwrap_err();
        assert!(matches!(
            err,
            LoadError::HexUnmapped {
                line: 2,
                address: 0x10_0000,
                ..
            }
        ));
        // The first byte was committed before the failure.
        assert_eq!(0x01, memory.read_byte(0xf_ffff).unwrap());
    }
}
