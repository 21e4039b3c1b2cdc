//! Symbols collected from loaded ELF files.

use std::collections::HashMap;
use std::io;

/// Location and size of an ELF symbol.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Symbol {
    pub address: u64,
    pub size: u64,
}

/// Name-keyed table of the symbols of every loaded ELF file.
///
/// Loaders populate the table; it is never mutated afterwards. Callers use it
/// to resolve well-known names (`_start`, `tohost`, `_finish`) and to find
/// the function containing a program counter when tracing.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: String, symbol: Symbol) {
        self.symbols.insert(name, symbol);
    }

    /// Look up a symbol by name.
    pub fn find(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    /// Find the symbol whose `[address, address + size)` range contains
    /// `address`, together with its name.
    ///
    /// When nested symbols cover the same address, the smallest one wins.
    pub fn function_containing(&self, address: u64) -> Option<(&str, Symbol)> {
        self.symbols
            .iter()
            .filter(|(_, symbol)| {
                address >= symbol.address && address - symbol.address < symbol.size
            })
            .min_by_key(|(_, symbol)| symbol.size)
            .map(|(name, symbol)| (name.as_str(), *symbol))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Write all symbols as `<name> <address>` lines, ordered by address.
    pub fn write_to(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let mut symbols: Vec<_> = self.symbols.iter().collect();
        symbols.sort_by_key(|(name, symbol)| (symbol.address, name.as_str()));
        for (name, symbol) in symbols {
            writeln!(out, "{} {:#x}", name, symbol.address)?;
        }
        Ok(())
    }
}
