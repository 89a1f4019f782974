/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Symbol and string table reading (§4.D: `nlist_64`, string table,
//! `name_of` resolution).

use crate::error::Result;
use crate::intern::{InternedStr, Interner};
use crate::macho::load_command::SymtabInfo;
use crate::macho::ParsedBinary;
use crate::reader::ByteView;

const N_STAB: u8 = 0xe0;
const N_TYPE: u8 = 0x0e;
const N_EXT: u8 = 0x01;
const N_UNDF: u8 = 0x0;
const N_SECT: u8 = 0xe;

/// One decoded `nlist_64` entry (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub name: InternedStr,
    pub kind: SymbolKind,
    pub is_external: bool,
    pub section_index: u8,
    pub value: u64,
}

/// Coarse classification of an `nlist_64.n_type`, per §4.D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// `N_STAB` bits set: a debugger-only symbol, not part of the public
    /// surface this crate indexes.
    Debug,
    /// `N_UNDF`: imported from another image, resolved at load time.
    Undefined,
    /// `N_SECT`: defined in one of this slice's sections.
    Defined,
    /// Any other `N_TYPE` value (`N_ABS`, `N_PBUD`, `N_INDR`) -- rare in
    /// ARM64 application binaries and treated uniformly as "other".
    Other,
}

/// The full symbol table of one slice: every [Symbol] plus the string table
/// used to resolve interned names (§4.D).
#[derive(Debug)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    /// Parses `nsyms` `nlist_64` entries starting at `symoff`, resolving
    /// each `n_strx` against the string table at `[stroff, stroff+strsize)`
    /// (§4.D). Names are interned through `interner`.
    pub fn parse(binary: &ParsedBinary, info: SymtabInfo, interner: &Interner) -> Result<Self> {
        let view = ByteView::new(binary.data(), binary.endian());
        let str_bytes = binary.file_read(info.stroff as usize, info.strsize as usize)?;

        let mut symbols = Vec::with_capacity(info.nsyms as usize);
        for i in 0..info.nsyms {
            let off = info.symoff as usize + i as usize * 16; // sizeof(nlist_64)
            let n_strx = view.read_u32(off)?;
            let n_type = view.read_u8(off + 4)?;
            let n_sect = view.read_u8(off + 5)?;
            let n_value = view.read_u64(off + 8)?;

            let name = read_str_table_entry(str_bytes, n_strx)?;
            let kind = if n_type & N_STAB != 0 {
                SymbolKind::Debug
            } else {
                match n_type & N_TYPE {
                    N_UNDF => SymbolKind::Undefined,
                    N_SECT => SymbolKind::Defined,
                    _ => SymbolKind::Other,
                }
            };
            symbols.push(Symbol {
                name: interner.intern(&name),
                kind,
                is_external: n_type & N_EXT != 0,
                section_index: n_sect,
                value: n_value,
            });
        }

        Ok(SymbolTable { symbols })
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn defined(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(|s| matches!(s.kind, SymbolKind::Defined))
    }

    pub fn undefined(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols
            .iter()
            .filter(|s| matches!(s.kind, SymbolKind::Undefined))
    }

    /// The defined, exported symbol (if any) whose address is exactly
    /// `address`.
    pub fn defined_at(&self, address: u64) -> Option<&Symbol> {
        self.defined().find(|s| s.value == address)
    }

    pub fn get(&self, index: usize) -> Option<&Symbol> {
        self.symbols.get(index)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Reads a NUL-terminated entry out of a string table blob at byte offset
/// `n_strx`, the shared helper both the symbol table and the indirect
/// symbol table (§4.E) use to resolve a `name_of`.
pub(crate) fn read_str_table_entry(str_bytes: &[u8], n_strx: u32) -> Result<String> {
    if n_strx == 0 {
        return Ok(String::new());
    }
    let view = ByteView::new(str_bytes, crate::reader::Endian::Little);
    view.read_cstr_at(n_strx as usize)
        .map_err(|_| crate::error::Error::StringIndexOutOfRange {
            index: n_strx,
            len: str_bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::AnalyzerOptions;

    fn build_fixture() -> (ParsedBinary, SymtabInfo) {
        // header(32) + one LC_SYMTAB command(24)
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&0xfeedfacfu32.to_le_bytes());
        data[16..20].copy_from_slice(&1u32.to_le_bytes()); // ncmds
        data[20..24].copy_from_slice(&24u32.to_le_bytes()); // sizeofcmds

        let symoff = 32 + 24;
        let stroff = symoff + 16 * 2;
        let strtab = b"\0_foo\0_bar\0";

        data.extend_from_slice(&2u32.to_le_bytes()); // LC_SYMTAB
        data.extend_from_slice(&24u32.to_le_bytes());
        data.extend_from_slice(&(symoff as u32).to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&(stroff as u32).to_le_bytes());
        data.extend_from_slice(&(strtab.len() as u32).to_le_bytes());

        // nlist_64 for "_foo": defined, external, value 0x4000
        data.extend_from_slice(&1u32.to_le_bytes()); // n_strx -> "_foo"
        data.push(N_SECT | N_EXT);
        data.push(1); // n_sect
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0x4000u64.to_le_bytes());

        // nlist_64 for "_bar": undefined, external
        data.extend_from_slice(&6u32.to_le_bytes()); // n_strx -> "_bar"
        data.push(N_UNDF | N_EXT);
        data.push(0);
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());

        data.extend_from_slice(strtab);

        let info = SymtabInfo {
            symoff: symoff as u32,
            nsyms: 2,
            stroff: stroff as u32,
            strsize: strtab.len() as u32,
        };
        let binary = ParsedBinary::parse(data, &AnalyzerOptions::new()).unwrap();
        (binary, info)
    }

    #[test]
    fn parses_defined_and_undefined_symbols() {
        let (binary, info) = build_fixture();
        let interner = Interner::new();
        let table = SymbolTable::parse(&binary, info, &interner).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.defined().count(), 1);
        assert_eq!(table.undefined().count(), 1);
        let foo = table.defined_at(0x4000).unwrap();
        assert_eq!(&*interner.resolve(foo.name), "_foo");
    }
}
