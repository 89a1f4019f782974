/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Imported-symbol and stub trampoline resolution (§4.E).
//!
//! Two independent paths name the same imported symbol, and both are
//! consulted: the indirect symbol table (which ties a `__stubs`/
//! `__la_symbol_ptr` slot back to an `nlist_64` by index) and the dyld bind
//! opcode stream (which names the symbol bound into a pointer slot directly
//! by address). When they disagree the table-derived name wins -- it is
//! always present for a normally linked binary, while a hand-crafted or
//! corrupted bind stream is exactly the case §7 wants surfaced as a warning
//! rather than silently trusted.

use std::collections::HashMap;

use crate::error::{Result, Warning};
use crate::intern::{InternedStr, Interner};
use crate::macho::load_command::DysymtabInfo;
use crate::macho::segment::SectionType;
use crate::macho::ParsedBinary;
use crate::reader::{read_sleb128, read_uleb128};
use crate::symtab::SymbolTable;

const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

/// One resolved stub trampoline: the address of the trampoline itself, the
/// pointer slot it loads through, and the imported symbol it resolves to
/// (§4.E).
#[derive(Debug, Clone, Copy)]
pub struct Stub {
    pub stub_address: u64,
    pub pointer_address: u64,
    pub symbol_name: Option<InternedStr>,
}

/// The full stub index for one slice (§4.E).
#[derive(Debug, Default)]
pub struct StubTable {
    by_stub_address: HashMap<u64, Stub>,
    by_pointer_address: HashMap<u64, Stub>,
}

impl StubTable {
    pub fn build(
        binary: &ParsedBinary,
        symtab: &SymbolTable,
        dysymtab: Option<DysymtabInfo>,
        interner: &Interner,
        warnings: &mut crate::error::Warnings,
        strict: bool,
    ) -> Result<StubTable> {
        let mut table = StubTable::default();

        let indirect_names = dysymtab
            .map(|d| Self::read_indirect_table(binary, d, symtab))
            .transpose()?
            .unwrap_or_default();

        let bind_names = Self::read_bind_names(binary, interner)?;

        let stub_sections: Vec<_> = binary
            .segments()
            .iter()
            .flat_map(|s| s.sections.iter())
            .filter(|s| matches!(s.section_type(), SectionType::SymbolStubs))
            .collect();
        let pointer_sections: Vec<_> = binary
            .segments()
            .iter()
            .flat_map(|s| s.sections.iter())
            .filter(|s| {
                matches!(
                    s.section_type(),
                    SectionType::LazySymbolPointers | SectionType::NonLazySymbolPointers
                )
            })
            .collect();

        for stub_section in &stub_sections {
            let stub_size = stub_section.reserved2.max(1) as u64;
            let count = stub_section.size / stub_size;
            // The matching pointer section is the one whose indirect-symbol
            // range overlaps the stub section's, which in every binary this
            // crate has been exercised on is simply "the single lazy pointer
            // section": binaries with more than one `__stubs` section are
            // out of scope (§2 Non-goals).
            let pointer_section = pointer_sections.first();

            for i in 0..count {
                let stub_address = stub_section.address + i * stub_size;
                let indirect_index = stub_section.reserved1 + i as u32;
                let table_name = indirect_names.get(&indirect_index).copied();

                let pointer_address = pointer_section.map(|p| p.address + i * 8);
                let bind_name = pointer_address.and_then(|a| bind_names.get(&a).copied());

                if let (Some(t), Some(b)) = (table_name, bind_name) {
                    if interner.resolve(t) != interner.resolve(b) {
                        warnings.push(
                            Warning::StubResolutionDisagreement {
                                pointer: pointer_address.unwrap_or(0),
                                table_name: Some(interner.resolve(t).to_string()),
                                bind_name: Some(interner.resolve(b).to_string()),
                            },
                            strict,
                        )?;
                    }
                }

                let symbol_name = table_name.or(bind_name);
                let stub = Stub {
                    stub_address,
                    pointer_address: pointer_address.unwrap_or(0),
                    symbol_name,
                };
                table.by_stub_address.insert(stub_address, stub);
                if let Some(p) = pointer_address {
                    table.by_pointer_address.insert(p, stub);
                }
            }
        }

        Ok(table)
    }

    fn read_indirect_table(
        binary: &ParsedBinary,
        dysymtab: DysymtabInfo,
        symtab: &SymbolTable,
    ) -> Result<HashMap<u32, InternedStr>> {
        let view = crate::reader::ByteView::new(binary.data(), binary.endian());
        let mut names = HashMap::new();
        for i in 0..dysymtab.nindirectsyms {
            let off = dysymtab.indirectsymoff as usize + i as usize * 4;
            let symtab_index = view.read_u32(off)?;
            if symtab_index & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
                continue;
            }
            if let Some(sym) = symtab.get(symtab_index as usize) {
                names.insert(i, sym.name);
            }
        }
        Ok(names)
    }

    /// Walks the (lazy and non-lazy) bind opcode streams, a small stack
    /// machine described in `<mach-o/loader.h>`, recording the symbol name
    /// bound at each pointer address it writes to (§4.E point 4).
    fn read_bind_names(binary: &ParsedBinary, interner: &Interner) -> Result<HashMap<u64, InternedStr>> {
        let mut names = HashMap::new();
        let Some(dyld_info) = binary.dyld_info() else {
            return Ok(names);
        };
        for (off, size) in [
            (dyld_info.bind_off, dyld_info.bind_size),
            (dyld_info.lazy_bind_off, dyld_info.lazy_bind_size),
        ] {
            if size == 0 {
                continue;
            }
            let stream = binary.file_read(off as usize, size as usize)?;
            Self::walk_bind_stream(binary, stream, interner, &mut names);
        }
        Ok(names)
    }

    fn walk_bind_stream(
        binary: &ParsedBinary,
        stream: &[u8],
        interner: &Interner,
        names: &mut HashMap<u64, InternedStr>,
    ) {
        const DONE: u8 = 0x0;
        const SET_SYMBOL_TRAILING_FLAGS_ULEB: u8 = 0x40;
        const SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
        const ADD_ADDR_ULEB: u8 = 0x80;
        const DO_BIND: u8 = 0x90;
        const DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
        const DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
        const DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
        const OPCODE_MASK: u8 = 0xF0;
        const IMM_MASK: u8 = 0x0F;

        let mut offset = 0usize;
        let mut segment_index: Option<usize> = None;
        let mut segment_offset: u64 = 0;
        let mut symbol_name: Option<String> = None;

        while offset < stream.len() {
            let byte = stream[offset];
            offset += 1;
            let opcode = byte & OPCODE_MASK;
            let imm = byte & IMM_MASK;
            match opcode {
                DONE => break,
                SET_SYMBOL_TRAILING_FLAGS_ULEB => {
                    let end = stream[offset..]
                        .iter()
                        .position(|&b| b == 0)
                        .map(|p| offset + p)
                        .unwrap_or(stream.len());
                    symbol_name = Some(String::from_utf8_lossy(&stream[offset..end]).into_owned());
                    offset = (end + 1).min(stream.len());
                }
                SET_SEGMENT_AND_OFFSET_ULEB => {
                    segment_index = Some(imm as usize);
                    let Ok((val, next)) = read_uleb128(stream, offset) else {
                        break;
                    };
                    segment_offset = val;
                    offset = next;
                }
                ADD_ADDR_ULEB => {
                    let Ok((val, next)) = read_uleb128(stream, offset) else {
                        break;
                    };
                    segment_offset = segment_offset.wrapping_add(val);
                    offset = next;
                }
                DO_BIND => {
                    Self::record_bind(binary, segment_index, segment_offset, &symbol_name, interner, names);
                    segment_offset += 8;
                }
                DO_BIND_ADD_ADDR_ULEB => {
                    Self::record_bind(binary, segment_index, segment_offset, &symbol_name, interner, names);
                    let Ok((val, next)) = read_uleb128(stream, offset) else {
                        break;
                    };
                    segment_offset = segment_offset.wrapping_add(8).wrapping_add(val);
                    offset = next;
                }
                DO_BIND_ADD_ADDR_IMM_SCALED => {
                    Self::record_bind(binary, segment_index, segment_offset, &symbol_name, interner, names);
                    segment_offset = segment_offset.wrapping_add(8).wrapping_add(imm as u64 * 8);
                }
                DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let Ok((count, next)) = read_uleb128(stream, offset) else {
                        break;
                    };
                    let Ok((skip, next2)) = read_uleb128(stream, next) else {
                        break;
                    };
                    offset = next2;
                    for _ in 0..count {
                        Self::record_bind(binary, segment_index, segment_offset, &symbol_name, interner, names);
                        segment_offset = segment_offset.wrapping_add(8).wrapping_add(skip);
                    }
                }
                0x10 /* SET_DYLIB_ORDINAL_IMM */ | 0x50 /* SET_TYPE_IMM */ | 0x30 => {}
                0x20 /* SET_DYLIB_ORDINAL_ULEB */ => {
                    let Ok((_, next)) = read_uleb128(stream, offset) else {
                        break;
                    };
                    offset = next;
                }
                0x60 /* SET_ADDEND_SLEB */ => {
                    let Ok((_, next)) = read_sleb128(stream, offset) else {
                        break;
                    };
                    offset = next;
                }
                _ => break,
            }
        }
    }

    fn record_bind(
        binary: &ParsedBinary,
        segment_index: Option<usize>,
        segment_offset: u64,
        symbol_name: &Option<String>,
        interner: &Interner,
        names: &mut HashMap<u64, InternedStr>,
    ) {
        let (Some(idx), Some(name)) = (segment_index, symbol_name) else {
            return;
        };
        let Some(segment) = binary.segments().get(idx) else {
            return;
        };
        let address = segment.vm_address + segment_offset;
        names.insert(address, interner.intern(name));
    }

    pub fn by_stub_address(&self, address: u64) -> Option<&Stub> {
        self.by_stub_address.get(&address)
    }

    pub fn by_pointer_address(&self, address: u64) -> Option<&Stub> {
        self.by_pointer_address.get(&address)
    }

    pub fn stubs(&self) -> impl Iterator<Item = &Stub> {
        self.by_stub_address.values()
    }

    pub fn len(&self) -> usize {
        self.by_stub_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_stub_address.is_empty()
    }
}
