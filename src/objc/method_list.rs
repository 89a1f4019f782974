/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `method_list_t` parsing: absolute and relative layouts (§4.F).
//!
//! A method list starts with `{ entsize: u32, count: u32 }` followed by
//! `count` entries. Bit 31 of `entsize` flags the "small" (relative) layout
//! introduced for iOS 14; everything else about the header is shared.

use crate::error::Result;
use crate::intern::{InternedStr, Interner};
use crate::macho::ParsedBinary;
use crate::reader::{ByteView, Endian};

const ENTSIZE_RELATIVE_FLAG: u32 = 0x8000_0000;
const ENTSIZE_MASK: u32 = !ENTSIZE_RELATIVE_FLAG;

/// One method entry with layout already normalized to absolute addresses
/// (§4.F: "the analyzer stores absolute addresses uniformly").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMethod {
    pub name_address: u64,
    pub types_address: u64,
    pub implementation_address: u64,
}

/// Parses the method list at `address`, selecting the absolute or relative
/// layout from `use_relative` (decided by the caller from the entsize flag
/// and deployment target, per §4.F).
pub fn parse_method_list(
    binary: &ParsedBinary,
    address: u64,
    use_relative_hint: bool,
    warnings: &mut crate::error::Warnings,
    strict: bool,
) -> Result<Vec<RawMethod>> {
    if address == 0 {
        return Ok(Vec::new());
    }
    let header = binary.vm_read(address, 8)?;
    let view = ByteView::new(header, binary.endian());
    let entsize_raw = view.read_u32(0)?;
    let count = view.read_u32(4)?;

    let flag_relative = entsize_raw & ENTSIZE_RELATIVE_FLAG != 0;
    if flag_relative != use_relative_hint {
        warnings.push(crate::error::Warning::AmbiguousLayout { address }, strict)?;
    }
    // §7: "Prefer the flag bit in the header" when the two disagree.
    let relative = flag_relative;
    let entry_size = if relative { 12 } else { 24 };
    let _ = entsize_raw & ENTSIZE_MASK; // real per-entry size, unused: fixed by layout kind

    let mut methods = Vec::with_capacity(count as usize);
    let mut entry_addr = address + 8;
    for _ in 0..count {
        let method = if relative {
            parse_relative_method(binary, entry_addr)?
        } else {
            parse_absolute_method(binary, entry_addr)?
        };
        methods.push(method);
        entry_addr += entry_size;
    }
    Ok(methods)
}

fn parse_absolute_method(binary: &ParsedBinary, entry_addr: u64) -> Result<RawMethod> {
    let bytes = binary.vm_read(entry_addr, 24)?;
    let view = ByteView::new(bytes, binary.endian());
    Ok(RawMethod {
        name_address: view.read_u64(0)?,
        types_address: view.read_u64(8)?,
        implementation_address: view.read_u64(16)?,
    })
}

/// Each field is a 32-bit signed offset from that field's own address. The
/// name field additionally dereferences through a selector-reference slot
/// (§4.F).
fn parse_relative_method(binary: &ParsedBinary, entry_addr: u64) -> Result<RawMethod> {
    let name_field = entry_addr;
    let types_field = entry_addr + 4;
    let imp_field = entry_addr + 8;

    let selref_addr = rel_target(binary, name_field)?;
    let name_address = read_u64_at(binary, selref_addr)?;
    let types_address = rel_target(binary, types_field)?;
    let implementation_address = rel_target(binary, imp_field)?;

    Ok(RawMethod {
        name_address,
        types_address,
        implementation_address,
    })
}

fn rel_target(binary: &ParsedBinary, field_addr: u64) -> Result<u64> {
    let bytes = binary.vm_read(field_addr, 4)?;
    let offset = ByteView::new(bytes, binary.endian()).read_i32(0)?;
    Ok((field_addr as i64 + offset as i64) as u64)
}

fn read_u64_at(binary: &ParsedBinary, addr: u64) -> Result<u64> {
    let bytes = binary.vm_read(addr, 8)?;
    ByteView::new(bytes, binary.endian()).read_u64(0)
}

/// Reads the interned name of the C string at `addr`, used for both method
/// names/types and Objective-C class/category/protocol names, all plain
/// NUL-terminated strings in `__TEXT,__objc_methname` or similar.
pub fn read_cstr_name(binary: &ParsedBinary, addr: u64, interner: &Interner) -> Result<InternedStr> {
    if addr == 0 {
        return Ok(interner.intern(""));
    }
    // Strings of unknown length: read whatever the containing segment has
    // left and let `read_cstr_at` stop at the first NUL.
    let window = binary.vm_read_upto(addr, 512).unwrap_or(&[]);
    let name = ByteView::new(window, Endian::Little).read_cstr_at(0)?;
    Ok(interner.intern(&name))
}
