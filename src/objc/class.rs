/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `class_t`/`class_ro_t`/`category_t` parsing (§4.F).
//!
//! Field offsets below are the stable objc4 ABI for 64-bit (widened from
//! the teacher's 32-bit `objc_class`/`objc_ivar` structs in `objc.rs`: this
//! crate only ever sees ARM64 Objective-C metadata, which is always LP64).

use crate::error::Result;
use crate::intern::{InternedStr, Interner};
use crate::macho::ParsedBinary;
use crate::objc::method_list::{parse_method_list, read_cstr_name, RawMethod};
use crate::objc::protocol::{parse_protocol_list, ObjcProtocol};
use crate::reader::ByteView;

/// Low 3 bits of `class_t.bits` are flags; the rest is the `class_ro_t`/
/// `class_rw_t` pointer.
pub const FAST_DATA_MASK: u64 = 0x0000_7ffffffffff8;

const CLASS_T_SIZE: u64 = 40; // isa(8) + superclass(8) + cache(16) + bits(8)

/// A resolved method, selector and implementation together with the
/// selector's type encoding (§3: `ObjcSelector`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjcSelector {
    pub name: InternedStr,
    pub type_encoding: String,
    pub implementation_address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjcIvar {
    pub name: InternedStr,
    pub type_encoding: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjcClass {
    pub address: u64,
    pub name: InternedStr,
    pub superclass_name: Option<InternedStr>,
    pub is_metaclass: bool,
    pub methods: Vec<ObjcSelector>,
    pub ivars: Vec<ObjcIvar>,
    pub protocols: Vec<InternedStr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjcCategory {
    pub address: u64,
    pub name: InternedStr,
    pub base_class_name: Option<InternedStr>,
    pub instance_methods: Vec<ObjcSelector>,
    pub class_methods: Vec<ObjcSelector>,
    pub protocols: Vec<InternedStr>,
}

fn to_selectors(raw: Vec<RawMethod>, binary: &ParsedBinary, interner: &Interner) -> Result<Vec<ObjcSelector>> {
    raw.into_iter()
        .map(|m| {
            Ok(ObjcSelector {
                name: read_cstr_name(binary, m.name_address, interner)?,
                type_encoding: read_c_string(binary, m.types_address)?,
                implementation_address: m.implementation_address,
            })
        })
        .collect()
}

fn read_c_string(binary: &ParsedBinary, addr: u64) -> Result<String> {
    if addr == 0 {
        return Ok(String::new());
    }
    let window = binary.vm_read_upto(addr, 512).unwrap_or(&[]);
    ByteView::new(window, binary.endian()).read_cstr_at(0)
}

fn protocol_names(protocols: Vec<ObjcProtocol>) -> Vec<InternedStr> {
    protocols.into_iter().map(|p| p.name).collect()
}

/// Parses the `class_t` at `address`, its `class_ro_t` (masked by
/// [FAST_DATA_MASK]), method list, ivar list and protocol list. Whether the
/// method list uses the relative layout is decided by the caller and passed
/// in as `use_relative_methods` (§4.F: header flag OR deployment target).
pub fn parse_class(
    binary: &ParsedBinary,
    address: u64,
    is_metaclass: bool,
    use_relative_methods: bool,
    interner: &Interner,
    warnings: &mut crate::error::Warnings,
    strict: bool,
) -> Result<ObjcClass> {
    let header = binary.vm_read(address, CLASS_T_SIZE as usize)?;
    let view = ByteView::new(header, binary.endian());
    let superclass_addr = view.read_u64(8)?;
    let bits = view.read_u64(32)?;
    let ro_addr = bits & FAST_DATA_MASK;

    let ro = binary.vm_read(ro_addr, 72)?;
    let ro_view = ByteView::new(ro, binary.endian());
    let name_addr = ro_view.read_u64(24)?;
    let method_list_addr = ro_view.read_u64(32)?;
    let protocol_list_addr = ro_view.read_u64(40)?;
    let ivar_list_addr = ro_view.read_u64(48)?;

    let name = read_cstr_name(binary, name_addr, interner)?;
    let raw_methods = parse_method_list(binary, method_list_addr, use_relative_methods, warnings, strict)?;
    let methods = to_selectors(raw_methods, binary, interner)?;
    let ivars = parse_ivar_list(binary, ivar_list_addr, interner)?;
    let protocols = protocol_names(parse_protocol_list(binary, protocol_list_addr, interner)?);

    let superclass_name = if superclass_addr != 0 {
        read_superclass_name(binary, superclass_addr, interner).ok()
    } else {
        None
    };

    Ok(ObjcClass {
        address,
        name,
        superclass_name,
        is_metaclass,
        methods,
        ivars,
        protocols,
    })
}

/// Names come from the superclass's own `class_ro_t`, so a superclass
/// reference is resolved enough to get a name without fully re-parsing its
/// method/ivar/protocol lists (the caller does that separately when it
/// walks to that class via `__objc_classlist`).
fn read_superclass_name(binary: &ParsedBinary, address: u64, interner: &Interner) -> Result<InternedStr> {
    let header = binary.vm_read(address, CLASS_T_SIZE as usize)?;
    let bits = ByteView::new(header, binary.endian()).read_u64(32)?;
    let ro_addr = bits & FAST_DATA_MASK;
    let ro = binary.vm_read(ro_addr, 32)?;
    let name_addr = ByteView::new(ro, binary.endian()).read_u64(24)?;
    read_cstr_name(binary, name_addr, interner)
}

/// `ivar_list_t`: same `{entsize, count}` header shape as a method list,
/// but each entry is `{ offset_ptr: u64, name: u64, type: u64, alignment: u32, size: u32 }`.
fn parse_ivar_list(binary: &ParsedBinary, address: u64, interner: &Interner) -> Result<Vec<ObjcIvar>> {
    if address == 0 {
        return Ok(Vec::new());
    }
    let header = binary.vm_read(address, 8)?;
    let count = ByteView::new(header, binary.endian()).read_u32(4)?;

    let mut ivars = Vec::with_capacity(count as usize);
    let mut entry_addr = address + 8;
    const IVAR_T_SIZE: u64 = 32;
    for _ in 0..count {
        let entry = binary.vm_read(entry_addr, IVAR_T_SIZE as usize)?;
        let view = ByteView::new(entry, binary.endian());
        let offset_ptr = view.read_u64(0)?;
        let name_addr = view.read_u64(8)?;
        let type_addr = view.read_u64(16)?;
        let offset = if offset_ptr != 0 {
            ByteView::new(binary.vm_read(offset_ptr, 4)?, binary.endian()).read_u32(0)? as u64
        } else {
            0
        };
        ivars.push(ObjcIvar {
            name: read_cstr_name(binary, name_addr, interner)?,
            type_encoding: read_c_string(binary, type_addr)?,
            offset,
        });
        entry_addr += IVAR_T_SIZE;
    }
    Ok(ivars)
}

/// `category_t`: `{ name, cls, instanceMethods, classMethods, protocols,
/// instanceProperties }`, all pointer-sized (§4.F / §3 `ObjcCategory`).
pub fn parse_category(
    binary: &ParsedBinary,
    address: u64,
    use_relative_methods: bool,
    interner: &Interner,
    warnings: &mut crate::error::Warnings,
    strict: bool,
) -> Result<ObjcCategory> {
    let bytes = binary.vm_read(address, 48)?;
    let view = ByteView::new(bytes, binary.endian());
    let name_addr = view.read_u64(0)?;
    let cls_addr = view.read_u64(8)?;
    let instance_methods_addr = view.read_u64(16)?;
    let class_methods_addr = view.read_u64(24)?;
    let protocols_addr = view.read_u64(32)?;

    let name = read_cstr_name(binary, name_addr, interner)?;
    let base_class_name = if cls_addr != 0 {
        read_superclass_name(binary, cls_addr, interner).ok()
    } else {
        None
    };
    let instance_methods = to_selectors(
        parse_method_list(binary, instance_methods_addr, use_relative_methods, warnings, strict)?,
        binary,
        interner,
    )?;
    let class_methods = to_selectors(
        parse_method_list(binary, class_methods_addr, use_relative_methods, warnings, strict)?,
        binary,
        interner,
    )?;
    let protocols = protocol_names(parse_protocol_list(binary, protocols_addr, interner)?);

    Ok(ObjcCategory {
        address,
        name,
        base_class_name,
        instance_methods,
        class_methods,
        protocols,
    })
}

/// The `isa` field of `address`'s `class_t`, i.e. its metaclass's address.
pub fn read_isa(binary: &ParsedBinary, address: u64) -> Result<u64> {
    let header = binary.vm_read(address, 8)?;
    ByteView::new(header, binary.endian()).read_u64(0)
}
