/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! `protocol_t` and `protocol_list_t` parsing (§4.F).

use crate::error::Result;
use crate::intern::{InternedStr, Interner};
use crate::macho::ParsedBinary;
use crate::objc::method_list::read_cstr_name;
use crate::reader::ByteView;

/// One `@protocol` declaration, name only -- the method requirements inside
/// a protocol are not modeled since nothing in §6's public interface
/// queries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjcProtocol {
    pub address: u64,
    pub name: InternedStr,
}

pub fn parse_protocol(binary: &ParsedBinary, address: u64, interner: &Interner) -> Result<ObjcProtocol> {
    let bytes = binary.vm_read(address, 16)?;
    let name_address = ByteView::new(bytes, binary.endian()).read_u64(8)?;
    Ok(ObjcProtocol {
        address,
        name: read_cstr_name(binary, name_address, interner)?,
    })
}

/// `protocol_list_t`: a `size_t count` followed by `count` pointers to
/// `protocol_t`.
pub fn parse_protocol_list(
    binary: &ParsedBinary,
    address: u64,
    interner: &Interner,
) -> Result<Vec<ObjcProtocol>> {
    if address == 0 {
        return Ok(Vec::new());
    }
    let header = binary.vm_read(address, 8)?;
    let count = ByteView::new(header, binary.endian()).read_u64(0)?;

    let mut protocols = Vec::with_capacity(count as usize);
    for i in 0..count {
        let slot_addr = address + 8 + i * 8;
        let slot = binary.vm_read(slot_addr, 8)?;
        let proto_addr = ByteView::new(slot, binary.endian()).read_u64(0)?;
        if proto_addr != 0 {
            protocols.push(parse_protocol(binary, proto_addr, interner)?);
        }
    }
    Ok(protocols)
}
