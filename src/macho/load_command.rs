/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Load command identifiers and the small value types they produce.
//!
//! §4.C names the load commands this crate extracts data from. This module
//! is the "arch-independent dispatcher" the design notes (§9) describe: each
//! concrete on-disk layout (32-bit `segment_command` vs. 64-bit
//! `segment_command_64`, etc.) is read by [`super::ParsedBinary::parse`],
//! and produces one of the logical structures defined here.

pub const LC_REQ_DYLD: u32 = 0x8000_0000;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;

/// `symtab_command` (§4.C: `LC_SYMTAB`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SymtabInfo {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// `dysymtab_command` (§4.C: `LC_DYSYMTAB`). Only the fields downstream
/// components use are kept; the rest of the real struct (TOC, module table,
/// referenced symbol table) is out of scope for this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DysymtabInfo {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
}

/// `dyld_info_command` (§4.C: `LC_DYLD_INFO[_ONLY]`). Retained so the bind
/// opcode stream can be located for chained-fixups-style stub resolution
/// (§4.E point 4).
#[derive(Debug, Clone, Copy, Default)]
pub struct DyldInfo {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// A platform as recorded by `LC_BUILD_VERSION` or inferred from a legacy
/// `LC_VERSION_MIN_*` command (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    IOs,
    TvOs,
    WatchOs,
    Unknown(u32),
}

/// A dotted `X.Y.Z` version as packed into a Mach-O version field
/// (`nibble` format: `X.Y.Z` encoded as `(X << 16) | (Y << 8) | Z`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub fn from_packed(packed: u32) -> Version {
        Version {
            major: (packed >> 16) as u16,
            minor: (packed >> 8) as u8,
            patch: packed as u8,
        }
    }
}

/// Build platform, deployment target and SDK version, from either
/// `LC_BUILD_VERSION` or a legacy `LC_VERSION_MIN_*` command (§4.C).
#[derive(Debug, Clone, PartialEq)]
pub struct BuildVersion {
    pub platform: Platform,
    pub min_os: Version,
    pub sdk: Version,
    pub tools: Vec<(u32, Version)>,
}
