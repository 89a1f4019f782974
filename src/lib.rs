/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Static analysis of ARM64 Mach-O binaries.
//!
//! `machxray` reads a thin or FAT Mach-O file, exposes its structural
//! metadata (segments, sections, symbols, load commands), and performs
//! symbolic analysis of its ARM64 code: cross-references between functions,
//! resolution of imported/exported symbols, recovery of the Objective-C
//! runtime's classes and methods, and flow-insensitive per-instruction
//! register-contents tracking.
//!
//! The top-level flow:
//!
//! ```no_run
//! let bytes = std::fs::read("App").unwrap();
//! let archive = machxray::parse(bytes).unwrap();
//! let slice = archive.arm64_slice(&machxray::AnalyzerOptions::new()).unwrap().unwrap();
//! let analyzer = machxray::Analyzer::for_slice(&slice, machxray::AnalyzerOptions::new()).unwrap();
//! for entry in analyzer.functions().unwrap() {
//!     let _ = analyzer.function_analyzer(entry);
//! }
//! ```
//!
//! Nothing here does I/O beyond what the caller explicitly asks for
//! (reading a path, writing a cache file); diagnostics flow through
//! `tracing` rather than stdout/stderr, so embedding applications keep
//! control of their own logging.

pub mod analyzer;
pub mod cache;
pub mod disasm;
pub mod error;
pub mod fat;
pub mod intern;
pub mod macho;
pub mod objc;
pub mod options;
pub mod reader;
pub mod stubs;
pub mod symtab;

use std::sync::Arc;

pub use analyzer::{Analyzer, FunctionAnalyzer, XRefAnalyzer};
pub use error::{Error, Result, Warning, Warnings};
pub use fat::FatArchive;
pub use macho::load_command::{Platform, Version};
pub use options::AnalyzerOptions;
pub use symtab::Symbol;

use intern::Interner;
use macho::load_command::SymtabInfo;
use macho::segment::Section;
use macho::ParsedBinary;
use symtab::SymbolTable;

/// Parses the FAT-or-thin Mach-O header at the start of `data` (§4.B).
/// Convenience entry point mirroring [`FatArchive::parse`].
pub fn parse(data: impl Into<Arc<[u8]>>) -> Result<FatArchive> {
    FatArchive::parse(data)
}

/// Reads `path` and parses it as a FAT-or-thin Mach-O file.
pub fn parse_file(path: impl AsRef<std::path::Path>) -> Result<FatArchive> {
    let bytes = std::fs::read(path)?;
    FatArchive::parse(bytes)
}

impl FatArchive {
    /// Parses and returns the first ARM64 slice in this archive, if any
    /// (§6: `FatArchive.arm64_slice()`).
    pub fn arm64_slice(&self, options: &AnalyzerOptions) -> Result<Option<Slice>> {
        let Some(index) = self.arm64_slice_index() else {
            return Ok(None);
        };
        let slice_descriptor = self.slices()[index];
        let bytes = self.slice_bytes(index)?;
        let binary = ParsedBinary::parse(bytes, options)?;
        Slice::from_parsed(binary, slice_descriptor.file_offset).map(Some)
    }
}

/// A single thin Mach-O slice, plus the lightweight structural accessors
/// `spec.md` §6 lists directly on `Slice` (segments, sections, symbols,
/// build metadata). Deeper analysis (cross-references, Objective-C,
/// dataflow) goes through [`Analyzer::for_slice`] instead of living here, so
/// a caller who only wants `Slice::symbols()` never pays for disassembling
/// the binary.
pub struct Slice {
    binary: ParsedBinary,
    interner: Interner,
    symtab: SymbolTable,
    file_offset_within_fat: u64,
}

impl Slice {
    /// Parses a thin (non-FAT) Mach-O slice directly.
    pub fn parse(data: impl Into<Arc<[u8]>>, options: &AnalyzerOptions) -> Result<Slice> {
        let binary = ParsedBinary::parse(data, options)?;
        Self::from_parsed(binary, 0)
    }

    fn from_parsed(binary: ParsedBinary, file_offset_within_fat: u64) -> Result<Slice> {
        let interner = Interner::new();
        let symtab = match binary.symtab_info() {
            Some(info) => SymbolTable::parse(&binary, info, &interner)?,
            None => SymbolTable::parse(&binary, SymtabInfo::default(), &interner)?,
        };
        Ok(Slice {
            binary,
            interner,
            symtab,
            file_offset_within_fat,
        })
    }

    pub fn binary(&self) -> &ParsedBinary {
        &self.binary
    }

    pub fn segments(&self) -> &[macho::segment::Segment] {
        self.binary.segments()
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.binary.segments().iter().flat_map(|s| s.sections.iter())
    }

    pub fn section(&self, segment_name: &str, section_name: &str) -> Option<&Section> {
        self.binary.section(segment_name, section_name)
    }

    pub fn symbols(&self) -> &[Symbol] {
        self.symtab.symbols()
    }

    pub fn imported_symbols(&self) -> Vec<String> {
        self.symtab
            .undefined()
            .map(|s| self.interner.resolve(s.name).to_string())
            .collect()
    }

    pub fn exported_symbols(&self) -> Vec<String> {
        self.symtab
            .defined()
            .filter(|s| s.is_external)
            .map(|s| self.interner.resolve(s.name).to_string())
            .collect()
    }

    /// The raw entitlements plist bytes embedded in `LC_CODE_SIGNATURE`'s
    /// SuperBlob, verbatim and undecoded (§6 expansion: decoding the plist
    /// is out of scope, but surfacing the bytes is a listed operation).
    pub fn entitlements_xml(&self) -> Option<Vec<u8>> {
        let linkedit = self.binary.code_signature()?;
        let blob = self.binary.file_read(linkedit.data_off as usize, linkedit.data_size as usize).ok()?;
        read_entitlements_blob(blob)
    }

    pub fn minimum_deployment_target(&self) -> Option<Version> {
        self.binary.build_version().map(|bv| bv.min_os)
    }

    pub fn build_platform(&self) -> Option<Platform> {
        self.binary.build_version().map(|bv| bv.platform)
    }

    pub fn build_tool_versions(&self) -> &[(u32, Version)] {
        self.binary.build_version().map(|bv| bv.tools.as_slice()).unwrap_or(&[])
    }

    pub fn file_offset_within_fat(&self) -> u64 {
        self.file_offset_within_fat
    }

    pub fn warnings(&self) -> &Warnings {
        self.binary.warnings()
    }
}

impl Analyzer {
    /// Builds an [Analyzer] over a parsed [Slice] (§6: `Analyzer.for(slice)`).
    /// The slice's own symbol table is not reused directly -- the analyzer
    /// keeps its own interner shared across symbols, stubs and the
    /// Objective-C runtime, so this re-parses the (already in-memory, no
    /// further disk I/O) symbol table against that interner.
    pub fn for_slice(slice: &Slice, options: AnalyzerOptions) -> Result<Analyzer> {
        Analyzer::new(slice.binary.clone(), options)
    }
}

const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;

/// Walks a code-signature SuperBlob (big-endian `magic`/`length`/`count`
/// header followed by `count` `(type, offset)` index entries) looking for
/// the entitlements sub-blob.
fn read_entitlements_blob(blob: &[u8]) -> Option<Vec<u8>> {
    let view = reader::ByteView::new(blob, reader::Endian::Big);
    let count = view.read_u32(8).ok()?;
    for i in 0..count {
        let entry_off = 12 + i as usize * 8;
        let blob_off = view.read_u32(entry_off + 4).ok()? as usize;
        let magic = view.read_u32(blob_off).ok()?;
        if magic == CSMAGIC_EMBEDDED_ENTITLEMENTS {
            let length = view.read_u32(blob_off + 4).ok()? as usize;
            let start = blob_off + 8;
            let end = blob_off + length;
            return blob.get(start..end).map(|b| b.to_vec());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlements_blob_extraction() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&0xfade_0cc0u32.to_be_bytes()); // CSMAGIC_EMBEDDED_SIGNATURE
        blob.extend_from_slice(&0u32.to_be_bytes()); // length, unused by the reader
        blob.extend_from_slice(&1u32.to_be_bytes()); // count
        let entitlements_offset = 12 + 8;
        blob.extend_from_slice(&5u32.to_be_bytes()); // CSSLOT_ENTITLEMENTS
        blob.extend_from_slice(&(entitlements_offset as u32).to_be_bytes());

        let plist = b"<plist/>";
        blob.extend_from_slice(&CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes());
        blob.extend_from_slice(&((8 + plist.len()) as u32).to_be_bytes());
        blob.extend_from_slice(plist);

        assert_eq!(read_entitlements_blob(&blob).unwrap(), plist);
    }

    #[test]
    fn missing_entitlements_blob_is_none() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&0xfade_0cc0u32.to_be_bytes());
        blob.extend_from_slice(&0u32.to_be_bytes());
        blob.extend_from_slice(&0u32.to_be_bytes()); // count
        assert!(read_entitlements_blob(&blob).is_none());
    }
}
