/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Thin Mach-O slice parsing (§4.C): the 64-bit `mach_header` and its load
//! commands.
//!
//! Only the 64-bit layout is handled -- every ARM64 Mach-O is LP64, and a
//! 32-bit `mach_header`/`LC_SEGMENT` pair in a slice this crate is asked to
//! parse means the caller picked the wrong slice out of a [`FatArchive`]
//! (§4.B), which is a structural error, not a warning.

pub mod load_command;
pub mod segment;

use std::sync::Arc;

use crate::error::{Error, Result, Warning, Warnings};
use crate::options::AnalyzerOptions;
use crate::reader::{ByteView, Endian};
use load_command::*;
use segment::{Section, Segment};

const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_CIGAM_64: u32 = 0xcffaedfe;

pub const MH_PIE: u32 = 0x0020_0000;

/// `dylib_command` payload (§4.C: `LC_LOAD_DYLIB` and friends).
#[derive(Debug, Clone, PartialEq)]
pub struct DylibRef {
    pub name: String,
    pub timestamp: u32,
    pub current_version: Version,
    pub compatibility_version: Version,
    pub weak: bool,
}

/// How control reaches this slice's entry point (§4.C: `LC_MAIN` or the
/// legacy `LC_UNIXTHREAD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `entry_point_command`: `entryoff` is a file offset into the `__TEXT`
    /// segment.
    Main { entry_off: u64, stack_size: u64 },
    /// `thread_command` carrying an `ARM_THREAD_STATE64`: `pc` is already a
    /// virtual address.
    UnixThread { pc: u64 },
}

/// `encryption_info_command`/`encryption_info_command_64` (§4.C:
/// `LC_ENCRYPTION_INFO`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub crypt_offset: u32,
    pub crypt_size: u32,
    pub crypt_id: u32,
}

/// `linkedit_data_command` (§4.C: `LC_CODE_SIGNATURE`, `LC_FUNCTION_STARTS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditData {
    pub data_off: u32,
    pub data_size: u32,
}

/// A single thin Mach-O slice: the 64-bit header plus everything its load
/// commands describe (§3, §4.C). Section and segment contents (bytes) are
/// read lazily by whichever component needs them ([`crate::symtab`],
/// [`crate::stubs`], [`crate::objc`]) via [`ParsedBinary::vm_read`] /
/// [`ParsedBinary::file_read`]; this type owns only the structural index.
#[derive(Debug, Clone)]
pub struct ParsedBinary {
    data: Arc<[u8]>,
    endian: Endian,
    cpu_type: i32,
    cpu_subtype: i32,
    filetype: u32,
    flags: u32,
    segments: Vec<Segment>,
    dylibs: Vec<DylibRef>,
    id_dylib: Option<DylibRef>,
    rpaths: Vec<String>,
    build_version: Option<BuildVersion>,
    source_version: Option<u64>,
    entry_point: Option<EntryPoint>,
    code_signature: Option<LinkeditData>,
    function_starts: Option<LinkeditData>,
    encryption_info: Option<EncryptionInfo>,
    symtab: Option<SymtabInfo>,
    dysymtab: Option<DysymtabInfo>,
    dyld_info: Option<DyldInfo>,
    warnings: Warnings,
}

impl ParsedBinary {
    /// Parses the 64-bit Mach-O header and load commands starting at the
    /// beginning of `data` (§4.C). `data` is expected to already be the
    /// bytes of one [`crate::fat::FatSlice`], not a whole FAT file.
    pub fn parse(data: impl Into<Arc<[u8]>>, options: &AnalyzerOptions) -> Result<ParsedBinary> {
        let data: Arc<[u8]> = data.into();
        if data.len() < 4 {
            return Err(Error::TruncatedBinary {
                offset: 0,
                len: data.len(),
                needed: 4,
            });
        }
        let magic_native = ByteView::new(&data, Endian::Little).read_u32(0)?;
        let endian = match magic_native {
            MH_MAGIC_64 => Endian::Little,
            MH_CIGAM_64 => Endian::Big,
            other => return Err(Error::NotAMachO { magic: other }),
        };
        let view = ByteView::new(&data, endian);

        let cpu_type = view.read_i32(4)?;
        let cpu_subtype = view.read_i32(8)?;
        let filetype = view.read_u32(12)?;
        let ncmds = view.read_u32(16)?;
        let flags = view.read_u32(24)?;

        let mut parsed = ParsedBinary {
            data: data.clone(),
            endian,
            cpu_type,
            cpu_subtype,
            filetype,
            flags,
            segments: Vec::new(),
            dylibs: Vec::new(),
            id_dylib: None,
            rpaths: Vec::new(),
            build_version: None,
            source_version: None,
            entry_point: None,
            code_signature: None,
            function_starts: None,
            encryption_info: None,
            symtab: None,
            dysymtab: None,
            dyld_info: None,
            warnings: Warnings::new(),
        };

        let mut offset = 32usize; // sizeof(mach_header_64)
        for _ in 0..ncmds {
            let cmd = view.read_u32(offset)?;
            let cmdsize = view.read_u32(offset + 4)?;
            if cmdsize < 8 {
                return Err(Error::TruncatedBinary {
                    offset,
                    len: data.len(),
                    needed: 8,
                });
            }
            parsed.parse_command(&view, cmd, offset, cmdsize as usize, options.strict)?;
            offset += cmdsize as usize;
        }

        Ok(parsed)
    }

    fn parse_command(
        &mut self,
        view: &ByteView<'_>,
        cmd: u32,
        offset: usize,
        cmdsize: usize,
        strict: bool,
    ) -> Result<()> {
        match cmd {
            LC_SEGMENT_64 => self.segments.push(self.parse_segment_64(view, offset)?),
            LC_SYMTAB => {
                self.symtab = Some(SymtabInfo {
                    symoff: view.read_u32(offset + 8)?,
                    nsyms: view.read_u32(offset + 12)?,
                    stroff: view.read_u32(offset + 16)?,
                    strsize: view.read_u32(offset + 20)?,
                });
            }
            LC_DYSYMTAB => {
                self.dysymtab = Some(DysymtabInfo {
                    ilocalsym: view.read_u32(offset + 8)?,
                    nlocalsym: view.read_u32(offset + 12)?,
                    iextdefsym: view.read_u32(offset + 16)?,
                    nextdefsym: view.read_u32(offset + 20)?,
                    iundefsym: view.read_u32(offset + 24)?,
                    nundefsym: view.read_u32(offset + 28)?,
                    indirectsymoff: view.read_u32(offset + 56)?,
                    nindirectsyms: view.read_u32(offset + 60)?,
                });
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                self.dyld_info = Some(DyldInfo {
                    rebase_off: view.read_u32(offset + 8)?,
                    rebase_size: view.read_u32(offset + 12)?,
                    bind_off: view.read_u32(offset + 16)?,
                    bind_size: view.read_u32(offset + 20)?,
                    lazy_bind_off: view.read_u32(offset + 32)?,
                    lazy_bind_size: view.read_u32(offset + 36)?,
                    export_off: view.read_u32(offset + 40)?,
                    export_size: view.read_u32(offset + 44)?,
                });
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB => {
                let dylib = self.parse_dylib(view, offset, cmd == LC_LOAD_WEAK_DYLIB)?;
                self.dylibs.push(dylib);
            }
            LC_ID_DYLIB => {
                self.id_dylib = Some(self.parse_dylib(view, offset, false)?);
            }
            LC_RPATH => {
                let path_off = view.read_u32(offset + 8)? as usize;
                self.rpaths.push(view.read_cstr_at(offset + path_off)?);
            }
            LC_BUILD_VERSION => {
                let platform = match view.read_u32(offset + 8)? {
                    1 => Platform::MacOs,
                    2 => Platform::IOs,
                    3 => Platform::TvOs,
                    4 => Platform::WatchOs,
                    other => Platform::Unknown(other),
                };
                let min_os = Version::from_packed(view.read_u32(offset + 12)?);
                let sdk = Version::from_packed(view.read_u32(offset + 16)?);
                let ntools = view.read_u32(offset + 20)?;
                let mut tools = Vec::with_capacity(ntools as usize);
                let mut tool_off = offset + 24;
                for _ in 0..ntools {
                    let tool = view.read_u32(tool_off)?;
                    let version = Version::from_packed(view.read_u32(tool_off + 4)?);
                    tools.push((tool, version));
                    tool_off += 8;
                }
                self.build_version = Some(BuildVersion {
                    platform,
                    min_os,
                    sdk,
                    tools,
                });
            }
            LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => {
                let platform = match cmd {
                    LC_VERSION_MIN_MACOSX => Platform::MacOs,
                    LC_VERSION_MIN_IPHONEOS => Platform::IOs,
                    LC_VERSION_MIN_TVOS => Platform::TvOs,
                    LC_VERSION_MIN_WATCHOS => Platform::WatchOs,
                    _ => unreachable!(),
                };
                let min_os = Version::from_packed(view.read_u32(offset + 8)?);
                let sdk = Version::from_packed(view.read_u32(offset + 12)?);
                self.build_version = Some(BuildVersion {
                    platform,
                    min_os,
                    sdk,
                    tools: Vec::new(),
                });
            }
            LC_MAIN => {
                self.entry_point = Some(EntryPoint::Main {
                    entry_off: view.read_u64(offset + 8)?,
                    stack_size: view.read_u64(offset + 16)?,
                });
            }
            0x5 /* LC_UNIXTHREAD */ => {
                if let Some(pc) = self.parse_unixthread_pc(view, offset, cmdsize)? {
                    self.entry_point = Some(EntryPoint::UnixThread { pc });
                }
            }
            LC_SOURCE_VERSION => {
                self.source_version = Some(view.read_u64(offset + 8)?);
            }
            LC_CODE_SIGNATURE => {
                self.code_signature = Some(LinkeditData {
                    data_off: view.read_u32(offset + 8)?,
                    data_size: view.read_u32(offset + 12)?,
                });
            }
            LC_FUNCTION_STARTS => {
                self.function_starts = Some(LinkeditData {
                    data_off: view.read_u32(offset + 8)?,
                    data_size: view.read_u32(offset + 12)?,
                });
            }
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                self.encryption_info = Some(EncryptionInfo {
                    crypt_offset: view.read_u32(offset + 8)?,
                    crypt_size: view.read_u32(offset + 12)?,
                    crypt_id: view.read_u32(offset + 16)?,
                });
            }
            _ => {
                self.warnings
                    .push(Warning::UnknownLoadCommand { cmd, offset }, strict)?;
            }
        }
        Ok(())
    }

    fn parse_segment_64(&self, view: &ByteView<'_>, offset: usize) -> Result<Segment> {
        let name_off = offset + 8;
        let name = view.read_cstr_at(name_off)?;
        let vm_address = view.read_u64(offset + 24)?;
        let vm_size = view.read_u64(offset + 32)?;
        let file_offset = view.read_u64(offset + 40)?;
        let file_size = view.read_u64(offset + 48)?;
        let max_protection = view.read_u32(offset + 56)?;
        let initial_protection = view.read_u32(offset + 60)?;
        let nsects = view.read_u32(offset + 64)?;

        let mut sections = Vec::with_capacity(nsects as usize);
        let mut sect_off = offset + 72; // sizeof(segment_command_64)
        for _ in 0..nsects {
            let section_name = view.read_cstr_at(sect_off)?;
            let segment_name = view.read_cstr_at(sect_off + 16)?;
            sections.push(Section {
                segment_name,
                section_name,
                address: view.read_u64(sect_off + 32)?,
                size: view.read_u64(sect_off + 40)?,
                file_offset: view.read_u32(sect_off + 48)?,
                alignment: view.read_u32(sect_off + 52)?,
                type_flags: view.read_u32(sect_off + 64)?,
                reserved1: view.read_u32(sect_off + 68)?,
                reserved2: view.read_u32(sect_off + 72)?,
            });
            sect_off += 80; // sizeof(section_64)
        }

        Ok(Segment {
            name,
            vm_address,
            vm_size,
            file_offset,
            file_size,
            max_protection,
            initial_protection,
            sections,
        })
    }

    fn parse_dylib(&self, view: &ByteView<'_>, offset: usize, weak: bool) -> Result<DylibRef> {
        let name_off = view.read_u32(offset + 8)? as usize;
        Ok(DylibRef {
            name: view.read_cstr_at(offset + name_off)?,
            timestamp: view.read_u32(offset + 12)?,
            current_version: Version::from_packed(view.read_u32(offset + 16)?),
            compatibility_version: Version::from_packed(view.read_u32(offset + 20)?),
            weak,
        })
    }

    /// `ARM_THREAD_STATE64` layout: 29 general registers, then `fp`, `lr`,
    /// `sp`, `pc`, then `cpsr` and padding. Only `pc` is wanted here.
    fn parse_unixthread_pc(
        &self,
        view: &ByteView<'_>,
        offset: usize,
        cmdsize: usize,
    ) -> Result<Option<u64>> {
        let flavor = view.read_u32(offset + 8)?;
        const ARM_THREAD_STATE64: u32 = 6;
        if flavor != ARM_THREAD_STATE64 {
            return Ok(None);
        }
        let state_off = offset + 16;
        let pc_off = state_off + 29 * 8 + 3 * 8;
        if pc_off + 8 > offset + cmdsize {
            return Ok(None);
        }
        Ok(Some(view.read_u64(pc_off)?))
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn cpu_type(&self) -> i32 {
        self.cpu_type
    }

    pub fn cpu_subtype(&self) -> i32 {
        self.cpu_subtype
    }

    pub fn filetype(&self) -> u32 {
        self.filetype
    }

    pub fn is_position_independent(&self) -> bool {
        self.flags & MH_PIE != 0
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Finds the section named `segment,section` across every segment
    /// (§3: `Slice.section("__TEXT,__text")`-style lookup).
    pub fn section(&self, segment_name: &str, section_name: &str) -> Option<&Section> {
        self.segment(segment_name)?
            .sections
            .iter()
            .find(|s| s.section_name == section_name)
    }

    pub fn dylibs(&self) -> &[DylibRef] {
        &self.dylibs
    }

    pub fn id_dylib(&self) -> Option<&DylibRef> {
        self.id_dylib.as_ref()
    }

    pub fn rpaths(&self) -> &[String] {
        &self.rpaths
    }

    pub fn build_version(&self) -> Option<&BuildVersion> {
        self.build_version.as_ref()
    }

    /// Unpacks the `A.B.C.D.E` source version field (10/10/10/10/22 bits,
    /// least-significant group first).
    pub fn source_version(&self) -> Option<[u32; 5]> {
        self.source_version.map(|v| {
            [
                (v >> 40) as u32 & 0xff_ffff,
                (v >> 30) as u32 & 0x3ff,
                (v >> 20) as u32 & 0x3ff,
                (v >> 10) as u32 & 0x3ff,
                v as u32 & 0x3ff,
            ]
        })
    }

    pub fn entry_point(&self) -> Option<EntryPoint> {
        self.entry_point
    }

    pub fn code_signature(&self) -> Option<LinkeditData> {
        self.code_signature
    }

    pub fn function_starts(&self) -> Option<LinkeditData> {
        self.function_starts
    }

    pub fn encryption_info(&self) -> Option<EncryptionInfo> {
        self.encryption_info
    }

    pub fn symtab_info(&self) -> Option<SymtabInfo> {
        self.symtab
    }

    pub fn dysymtab_info(&self) -> Option<DysymtabInfo> {
        self.dysymtab
    }

    pub fn dyld_info(&self) -> Option<DyldInfo> {
        self.dyld_info
    }

    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }

    pub fn warnings_mut(&mut self) -> &mut Warnings {
        &mut self.warnings
    }

    /// Reads `len` bytes starting at file offset `offset`, independent of
    /// any segment mapping. Used for `__LINKEDIT` structures (symbol table,
    /// string table, bind opcodes), which are addressed by file offset
    /// rather than a `vmaddr` (§4.D, §4.E).
    pub fn file_read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        ByteView::new(&self.data, self.endian)
            .sub_view(offset, len)
            .map(|v| v.bytes())
    }

    /// Translates a virtual address to file bytes by locating the segment
    /// that contains it (§3: `Segment::vm_to_file_offset`).
    pub fn vm_read(&self, address: u64, len: usize) -> Result<&[u8]> {
        let segment = self.segments.iter().find(|s| s.contains_vm_address(address));
        let file_offset = segment
            .and_then(|s| s.vm_to_file_offset(address))
            .ok_or(Error::TruncatedBinary {
                offset: address as usize,
                len: 0,
                needed: len,
            })?;
        self.file_read(file_offset as usize, len)
    }

    /// Like [`Self::vm_read`] but clamps `len` to however many bytes remain
    /// in the containing segment, for reads (NUL-terminated C strings) whose
    /// true length is not known up front.
    pub fn vm_read_upto(&self, address: u64, max_len: usize) -> Result<&[u8]> {
        let segment = self
            .segments
            .iter()
            .find(|s| s.contains_vm_address(address))
            .ok_or(Error::TruncatedBinary {
                offset: address as usize,
                len: 0,
                needed: max_len,
            })?;
        let file_offset = segment.vm_to_file_offset(address).ok_or(Error::TruncatedBinary {
            offset: address as usize,
            len: 0,
            needed: max_len,
        })?;
        let remaining = (segment.vm_address + segment.vm_size - address) as usize;
        self.file_read(file_offset as usize, max_len.min(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_cmd(data: &mut Vec<u8>, cmd: u32, body: &[u8]) {
        let cmdsize = (8 + body.len()) as u32;
        data.extend_from_slice(&cmd.to_le_bytes());
        data.extend_from_slice(&cmdsize.to_le_bytes());
        data.extend_from_slice(body);
    }

    fn minimal_header(ncmds: u32, sizeofcmds: u32) -> Vec<u8> {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[4..8].copy_from_slice(&(CPU_TYPE_ARM64_FOR_TEST).to_le_bytes());
        data[16..20].copy_from_slice(&ncmds.to_le_bytes());
        data[20..24].copy_from_slice(&sizeofcmds.to_le_bytes());
        data
    }

    const CPU_TYPE_ARM64_FOR_TEST: u32 = (12 | (1 << 24)) as u32;

    #[test]
    fn rejects_non_64_bit_magic() {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&0xfeedfaceu32.to_le_bytes());
        let err = ParsedBinary::parse(data, &AnalyzerOptions::new()).unwrap_err();
        assert!(matches!(err, Error::NotAMachO { .. }));
    }

    #[test]
    fn unknown_load_command_is_a_warning_not_an_error() {
        let mut body = Vec::new();
        push_cmd(&mut body, 0xdead_beef, &[0u8; 8]);
        let mut data = minimal_header(1, body.len() as u32);
        data.extend_from_slice(&body);
        let parsed = ParsedBinary::parse(data, &AnalyzerOptions::new()).unwrap();
        assert_eq!(parsed.warnings().len(), 1);
    }

    #[test]
    fn unknown_load_command_is_an_error_in_strict_mode() {
        let mut body = Vec::new();
        push_cmd(&mut body, 0xdead_beef, &[0u8; 8]);
        let mut data = minimal_header(1, body.len() as u32);
        data.extend_from_slice(&body);
        let err = ParsedBinary::parse(data, &AnalyzerOptions::new().strict(true)).unwrap_err();
        assert!(matches!(err, Error::StrictWarning(Warning::UnknownLoadCommand { .. })));
    }

    #[test]
    fn parses_a_segment_with_one_section() {
        let mut segment_body = vec![0u8; 64];
        segment_body[0..6].copy_from_slice(b"__TEXT");
        segment_body[16..24].copy_from_slice(&0x1_0000u64.to_le_bytes()); // vmaddr
        segment_body[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // vmsize
        segment_body[32..40].copy_from_slice(&0u64.to_le_bytes()); // fileoff
        segment_body[40..48].copy_from_slice(&0x1000u64.to_le_bytes()); // filesize
        segment_body[48..52].copy_from_slice(&7u32.to_le_bytes()); // maxprot
        segment_body[52..56].copy_from_slice(&5u32.to_le_bytes()); // initprot
        segment_body[56..60].copy_from_slice(&1u32.to_le_bytes()); // nsects

        let mut section = vec![0u8; 80];
        section[0..6].copy_from_slice(b"__text");
        section[16..22].copy_from_slice(b"__TEXT");
        section[32..40].copy_from_slice(&0x1_0000u64.to_le_bytes());
        section[40..48].copy_from_slice(&0x20u64.to_le_bytes());
        segment_body.extend_from_slice(&section);

        let mut body = Vec::new();
        push_cmd(&mut body, LC_SEGMENT_64, &segment_body);
        let mut data = minimal_header(1, body.len() as u32);
        data.extend_from_slice(&body);

        let parsed = ParsedBinary::parse(data, &AnalyzerOptions::new()).unwrap();
        assert_eq!(parsed.segments().len(), 1);
        let seg = parsed.segment("__TEXT").unwrap();
        assert_eq!(seg.sections.len(), 1);
        assert!(parsed.section("__TEXT", "__text").is_some());
        assert!(seg.is_executable());
    }
}
