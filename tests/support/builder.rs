/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! A small hand-rolled Mach-O byte-buffer builder for fixtures that are too
//! tedious to lay out field-by-field inline in a test, mirroring the
//! `push_cmd`/`minimal_header` helpers already used by the crate's own
//! unit tests (see `src/macho/mod.rs`, `src/symtab.rs`).
//!
//! Every segment this builder emits uses `vm_address == file_offset`, so a
//! byte written with `write_at(addr, ...)` is visible at virtual address
//! `addr` without any extra bookkeeping.

pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const CPU_TYPE_ARM64: i32 = 12 | (1 << 24);
pub const CPU_TYPE_ARM: i32 = 12;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_BUILD_VERSION: u32 = 0x32;
const LC_MAIN: u32 = 0x28 | 0x8000_0000;
const PLATFORM_IOS: u32 = 2;

pub const SECTION_REGULAR: u32 = 0x0;
pub const SECTION_CSTRING_LITERALS: u32 = 0x2;
pub const SECTION_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
pub const SECTION_LAZY_SYMBOL_POINTERS: u32 = 0x7;
pub const SECTION_SYMBOL_STUBS: u32 = 0x8;

pub struct SectionDesc {
    pub sectname: &'static str,
    pub segname: &'static str,
    pub address: u64,
    pub size: u64,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl SectionDesc {
    pub fn new(segname: &'static str, sectname: &'static str, address: u64, size: u64) -> Self {
        SectionDesc {
            sectname,
            segname,
            address,
            size,
            flags: SECTION_REGULAR,
            reserved1: 0,
            reserved2: 0,
        }
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn reserved1(mut self, v: u32) -> Self {
        self.reserved1 = v;
        self
    }

    pub fn reserved2(mut self, v: u32) -> Self {
        self.reserved2 = v;
        self
    }
}

/// `nlist_64` fixture input, the same shape `src/symtab.rs`'s own unit tests
/// build by hand.
pub struct SymbolDesc {
    pub name: &'static str,
    pub n_type: u8,
    pub n_sect: u8,
    pub value: u64,
}

pub struct MachOBuilder {
    data: Vec<u8>,
    ncmds: u32,
    header_locked: bool,
}

impl MachOBuilder {
    pub fn new() -> Self {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[4..8].copy_from_slice(&(CPU_TYPE_ARM64 as u32).to_le_bytes());
        MachOBuilder { data, ncmds: 0, header_locked: false }
    }

    fn push_cmd(&mut self, cmd: u32, body: &[u8]) {
        assert!(!self.header_locked, "cannot push a load command after finish_header()");
        let cmdsize = (8 + body.len()) as u32;
        self.data.extend_from_slice(&cmd.to_le_bytes());
        self.data.extend_from_slice(&cmdsize.to_le_bytes());
        self.data.extend_from_slice(body);
        self.ncmds += 1;
    }

    pub fn segment64(
        &mut self,
        name: &str,
        vm_address: u64,
        vm_size: u64,
        file_offset: u64,
        file_size: u64,
        initial_protection: u32,
        sections: &[SectionDesc],
    ) {
        let mut body = vec![0u8; 64];
        write_fixed_str(&mut body[0..16], name);
        body[16..24].copy_from_slice(&vm_address.to_le_bytes());
        body[24..32].copy_from_slice(&vm_size.to_le_bytes());
        body[32..40].copy_from_slice(&file_offset.to_le_bytes());
        body[40..48].copy_from_slice(&file_size.to_le_bytes());
        body[48..52].copy_from_slice(&7u32.to_le_bytes()); // maxprot: rwx
        body[52..56].copy_from_slice(&initial_protection.to_le_bytes());
        body[56..60].copy_from_slice(&(sections.len() as u32).to_le_bytes());

        for s in sections {
            let mut sect = vec![0u8; 80];
            write_fixed_str(&mut sect[0..16], s.sectname);
            write_fixed_str(&mut sect[16..32], s.segname);
            sect[32..40].copy_from_slice(&s.address.to_le_bytes());
            sect[40..48].copy_from_slice(&s.size.to_le_bytes());
            sect[48..52].copy_from_slice(&(s.address as u32).to_le_bytes()); // file_offset == address
            sect[64..68].copy_from_slice(&s.flags.to_le_bytes());
            sect[68..72].copy_from_slice(&s.reserved1.to_le_bytes());
            sect[72..76].copy_from_slice(&s.reserved2.to_le_bytes());
            body.extend_from_slice(&sect);
        }

        self.push_cmd(LC_SEGMENT_64, &body);
    }

    pub fn symtab(&mut self, symbols: &[SymbolDesc]) {
        let mut strtab = vec![0u8]; // index 0 is always the empty string
        let mut entries = Vec::with_capacity(symbols.len());
        for sym in symbols {
            let strx = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
            entries.push((strx, sym));
        }

        // The symtab and string table are placed right after the end of the
        // already-written commands; `finish_header` must not be called
        // before this, since it reads `self.data.len()` to size sizeofcmds.
        let symoff = self.data.len() + 24; // this command's own body isn't written yet
        let nsyms = symbols.len() as u32;
        let stroff = symoff + symbols.len() * 16;
        let strsize = strtab.len() as u32;

        let mut body = vec![0u8; 16];
        body[0..4].copy_from_slice(&(symoff as u32).to_le_bytes());
        body[4..8].copy_from_slice(&nsyms.to_le_bytes());
        body[8..12].copy_from_slice(&(stroff as u32).to_le_bytes());
        body[12..16].copy_from_slice(&strsize.to_le_bytes());
        self.push_cmd(LC_SYMTAB, &body);

        for (strx, sym) in &entries {
            self.data.extend_from_slice(&strx.to_le_bytes());
            self.data.push(sym.n_type);
            self.data.push(sym.n_sect);
            self.data.extend_from_slice(&0u16.to_le_bytes());
            self.data.extend_from_slice(&sym.value.to_le_bytes());
        }
        self.data.extend_from_slice(&strtab);
    }

    /// `indirect_syms` are raw symtab indices, in stub order.
    pub fn dysymtab(&mut self, indirect_syms: &[u32]) {
        let indirectsymoff = self.data.len() + 80;
        let mut body = vec![0u8; 72];
        body[48..52].copy_from_slice(&(indirectsymoff as u32).to_le_bytes());
        body[52..56].copy_from_slice(&(indirect_syms.len() as u32).to_le_bytes());
        self.push_cmd(LC_DYSYMTAB, &body);

        for &idx in indirect_syms {
            self.data.extend_from_slice(&idx.to_le_bytes());
        }
    }

    pub fn build_version_ios(&mut self, major: u16, minor: u8, patch: u8) {
        let packed = ((major as u32) << 16) | ((minor as u32) << 8) | patch as u32;
        let mut body = vec![0u8; 16];
        body[0..4].copy_from_slice(&PLATFORM_IOS.to_le_bytes());
        body[4..8].copy_from_slice(&packed.to_le_bytes());
        body[8..12].copy_from_slice(&packed.to_le_bytes());
        body[12..16].copy_from_slice(&0u32.to_le_bytes());
        self.push_cmd(LC_BUILD_VERSION, &body);
    }

    pub fn main_entry(&mut self, entry_off: u64, stack_size: u64) {
        let mut body = vec![0u8; 16];
        body[0..8].copy_from_slice(&entry_off.to_le_bytes());
        body[8..16].copy_from_slice(&stack_size.to_le_bytes());
        self.push_cmd(LC_MAIN, &body);
    }

    /// Locks `ncmds`/`sizeofcmds` into the header. Must be called exactly
    /// once, after every `push_cmd`-based method and before any
    /// [`Self::write_at`].
    pub fn finish_header(&mut self) {
        assert!(!self.header_locked, "finish_header() called twice");
        let sizeofcmds = (self.data.len() - 32) as u32;
        self.data[16..20].copy_from_slice(&self.ncmds.to_le_bytes());
        self.data[20..24].copy_from_slice(&sizeofcmds.to_le_bytes());
        self.header_locked = true;
    }

    /// Writes `bytes` at absolute file offset `offset`, growing the buffer
    /// with zeros if needed. Only valid after [`Self::finish_header`].
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        assert!(self.header_locked, "write_at() before finish_header()");
        let offset = offset as usize;
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

fn write_fixed_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Wraps a set of pre-built thin slices into a big-endian FAT header, the
/// same layout `src/fat.rs`'s own tests hand-assemble.
pub fn wrap_fat(slices: &[(i32, Vec<u8>)]) -> Vec<u8> {
    const FAT_MAGIC: u32 = 0xcafebabe;
    let entry_size = 20;
    let header_size = 8 + slices.len() * entry_size;
    let mut offsets = Vec::with_capacity(slices.len());
    let mut cursor = align_up(header_size, 0x1000);
    for (_, bytes) in slices {
        offsets.push(cursor);
        cursor = align_up(cursor + bytes.len(), 0x1000);
    }

    let mut data = vec![0u8; cursor];
    data[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    data[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());
    for (i, (cpu_type, bytes)) in slices.iter().enumerate() {
        let base = 8 + i * entry_size;
        data[base..base + 4].copy_from_slice(&(*cpu_type as u32).to_be_bytes());
        data[base + 4..base + 8].copy_from_slice(&0u32.to_be_bytes());
        data[base + 8..base + 12].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
        data[base + 12..base + 16].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        data[base + 16..base + 20].copy_from_slice(&12u32.to_be_bytes());
        data[offsets[i]..offsets[i] + bytes.len()].copy_from_slice(bytes);
    }
    data
}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}
