/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! FAT archive dispatch (§4.B).
//!
//! A FAT ("universal") Mach-O file is a small header followed by an array of
//! `(cpu_type, cpu_subtype, offset, size, align)` tuples, each pointing at an
//! embedded thin Mach-O slice for one architecture. A thin file has no FAT
//! header at all -- it is just a Mach-O slice starting at offset 0 -- so we
//! model it as a one-element [FatArchive] to give callers a single type to
//! work with either way.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::reader::{ByteView, Endian};

pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_CIGAM: u32 = 0xbebafeca;
pub const FAT_MAGIC_64: u32 = 0xcafebabf;
pub const FAT_CIGAM_64: u32 = 0xbfbafeca;

pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;

/// One embedded slice's location and architecture, as described by a
/// `fat_arch`/`fat_arch_64` record. This is purely descriptive: parsing the
/// slice's own header and load commands is component 4.C
/// ([`crate::macho::ParsedBinary`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatSlice {
    pub cpu_type: i32,
    pub cpu_subtype: i32,
    pub file_offset: u64,
    pub size: u64,
    pub align: u32,
}

/// An ordered sequence of [FatSlice] descriptors: either parsed from a real
/// FAT header, or synthesized as a single element covering the whole file
/// when the input is a thin Mach-O.
#[derive(Debug, Clone)]
pub struct FatArchive {
    data: Arc<[u8]>,
    slices: Vec<FatSlice>,
}

/// ARM64's `cpu_type_t`, from `mach/machine.h`. `CPU_ARCH_ABI64` is bit 24.
pub const CPU_TYPE_ARM64: i32 = 12 | (1 << 24);
pub const CPU_TYPE_ARM: i32 = 12;

impl FatArchive {
    /// Parses the FAT or thin Mach-O header at the start of `data` (§4.B).
    pub fn parse(data: impl Into<Arc<[u8]>>) -> Result<FatArchive> {
        let data: Arc<[u8]> = data.into();
        if data.len() < 4 {
            return Err(Error::TruncatedBinary {
                offset: 0,
                len: data.len(),
                needed: 4,
            });
        }
        // The magic is read in big-endian first to distinguish FAT (always
        // big-endian on disk) from thin Mach-O (which can be either), per
        // §4.B.
        let magic_be = ByteView::new(&data, Endian::Big).read_u32(0)?;

        let slices = match magic_be {
            FAT_MAGIC => Self::parse_fat_arches(&data, false)?,
            FAT_MAGIC_64 => Self::parse_fat_arches(&data, true)?,
            _ => {
                let magic_native = ByteView::new(&data, Endian::Little).read_u32(0)?;
                let endian = match magic_native {
                    MH_MAGIC | MH_MAGIC_64 => Endian::Little,
                    MH_CIGAM | MH_CIGAM_64 => Endian::Big,
                    _ => return Err(Error::NotAMachO { magic: magic_be }),
                };
                // A thin file is a Mach-O slice starting at offset 0; read its
                // own `cputype`/`cpusubtype` (same offsets `mach_header`/
                // `mach_header_64` share) so `arm64_slice_index` can find it.
                let view = ByteView::new(&data, endian);
                vec![FatSlice {
                    cpu_type: view.read_i32(4)?,
                    cpu_subtype: view.read_i32(8)?,
                    file_offset: 0,
                    size: data.len() as u64,
                    align: 0,
                }]
            }
        };

        Ok(FatArchive { data, slices })
    }

    fn parse_fat_arches(data: &[u8], is_64: bool) -> Result<Vec<FatSlice>> {
        let view = ByteView::new(data, Endian::Big);
        let nfat_arch = view.read_u32(4)?;
        let entry_size = if is_64 { 32 } else { 20 };
        let mut slices = Vec::with_capacity(nfat_arch as usize);
        let mut offset = 8usize;
        for _ in 0..nfat_arch {
            let cpu_type = view.read_u32(offset)? as i32;
            let cpu_subtype = view.read_u32(offset + 4)? as i32;
            let (file_offset, size, align) = if is_64 {
                (
                    view.read_u64(offset + 8)?,
                    view.read_u64(offset + 16)?,
                    view.read_u32(offset + 24)?,
                )
            } else {
                (
                    view.read_u32(offset + 8)? as u64,
                    view.read_u32(offset + 12)? as u64,
                    view.read_u32(offset + 16)?,
                )
            };
            slices.push(FatSlice {
                cpu_type,
                cpu_subtype,
                file_offset,
                size,
                align,
            });
            offset += entry_size;
        }
        Ok(slices)
    }

    /// The descriptors for every embedded slice, in on-disk order.
    pub fn slices(&self) -> &[FatSlice] {
        &self.slices
    }

    pub fn is_fat(&self) -> bool {
        self.slices.len() > 1
            || (self.slices.len() == 1 && self.slices[0].file_offset != 0)
                && self.data.len() > self.slices[0].size as usize
    }

    /// The raw bytes of the `index`-th slice, clamped to the file's actual
    /// length (a malformed `fat_arch` can claim an extent beyond EOF; we
    /// never panic on that, we just clamp and let slice parsing report
    /// `TruncatedBinary` for whatever is actually missing).
    pub fn slice_bytes(&self, index: usize) -> Result<Arc<[u8]>> {
        let slice = self
            .slices
            .get(index)
            .ok_or_else(|| Error::TruncatedBinary {
                offset: 0,
                len: self.slices.len(),
                needed: index + 1,
            })?;
        let start = (slice.file_offset as usize).min(self.data.len());
        let end = ((slice.file_offset + slice.size) as usize).min(self.data.len());
        Ok(Arc::from(&self.data[start..end]))
    }

    /// Finds the first slice whose CPU type is ARM64, if any (§6:
    /// `FatArchive.arm64_slice()`).
    pub fn arm64_slice_index(&self) -> Option<usize> {
        self.slices
            .iter()
            .position(|s| s.cpu_type == CPU_TYPE_ARM64)
    }
}
