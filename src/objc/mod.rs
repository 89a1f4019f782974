/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Objective-C runtime metadata recovery (§4.F).
//!
//! Reads `__objc_classlist`, `__objc_catlist`, `__objc_protolist`,
//! `__objc_selrefs` and `__objc_classrefs`, and produces a fully resolved,
//! address-normalized model of every class, category and protocol compiled
//! into the slice.

pub mod class;
pub mod method_list;
pub mod protocol;

use std::collections::HashMap;

use crate::error::{Result, Warnings};
use crate::intern::{InternedStr, Interner};
use crate::macho::load_command::Platform;
use crate::macho::ParsedBinary;
use crate::reader::ByteView;

pub use class::{ObjcCategory, ObjcClass, ObjcIvar, ObjcSelector};
pub use protocol::ObjcProtocol;

/// The fully parsed Objective-C runtime model of one slice (§4.F).
#[derive(Debug, Default)]
pub struct ObjcRuntime {
    classes: Vec<ObjcClass>,
    categories: Vec<ObjcCategory>,
    protocols: Vec<ObjcProtocol>,
    classes_by_address: HashMap<u64, usize>,
    /// `__objc_selrefs` slot address -> selector name.
    selref_names: HashMap<u64, InternedStr>,
    /// `__objc_classrefs` slot address -> class name. Populated only from
    /// the classref section itself, never from dyld-bound externals, so
    /// `classref_for_class_name` cannot accidentally return a bound-pointer
    /// address with a matching name (§4.F correctness requirement).
    classref_names: HashMap<u64, InternedStr>,
    /// selector name -> `(declaring class name, implementation address)`,
    /// for `get_imps_for_sel`.
    method_index: HashMap<InternedStr, Vec<(InternedStr, u64)>>,
}

impl ObjcRuntime {
    pub fn build(
        binary: &ParsedBinary,
        interner: &Interner,
        warnings: &mut Warnings,
        strict: bool,
    ) -> Result<ObjcRuntime> {
        let mut runtime = ObjcRuntime::default();
        let use_relative_methods = uses_relative_method_lists(binary);

        if let Some(section) = find_section(binary, "__objc_classlist") {
            let addresses = read_pointer_array(binary, section.address, section.size)?;
            for addr in addresses {
                runtime.ensure_class(binary, addr, false, use_relative_methods, interner, warnings, strict)?;
            }
        }

        if let Some(section) = find_section(binary, "__objc_catlist") {
            let addresses = read_pointer_array(binary, section.address, section.size)?;
            for addr in addresses {
                let category =
                    class::parse_category(binary, addr, use_relative_methods, interner, warnings, strict)?;
                for m in category.instance_methods.iter().chain(category.class_methods.iter()) {
                    runtime
                        .method_index
                        .entry(m.name)
                        .or_default()
                        .push((category.base_class_name.unwrap_or(m.name), m.implementation_address));
                }
                runtime.categories.push(category);
            }
        }

        if let Some(section) = find_section(binary, "__objc_protolist") {
            let addresses = read_pointer_array(binary, section.address, section.size)?;
            for addr in addresses {
                runtime.protocols.push(protocol::parse_protocol(binary, addr, interner)?);
            }
        }

        if let Some(section) = find_section(binary, "__objc_selrefs") {
            let count = section.size / 8;
            for i in 0..count {
                let slot_addr = section.address + i * 8;
                let Ok(bytes) = binary.vm_read(slot_addr, 8) else {
                    continue;
                };
                let name_addr = ByteView::new(bytes, binary.endian()).read_u64(0)?;
                let name = method_list::read_cstr_name(binary, name_addr, interner)?;
                runtime.selref_names.insert(slot_addr, name);
            }
        }

        if let Some(section) = find_section(binary, "__objc_classrefs") {
            let addresses = read_pointer_array(binary, section.address, section.size)?;
            for (i, class_addr) in addresses.into_iter().enumerate() {
                let slot_addr = section.address + i as u64 * 8;
                if let Some(&idx) = runtime.classes_by_address.get(&class_addr) {
                    runtime.classref_names.insert(slot_addr, runtime.classes[idx].name);
                }
            }
        }

        Ok(runtime)
    }

    #[allow(clippy::too_many_arguments)]
    fn ensure_class(
        &mut self,
        binary: &ParsedBinary,
        address: u64,
        is_metaclass: bool,
        use_relative_methods: bool,
        interner: &Interner,
        warnings: &mut Warnings,
        strict: bool,
    ) -> Result<usize> {
        if let Some(&idx) = self.classes_by_address.get(&address) {
            return Ok(idx);
        }
        let parsed = class::parse_class(
            binary,
            address,
            is_metaclass,
            use_relative_methods,
            interner,
            warnings,
            strict,
        )?;
        for m in &parsed.methods {
            self.method_index
                .entry(m.name)
                .or_default()
                .push((parsed.name, m.implementation_address));
        }
        let idx = self.classes.len();
        self.classes_by_address.insert(address, idx);
        self.classes.push(parsed);

        if !is_metaclass {
            if let Ok(isa) = class::read_isa(binary, address) {
                if isa != 0 && isa != address {
                    let _ = self.ensure_class(binary, isa, true, use_relative_methods, interner, warnings, strict);
                }
            }
        }
        Ok(idx)
    }

    pub fn classes(&self) -> &[ObjcClass] {
        &self.classes
    }

    pub fn categories(&self) -> &[ObjcCategory] {
        &self.categories
    }

    pub fn protocols(&self) -> &[ObjcProtocol] {
        &self.protocols
    }

    pub fn class_name_for_class_pointer(&self, address: u64) -> Option<InternedStr> {
        self.classes_by_address.get(&address).map(|&i| self.classes[i].name)
    }

    /// Returns the `__objc_classrefs` slot address for `name`, not a
    /// dyld-bound pointer even if one with the same name exists elsewhere
    /// (§4.F correctness requirement).
    pub fn classref_for_class_name(&self, name: &str, interner: &Interner) -> Option<u64> {
        self.classref_names
            .iter()
            .find(|(_, &n)| &*interner.resolve(n) == name)
            .map(|(&addr, _)| addr)
    }

    pub fn selector_for_selref(&self, selref_address: u64) -> Option<InternedStr> {
        self.selref_names.get(&selref_address).copied()
    }

    pub fn get_imps_for_sel(&self, selector_name: &str, interner: &Interner) -> Vec<u64> {
        self.method_index
            .iter()
            .filter(|(&name, _)| &*interner.resolve(name) == selector_name)
            .flat_map(|(_, v)| v.iter().map(|(_, addr)| *addr))
            .collect()
    }
}

fn find_section<'a>(binary: &'a ParsedBinary, section_name: &str) -> Option<&'a crate::macho::segment::Section> {
    binary
        .segments()
        .iter()
        .flat_map(|s| s.sections.iter())
        .find(|s| s.section_name == section_name)
}

fn read_pointer_array(binary: &ParsedBinary, address: u64, size: u64) -> Result<Vec<u64>> {
    let count = size / 8;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let slot_addr = address + i * 8;
        let Ok(bytes) = binary.vm_read(slot_addr, 8) else {
            continue;
        };
        let value = ByteView::new(bytes, binary.endian()).read_u64(0)?;
        if value != 0 {
            out.push(value);
        }
    }
    Ok(out)
}

/// Per §4.F: relative method lists are used when the binary's minimum
/// deployment target is iOS 14 or later (the per-list entsize flag is the
/// authoritative signal and is checked again inside `parse_method_list`;
/// this is only the initial hint used to detect disagreement).
fn uses_relative_method_lists(binary: &ParsedBinary) -> bool {
    match binary.build_version() {
        Some(bv) if bv.platform == Platform::IOs => {
            bv.min_os
                >= crate::macho::load_command::Version {
                    major: 14,
                    minor: 0,
                    patch: 0,
                }
        }
        _ => false,
    }
}
