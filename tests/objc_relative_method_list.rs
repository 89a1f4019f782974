/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
mod support;

use machxray::{Analyzer, AnalyzerOptions, Slice};
use support::builder::{MachOBuilder, SectionDesc};

const CLASS_ADDR: u64 = 0x4000;
const RO_ADDR: u64 = 0x4100;
const CLASS_NAME_ADDR: u64 = 0x4200;
const METHOD_NAME_ADDR: u64 = 0x4210;
const METHOD_TYPES_ADDR: u64 = 0x4220;
const METHOD_LIST_ADDR: u64 = 0x4300;
const SELREF_ADDR: u64 = 0x4400;
const CLASSLIST_ADDR: u64 = 0x4600;
const IMP_ADDR: u64 = 0x5000;

/// An iOS-14-style relative method list resolves names, type encodings and
/// implementation addresses through the field-relative encoding, including
/// the extra indirection through a selector-reference slot for the name.
#[test]
fn relative_method_list_resolves_selector_and_implementation() {
    let mut b = MachOBuilder::new();
    b.segment64(
        "__TEXT",
        0,
        0x10000,
        0,
        0x10000,
        5,
        &[SectionDesc::new("__DATA", "__objc_classlist", CLASSLIST_ADDR, 8)],
    );
    b.build_version_ios(14, 0, 0);
    b.finish_header();

    // class_t: isa (points to itself, so the metaclass is not recursed
    // into), superclass 0, 16 bytes of unused cache, bits -> RO_ADDR.
    b.write_at(CLASS_ADDR, &CLASS_ADDR.to_le_bytes());
    b.write_at(CLASS_ADDR + 8, &0u64.to_le_bytes());
    b.write_at(CLASS_ADDR + 16, &[0u8; 16]);
    b.write_at(CLASS_ADDR + 32, &RO_ADDR.to_le_bytes());

    // class_ro_t: name/method-list/protocol-list/ivar-list pointers, starting
    // after the 24 bytes of flags/instanceStart/instanceSize/ivarLayout.
    b.write_at(RO_ADDR + 24, &CLASS_NAME_ADDR.to_le_bytes());
    b.write_at(RO_ADDR + 32, &METHOD_LIST_ADDR.to_le_bytes());
    b.write_at(RO_ADDR + 40, &0u64.to_le_bytes());
    b.write_at(RO_ADDR + 48, &0u64.to_le_bytes());

    b.write_at(CLASS_NAME_ADDR, b"MyClass\0");
    b.write_at(METHOD_NAME_ADDR, b"run\0");
    b.write_at(METHOD_TYPES_ADDR, b"v16@0:8\0");

    // method_list_t, relative layout: entsize with the high bit set, one
    // entry of three 32-bit field-relative offsets.
    b.write_at(METHOD_LIST_ADDR, &0x8000_000cu32.to_le_bytes());
    b.write_at(METHOD_LIST_ADDR + 4, &1u32.to_le_bytes());
    let entry_addr = METHOD_LIST_ADDR + 8;
    let name_field = entry_addr;
    let types_field = entry_addr + 4;
    let imp_field = entry_addr + 8;
    b.write_at(name_field, &((SELREF_ADDR as i64 - name_field as i64) as i32).to_le_bytes());
    b.write_at(types_field, &((METHOD_TYPES_ADDR as i64 - types_field as i64) as i32).to_le_bytes());
    b.write_at(imp_field, &((IMP_ADDR as i64 - imp_field as i64) as i32).to_le_bytes());

    // Selector-reference slot, dereferenced once more to reach the name.
    b.write_at(SELREF_ADDR, &METHOD_NAME_ADDR.to_le_bytes());

    b.write_at(CLASSLIST_ADDR, &CLASS_ADDR.to_le_bytes());

    let data = b.into_bytes();
    let options = AnalyzerOptions::new();
    let slice = Slice::parse(data, &options).unwrap();
    let analyzer = Analyzer::for_slice(&slice, options).unwrap();

    let classes = analyzer.objc_classes().unwrap();
    assert_eq!(classes.len(), 1);
    let class = &classes[0];
    assert_eq!(&*analyzer.interner().resolve(class.name), "MyClass");
    assert_eq!(class.methods.len(), 1);
    let method = &class.methods[0];
    assert_eq!(&*analyzer.interner().resolve(method.name), "run");
    assert_eq!(method.type_encoding, "v16@0:8");
    assert_eq!(method.implementation_address, IMP_ADDR);

    let imps = analyzer.get_imps_for_sel("run").unwrap();
    assert_eq!(imps, vec![IMP_ADDR]);
}
