/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
mod support;

use machxray::fat::{CPU_TYPE_ARM, CPU_TYPE_ARM64};
use machxray::AnalyzerOptions;
use support::builder::{wrap_fat, MachOBuilder, SectionDesc};

/// A FAT archive containing both an armv7 and an arm64 slice describes both
/// independently and dispatches `arm64_slice` to the right one.
#[test]
fn fat_archive_dispatches_to_the_arm64_slice() {
    let mut arm64 = MachOBuilder::new();
    arm64.segment64(
        "__TEXT",
        0,
        0x1000,
        0,
        0x1000,
        5,
        &[SectionDesc::new("__TEXT", "__text", 0x0, 4)],
    );
    arm64.main_entry(0, 0);
    arm64.finish_header();
    arm64.write_at(0, &support::insn::le_bytes(support::insn::RET));
    let arm64_bytes = arm64.into_bytes();

    let armv7_bytes = vec![0u8; 64];

    let fat = wrap_fat(&[(CPU_TYPE_ARM, armv7_bytes), (CPU_TYPE_ARM64, arm64_bytes.clone())]);

    let archive = machxray::parse(fat).unwrap();
    assert_eq!(archive.slices().len(), 2);
    assert_eq!(archive.slices()[0].cpu_type, CPU_TYPE_ARM);
    assert_eq!(archive.slices()[1].cpu_type, CPU_TYPE_ARM64);

    let idx = archive.arm64_slice_index().unwrap();
    assert_eq!(idx, 1);

    let bytes = archive.slice_bytes(idx).unwrap();
    assert_eq!(&bytes[..arm64_bytes.len()], arm64_bytes.as_slice());

    let options = AnalyzerOptions::new();
    let slice = archive.arm64_slice(&options).unwrap().expect("an arm64 slice");
    assert_eq!(slice.segments().len(), 1);
    assert_eq!(slice.segments()[0].name, "__TEXT");
}
