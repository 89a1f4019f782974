/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
mod support;

use machxray::{Analyzer, AnalyzerOptions, Slice};
use support::builder::{MachOBuilder, SectionDesc};
use support::insn;

/// A second `Analyzer` pointed at the same cache directory recovers the
/// first one's basic-block partition without disassembling anything itself.
#[test]
fn basic_blocks_survive_a_cache_round_trip() {
    let mut b = MachOBuilder::new();
    b.segment64(
        "__TEXT",
        0,
        0x10000,
        0,
        0x10000,
        5,
        &[SectionDesc::new("__TEXT", "__text", 0x4000, 0x18)],
    );
    b.main_entry(0x4000, 0);
    b.finish_header();

    b.write_at(0x4000, &insn::le_bytes(insn::CMP_X0_X1));
    b.write_at(0x4004, &insn::le_bytes(insn::b_eq(0x4010 - 0x4004)));
    b.write_at(0x4008, &insn::le_bytes(insn::movz_x(0, 3)));
    b.write_at(0x400c, &insn::le_bytes(insn::RET));
    b.write_at(0x4010, &insn::le_bytes(insn::movz_x(0, 5)));
    b.write_at(0x4014, &insn::le_bytes(insn::RET));
    let data = b.into_bytes();

    let cache_dir = tempfile::tempdir().unwrap();

    let options = AnalyzerOptions::new().cache_dir(cache_dir.path());
    let slice = Slice::parse(data.clone(), &options).unwrap();
    let analyzer = Analyzer::for_slice(&slice, options).unwrap();
    let live_blocks = analyzer.function_analyzer(0x4000).unwrap().unwrap().basic_blocks();

    let options = AnalyzerOptions::new().cache_dir(cache_dir.path());
    let slice = Slice::parse(data, &options).unwrap();
    let second = Analyzer::for_slice(&slice, options).unwrap();

    assert_eq!(second.basic_blocks_from_cache(0x4000), Some(live_blocks));
    assert_eq!(second.basic_blocks_from_cache(0x9999), None);
}
