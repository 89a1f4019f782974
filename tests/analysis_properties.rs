/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
mod support;

use machxray::{Analyzer, AnalyzerOptions, Slice};
use support::builder::{MachOBuilder, SectionDesc};
use support::insn;

fn sample_binary() -> Vec<u8> {
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
    b.into_bytes()
}

/// Parsing the same bytes twice produces structurally identical segment and
/// section tables -- nothing about parsing depends on ambient state.
#[test]
fn parsing_is_deterministic() {
    let data = sample_binary();
    let options = AnalyzerOptions::new();

    let slice_a = Slice::parse(data.clone(), &options).unwrap();
    let slice_b = Slice::parse(data, &options).unwrap();

    similar_asserts::assert_eq!(slice_a.segments(), slice_b.segments());
    assert_eq!(slice_a.symbols().len(), slice_b.symbols().len());
}

/// Repeated calls to the lazily-cached accessors return the same results as
/// the first call, whether or not anything else has touched the analyzer in
/// between.
#[test]
fn cached_accessors_are_idempotent() {
    let data = sample_binary();
    let options = AnalyzerOptions::new();
    let slice = Slice::parse(data, &options).unwrap();
    let analyzer = Analyzer::for_slice(&slice, options).unwrap();

    let first = analyzer.functions().unwrap();
    let second = analyzer.functions().unwrap();
    assert_eq!(first, second);

    let xrefs_first = analyzer.compute_xrefs().callers_of(0x4010);
    let xrefs_second = analyzer.compute_xrefs().callers_of(0x4010);
    assert_eq!(xrefs_first, xrefs_second);

    // Asking for the function analyzer after xrefs were already computed
    // still sees the same cached function table.
    let func = analyzer.function_analyzer(0x4000).unwrap().expect("function at 0x4000");
    assert_eq!(func.basic_blocks().len(), 3);
    assert_eq!(func.basic_blocks(), analyzer.function_analyzer(0x4000).unwrap().unwrap().basic_blocks());
}
