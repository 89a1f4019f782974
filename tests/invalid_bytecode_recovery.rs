/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
mod support;

use machxray::error::Warning;
use machxray::{Analyzer, AnalyzerOptions, Slice};
use support::builder::{MachOBuilder, SectionDesc, SymbolDesc};
use support::insn;

/// A function whose first instruction fails to decode is dropped, with a
/// warning recorded, while an unrelated valid function in the same binary
/// is still analyzed.
#[test]
fn malformed_function_is_dropped_without_failing_the_others() {
    let mut b = MachOBuilder::new();
    b.segment64(
        "__TEXT",
        0,
        0x10000,
        0,
        0x10000,
        5,
        &[SectionDesc::new("__TEXT", "__text", 0x4000, 0x14)],
    );
    b.symtab(&[
        SymbolDesc { name: "_f1", n_type: 0x0f, n_sect: 1, value: 0x4000 },
        SymbolDesc { name: "_f2", n_type: 0x0f, n_sect: 1, value: 0x4010 },
    ]);
    b.finish_header();

    b.write_at(0x4000, &insn::le_bytes(insn::RET));
    b.write_at(0x4010, &[0xff, 0xff, 0xff, 0xff]);

    let data = b.into_bytes();
    let options = AnalyzerOptions::new();
    let slice = Slice::parse(data, &options).unwrap();
    let analyzer = Analyzer::for_slice(&slice, options).unwrap();

    assert_eq!(analyzer.functions().unwrap(), vec![0x4000]);
    assert!(analyzer.function_analyzer(0x4010).unwrap().is_none());

    let warnings = analyzer.warnings();
    assert!(warnings.iter().any(|w| matches!(
        w,
        Warning::InvalidBytecode { function: 0x4010, address: 0x4010 }
    )));
}
