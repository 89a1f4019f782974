/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
mod support;

use machxray::{Analyzer, AnalyzerOptions, Slice};
use support::builder::{MachOBuilder, SectionDesc, SymbolDesc, SECTION_LAZY_SYMBOL_POINTERS, SECTION_SYMBOL_STUBS};
use support::insn;

/// A `blr Xn` whose target register is materialized from the stub's own
/// address (rather than encoded as a direct `bl` immediate) still resolves
/// through the stub table, so the call site is recorded as a caller of the
/// stub just like a direct `bl` would be.
#[test]
fn blr_through_register_materialized_stub_address_resolves() {
    let mut b = MachOBuilder::new();
    b.segment64(
        "__TEXT",
        0,
        0x10000,
        0,
        0x10000,
        5,
        &[
            SectionDesc::new("__TEXT", "__text", 0x6000, 0x10),
            SectionDesc::new("__TEXT", "__stubs", 0x4000, 12)
                .flags(SECTION_SYMBOL_STUBS)
                .reserved1(0)
                .reserved2(12),
            SectionDesc::new("__TEXT", "__la_symbol_ptr", 0x5000, 8).flags(SECTION_LAZY_SYMBOL_POINTERS),
        ],
    );
    b.symtab(&[SymbolDesc { name: "_objc_msgSend", n_type: 0x01, n_sect: 0, value: 0 }]);
    b.dysymtab(&[0]);
    b.main_entry(0x6000, 0);
    b.finish_header();

    // adrp/add materialize the stub's own address (0x4000) into x8, then
    // call through it indirectly instead of `bl`-ing it directly.
    b.write_at(0x6000, &insn::le_bytes(insn::adrp_x(8, -2)));
    b.write_at(0x6004, &insn::le_bytes(insn::add_x_imm(8, 8, 0)));
    b.write_at(0x6008, &insn::le_bytes(insn::blr(8)));
    b.write_at(0x600c, &insn::le_bytes(insn::RET));

    let data = b.into_bytes();
    let options = AnalyzerOptions::new();
    let slice = Slice::parse(data, &options).unwrap();
    let analyzer = Analyzer::for_slice(&slice, options).unwrap();

    let stub = analyzer.stubs().by_stub_address(0x4000).expect("stub at 0x4000");
    assert_eq!(stub.pointer_address, 0x5000);

    let xrefs = analyzer.compute_xrefs();
    assert_eq!(xrefs.callers_of(0x4000), vec![0x6008]);
}
