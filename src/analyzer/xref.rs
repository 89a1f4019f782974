/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Cross-reference index construction (§4.I).

use std::collections::HashMap;

use crate::analyzer::dataflow::{self, RegisterContents};
use crate::analyzer::function::Function;
use crate::disasm::{FlowKind, Operand};
use crate::intern::{InternedStr, Interner};
use crate::macho::segment::SectionType;
use crate::macho::ParsedBinary;
use crate::objc::ObjcRuntime;
use crate::reader::{ByteView, Endian};
use crate::stubs::StubTable;

/// A resolved Objective-C message-send call site (§3: `XRef` Objective-C
/// subtype; §6: `CallSite`).
#[derive(Debug, Clone)]
pub struct CallSite {
    pub address: u64,
    pub class_name: Option<String>,
    pub selector_name: Option<String>,
}

/// The `_objc_opt_*`/`_objc_alloc_init` fast paths that bypass a selector
/// reference entirely (§4.H).
const FAST_PATH_SELECTORS: &[(&str, &str)] = &[
    ("_objc_opt_new", "new"),
    ("_objc_opt_self", "self"),
    ("_objc_opt_class", "class"),
    ("_objc_opt_isKindOfClass", "isKindOfClass:"),
    ("_objc_opt_respondsToSelector", "respondsToSelector:"),
    ("_objc_alloc", "alloc"),
    ("_objc_alloc_init", "init"),
];

const MSG_SEND_NAMES: &[&str] = &["_objc_msgSend", "_objc_msgSendSuper2"];

/// Full XRef index for one analyzer (§4.I): direct-branch/call callers,
/// Objective-C call sites keyed by (class, selector), and string-literal
/// load sites.
#[derive(Debug, Default)]
pub struct XRefIndex {
    callers: HashMap<u64, Vec<u64>>,
    objc_calls: HashMap<(InternedStr, InternedStr), Vec<u64>>,
    string_loads: HashMap<String, Vec<(u64, u64)>>,
}

impl XRefIndex {
    pub fn build(
        binary: &ParsedBinary,
        functions: &HashMap<u64, Function>,
        stubs: &StubTable,
        objc: &ObjcRuntime,
        interner: &Interner,
    ) -> XRefIndex {
        let mut index = XRefIndex::default();

        for function in functions.values() {
            for insn in &function.instructions {
                match insn.flow {
                    FlowKind::DirectBranch { .. } => {
                        if let Some(target) = insn.branch_target {
                            index.callers.entry(target).or_default().push(insn.address);
                        }
                    }
                    FlowKind::Call => {
                        if let Some(target) = insn.branch_target {
                            index.callers.entry(target).or_default().push(insn.address);
                            index.record_objc_call(binary, function, insn.address, target, stubs, objc, interner);
                        }
                    }
                    FlowKind::IndirectCall => {
                        if let Some(target) = resolve_indirect_call_target(binary, function, insn, stubs) {
                            index.callers.entry(target).or_default().push(insn.address);
                            index.record_objc_call(binary, function, insn.address, target, stubs, objc, interner);
                        }
                    }
                    _ => {}
                }
            }
            index.find_string_loads(binary, function, interner);
        }

        index
    }

    fn record_objc_call(
        &mut self,
        binary: &ParsedBinary,
        function: &Function,
        call_address: u64,
        target: u64,
        stubs: &StubTable,
        objc: &ObjcRuntime,
        interner: &Interner,
    ) {
        let Some(stub) = stubs.by_stub_address(target) else {
            return;
        };
        let Some(symbol_name) = stub.symbol_name else {
            return;
        };
        let name = interner.resolve(symbol_name);

        let selector_name = if MSG_SEND_NAMES.contains(&&*name) {
            let x1 = dataflow::register_contents_at(binary, function, "x1", call_address);
            resolve_selref_name(binary, x1, objc, interner)
        } else if let Some((_, sel)) = FAST_PATH_SELECTORS.iter().find(|(n, _)| *n == &*name) {
            Some(sel.to_string())
        } else {
            return;
        };

        let x0 = dataflow::register_contents_at(binary, function, "x0", call_address);
        let class_name = resolve_classref_name(x0, objc, interner);

        let (Some(class), Some(selector)) = (class_name.clone(), selector_name.clone()) else {
            return;
        };
        let key = (interner.intern(&class), interner.intern(&selector));
        self.objc_calls.entry(key).or_default().push(call_address);
    }

    fn find_string_loads(&mut self, binary: &ParsedBinary, function: &Function, _interner: &Interner) {
        #[derive(Clone, Copy)]
        struct Tracked {
            contents: RegisterContents,
            origin: Option<u64>,
        }

        for block in &function.basic_blocks {
            let mut regs: HashMap<String, Tracked> = HashMap::new();
            for insn in dataflow::instructions_in_block(function, *block) {
                match insn.mnemonic.as_str() {
                    "adrp" => {
                        if let [Operand::Reg(d), Operand::Imm(page)] = insn.operands.as_slice() {
                            regs.insert(
                                d.clone(),
                                Tracked {
                                    contents: RegisterContents::MemoryAddress(*page as u64),
                                    origin: Some(insn.address),
                                },
                            );
                        }
                    }
                    "add" => {
                        if let [Operand::Reg(d), Operand::Reg(s), Operand::Imm(off)] =
                            insn.operands.as_slice()
                        {
                            if d == s {
                                if let Some(&Tracked {
                                    contents: RegisterContents::MemoryAddress(base),
                                    origin,
                                }) = regs.get(s)
                                {
                                    let addr = (base as i64 + off) as u64;
                                    regs.insert(
                                        d.clone(),
                                        Tracked {
                                            contents: RegisterContents::MemoryAddress(addr),
                                            origin,
                                        },
                                    );
                                    if let (Some(origin), Some(text)) =
                                        (origin, literal_string_at(binary, addr))
                                    {
                                        self.string_loads.entry(text).or_default().push((origin, addr));
                                    }
                                }
                            }
                        }
                    }
                    "ldr" => {
                        if let [Operand::Reg(d), Operand::Mem { base: Some(b), disp }] =
                            insn.operands.as_slice()
                        {
                            if let Some(&Tracked {
                                contents: RegisterContents::MemoryAddress(base),
                                origin,
                            }) = regs.get(b)
                            {
                                let addr = (base as i64 + disp) as u64;
                                if let (Some(origin), Some(text)) =
                                    (origin, literal_string_at(binary, addr))
                                {
                                    self.string_loads.entry(text).or_default().push((origin, addr));
                                }
                                regs.insert(
                                    d.clone(),
                                    Tracked {
                                        contents: RegisterContents::MemoryAddress(addr),
                                        origin,
                                    },
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn callers_of(&self, address: u64) -> &[u64] {
        self.callers.get(&address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn objc_calls_to(
        &self,
        class_names: &[String],
        selector_names: &[String],
        requires_both_found: bool,
        interner: &Interner,
    ) -> Vec<CallSite> {
        let mut out = Vec::new();
        for (&(class, selector), sites) in &self.objc_calls {
            let class_str = interner.resolve(class);
            let selector_str = interner.resolve(selector);
            let class_match = class_names.is_empty() || class_names.iter().any(|c| c == &*class_str);
            let selector_match =
                selector_names.is_empty() || selector_names.iter().any(|s| s == &*selector_str);
            let matched = if requires_both_found {
                class_match && selector_match
            } else {
                class_match || selector_match
            };
            if matched {
                for &address in sites {
                    out.push(CallSite {
                        address,
                        class_name: Some(class_str.to_string()),
                        selector_name: Some(selector_str.to_string()),
                    });
                }
            }
        }
        out
    }

    pub fn string_xrefs_to(&self, literal: &str) -> Vec<(u64, u64)> {
        self.string_loads.get(literal).cloned().unwrap_or_default()
    }

    pub fn strings_in_func(&self, function: &Function) -> Vec<(u64, String)> {
        let mut out = Vec::new();
        for (text, sites) in &self.string_loads {
            for &(addr, _) in sites {
                if addr >= function.entry && addr < function.end {
                    out.push((addr, text.clone()));
                }
            }
        }
        out
    }

    pub fn all_strings(&self) -> Vec<(u64, String)> {
        self.string_loads
            .iter()
            .flat_map(|(text, sites)| sites.iter().map(move |&(_, addr)| (addr, text.clone())))
            .collect()
    }

    /// Every `(literal, origin, target)` triple, in the shape
    /// [`crate::cache::CachedAnalysis`] persists (§6 cache expansion).
    pub fn string_load_triples(&self) -> Vec<(String, u64, u64)> {
        self.string_loads
            .iter()
            .flat_map(|(text, sites)| sites.iter().map(move |&(origin, target)| (text.clone(), origin, target)))
            .collect()
    }
}

fn resolve_classref_name(contents: RegisterContents, objc: &ObjcRuntime, interner: &Interner) -> Option<String> {
    match contents {
        RegisterContents::MemoryAddress(addr) => objc
            .class_name_for_class_pointer(addr)
            .map(|n| interner.resolve(n).to_string()),
        _ => None,
    }
}

fn resolve_selref_name(
    binary: &ParsedBinary,
    contents: RegisterContents,
    objc: &ObjcRuntime,
    interner: &Interner,
) -> Option<String> {
    match contents {
        RegisterContents::MemoryAddress(addr) => {
            if let Some(name) = objc.selector_for_selref(addr) {
                return Some(interner.resolve(name).to_string());
            }
            // `addr` may already be the name string's address rather than a
            // selref slot, if the compiler folded the indirection away.
            let bytes = binary.vm_read_upto(addr, 256).ok()?;
            let s = ByteView::new(bytes, Endian::Little).read_cstr_at(0).ok()?;
            if !s.is_empty() {
                Some(s)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Resolves a `blr Xn` indirect call's target back to the stub trampoline it
/// reads through, so an Objective-C dispatch materialized into a register
/// (rather than encoded as a direct `bl` immediate) still resolves through
/// 4.E (§4.H: "`bl imm` or `blr Xn` whose target resolves ... to
/// `_objc_msgSend`"). Returns the stub's own address, matching what a direct
/// `Call`'s `branch_target` would already be, so the caller can feed it
/// straight into `record_objc_call`'s `stubs.by_stub_address` lookup.
fn resolve_indirect_call_target(
    binary: &ParsedBinary,
    function: &Function,
    insn: &crate::disasm::DecodedInsn,
    stubs: &StubTable,
) -> Option<u64> {
    let Operand::Reg(reg) = insn.operands.first()? else {
        return None;
    };
    let contents = dataflow::register_contents_at(binary, function, reg, insn.address);
    let RegisterContents::MemoryAddress(addr) = contents else {
        return None;
    };
    if let Some(stub) = stubs.by_stub_address(addr) {
        return Some(stub.stub_address);
    }
    stubs.by_pointer_address(addr).map(|stub| stub.stub_address)
}

/// If `addr` lands in a recognised literal-string-bearing section, returns
/// the string it names -- dereferencing one extra level for `__cfstring`,
/// whose entries are `CFConstantStringClassReference` structs rather than
/// raw bytes (§4.H / §4.I: "nothing behind further indirection is
/// recognized" beyond this one well-known case).
fn literal_string_at(binary: &ParsedBinary, addr: u64) -> Option<String> {
    let section = binary
        .segments()
        .iter()
        .flat_map(|s| s.sections.iter())
        .find(|s| s.contains_address(addr))?;

    match section.section_name.as_str() {
        "__cstring" | "__objc_methname" => {
            let bytes = binary.vm_read_upto(addr, 4096).ok()?;
            let s = ByteView::new(bytes, Endian::Little).read_cstr_at(0).ok()?;
            (!s.is_empty()).then_some(s)
        }
        "__cfstring" => {
            let buffer_ptr_bytes = binary.vm_read(addr + 16, 8).ok()?;
            let buffer_ptr = ByteView::new(buffer_ptr_bytes, Endian::Little).read_u64(0).ok()?;
            let bytes = binary.vm_read_upto(buffer_ptr, 4096).ok()?;
            let s = ByteView::new(bytes, Endian::Little).read_cstr_at(0).ok()?;
            (!s.is_empty()).then_some(s)
        }
        _ if matches!(section.section_type(), SectionType::CstringLiterals) => {
            let bytes = binary.vm_read_upto(addr, 4096).ok()?;
            let s = ByteView::new(bytes, Endian::Little).read_cstr_at(0).ok()?;
            (!s.is_empty()).then_some(s)
        }
        _ => None,
    }
}
