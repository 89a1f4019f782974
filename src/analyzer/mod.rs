/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The analysis facade (§6): symbol resolution, the Objective-C runtime
//! model, function disassembly, and the two-phase XRef index, all lazily
//! computed and cached behind `RefCell`.
//!
//! An [Analyzer] is single-writer by construction: every cache is a
//! `RefCell<Option<T>>`, which makes the type `!Sync` for free. Sharing one
//! across threads means wrapping it yourself (a `Mutex<Analyzer>`, say);
//! nothing here attempts that on your behalf.

pub mod dataflow;
pub mod function;
pub mod xref;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::cache::{Cache, CachedAnalysis};
use crate::disasm::{Disassembler, FlowKind};
use crate::error::{Result, Warnings};
use crate::intern::Interner;
use crate::macho::segment::SectionType;
use crate::macho::ParsedBinary;
use crate::objc::ObjcRuntime;
use crate::options::AnalyzerOptions;
use crate::reader::read_uleb128;
use crate::stubs::StubTable;
use crate::symtab::{SymbolKind, SymbolTable};

pub use function::{BasicBlock, DecodedInsn, Function};
pub use xref::{CallSite, XRefIndex};

/// Lazily populated analysis state for one parsed slice (§6).
pub struct Analyzer {
    binary: ParsedBinary,
    interner: Interner,
    options: AnalyzerOptions,
    symtab: SymbolTable,
    stubs: StubTable,
    warnings: RefCell<Warnings>,
    objc: RefCell<Option<ObjcRuntime>>,
    functions: RefCell<Option<HashMap<u64, Function>>>,
    xrefs: RefCell<Option<XRefIndex>>,
    cache: Option<Cache>,
}

impl Analyzer {
    pub fn new(binary: ParsedBinary, options: AnalyzerOptions) -> Result<Analyzer> {
        let interner = Interner::new();
        let mut warnings = Warnings::new();
        let symtab = match binary.symtab_info() {
            Some(info) => SymbolTable::parse(&binary, info, &interner)?,
            None => SymbolTable::parse(
                &binary,
                crate::macho::load_command::SymtabInfo::default(),
                &interner,
            )?,
        };
        let stubs = StubTable::build(
            &binary,
            &symtab,
            binary.dysymtab_info(),
            &interner,
            &mut warnings,
            options.strict,
        )?;

        let cache = options.cache_dir.clone().map(Cache::new);

        let analyzer = Analyzer {
            binary,
            interner,
            options,
            symtab,
            stubs,
            warnings: RefCell::new(warnings),
            objc: RefCell::new(None),
            functions: RefCell::new(None),
            xrefs: RefCell::new(None),
            cache,
        };

        if analyzer.options.eager_xrefs {
            analyzer.compute_xrefs();
        }

        Ok(analyzer)
    }

    pub fn binary(&self) -> &ParsedBinary {
        &self.binary
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symtab
    }

    pub fn stubs(&self) -> &StubTable {
        &self.stubs
    }

    pub fn warnings(&self) -> Warnings {
        self.warnings.borrow().clone()
    }

    /// `name -> pointer slot address` for every imported symbol resolved
    /// through a stub (§6).
    pub fn imported_symbol_names_to_pointers(&self) -> HashMap<String, u64> {
        self.stubs
            .stubs()
            .filter_map(|s| Some((self.interner.resolve(s.symbol_name?).to_string(), s.pointer_address)))
            .collect()
    }

    /// `name -> address` for every symbol this slice defines (§6).
    pub fn exported_symbol_names_to_pointers(&self) -> HashMap<String, u64> {
        self.symtab
            .defined()
            .filter(|s| s.is_external)
            .map(|s| (self.interner.resolve(s.name).to_string(), s.value))
            .collect()
    }

    /// `pointer slot address -> name`, the inverse of
    /// [`Self::imported_symbol_names_to_pointers`] (§6).
    pub fn imported_symbols_to_symbol_names(&self) -> HashMap<u64, String> {
        self.stubs
            .stubs()
            .filter_map(|s| Some((s.pointer_address, self.interner.resolve(s.symbol_name?).to_string())))
            .collect()
    }

    fn objc(&self) -> Result<()> {
        if self.objc.borrow().is_some() {
            return Ok(());
        }
        let mut warnings = self.warnings.borrow_mut();
        let runtime = ObjcRuntime::build(&self.binary, &self.interner, &mut warnings, self.options.strict)?;
        *self.objc.borrow_mut() = Some(runtime);
        Ok(())
    }

    pub fn objc_classes(&self) -> Result<Vec<crate::objc::ObjcClass>> {
        self.objc()?;
        Ok(self.objc.borrow().as_ref().unwrap().classes().to_vec())
    }

    pub fn classref_for_class_name(&self, name: &str) -> Result<Option<u64>> {
        self.objc()?;
        Ok(self
            .objc
            .borrow()
            .as_ref()
            .unwrap()
            .classref_for_class_name(name, &self.interner))
    }

    pub fn class_name_for_class_pointer(&self, address: u64) -> Result<Option<String>> {
        self.objc()?;
        Ok(self
            .objc
            .borrow()
            .as_ref()
            .unwrap()
            .class_name_for_class_pointer(address)
            .map(|n| self.interner.resolve(n).to_string()))
    }

    pub fn selector_for_selref(&self, selref_address: u64) -> Result<Option<String>> {
        self.objc()?;
        Ok(self
            .objc
            .borrow()
            .as_ref()
            .unwrap()
            .selector_for_selref(selref_address)
            .map(|n| self.interner.resolve(n).to_string()))
    }

    pub fn get_imps_for_sel(&self, selector_name: &str) -> Result<Vec<u64>> {
        self.objc()?;
        Ok(self
            .objc
            .borrow()
            .as_ref()
            .unwrap()
            .get_imps_for_sel(selector_name, &self.interner))
    }

    /// Builds (if not already cached) every function reachable from a
    /// function-start, a defined text symbol, or the slice's entry point
    /// (§4.G), and returns their entry addresses in ascending order.
    pub fn functions(&self) -> Result<Vec<u64>> {
        self.ensure_functions()?;
        let mut addrs: Vec<u64> = self.functions.borrow().as_ref().unwrap().keys().copied().collect();
        addrs.sort_unstable();
        Ok(addrs)
    }

    fn ensure_functions(&self) -> Result<()> {
        if self.functions.borrow().is_some() {
            return Ok(());
        }
        let disasm = Disassembler::new()?;
        let mut built: HashMap<u64, Function> = HashMap::new();

        // Computed before `warnings` is borrowed below: building the
        // Objective-C runtime for point (a)'s candidates borrows it too.
        let initial = self.function_entry_candidates()?;
        let mut seen: BTreeSet<u64> = initial.iter().copied().collect();
        let mut queue: VecDeque<u64> = initial.into_iter().collect();

        let mut warnings = self.warnings.borrow_mut();

        // Branch/call targets discovered while disassembling one function are
        // themselves entry candidates (§4.G point (c)): a callee reached only
        // through code, never named by a symbol or `LC_FUNCTION_STARTS`, is
        // still disassembled.
        while let Some(entry) = queue.pop_front() {
            if built.contains_key(&entry) {
                continue;
            }
            let Some(f) = function::build_function(&self.binary, &disasm, entry, &mut warnings, self.options.strict)?
            else {
                continue;
            };
            for insn in &f.instructions {
                if matches!(insn.flow, FlowKind::DirectBranch { .. } | FlowKind::Call) {
                    if let Some(target) = insn.branch_target {
                        if seen.insert(target) {
                            queue.push_back(target);
                        }
                    }
                }
            }
            built.insert(entry, f);
        }

        self.persist_functions_to_cache(&built);
        *self.functions.borrow_mut() = Some(built);
        Ok(())
    }

    /// A stable key for this slice's bytes, used to address its cache entry.
    fn cache_key(&self) -> String {
        Cache::key_for(self.binary.data())
    }

    /// Best-effort write-through of the basic-block partition to the
    /// optional on-disk cache (§6 cache expansion). A write failure (a
    /// read-only cache directory, a full disk) never surfaces as an
    /// analysis error -- the cache is an optimization, not a dependency.
    fn persist_functions_to_cache(&self, functions: &HashMap<u64, Function>) {
        let Some(cache) = &self.cache else { return };
        let key = self.cache_key();
        let values: Vec<Function> = functions.values().cloned().collect();
        let string_loads = cache.load(&key).map(|c| c.string_loads).unwrap_or_default();
        let analysis = CachedAnalysis::from_live(&values, &string_loads);
        let _ = cache.store(&key, &analysis);
    }

    /// Looks up a function's basic-block partition in the on-disk cache
    /// without disassembling anything, for a caller that persisted a cache
    /// in an earlier run and just wants boundaries back (§6 cache
    /// expansion). Returns `None` if no cache is configured, nothing is
    /// cached for this slice, or this entry isn't in it.
    pub fn basic_blocks_from_cache(&self, entry: u64) -> Option<Vec<BasicBlock>> {
        self.cache.as_ref()?.load(&self.cache_key())?.basic_blocks_for(entry)
    }

    /// Merges freshly computed string-literal load sites into the cache
    /// entry that [`Self::persist_functions_to_cache`] already wrote.
    fn persist_string_loads_to_cache(&self, functions: &HashMap<u64, Function>, index: &XRefIndex) {
        let Some(cache) = &self.cache else { return };
        let key = self.cache_key();
        let values: Vec<Function> = functions.values().cloned().collect();
        let analysis = CachedAnalysis::from_live(&values, &index.string_load_triples());
        let _ = cache.store(&key, &analysis);
    }

    /// Collects candidate function entry points from `LC_FUNCTION_STARTS`,
    /// defined symbols in executable sections, the slice's own entry point,
    /// and every recovered Objective-C method implementation (§4.G points
    /// (a) and (b); point (c), branch targets found while analyzing another
    /// function, is closed over separately in `ensure_functions`).
    fn function_entry_candidates(&self) -> Result<BTreeSet<u64>> {
        let mut out = BTreeSet::new();

        if let (Some(starts), Some(text)) = (self.binary.function_starts(), self.binary.segment("__TEXT")) {
            if let Ok(bytes) = self.binary.file_read(starts.data_off as usize, starts.data_size as usize) {
                let mut offset = 0usize;
                let mut address = text.vm_address;
                while offset < bytes.len() {
                    match read_uleb128(bytes, offset) {
                        Ok((delta, next)) => {
                            if delta == 0 && next == offset + 1 && bytes[offset] == 0 {
                                break;
                            }
                            address += delta;
                            out.insert(address);
                            offset = next;
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        for symbol in self.symtab.defined() {
            let in_executable = self
                .binary
                .segments()
                .iter()
                .flat_map(|s| s.sections.iter())
                .enumerate()
                .any(|(i, sect)| {
                    (i as u8 + 1) == symbol.section_index
                        && matches!(sect.section_type(), SectionType::Regular)
                        && sect.section_name == "__text"
                });
            if matches!(symbol.kind, SymbolKind::Defined) && in_executable {
                out.insert(symbol.value);
            }
        }

        match self.binary.entry_point() {
            Some(crate::macho::EntryPoint::UnixThread { pc }) => {
                out.insert(pc);
            }
            Some(crate::macho::EntryPoint::Main { entry_off, .. }) => {
                if let Some(text) = self.binary.segment("__TEXT") {
                    out.insert(text.vm_address + entry_off);
                }
            }
            None => {}
        }

        for class in self.objc_classes()? {
            for method in &class.methods {
                out.insert(method.implementation_address);
            }
        }

        Ok(out)
    }

    pub fn function_analyzer(&self, entry: u64) -> Result<Option<FunctionAnalyzer<'_>>> {
        self.ensure_functions()?;
        let exists = self.functions.borrow().as_ref().unwrap().contains_key(&entry);
        Ok(exists.then_some(FunctionAnalyzer { analyzer: self, entry }))
    }

    /// Computes (idempotently) the XRef index over every known function
    /// (§6, §8: repeated calls return the same index without redoing the
    /// work).
    pub fn compute_xrefs(&self) -> XRefAnalyzer<'_> {
        if self.xrefs.borrow().is_some() {
            return XRefAnalyzer { analyzer: self };
        }
        self.ensure_functions().ok();
        self.objc().ok();
        let empty_functions = HashMap::new();
        let empty_objc = ObjcRuntime::default();
        let functions_guard = self.functions.borrow();
        let functions = functions_guard.as_ref().unwrap_or(&empty_functions);
        let objc_guard = self.objc.borrow();
        let objc = objc_guard.as_ref().unwrap_or(&empty_objc);
        let index = XRefIndex::build(&self.binary, functions, &self.stubs, objc, &self.interner);
        self.persist_string_loads_to_cache(functions, &index);
        drop(objc_guard);
        drop(functions_guard);
        *self.xrefs.borrow_mut() = Some(index);
        XRefAnalyzer { analyzer: self }
    }
}

/// Per-function view over an [Analyzer] (§6: `Analyzer.function_analyzer`).
pub struct FunctionAnalyzer<'a> {
    analyzer: &'a Analyzer,
    entry: u64,
}

impl<'a> FunctionAnalyzer<'a> {
    pub fn entry(&self) -> u64 {
        self.entry
    }

    fn with_function<T>(&self, f: impl FnOnce(&Function) -> T) -> T {
        let functions = self.analyzer.functions.borrow();
        let function = functions.as_ref().unwrap().get(&self.entry).unwrap();
        f(function)
    }

    pub fn instructions(&self) -> Vec<DecodedInsn> {
        self.with_function(|f| f.instructions.clone())
    }

    pub fn basic_blocks(&self) -> Vec<BasicBlock> {
        self.with_function(|f| f.basic_blocks.clone())
    }

    /// §6: `get_register_contents_at_instruction`.
    pub fn register_contents_at(&self, register: &str, at_address: u64) -> dataflow::RegisterContents {
        let functions = self.analyzer.functions.borrow();
        let function = functions.as_ref().unwrap().get(&self.entry).unwrap();
        dataflow::register_contents_at(&self.analyzer.binary, function, register, at_address)
    }
}

/// The phase-gated XRef view: only reachable via [`Analyzer::compute_xrefs`],
/// so the index is guaranteed built before any of these methods run (§6,
/// §9's two-phase design note).
pub struct XRefAnalyzer<'a> {
    analyzer: &'a Analyzer,
}

impl<'a> XRefAnalyzer<'a> {
    pub fn callers_of(&self, address: u64) -> Vec<u64> {
        self.analyzer.xrefs.borrow().as_ref().unwrap().callers_of(address).to_vec()
    }

    pub fn objc_calls_to(&self, class_name: Option<&str>, selector_name: Option<&str>) -> Vec<CallSite> {
        let classes: Vec<String> = class_name.map(|s| s.to_string()).into_iter().collect();
        let selectors: Vec<String> = selector_name.map(|s| s.to_string()).into_iter().collect();
        self.analyzer
            .xrefs
            .borrow()
            .as_ref()
            .unwrap()
            .objc_calls_to(&classes, &selectors, class_name.is_some() && selector_name.is_some(), &self.analyzer.interner)
    }

    pub fn string_xrefs_to(&self, literal: &str) -> Vec<(u64, u64)> {
        self.analyzer.xrefs.borrow().as_ref().unwrap().string_xrefs_to(literal)
    }

    pub fn strings_in_func(&self, entry: u64) -> Vec<(u64, String)> {
        let functions = self.analyzer.functions.borrow();
        match functions.as_ref().and_then(|m| m.get(&entry)) {
            Some(function) => self.analyzer.xrefs.borrow().as_ref().unwrap().strings_in_func(function),
            None => Vec::new(),
        }
    }

    pub fn get_cstrings(&self) -> Vec<(u64, String)> {
        self.analyzer.xrefs.borrow().as_ref().unwrap().all_strings()
    }
}
