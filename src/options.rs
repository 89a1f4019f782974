/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Configuration knobs for parsing and analysis.
//!
//! There is no on-disk configuration format here -- callers are other Rust
//! programs, so a plain builder is the idiomatic surface, the same way
//! `symbolic_debuginfo`'s `Object`/`Archive` types take a handful of
//! constructor arguments rather than reading a config file.

use std::path::PathBuf;

/// Options controlling how a [`ParsedBinary`](crate::macho::ParsedBinary) or
/// [`Analyzer`](crate::analyzer::Analyzer) behaves.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOptions {
    /// When set, non-fatal conditions from §7 (unknown load commands,
    /// inconsistent symbol tables, ambiguous Objective-C layouts, stub
    /// resolution disagreements) become hard errors instead of being
    /// accumulated into a `Warnings` list. Useful for test suites that want
    /// to assert a fixture is well-formed.
    pub strict: bool,

    /// Path to a directory used for the optional persisted cache described
    /// in §6 ("may optionally be persisted to a local key-value cache keyed
    /// by the slice's content hash"). `None` disables the cache entirely,
    /// which is the default: persistence is an implementation choice, not a
    /// correctness requirement.
    pub cache_dir: Option<PathBuf>,

    /// Eagerly compute the XRef index when an [`Analyzer`] is constructed,
    /// rather than waiting for the first call to a method that needs it.
    /// Off by default so that simple structural queries (symbols, sections)
    /// never pay for disassembling the whole binary.
    pub eager_xrefs: bool,
}

impl AnalyzerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn eager_xrefs(mut self, eager: bool) -> Self {
        self.eager_xrefs = eager;
        self
    }
}
