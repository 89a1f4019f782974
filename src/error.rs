/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The error taxonomy for parsing and analysis.
//!
//! Two kinds of failure exist here. Fatal errors ([Error]) abort the call
//! that produced them: a malformed magic number or a read that runs off the
//! end of the slice means there is nothing sensible left to return. Non-fatal
//! conditions ([Warning]) are collected into a [Warnings] list attached to
//! the [`ParsedBinary`](crate::macho::ParsedBinary) or
//! [`Analyzer`](crate::analyzer::Analyzer) that produced them, and are also
//! emitted as `tracing` events as they are discovered.

use std::fmt;

/// Fatal errors. Returned from `Result`s that abort the whole parse or
/// analysis call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The first four bytes were not a Mach-O or FAT magic number.
    #[error("not a Mach-O file (magic {magic:#010x})")]
    NotAMachO { magic: u32 },

    /// A bounds-checked read ran off the end of the slice.
    #[error("truncated binary: tried to read {needed} byte(s) at offset {offset} of a {len}-byte region")]
    TruncatedBinary {
        offset: usize,
        len: usize,
        needed: usize,
    },

    /// A string table lookup used a `n_strx`/offset beyond the string table.
    #[error("string table index {index} out of range (table is {len} bytes)")]
    StringIndexOutOfRange { index: u32, len: usize },

    /// An address used to index into a function's basic blocks was not
    /// inside the function's extent.
    #[error("address {address:#x} is outside the function extent [{start:#x}, {end:#x})")]
    AddressOutsideFunction {
        address: u64,
        start: u64,
        end: u64,
    },

    /// The disassembler could not decode bytes where a decode was required
    /// (not merely skipped, see [Warning::InvalidBytecode]).
    #[error("could not decode instruction at {address:#x}")]
    Disassembly {
        address: u64,
        #[source]
        source: capstone::Error,
    },

    #[error(transparent)]
    Capstone(#[from] capstone::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Raised instead of silently accumulating a [Warning] when
    /// [`AnalyzerOptions::strict`](crate::options::AnalyzerOptions::strict)
    /// is set.
    #[error("warning promoted to error by strict mode: {0}")]
    StrictWarning(Warning),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal conditions, per §7 of the design: recorded, surfaced to the
/// caller through [Warnings], but never abort the containing operation
/// (other than the function an `InvalidBytecode` occurs in, which is
/// abandoned for XRef purposes while the rest of the binary proceeds).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Warning {
    #[error("unknown load command {cmd:#x} at offset {offset:#x}")]
    UnknownLoadCommand { cmd: u32, offset: usize },

    #[error("inconsistent symbol table: {detail}")]
    InconsistentSymbolTable { detail: String },

    #[error("invalid bytecode at {address:#x} in function {function:#x}: function abandoned for XRef purposes")]
    InvalidBytecode { function: u64, address: u64 },

    #[error("ambiguous Objective-C method-list layout at {address:#x}: header flag and deployment target disagree, preferring header flag")]
    AmbiguousLayout { address: u64 },

    #[error("stub resolution disagreement for bound pointer {pointer:#x}: table says {table_name:?}, bind stream says {bind_name:?}")]
    StubResolutionDisagreement {
        pointer: u64,
        table_name: Option<String>,
        bind_name: Option<String>,
    },
}

/// An ordered collection of [Warning]s, attached to whatever structure
/// produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Warnings(Vec<Warning>);

impl Warnings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning. If `strict` is set this returns an error instead of
    /// recording anything, per §7's strict-mode escape hatch.
    pub fn push(&mut self, warning: Warning, strict: bool) -> Result<()> {
        if strict {
            return Err(Error::StrictWarning(warning));
        }
        match &warning {
            Warning::UnknownLoadCommand { cmd, offset } => {
                tracing::debug!(cmd = %format_args!("{cmd:#x}"), offset, "unknown load command")
            }
            Warning::InconsistentSymbolTable { detail } => {
                tracing::warn!(detail, "inconsistent symbol table")
            }
            Warning::InvalidBytecode { function, address } => {
                tracing::warn!(function = %format_args!("{function:#x}"), address = %format_args!("{address:#x}"), "invalid bytecode, abandoning function")
            }
            Warning::AmbiguousLayout { address } => {
                tracing::warn!(address = %format_args!("{address:#x}"), "ambiguous Objective-C method-list layout")
            }
            Warning::StubResolutionDisagreement { pointer, .. } => {
                tracing::warn!(pointer = %format_args!("{pointer:#x}"), "stub resolution disagreement between table and bind stream")
            }
        }
        self.0.push(warning);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Warning> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Warnings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, w) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{w}")?;
        }
        Ok(())
    }
}
