/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Per-slice string interning.
//!
//! Symbol and selector names recur tens of thousands of times across a
//! binary's symbol table, indirect symbol table and Objective-C metadata.
//! Interning them here means equality and hashing of an [InternedStr] is a
//! `u32` comparison rather than a string compare, and every table that keys
//! on a name can share the same storage.

use indexmap::IndexSet;
use std::sync::{Arc, Mutex};

/// A handle to an interned string. Cheap to copy, compares by identity
/// within the [Interner] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternedStr(u32);

/// Owns the backing storage for a slice's interned names.
///
/// Wrapped in a `Mutex` rather than exposed as `&mut self` because the
/// [`Analyzer`](crate::analyzer::Analyzer) shares one interner across
/// several lazily populated caches that are each built independently (see
/// §9: "single-writer contract (one thread per analyzer)" -- the mutex here
/// is about sharing, not concurrency).
#[derive(Debug, Default)]
pub struct Interner {
    strings: Mutex<IndexSet<Arc<str>>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, s: &str) -> InternedStr {
        let mut strings = self.strings.lock().unwrap();
        if let Some(idx) = strings.get_index_of(s) {
            return InternedStr(idx as u32);
        }
        let (idx, _) = strings.insert_full(Arc::from(s));
        InternedStr(idx as u32)
    }

    pub fn resolve(&self, s: InternedStr) -> Arc<str> {
        let strings = self.strings.lock().unwrap();
        strings
            .get_index(s.0 as usize)
            .cloned()
            .expect("InternedStr from a different Interner")
    }

    pub fn len(&self) -> usize {
        self.strings.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
