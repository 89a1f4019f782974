/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Optional on-disk cache of the expensive parts of an analysis (§6: "may
//! optionally be persisted to a local key-value cache keyed by the slice's
//! content hash").
//!
//! This is an implementation choice, not a wire-compatibility concern: the
//! format is private to this crate and may change between releases without
//! notice. A miss (wrong version, corrupt JSON, missing file) is always
//! silently treated as "nothing cached" -- nothing here is allowed to turn a
//! cache problem into an analysis failure.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analyzer::{BasicBlock, Function};

/// Schema version, bumped whenever [CachedAnalysis]'s shape changes so an
/// old cache directory from a prior release is ignored rather than
/// misparsed.
const CACHE_VERSION: u32 = 1;

/// The subset of an analysis worth persisting: basic-block partitions (the
/// expensive part of §4.G) and string-literal load sites (the expensive part
/// of §4.I). The XRef caller/callee graph is cheap to recompute once
/// functions are partitioned, so it is not stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedAnalysis {
    version: u32,
    pub functions: Vec<CachedFunction>,
    pub string_loads: Vec<(String, u64, u64)>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CachedFunction {
    pub entry: u64,
    pub end: u64,
    pub basic_blocks: Vec<(u64, u64)>,
}

impl CachedAnalysis {
    pub fn from_live(functions: &[Function], string_loads: &[(String, u64, u64)]) -> CachedAnalysis {
        CachedAnalysis {
            version: CACHE_VERSION,
            functions: functions
                .iter()
                .map(|f| CachedFunction {
                    entry: f.entry,
                    end: f.end,
                    basic_blocks: f.basic_blocks.iter().map(|b| (b.start, b.end)).collect(),
                })
                .collect(),
            string_loads: string_loads.to_vec(),
        }
    }

    pub fn basic_blocks_for(&self, entry: u64) -> Option<Vec<BasicBlock>> {
        self.functions
            .iter()
            .find(|f| f.entry == entry)
            .map(|f| f.basic_blocks.iter().map(|&(start, end)| BasicBlock { start, end }).collect())
    }
}

/// Content-hash-keyed directory cache.
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Cache {
        Cache { dir: dir.into() }
    }

    /// A stable key for `data`, used as the cache file's name. Not
    /// cryptographic: collisions only cost a spurious cache miss, not
    /// correctness, since every cache read still gets parsed and validated.
    pub fn key_for(data: &[u8]) -> String {
        let mut hasher = DefaultHasher::new();
        data.len().hash(&mut hasher);
        data.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn load(&self, key: &str) -> Option<CachedAnalysis> {
        let bytes = std::fs::read(self.path_for(key)).ok()?;
        let cached: CachedAnalysis = serde_json::from_slice(&bytes).ok()?;
        (cached.version == CACHE_VERSION).then_some(cached)
    }

    pub fn store(&self, key: &str, analysis: &CachedAnalysis) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec(analysis).map_err(std::io::Error::other)?;
        std::fs::write(self.path_for(key), bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let key = Cache::key_for(b"hello");
        let analysis = CachedAnalysis {
            version: CACHE_VERSION,
            functions: vec![CachedFunction {
                entry: 0x1000,
                end: 0x1010,
                basic_blocks: vec![(0x1000, 0x1010)],
            }],
            string_loads: vec![("hi".to_string(), 0x2000, 0x3000)],
        };
        cache.store(&key, &analysis).unwrap();
        let loaded = cache.load(&key).unwrap();
        assert_eq!(loaded.basic_blocks_for(0x1000).unwrap(), vec![BasicBlock { start: 0x1000, end: 0x1010 }]);
    }

    #[test]
    fn missing_entry_is_a_clean_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        assert!(cache.load("does-not-exist").is_none());
    }
}
