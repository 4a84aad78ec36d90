//! File registry: tracks replicated files and assembles `addfile` segment
//! commands into complete files.
//!
//! Grounded on `original_source/core.h`'s file-registry bookkeeping
//! (paired with `commands.cpp`'s `exec_addfile`, which either installs a
//! whole-file payload or writes a `[from, to)` segment into a temp sparse
//! file, renaming it into place once every segment up to the known file
//! size has arrived) and spec §4.3/§4.4's `addfile` description.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
}

/// Registry of completed files (spec §3 "file registry").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileRegistry {
    files: IndexMap<String, FileEntry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        FileRegistry::default()
    }

    pub fn insert(&mut self, name: &str, size: u64) {
        self.files.insert(name.to_string(), FileEntry { size });
    }

    pub fn remove(&mut self, name: &str) -> Option<FileEntry> {
        self.files.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// Splits `content` into `granularity`-sized segments, the unit
/// `create_command` calls when authoring an `addfile` sequence (spec §8
/// scenario 6: 2500-byte file at 1K granularity yields three segments).
pub fn split_into_segments(content: &[u8], granularity: u64) -> Vec<(u64, u64, Vec<u8>)> {
    if granularity == 0 || content.is_empty() {
        return vec![(0, content.len() as u64, content.to_vec())];
    }
    let mut out = Vec::new();
    let mut from = 0u64;
    while from < content.len() as u64 {
        let to = (from + granularity).min(content.len() as u64);
        out.push((from, to, content[from as usize..to as usize].to_vec()));
        from = to;
    }
    out
}

/// Assembles a file from out-of-order `[from, to)` segments. Mirrors the
/// temp sparse-file-then-rename approach of `exec_addfile`: segments are
/// held keyed by offset until the accumulated span covers `[0, total)`,
/// then concatenated in order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SegmentAssembler {
    segments: BTreeMap<u64, Vec<u8>>,
    total: Option<u64>,
}

impl SegmentAssembler {
    pub fn new() -> Self {
        SegmentAssembler::default()
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = Some(total);
    }

    pub fn add_segment(&mut self, from: u64, data: Vec<u8>) {
        self.segments.insert(from, data);
    }

    /// Returns the assembled bytes once every byte of `[0, total)` is
    /// covered by contiguous segments, else `None`.
    pub fn try_assemble(&self) -> Option<Vec<u8>> {
        let total = self.total?;
        let mut out = Vec::with_capacity(total as usize);
        let mut cursor = 0u64;
        for (&from, data) in self.segments.iter() {
            if from != cursor {
                return None;
            }
            out.extend_from_slice(data);
            cursor += data.len() as u64;
        }
        if cursor == total {
            Some(out)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_into_segments_matches_granularity_scenario() {
        let content = vec![7u8; 2500];
        let segments = split_into_segments(&content, 1024);
        assert_eq!(segments.len(), 3);
        assert_eq!((segments[0].0, segments[0].1), (0, 1024));
        assert_eq!((segments[1].0, segments[1].1), (1024, 2048));
        assert_eq!((segments[2].0, segments[2].1), (2048, 2500));
    }

    #[test]
    fn assembler_reassembles_out_of_order_segments() {
        let content = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let segments = split_into_segments(&content, 3);
        let mut asm = SegmentAssembler::new();
        asm.set_total(content.len() as u64);
        for (from, _to, data) in segments.into_iter().rev() {
            asm.add_segment(from, data);
        }
        assert_eq!(asm.try_assemble().unwrap(), content);
    }

    #[test]
    fn assembler_refuses_partial_coverage() {
        let mut asm = SegmentAssembler::new();
        asm.set_total(10);
        asm.add_segment(0, vec![0; 5]);
        assert!(asm.try_assemble().is_none());
    }
}
