//! Packed checksum index (§8 "dump/load round-trip"), used by the compactor to test whether a
//! live message's content changed since it was last rewritten, without deserializing the full
//! JSON payload.
//!
//! Layout mirrors the feed-checksum packing this was adapted from: a version byte, a 4-byte
//! count, then a flat array of 4-byte keys followed by a flat array of 8-byte values (two
//! parallel arrays rather than interleaved key/value pairs, so both arrays compress and scan
//! contiguously).

use crate::error::{Error, Result};
use std::collections::BTreeMap;

const VERSION: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumIndex {
    entries: BTreeMap<u32, u64>,
}

impl ChecksumIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: u32, checksum: u64) {
        self.entries.insert(key, checksum);
    }

    pub fn get(&self, key: u32) -> Option<u64> {
        self.entries.get(&key).copied()
    }

    pub fn remove(&mut self, key: u32) {
        self.entries.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `[version: u8][count: u32 LE][keys: count * u32 LE][values: count * u64 LE]`.
    pub fn dump(&self) -> Vec<u8> {
        let count = self.entries.len() as u32;
        let mut out = Vec::with_capacity(1 + 4 + self.entries.len() * 12);
        out.push(VERSION);
        out.extend_from_slice(&count.to_le_bytes());
        for key in self.entries.keys() {
            out.extend_from_slice(&key.to_le_bytes());
        }
        for value in self.entries.values() {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn load(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::CorruptLog("empty checksum index".into()));
        }
        let version = buf[0];
        if version != VERSION {
            return Err(Error::CorruptLog(format!("unsupported checksum index version {version}")));
        }
        if buf.len() < 5 {
            return Err(Error::CorruptLog("truncated checksum index header".into()));
        }
        let count = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
        let keys_start = 5;
        let keys_end = keys_start + count * 4;
        let values_end = keys_end + count * 8;
        if buf.len() < values_end {
            return Err(Error::CorruptLog("truncated checksum index body".into()));
        }
        let mut entries = BTreeMap::new();
        for i in 0..count {
            let key_bytes = &buf[keys_start + i * 4..keys_start + i * 4 + 4];
            let key = u32::from_le_bytes(key_bytes.try_into().unwrap());
            let value_offset = keys_end + i * 8;
            let value_bytes = &buf[value_offset..value_offset + 8];
            let value = u64::from_le_bytes(value_bytes.try_into().unwrap());
            entries.insert(key, value);
        }
        Ok(ChecksumIndex { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_index_round_trips() {
        let idx = ChecksumIndex::new();
        let bytes = idx.dump();
        let loaded = ChecksumIndex::load(&bytes).unwrap();
        assert_eq!(idx, loaded);
    }

    #[test]
    fn truncated_body_is_corrupt_not_panicking() {
        let mut idx = ChecksumIndex::new();
        idx.insert(1, 100);
        idx.insert(2, 200);
        let bytes = idx.dump();
        let err = ChecksumIndex::load(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err.kind(), "corrupt_log");
    }

    proptest! {
        #[test]
        fn dump_load_round_trips_for_arbitrary_maps(pairs in proptest::collection::vec((any::<u32>(), any::<u64>()), 0..64)) {
            let mut idx = ChecksumIndex::new();
            for (k, v) in pairs {
                idx.insert(k, v);
            }
            let bytes = idx.dump();
            let loaded = ChecksumIndex::load(&bytes).unwrap();
            prop_assert_eq!(idx, loaded);
        }
    }
}
