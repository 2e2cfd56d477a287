// rust/pipeline-core/src/record/mod.rs

//! Training records and the handles that group them.
//!
//! A [`Record`] is one training example: an instance id, a session
//! (`search_id`), optional passthrough metadata and its feature signatures
//! grouped by slot. Records are immutable once parsed; later stages move them
//! between channels, fold them together by instance id, or group them into
//! [`PvInstance`] sessions through [`RecordId`] handles into a
//! [`RecordArena`].

mod arena;
mod codec;
mod slots;

pub use arena::{PvInstance, RecordArena, RecordId};
pub use codec::{decode_records, encode_record, encode_records};
pub use slots::SlotTable;

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

/// Magnitude below which a float feature counts as empty.
pub const FLOAT_EPSILON: f32 = 1e-6;

/// One feature signature: a value tagged with its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureItem<V> {
    pub slot: u16,
    pub value: V,
}

impl<V> FeatureItem<V> {
    pub fn new(slot: u16, value: V) -> Self {
        Self { slot, value }
    }
}

impl FeatureItem<u64> {
    pub fn is_empty(&self) -> bool {
        self.value == 0
    }
}

impl FeatureItem<f32> {
    pub fn is_empty(&self) -> bool {
        self.value.abs() < FLOAT_EPSILON
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub instance_id: String,
    pub search_id: u64,
    pub rank: u32,
    pub cmatch: u32,
    pub content: Option<String>,
    pub log_key: Option<String>,
    pub uint64_feasigns: Vec<FeatureItem<u64>>,
    pub float_feasigns: Vec<FeatureItem<f32>>,
}

impl Record {
    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    pub fn push_uint64(&mut self, slot: u16, value: u64) {
        self.uint64_feasigns.push(FeatureItem::new(slot, value));
    }

    pub fn push_float(&mut self, slot: u16, value: f32) {
        self.float_feasigns.push(FeatureItem::new(slot, value));
    }

    pub fn feature_count(&self) -> usize {
        self.uint64_feasigns.len() + self.float_feasigns.len()
    }

    /// XXH64 (seed 0) of the instance id, used for instance-consistent partitioning.
    pub fn instance_hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(self.instance_id.as_bytes());
        hasher.finish()
    }

    /// Sets the log key and fills `search_id`, `cmatch` and `rank` from it.
    ///
    /// Returns `false` (leaving the ids untouched) if the key is too short
    /// or not hex in the expected positions.
    pub fn apply_log_key(&mut self, log_key: impl Into<String>) -> bool {
        let log_key = log_key.into();
        let parsed = parse_log_key(&log_key);
        if let Some(ids) = parsed {
            self.search_id = ids.search_id;
            self.cmatch = ids.cmatch;
            self.rank = ids.rank;
        }
        self.log_key = Some(log_key);
        parsed.is_some()
    }
}

/// Ids packed into a log key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogKeyIds {
    pub search_id: u64,
    pub cmatch: u32,
    pub rank: u32,
}

/// Decodes a log key: cmatch in hex chars 11..14, rank in 14..16, search id in 16..32.
pub fn parse_log_key(log_key: &str) -> Option<LogKeyIds> {
    let cmatch = u32::from_str_radix(log_key.get(11..14)?, 16).ok()?;
    let rank = u32::from_str_radix(log_key.get(14..16)?, 16).ok()?;
    let search_id = u64::from_str_radix(log_key.get(16..32)?, 16).ok()?;
    Some(LogKeyIds {
        search_id,
        cmatch,
        rank,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_key() {
        // 11 padding chars, then cmatch, rank and search id
        let key = "00000000000".to_string() + "0a2" + "03" + "00000000000004d2";
        let ids = parse_log_key(&key).unwrap();
        assert_eq!(ids.cmatch, 0xa2);
        assert_eq!(ids.rank, 3);
        assert_eq!(ids.search_id, 1234);
    }

    #[test]
    fn test_parse_log_key_too_short() {
        assert!(parse_log_key("0123").is_none());
        assert!(parse_log_key("00000000000zzz0300000000000004d2").is_none());
    }

    #[test]
    fn test_apply_log_key_fills_ids() {
        let mut record = Record::with_instance_id("ins");
        let key = "00000000000".to_string() + "001" + "02" + "000000000000000f";
        assert!(record.apply_log_key(key.clone()));
        assert_eq!(record.search_id, 15);
        assert_eq!(record.rank, 2);
        assert_eq!(record.cmatch, 1);
        assert_eq!(record.log_key, Some(key));
    }

    #[test]
    fn test_instance_hash_is_stable() {
        let a = Record::with_instance_id("user-17");
        let b = Record::with_instance_id("user-17");
        let c = Record::with_instance_id("user-18");
        assert_eq!(a.instance_hash(), b.instance_hash());
        assert_ne!(a.instance_hash(), c.instance_hash());
    }

    #[test]
    fn test_feature_emptiness() {
        assert!(FeatureItem::new(0, 0u64).is_empty());
        assert!(!FeatureItem::new(0, 3u64).is_empty());
        assert!(FeatureItem::new(0, 1e-7f32).is_empty());
        assert!(!FeatureItem::new(0, -0.5f32).is_empty());
    }

    #[test]
    fn test_feature_count() {
        let mut record = Record::default();
        record.push_uint64(1, 10);
        record.push_uint64(2, 20);
        record.push_float(3, 0.5);
        assert_eq!(record.feature_count(), 3);
    }
}
