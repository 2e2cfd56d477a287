// rust/pipeline-core/src/config.rs

//! Configuration management for the training-data pipeline.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PipelineError, Result};

// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dataset: DatasetConfig,
    pub reader: ReaderConfig,
    pub merge: MergeConfig,
    pub shuffle: ShuffleConfig,
}

/// Dataset variant selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Record pipeline over double-buffered output/consume channels.
    #[default]
    MultiSlot,
    /// In-memory record vector with batch offsets, loaded through worker pools.
    Slot,
    /// Slot pipeline that repartitions records across ranks while loading.
    DistributedSlot,
}

/// How records are assigned to destination ranks during a global shuffle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Resolved from the merge settings, see [`PipelineConfig::partition_strategy`].
    #[default]
    Auto,
    /// Uniform-random destination.
    Random,
    /// `search_id % rank_count`, keeps sessions together.
    SearchId,
    /// `xxh64(instance_id) % rank_count`, keeps instance duplicates together.
    InstanceId,
}

/// Value type carried by a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    #[default]
    Uint64,
    Float,
}

/// One configured feature slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    #[serde(default)]
    pub kind: SlotKind,
    #[serde(default)]
    pub dense: bool,
    #[serde(default = "default_true")]
    pub used: bool,
}

fn default_true() -> bool {
    true
}

impl SlotConfig {
    /// Sparse, used slot of the given kind.
    pub fn sparse(name: impl Into<String>, kind: SlotKind) -> Self {
        Self {
            name: name.into(),
            kind,
            dense: false,
            used: true,
        }
    }

    /// Dense, used slot of the given kind.
    pub fn dense(name: impl Into<String>, kind: SlotKind) -> Self {
        Self {
            name: name.into(),
            kind,
            dense: true,
            used: true,
        }
    }
}

/// Dataset configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Dataset variant: "multi_slot", "slot" or "distributed_slot".
    pub kind: DatasetKind,
    // Number of reader / load threads.
    pub thread_num: usize,
    // Number of output channels; must not exceed thread_num.
    pub channel_num: usize,
    // Threads used by background preload (0 means thread_num).
    pub preload_thread_num: usize,
    // Records handed to a reader per batch.
    pub batch_size: usize,
    // Input files.
    pub filelist: Vec<PathBuf>,
}

// Text reader options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    // Whether each line starts with an instance id.
    pub parse_ins_id: bool,
    // Whether a content field follows the instance id.
    pub parse_content: bool,
    // Whether a log key follows; search id, cmatch and rank are decoded from it.
    pub parse_logkey: bool,
    // Records per write into the input channel.
    pub write_batch: usize,
    /// Slot table, in slot-index order.
    pub slots: Vec<SlotConfig>,
}

// Merge options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    // Merge records sharing an instance id.
    pub merge_by_ins_id: bool,
    // Expected group cardinality; 0 disables the check.
    pub merge_size: usize,
    // Group records into sessions at preprocess time.
    pub enable_pv_merge: bool,
    // Group equal search ids (true) or emit one session per record (false).
    pub merge_by_sid: bool,
    // Merge pool size for the slot variants.
    pub merge_thread_num: usize,
}

// Shuffle options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    // Run the cross-rank shuffle as part of a pass.
    pub global_shuffle: bool,
    /// Partition strategy: "auto", "random", "search_id" or "instance_id".
    pub strategy: PartitionStrategy,
    // Records drained from the input channel per send round.
    pub send_batch_size: usize,
    // Shuffle pool size.
    pub thread_num: usize,
    // Pause between send rounds, in milliseconds.
    pub send_sleep_ms: u64,
    // Optional seed for reproducible shuffling.
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            kind: DatasetKind::MultiSlot,
            thread_num: 1,
            channel_num: 1,
            preload_thread_num: 0,
            batch_size: 32,
            filelist: Vec::new(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            parse_ins_id: false,
            parse_content: false,
            parse_logkey: false,
            write_batch: 1024,
            slots: Vec::new(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_by_ins_id: false,
            merge_size: 2,
            enable_pv_merge: false,
            merge_by_sid: true,
            merge_thread_num: 4,
        }
    }
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            global_shuffle: false,
            strategy: PartitionStrategy::Auto,
            send_batch_size: 1024,
            thread_num: 4,
            send_sleep_ms: 0,
            seed: None,
        }
    }
}

impl FromStr for PipelineConfig {
    type Err = PipelineError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| PipelineError::config_with_source("failed to parse TOML config", e))
    }
}

impl FromStr for PartitionStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "random" => Ok(Self::Random),
            "search_id" | "search-id" => Ok(Self::SearchId),
            "instance_id" | "instance-id" => Ok(Self::InstanceId),
            other => Err(PipelineError::config(format!(
                "unknown partition strategy '{other}'"
            ))),
        }
    }
}

impl FromStr for DatasetKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "multi_slot" | "multi-slot" => Ok(Self::MultiSlot),
            "slot" => Ok(Self::Slot),
            "distributed_slot" | "distributed-slot" => Ok(Self::DistributedSlot),
            other => Err(PipelineError::config(format!("unknown dataset kind '{other}'"))),
        }
    }
}

impl PipelineConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    /// The partition strategy actually used by a global shuffle.
    ///
    /// `Auto` picks session-consistent partitioning when PV merge is on,
    /// instance-consistent partitioning when merge-by-instance-id is on,
    /// and random partitioning otherwise.
    pub fn partition_strategy(&self) -> PartitionStrategy {
        match self.shuffle.strategy {
            PartitionStrategy::Auto => {
                if self.merge.enable_pv_merge {
                    PartitionStrategy::SearchId
                } else if self.merge.merge_by_ins_id {
                    PartitionStrategy::InstanceId
                } else {
                    PartitionStrategy::Random
                }
            }
            explicit => explicit,
        }
    }

    /// Threads used by a background preload.
    pub fn preload_threads(&self) -> usize {
        if self.dataset.preload_thread_num == 0 {
            self.dataset.thread_num
        } else {
            self.dataset.preload_thread_num
        }
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `TDP_` and use underscores
    // to separate nested fields. For example:
    // - `TDP_DATASET_THREAD_NUM` overrides `dataset.thread_num`
    // - `TDP_MERGE_MERGE_SIZE` overrides `merge.merge_size`
    // - `TDP_SHUFFLE_STRATEGY` overrides `shuffle.strategy`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Dataset overrides
        if let Ok(val) = std::env::var("TDP_DATASET_KIND") {
            if let Ok(v) = val.parse() {
                self.dataset.kind = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_DATASET_THREAD_NUM") {
            if let Ok(v) = val.parse() {
                self.dataset.thread_num = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_DATASET_CHANNEL_NUM") {
            if let Ok(v) = val.parse() {
                self.dataset.channel_num = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_DATASET_PRELOAD_THREAD_NUM") {
            if let Ok(v) = val.parse() {
                self.dataset.preload_thread_num = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_DATASET_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.dataset.batch_size = v;
            }
        }

        // Reader overrides
        if let Ok(val) = std::env::var("TDP_READER_PARSE_INS_ID") {
            if let Ok(v) = val.parse() {
                self.reader.parse_ins_id = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_READER_PARSE_CONTENT") {
            if let Ok(v) = val.parse() {
                self.reader.parse_content = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_READER_PARSE_LOGKEY") {
            if let Ok(v) = val.parse() {
                self.reader.parse_logkey = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_READER_WRITE_BATCH") {
            if let Ok(v) = val.parse() {
                self.reader.write_batch = v;
            }
        }

        // Merge overrides
        if let Ok(val) = std::env::var("TDP_MERGE_MERGE_BY_INS_ID") {
            if let Ok(v) = val.parse() {
                self.merge.merge_by_ins_id = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_MERGE_MERGE_SIZE") {
            if let Ok(v) = val.parse() {
                self.merge.merge_size = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_MERGE_ENABLE_PV_MERGE") {
            if let Ok(v) = val.parse() {
                self.merge.enable_pv_merge = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_MERGE_MERGE_BY_SID") {
            if let Ok(v) = val.parse() {
                self.merge.merge_by_sid = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_MERGE_THREAD_NUM") {
            if let Ok(v) = val.parse() {
                self.merge.merge_thread_num = v;
            }
        }

        // Shuffle overrides
        if let Ok(val) = std::env::var("TDP_SHUFFLE_GLOBAL_SHUFFLE") {
            if let Ok(v) = val.parse() {
                self.shuffle.global_shuffle = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_SHUFFLE_STRATEGY") {
            if let Ok(v) = val.parse() {
                self.shuffle.strategy = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_SHUFFLE_SEND_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.shuffle.send_batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_SHUFFLE_THREAD_NUM") {
            if let Ok(v) = val.parse() {
                self.shuffle.thread_num = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_SHUFFLE_SEND_SLEEP_MS") {
            if let Ok(v) = val.parse() {
                self.shuffle.send_sleep_ms = v;
            }
        }
        if let Ok(val) = std::env::var("TDP_SHUFFLE_SEED") {
            if let Ok(v) = val.parse() {
                self.shuffle.seed = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Dataset validation
        if self.dataset.thread_num == 0 {
            return Err(PipelineError::config(
                "dataset.thread_num must be greater than 0",
            ));
        }
        if self.dataset.channel_num == 0 {
            return Err(PipelineError::config(
                "dataset.channel_num must be greater than 0",
            ));
        }
        if self.dataset.channel_num > self.dataset.thread_num {
            return Err(PipelineError::config(format!(
                "dataset.channel_num ({}) must not exceed dataset.thread_num ({})",
                self.dataset.channel_num, self.dataset.thread_num
            )));
        }
        if self.dataset.batch_size == 0 {
            return Err(PipelineError::config(
                "dataset.batch_size must be greater than 0",
            ));
        }

        // Reader validation
        if self.reader.write_batch == 0 {
            return Err(PipelineError::config(
                "reader.write_batch must be greater than 0",
            ));
        }
        if self.reader.slots.len() > usize::from(u16::MAX) + 1 {
            return Err(PipelineError::config(
                "reader.slots must not contain more than 65536 slots",
            ));
        }
        let mut seen = HashSet::new();
        for slot in &self.reader.slots {
            if slot.name.is_empty() {
                return Err(PipelineError::config("reader.slots names must not be empty"));
            }
            if !seen.insert(slot.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "reader.slots contains duplicate slot '{}'",
                    slot.name
                )));
            }
        }

        // Merge validation
        if self.merge.merge_by_ins_id && !self.reader.parse_ins_id {
            return Err(PipelineError::config(
                "reader.parse_ins_id must be enabled when merge.merge_by_ins_id is set",
            ));
        }
        if self.merge.enable_pv_merge && !self.reader.parse_logkey {
            return Err(PipelineError::config(
                "reader.parse_logkey must be enabled when merge.enable_pv_merge is set",
            ));
        }
        if self.merge.merge_thread_num == 0 {
            return Err(PipelineError::config(
                "merge.merge_thread_num must be greater than 0",
            ));
        }

        // Shuffle validation
        if self.shuffle.send_batch_size == 0 {
            return Err(PipelineError::config(
                "shuffle.send_batch_size must be greater than 0",
            ));
        }
        if self.shuffle.thread_num == 0 {
            return Err(PipelineError::config(
                "shuffle.thread_num must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.dataset.kind, DatasetKind::MultiSlot);
        assert_eq!(config.dataset.thread_num, 1);
        assert_eq!(config.dataset.channel_num, 1);
        assert_eq!(config.dataset.batch_size, 32);
        assert!(config.dataset.filelist.is_empty());

        assert!(!config.reader.parse_ins_id);
        assert_eq!(config.reader.write_batch, 1024);

        assert!(!config.merge.merge_by_ins_id);
        assert_eq!(config.merge.merge_size, 2);
        assert!(config.merge.merge_by_sid);
        assert!(!config.merge.enable_pv_merge);

        assert_eq!(config.shuffle.strategy, PartitionStrategy::Auto);
        assert_eq!(config.shuffle.send_batch_size, 1024);
        assert!(config.shuffle.seed.is_none());
    }

    #[test]
    fn test_default_validates() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: PipelineConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [dataset]
            kind = "distributed_slot"
            thread_num = 8
            channel_num = 4
            batch_size = 64
            filelist = ["part-000", "part-001"]

            [reader]
            parse_ins_id = true
            parse_logkey = true
            write_batch = 256

            [[reader.slots]]
            name = "click"
            kind = "float"
            dense = true

            [[reader.slots]]
            name = "user"

            [merge]
            merge_by_ins_id = true
            merge_size = 3
            enable_pv_merge = true
            merge_by_sid = false

            [shuffle]
            global_shuffle = true
            strategy = "instance_id"
            send_batch_size = 512
            thread_num = 2
            seed = 7
        "#;

        let config: PipelineConfig = toml.parse().unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.dataset.kind, DatasetKind::DistributedSlot);
        assert_eq!(config.dataset.thread_num, 8);
        assert_eq!(config.dataset.channel_num, 4);
        assert_eq!(config.dataset.filelist.len(), 2);

        assert_eq!(config.reader.slots.len(), 2);
        assert_eq!(config.reader.slots[0].kind, SlotKind::Float);
        assert!(config.reader.slots[0].dense);
        assert_eq!(config.reader.slots[1].kind, SlotKind::Uint64);
        assert!(config.reader.slots[1].used);

        assert_eq!(config.merge.merge_size, 3);
        assert!(!config.merge.merge_by_sid);

        assert_eq!(config.shuffle.strategy, PartitionStrategy::InstanceId);
        assert_eq!(config.shuffle.seed, Some(7));
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<PipelineConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [dataset]
            thread_num = 4
            channel_num = 2
            "#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dataset.thread_num, 4);
        assert_eq!(config.dataset.channel_num, 2);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = PipelineConfig::from_file("/nonexistent/pipeline.toml");
        assert!(matches!(result, Err(PipelineError::Storage { .. })));
    }

    #[test]
    fn test_validate_channel_num_exceeds_thread_num() {
        let mut config = PipelineConfig::default();
        config.dataset.thread_num = 2;
        config.dataset.channel_num = 3;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("must not exceed"));
    }

    #[test]
    fn test_validate_zero_thread_num() {
        let mut config = PipelineConfig::default();
        config.dataset.thread_num = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_merge_requires_ins_id() {
        let mut config = PipelineConfig::default();
        config.merge.merge_by_ins_id = true;
        assert!(config.validate().is_err());

        config.reader.parse_ins_id = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_slot() {
        let mut config = PipelineConfig::default();
        config.reader.slots = vec![
            SlotConfig::sparse("a", SlotKind::Uint64),
            SlotConfig::dense("a", SlotKind::Float),
        ];
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_zero_send_batch_size() {
        let mut config = PipelineConfig::default();
        config.shuffle.send_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partition_strategy_resolution() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.partition_strategy(), PartitionStrategy::Random);

        config.merge.merge_by_ins_id = true;
        assert_eq!(config.partition_strategy(), PartitionStrategy::InstanceId);

        config.merge.enable_pv_merge = true;
        assert_eq!(config.partition_strategy(), PartitionStrategy::SearchId);

        config.shuffle.strategy = PartitionStrategy::Random;
        assert_eq!(config.partition_strategy(), PartitionStrategy::Random);
    }

    #[test]
    fn test_preload_threads_fallback() {
        let mut config = PipelineConfig::default();
        config.dataset.thread_num = 6;
        assert_eq!(config.preload_threads(), 6);
        config.dataset.preload_thread_num = 2;
        assert_eq!(config.preload_threads(), 2);
    }

    // Helper to clear all TDP_ environment variables for test isolation
    fn clear_tdp_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("TDP_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test because
    // env vars are process-global state.
    #[test]
    fn test_env_overrides() {
        clear_tdp_env_vars();

        std::env::set_var("TDP_DATASET_THREAD_NUM", "12");
        std::env::set_var("TDP_DATASET_KIND", "slot");
        std::env::set_var("TDP_MERGE_MERGE_SIZE", "4");
        std::env::set_var("TDP_SHUFFLE_STRATEGY", "search_id");
        std::env::set_var("TDP_SHUFFLE_SEED", "99");

        let config = PipelineConfig::default().with_env_overrides();

        assert_eq!(config.dataset.thread_num, 12);
        assert_eq!(config.dataset.kind, DatasetKind::Slot);
        assert_eq!(config.merge.merge_size, 4);
        assert_eq!(config.shuffle.strategy, PartitionStrategy::SearchId);
        assert_eq!(config.shuffle.seed, Some(99));

        clear_tdp_env_vars();

        // Invalid values are ignored
        std::env::set_var("TDP_DATASET_THREAD_NUM", "many");
        std::env::set_var("TDP_SHUFFLE_STRATEGY", "round_robin");

        let config = PipelineConfig::default().with_env_overrides();
        assert_eq!(config.dataset.thread_num, 1);
        assert_eq!(config.shuffle.strategy, PartitionStrategy::Auto);

        clear_tdp_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = PipelineConfig::default();
        original.reader.slots = vec![SlotConfig::dense("ctr", SlotKind::Float)];
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: PipelineConfig = toml_str.parse().unwrap();

        assert_eq!(original.dataset.thread_num, parsed.dataset.thread_num);
        assert_eq!(original.reader.slots, parsed.reader.slots);
        assert_eq!(original.shuffle.strategy, parsed.shuffle.strategy);
    }
}
