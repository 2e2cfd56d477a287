// rust/pipeline-core/src/lib.rs

//! Training-Data Pipeline - Core Library
//!
//! This crate provides the in-memory ingestion engine that feeds training
//! workers: closable channels, record loading, local and cross-rank
//! shuffling, merging of records that share an instance id, and the dataset
//! controllers that reshard buffered records across reader threads.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{DatasetKind, PartitionStrategy, PipelineConfig, SlotConfig, SlotKind};
pub use error::{PipelineError, Result};

pub mod channel;
pub use channel::{make_channel, Channel, ChannelPairs, ReadSide, ReshardStats, WaitGroup};

pub mod record;
pub use record::{FeatureItem, PvInstance, Record, RecordArena, RecordId, SlotTable};

pub mod merge;
pub use merge::{build_pv_instances, merge_by_instance_id, MergeStats};

pub mod pool;
pub use pool::{PipelinePools, TaskHandle, WorkerPool};

pub mod reader;
pub use reader::{FileCursor, RecordReader, TextRecordReader};

pub mod feed;
pub use feed::{FeedChannels, ThreadReader};

pub mod messenger;
pub use messenger::{InterRankMessenger, LocalCluster, LocalMessenger, MessageHandler};

pub mod shuffle;
pub use shuffle::{DistributedShuffle, ShuffleStats};

pub mod dataset;
pub use dataset::{
    create_dataset, Dataset, DatasetBase, DistributedSlotDataset, Load, Merge, MultiSlotDataset,
    PipelinePhase, Preprocess, Shuffle, SlotDataset,
};

pub mod runtime;
pub use runtime::{PassReport, PipelineRuntime};
