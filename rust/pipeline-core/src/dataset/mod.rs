// rust/pipeline-core/src/dataset/mod.rs

//! Pipeline controllers.
//!
//! A dataset owns every channel, pool and reader of one pipeline and drives
//! a pass through its phases:
//!
//! ```text
//! Idle -> Loading -> (LocalShuffle) -> (DistributedShuffle) -> Merging -> Sharded -> Consumed -> Idle
//! ```
//!
//! Variants share the same primitives and differ in which capabilities they
//! provide. Each capability is a trait ([`Load`], [`Shuffle`], [`Merge`],
//! [`Preprocess`]) on top of [`DatasetBase`]; operations a variant does not
//! support return a `Dataset` error instead of being silently ignored.
//!
//! - [`MultiSlotDataset`]: double-buffered output/consume channels,
//!   instance merge, session grouping, resharding.
//! - [`SlotDataset`]: concurrent load and merge into an in-memory arena,
//!   consumed through batch offsets.
//! - [`DistributedSlotDataset`]: a slot dataset that repartitions records
//!   across ranks while loading.

mod batching;
mod context;
mod multi_slot;
mod slot;

pub use batching::{compute_thread_batches, BatchPlan};
pub use multi_slot::MultiSlotDataset;
pub use slot::{DistributedSlotDataset, SlotDataset};

use std::path::PathBuf;
use std::sync::Arc;

use crate::channel::ReshardStats;
use crate::config::{DatasetKind, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::feed::ThreadReader;
use crate::merge::MergeStats;
use crate::messenger::InterRankMessenger;
use crate::reader::RecordReader;
use crate::shuffle::ShuffleStats;

/// Where a dataset is in its pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PipelinePhase {
    #[default]
    Idle,
    Loading,
    LocalShuffle,
    DistributedShuffle,
    Merging,
    Sharded,
    Consumed,
}

/// Operations every dataset variant provides.
pub trait DatasetBase: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    fn kind(&self) -> DatasetKind;

    fn phase(&self) -> PipelinePhase;

    fn config(&self) -> &PipelineConfig;

    /// Replaces the file list and rewinds the file cursor.
    fn set_filelist(&mut self, files: Vec<PathBuf>);

    /// Creates channels that do not exist yet, waiting for a pending release first.
    fn create_channel(&mut self) -> Result<()>;

    /// Creates one reader per thread. A no-op if readers already exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread or channel counts are inconsistent.
    fn create_readers(&mut self) -> Result<()>;

    fn destroy_readers(&mut self);

    fn readers(&self) -> &[ThreadReader];

    fn readers_mut(&mut self) -> &mut [ThreadReader];

    /// Recreates readers for `thread_num` threads.
    fn dynamic_adjust_readers_num(&mut self, thread_num: usize) -> Result<()>;

    /// Redistributes buffered records over `channel_num` channels.
    fn dynamic_adjust_channel_num(
        &mut self,
        channel_num: usize,
        discard_remainder: bool,
    ) -> Result<ReshardStats> {
        let _ = (channel_num, discard_remainder);
        Err(PipelineError::unsupported(self.name(), "dynamic_adjust_channel_num"))
    }

    /// Records buffered in the input stage.
    fn memory_data_size(&self) -> usize;

    /// Records buffered in the reader-facing stage.
    fn shuffle_data_size(&self) -> usize {
        0
    }

    fn pv_data_size(&self) -> usize {
        0
    }

    fn feature_count(&self) -> u64;

    /// Detaches all buffered data and drops it on a background thread.
    fn release_memory(&mut self);

    fn wait_release_done(&mut self);
}

pub trait Load: DatasetBase {
    /// Loads every file and returns the number of records loaded.
    fn load_into_memory(&mut self) -> Result<usize>;

    fn preload_into_memory(&mut self) -> Result<()> {
        Err(PipelineError::unsupported(self.name(), "preload_into_memory"))
    }

    fn wait_preload_done(&mut self) -> Result<usize> {
        Err(PipelineError::unsupported(self.name(), "wait_preload_done"))
    }
}

pub trait Shuffle: DatasetBase {
    /// Uniformly permutes buffered records in memory.
    fn local_shuffle(&mut self) -> Result<usize>;

    /// Repartitions buffered records across ranks.
    fn global_shuffle(&mut self) -> Result<ShuffleStats> {
        Err(PipelineError::unsupported(self.name(), "global_shuffle"))
    }
}

pub trait Merge: DatasetBase {
    fn merge_by_ins_id(&mut self) -> Result<MergeStats> {
        Err(PipelineError::unsupported(self.name(), "merge_by_ins_id"))
    }
}

pub trait Preprocess: DatasetBase {
    fn preprocess_instance(&mut self) -> Result<()>;

    fn postprocess_instance(&mut self) -> Result<()> {
        Ok(())
    }

    /// Plans batch offsets and hands them to the readers.
    fn prepare_train(&mut self) -> Result<()> {
        Err(PipelineError::unsupported(self.name(), "prepare_train"))
    }
}

/// A dataset with every capability trait, usable as `Box<dyn Dataset>`.
pub trait Dataset: Load + Shuffle + Merge + Preprocess {}

impl<T: Load + Shuffle + Merge + Preprocess> Dataset for T {}

/// Builds the dataset variant selected by `config.dataset.kind`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a distributed
/// variant is requested without a messenger.
pub fn create_dataset(
    config: PipelineConfig,
    reader: Arc<dyn RecordReader>,
    messenger: Option<Arc<dyn InterRankMessenger>>,
) -> Result<Box<dyn Dataset>> {
    config.validate()?;
    let dataset: Box<dyn Dataset> = match config.dataset.kind {
        DatasetKind::MultiSlot => Box::new(MultiSlotDataset::new(config, reader, messenger)),
        DatasetKind::Slot => Box::new(SlotDataset::new(config, reader, messenger)),
        DatasetKind::DistributedSlot => {
            let messenger = messenger.ok_or_else(|| {
                PipelineError::config("the distributed_slot dataset needs an inter-rank messenger")
            })?;
            Box::new(DistributedSlotDataset::new(config, reader, messenger))
        }
    };
    tracing::debug!(dataset = dataset.name(), "dataset created");
    Ok(dataset)
}
