// rust/pipeline-core/src/runtime.rs

//! Pipeline orchestration.
//!
//! [`PipelineRuntime`] ties a validated configuration, an optional
//! inter-rank messenger and the record reader together, builds datasets and
//! drives them through one pass.
//!
//! # Example
//!
//! ```no_run
//! use pipeline_core::PipelineRuntime;
//!
//! let runtime = PipelineRuntime::from_config_file("pipeline.toml").unwrap();
//! let mut dataset = runtime.build_dataset().unwrap();
//! let report = runtime.run_pass(dataset.as_mut()).unwrap();
//! println!("loaded {} records", report.loaded);
//!
//! for reader in dataset.readers_mut() {
//!     reader.start();
//!     while reader.next_batch(|batch| println!("{} records", batch.len())) {}
//! }
//! dataset.destroy_readers();
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{DatasetKind, PipelineConfig};
use crate::dataset::{create_dataset, Dataset};
use crate::error::Result;
use crate::merge::MergeStats;
use crate::messenger::InterRankMessenger;
use crate::reader::{RecordReader, TextRecordReader};
use crate::shuffle::ShuffleStats;

/// Summary of one pass driven by [`PipelineRuntime::run_pass`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Records produced by the load workers (after collection for slot variants).
    pub loaded: usize,
    /// Set when the pass ran a global shuffle.
    pub shuffle: Option<ShuffleStats>,
    /// Set when the pass merged records by instance id.
    pub merge: Option<MergeStats>,
    pub memory_data_size: usize,
    pub shuffle_data_size: usize,
    pub pv_data_size: usize,
    pub features: u64,
    pub elapsed: Duration,
}

/// Builds datasets from one configuration and runs their passes.
pub struct PipelineRuntime {
    config: PipelineConfig,
    messenger: Option<Arc<dyn InterRankMessenger>>,
}

impl PipelineRuntime {
    /// Creates a runtime with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the default configuration does not validate.
    pub fn new() -> Result<Self> {
        Self::from_config(PipelineConfig::default())
    }

    /// Creates a runtime from a TOML file, applying `TDP_*` environment
    /// overrides after loading it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = PipelineConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Creates a runtime from a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            messenger: None,
        })
    }

    /// Attaches the messenger used for global shuffles and batch planning.
    pub fn with_messenger(mut self, messenger: Arc<dyn InterRankMessenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn messenger(&self) -> Option<&Arc<dyn InterRankMessenger>> {
        self.messenger.as_ref()
    }

    /// A text reader for the configured slots.
    pub fn text_reader(&self) -> Arc<dyn RecordReader> {
        Arc::new(TextRecordReader::new(&self.config.reader))
    }

    /// Builds the configured dataset variant over the text reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the variant needs a messenger and none is attached.
    pub fn build_dataset(&self) -> Result<Box<dyn Dataset>> {
        self.build_dataset_with_reader(self.text_reader())
    }

    /// Builds the configured dataset variant over `reader`.
    pub fn build_dataset_with_reader(&self, reader: Arc<dyn RecordReader>) -> Result<Box<dyn Dataset>> {
        create_dataset(self.config.clone(), reader, self.messenger.clone())
    }

    /// Runs the standard pass on `dataset` and leaves it with readers ready.
    ///
    /// The record pipeline loads, shuffles (globally when configured, else
    /// locally), optionally merges by instance id and groups sessions. Slot
    /// variants load, group sessions and plan batch offsets.
    ///
    /// With several ranks, every rank must run the pass together.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a phase. The dataset is left in
    /// that phase.
    pub fn run_pass(&self, dataset: &mut dyn Dataset) -> Result<PassReport> {
        let started = Instant::now();
        let config = dataset.config().clone();
        let mut report = PassReport::default();

        dataset.create_channel()?;
        report.loaded = dataset.load_into_memory()?;

        match dataset.kind() {
            DatasetKind::MultiSlot => {
                if config.shuffle.global_shuffle {
                    report.shuffle = Some(dataset.global_shuffle()?);
                } else {
                    dataset.local_shuffle()?;
                }
                if config.merge.merge_by_ins_id {
                    report.merge = Some(dataset.merge_by_ins_id()?);
                }
                if config.merge.enable_pv_merge {
                    dataset.preprocess_instance()?;
                }
                dataset.create_readers()?;
            }
            DatasetKind::Slot | DatasetKind::DistributedSlot => {
                dataset.preprocess_instance()?;
                dataset.create_readers()?;
                dataset.prepare_train()?;
            }
        }

        report.memory_data_size = dataset.memory_data_size();
        report.shuffle_data_size = dataset.shuffle_data_size();
        report.pv_data_size = dataset.pv_data_size();
        report.features = dataset.feature_count();
        report.elapsed = started.elapsed();

        tracing::info!(
            dataset = dataset.name(),
            loaded = report.loaded,
            memory = report.memory_data_size,
            shuffled = report.shuffle_data_size,
            sessions = report.pv_data_size,
            features = report.features,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pass ready"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("ranks", &self.messenger.as_ref().map_or(1, |m| m.rank_count()))
            .finish()
    }
}
