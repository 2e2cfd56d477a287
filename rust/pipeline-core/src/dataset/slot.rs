// rust/pipeline-core/src/dataset/slot.rs

//! Arena-backed slot datasets.
//!
//! Loading runs three pools at once. Load workers fill the input channel,
//! shuffle workers (distributed variant only) repartition it across ranks
//! into the shuffle channel, and merge workers collect whatever reaches
//! them into one record vector. The vector becomes a [`RecordArena`] that
//! readers consume through batch offsets planned by
//! [`prepare_train`](Preprocess::prepare_train).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use super::batching::compute_thread_batches;
use super::context::{spawn_load_workers, DatasetContext};
use super::{DatasetBase, Load, Merge, PipelinePhase, Preprocess, Shuffle};
use crate::channel::{make_channel, Channel};
use crate::config::{DatasetKind, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::feed::ThreadReader;
use crate::merge::{build_pv_instances, merge_by_instance_id};
use crate::messenger::InterRankMessenger;
use crate::pool::join_all;
use crate::reader::{FeatureCounter, RecordReader};
use crate::record::{PvInstance, Record, RecordArena, SlotTable};
use crate::shuffle::{DistributedShuffle, ShuffleOptions, ShuffleSink};

const COLLECT_BATCH: usize = 1024;

// Merge worker body: drains `source` into `collected` until it is closed.
fn collect_records(
    source: &Channel<Record>,
    collected: &Mutex<Vec<Record>>,
    features: &FeatureCounter,
) -> usize {
    let mut batch = Vec::new();
    let mut total = 0;
    while source.read_once(&mut batch, COLLECT_BATCH) {
        features.add(batch.iter().map(Record::feature_count).sum::<usize>() as u64);
        total += batch.len();
        collected.lock().append(&mut batch);
    }
    total
}

/// Slot dataset holding records in an in-memory arena.
pub struct SlotDataset {
    ctx: DatasetContext,
    kind: DatasetKind,
    slots: Arc<SlotTable>,
    shuffle_channel: Arc<Channel<Record>>,
    arena: Arc<RecordArena>,
    pv_instances: Arc<Vec<PvInstance>>,
}

impl SlotDataset {
    pub fn new(
        config: PipelineConfig,
        reader: Arc<dyn RecordReader>,
        messenger: Option<Arc<dyn InterRankMessenger>>,
    ) -> Self {
        Self::with_kind(DatasetKind::Slot, config, reader, messenger)
    }

    fn with_kind(
        kind: DatasetKind,
        config: PipelineConfig,
        reader: Arc<dyn RecordReader>,
        messenger: Option<Arc<dyn InterRankMessenger>>,
    ) -> Self {
        let name = match kind {
            DatasetKind::DistributedSlot => "distributed_slot",
            _ => "slot",
        };
        let slots = Arc::new(SlotTable::new(&config.reader.slots));
        let mut ds = Self {
            ctx: DatasetContext::new(name, config, reader, messenger),
            kind,
            slots,
            shuffle_channel: make_channel(),
            arena: Arc::new(RecordArena::default()),
            pv_instances: Arc::new(Vec::new()),
        };
        // Apply rank polling to the configured file list.
        let files = ds.ctx.config.dataset.filelist.clone();
        ds.ctx.set_filelist(files, true);
        ds
    }

    pub fn arena(&self) -> &Arc<RecordArena> {
        &self.arena
    }

    pub fn pv_instances(&self) -> &[PvInstance] {
        &self.pv_instances
    }

    fn distributed_messenger(&self) -> Option<Arc<dyn InterRankMessenger>> {
        if self.kind != DatasetKind::DistributedSlot {
            return None;
        }
        self.ctx.messenger.clone().filter(|m| m.rank_count() > 1)
    }

    // Drops reader references so the arena and sessions can be mutated in place.
    fn unbind_readers(&mut self) {
        for reader in &mut self.ctx.readers {
            reader.clear_batch_offsets();
            reader.bind_arena(Arc::default(), None);
        }
    }

    fn bind_readers(&mut self) {
        let pv = (!self.pv_instances.is_empty()).then(|| Arc::clone(&self.pv_instances));
        for reader in &mut self.ctx.readers {
            reader.bind_arena(Arc::clone(&self.arena), pv.clone());
        }
    }
}

impl DatasetBase for SlotDataset {
    fn name(&self) -> &'static str {
        self.ctx.name
    }

    fn kind(&self) -> DatasetKind {
        self.kind
    }

    fn phase(&self) -> PipelinePhase {
        self.ctx.phase()
    }

    fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    fn set_filelist(&mut self, files: Vec<PathBuf>) {
        self.ctx.set_filelist(files, true);
    }

    fn create_channel(&mut self) -> Result<()> {
        self.ctx.wait_release_done();
        Ok(())
    }

    fn create_readers(&mut self) -> Result<()> {
        self.ctx.check_readers()?;
        if !self.ctx.readers.is_empty() {
            return Ok(());
        }
        let thread_num = self.ctx.thread_num();
        let batch_size = self.ctx.config.dataset.batch_size;
        self.ctx.readers = (0..thread_num)
            .map(|i| ThreadReader::new(i, thread_num, batch_size))
            .collect();
        self.bind_readers();
        self.ctx.enter(PipelinePhase::Sharded);
        tracing::debug!(dataset = self.ctx.name, thread_num, "readers created");
        Ok(())
    }

    fn destroy_readers(&mut self) {
        self.ctx.readers.clear();
        self.ctx.files.reset();
        self.ctx.enter(PipelinePhase::Consumed);
    }

    fn readers(&self) -> &[ThreadReader] {
        &self.ctx.readers
    }

    fn readers_mut(&mut self) -> &mut [ThreadReader] {
        &mut self.ctx.readers
    }

    fn dynamic_adjust_readers_num(&mut self, thread_num: usize) -> Result<()> {
        if thread_num == self.ctx.thread_num() {
            if self.ctx.readers.is_empty() {
                return Ok(());
            }
            return self.prepare_train();
        }
        self.ctx.check_reader_counts(thread_num, self.ctx.channel_num())?;
        tracing::info!(
            dataset = self.ctx.name,
            from = self.ctx.thread_num(),
            to = thread_num,
            "adjusting reader count"
        );
        self.ctx.config.dataset.thread_num = thread_num;
        self.ctx.readers.clear();
        self.create_readers()?;
        self.prepare_train()
    }

    fn memory_data_size(&self) -> usize {
        self.arena.len()
    }

    fn shuffle_data_size(&self) -> usize {
        self.shuffle_channel.size()
    }

    fn pv_data_size(&self) -> usize {
        self.pv_instances.len()
    }

    fn feature_count(&self) -> u64 {
        self.ctx.features.get()
    }

    fn release_memory(&mut self) {
        let payload = (
            std::mem::replace(&mut self.ctx.input, make_channel()),
            std::mem::replace(&mut self.shuffle_channel, make_channel()),
            std::mem::take(&mut self.arena),
            std::mem::take(&mut self.pv_instances),
            std::mem::take(&mut self.ctx.readers),
        );
        self.ctx.release_in_background(Box::new(payload));
    }

    fn wait_release_done(&mut self) {
        self.ctx.wait_release_done();
    }
}

impl Load for SlotDataset {
    /// Loads, optionally repartitions across ranks, and collects every
    /// record into the arena. Returns the number of records kept.
    fn load_into_memory(&mut self) -> Result<usize> {
        self.ctx.prepare_input();
        self.ctx.enter(PipelinePhase::Loading);
        self.unbind_readers();
        let started = Instant::now();

        let load_threads = self.ctx.thread_num();
        let merge_threads = self.ctx.config.merge.merge_thread_num.max(1);
        let shuffle_threads = self.ctx.config.shuffle.thread_num.max(1);
        let options = ShuffleOptions::from_config(&self.ctx.config);
        let job = self.ctx.load_job();
        let messenger = self.distributed_messenger();

        let source = match &messenger {
            Some(_) => {
                self.shuffle_channel.clear();
                self.shuffle_channel.open();
                Arc::clone(&self.shuffle_channel)
            }
            None => Arc::clone(&self.ctx.input),
        };
        let collected = Arc::new(Mutex::new(Vec::new()));
        let merge_features = Arc::new(FeatureCounter::new());

        let (load_pool, merge_pool, shuffle_pool) =
            self.ctx.pools.all(load_threads, merge_threads, shuffle_threads)?;

        let coordinator = messenger.as_ref().map(|m| {
            Arc::new(DistributedShuffle::new(
                Arc::clone(m),
                ShuffleSink::channel(Arc::clone(&source)),
                options,
            ))
        });
        if let Some(c) = &coordinator {
            c.register();
        }

        let load_handles = spawn_load_workers(load_pool, &job, load_threads);
        let shuffle_handles = match &coordinator {
            Some(c) => c.start(shuffle_pool, Arc::clone(&job.input), shuffle_threads),
            None => Vec::new(),
        };
        let merge_handles: Vec<_> = (0..merge_threads)
            .map(|_| {
                let source = Arc::clone(&source);
                let collected = Arc::clone(&collected);
                let features = Arc::clone(&merge_features);
                merge_pool.spawn(move || {
                    Ok::<_, PipelineError>(collect_records(&source, &collected, &features))
                })
            })
            .collect();

        let loaded = join_all(load_handles);
        let shuffled = join_all(shuffle_handles);
        if let (Some(c), Some(m)) = (&coordinator, &messenger) {
            c.wait_closed();
            c.unregister();
            m.barrier();
        }
        let collected_counts = join_all(merge_handles);

        let loaded: usize = loaded?.into_iter().sum();
        shuffled?;
        let received: usize = collected_counts?.into_iter().sum();

        let mut records = std::mem::take(&mut *collected.lock());
        let mut features = merge_features.get();
        if self.ctx.config.merge.merge_by_ins_id {
            let (merged, stats) = merge_by_instance_id(
                records,
                &self.slots,
                self.ctx.config.merge.merge_size,
            );
            tracing::info!(
                dataset = self.ctx.name,
                input = stats.input_records,
                merged = stats.merged_records,
                dropped_records = stats.dropped_records,
                "records merged by instance id"
            );
            features = merged.iter().map(Record::feature_count).sum::<usize>() as u64;
            records = merged;
        }
        self.ctx.features.reset();
        self.ctx.features.add(features);

        self.arena = Arc::new(RecordArena::new(records));
        self.pv_instances = Arc::new(Vec::new());
        self.ctx.input.clear();
        self.bind_readers();

        let stats = coordinator.map(|c| c.stats()).unwrap_or_default();
        tracing::info!(
            dataset = self.ctx.name,
            loaded,
            received,
            kept = self.arena.len(),
            sent = stats.sent,
            features,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "load into memory finished"
        );
        Ok(self.arena.len())
    }
}

impl Shuffle for SlotDataset {
    /// Shuffles the PV sessions when they exist, else the arena records.
    fn local_shuffle(&mut self) -> Result<usize> {
        self.ctx.enter(PipelinePhase::LocalShuffle);
        self.unbind_readers();
        let shuffled = if self.pv_instances.is_empty() {
            Arc::make_mut(&mut self.arena).shuffle(&mut self.ctx.rng);
            self.arena.len()
        } else {
            Arc::make_mut(&mut self.pv_instances).shuffle(&mut self.ctx.rng);
            self.pv_instances.len()
        };
        self.bind_readers();
        tracing::debug!(dataset = self.ctx.name, shuffled, "local shuffle finished");
        Ok(shuffled)
    }
}

impl Merge for SlotDataset {}

impl Preprocess for SlotDataset {
    fn preprocess_instance(&mut self) -> Result<()> {
        if !self.ctx.config.merge.enable_pv_merge {
            return Ok(());
        }
        self.unbind_readers();
        Arc::make_mut(&mut self.arena).sort_by_search_id();
        let instances = build_pv_instances(&self.arena, self.ctx.config.merge.merge_by_sid);
        tracing::info!(
            dataset = self.ctx.name,
            records = self.arena.len(),
            sessions = instances.len(),
            "records grouped into sessions"
        );
        self.pv_instances = Arc::new(instances);
        self.bind_readers();
        Ok(())
    }

    /// Shuffles records (or sessions), plans batch offsets and deals them
    /// round-robin to the readers.
    fn prepare_train(&mut self) -> Result<()> {
        if self.ctx.readers.is_empty() {
            return Err(PipelineError::dataset(
                self.ctx.name,
                "prepare_train needs readers; call create_readers first",
            ));
        }
        self.local_shuffle()?;
        let thread_num = self.ctx.thread_num();
        let total = if self.pv_instances.is_empty() {
            self.arena.len()
        } else {
            self.pv_instances.len()
        };
        let plan = compute_thread_batches(
            thread_num,
            total,
            self.ctx.config.dataset.batch_size,
            self.ctx.messenger.as_deref(),
        )?;

        let readers = self.ctx.readers.len();
        for reader in &mut self.ctx.readers {
            reader.clear_batch_offsets();
        }
        for (i, (start, len)) in plan.offsets.iter().copied().enumerate() {
            self.ctx.readers[i % readers].add_batch_offset(start, len);
        }
        self.ctx.enter(PipelinePhase::Sharded);
        tracing::info!(
            dataset = self.ctx.name,
            total,
            batches = plan.offsets.len(),
            thread_batch_num = plan.thread_batch_num,
            "training batches prepared"
        );
        Ok(())
    }
}

impl std::fmt::Debug for SlotDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotDataset")
            .field("kind", &self.kind)
            .field("phase", &self.ctx.phase())
            .field("records", &self.arena.len())
            .field("sessions", &self.pv_instances.len())
            .finish()
    }
}

/// Slot dataset that repartitions records across ranks while loading.
#[derive(Debug)]
pub struct DistributedSlotDataset(SlotDataset);

impl DistributedSlotDataset {
    pub fn new(
        config: PipelineConfig,
        reader: Arc<dyn RecordReader>,
        messenger: Arc<dyn InterRankMessenger>,
    ) -> Self {
        Self(SlotDataset::with_kind(
            DatasetKind::DistributedSlot,
            config,
            reader,
            Some(messenger),
        ))
    }

    pub fn arena(&self) -> &Arc<RecordArena> {
        self.0.arena()
    }

    pub fn pv_instances(&self) -> &[PvInstance] {
        self.0.pv_instances()
    }
}

impl DatasetBase for DistributedSlotDataset {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn kind(&self) -> DatasetKind {
        self.0.kind()
    }

    fn phase(&self) -> PipelinePhase {
        self.0.phase()
    }

    fn config(&self) -> &PipelineConfig {
        self.0.config()
    }

    fn set_filelist(&mut self, files: Vec<PathBuf>) {
        self.0.set_filelist(files);
    }

    fn create_channel(&mut self) -> Result<()> {
        self.0.create_channel()
    }

    fn create_readers(&mut self) -> Result<()> {
        self.0.create_readers()
    }

    fn destroy_readers(&mut self) {
        self.0.destroy_readers();
    }

    fn readers(&self) -> &[ThreadReader] {
        self.0.readers()
    }

    fn readers_mut(&mut self) -> &mut [ThreadReader] {
        self.0.readers_mut()
    }

    fn dynamic_adjust_readers_num(&mut self, thread_num: usize) -> Result<()> {
        self.0.dynamic_adjust_readers_num(thread_num)
    }

    fn memory_data_size(&self) -> usize {
        self.0.memory_data_size()
    }

    fn shuffle_data_size(&self) -> usize {
        self.0.shuffle_data_size()
    }

    fn pv_data_size(&self) -> usize {
        self.0.pv_data_size()
    }

    fn feature_count(&self) -> u64 {
        self.0.feature_count()
    }

    fn release_memory(&mut self) {
        self.0.release_memory();
    }

    fn wait_release_done(&mut self) {
        self.0.wait_release_done();
    }
}

impl Load for DistributedSlotDataset {
    fn load_into_memory(&mut self) -> Result<usize> {
        self.0.load_into_memory()
    }
}

impl Shuffle for DistributedSlotDataset {
    fn local_shuffle(&mut self) -> Result<usize> {
        self.0.local_shuffle()
    }
}

impl Merge for DistributedSlotDataset {}

impl Preprocess for DistributedSlotDataset {
    fn preprocess_instance(&mut self) -> Result<()> {
        self.0.preprocess_instance()
    }

    fn prepare_train(&mut self) -> Result<()> {
        self.0.prepare_train()
    }
}
