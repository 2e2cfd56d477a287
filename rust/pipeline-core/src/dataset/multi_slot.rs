// rust/pipeline-core/src/dataset/multi_slot.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;

use super::context::DatasetContext;
use super::{DatasetBase, Load, Merge, PipelinePhase, Preprocess, Shuffle};
use crate::channel::{
    consumer_block_size, make_channel, Channel, ChannelPairs, ReadSide, ReshardStats,
};
use crate::config::{DatasetKind, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::feed::{FeedChannels, ThreadReader};
use crate::merge::{build_pv_instances, merge_by_instance_id, MergeStats};
use crate::messenger::InterRankMessenger;
use crate::pool::join_all;
use crate::reader::RecordReader;
use crate::record::{PvInstance, Record, RecordArena, RecordId, SlotTable};
use crate::shuffle::{self, DistributedShuffle, ShuffleOptions, ShuffleSink, ShuffleStats};

const NAME: &str = "multi_slot";

/// Record pipeline over double-buffered output/consume channel pairs.
///
/// Loaded records sit in the input channel until readers pull them, a
/// global shuffle spreads them over the producing channels, or a merge
/// rewrites them there. Readers drain one side of each pair and refill the
/// other; [`destroy_readers`](DatasetBase::destroy_readers) flips the side
/// so the next pass reads back what the last one consumed.
///
/// Preprocessing moves records into a [`RecordArena`] and feeds readers
/// [`RecordId`]s, or [`PvInstance`] sessions when PV merge is enabled.
pub struct MultiSlotDataset {
    ctx: DatasetContext,
    slots: Arc<SlotTable>,
    side: ReadSide,
    pairs: ChannelPairs<Record>,
    id_input: Arc<Channel<RecordId>>,
    id_pairs: ChannelPairs<RecordId>,
    pv_input: Arc<Channel<PvInstance>>,
    pv_pairs: ChannelPairs<PvInstance>,
    arena: Arc<RecordArena>,
}

impl MultiSlotDataset {
    pub fn new(
        config: PipelineConfig,
        reader: Arc<dyn RecordReader>,
        messenger: Option<Arc<dyn InterRankMessenger>>,
    ) -> Self {
        let channel_num = config.dataset.channel_num;
        let slots = Arc::new(SlotTable::new(&config.reader.slots));
        Self {
            ctx: DatasetContext::new(NAME, config, reader, messenger),
            slots,
            side: ReadSide::default(),
            pairs: ChannelPairs::new(channel_num),
            id_input: make_channel(),
            id_pairs: ChannelPairs::new(channel_num),
            pv_input: make_channel(),
            pv_pairs: ChannelPairs::new(channel_num),
            arena: Arc::new(RecordArena::default()),
        }
    }

    pub fn read_side(&self) -> ReadSide {
        self.side
    }

    pub fn input_channel(&self) -> &Arc<Channel<Record>> {
        &self.ctx.input
    }

    pub fn channel_pairs(&self) -> &ChannelPairs<Record> {
        &self.pairs
    }

    pub fn id_input_channel(&self) -> &Arc<Channel<RecordId>> {
        &self.id_input
    }

    pub fn pv_input_channel(&self) -> &Arc<Channel<PvInstance>> {
        &self.pv_input
    }

    pub fn arena(&self) -> &Arc<RecordArena> {
        &self.arena
    }

    // Points every reader at channel `i % channel_num` on the current side.
    fn bind_readers(&mut self) {
        let channel_num = self.pairs.len();
        if channel_num == 0 {
            return;
        }
        for (i, reader) in self.ctx.readers.iter_mut().enumerate() {
            let idx = i % channel_num;
            let (read, refill) = self.pairs.for_reader(idx, self.side);
            reader.bind_records(FeedChannels::new(Arc::clone(&self.ctx.input), read, refill));

            let (read, refill) = self.id_pairs.for_reader(idx, self.side);
            reader.bind_ids(
                FeedChannels::new(Arc::clone(&self.id_input), read, refill),
                Arc::clone(&self.arena),
            );

            let (read, refill) = self.pv_pairs.for_reader(idx, self.side);
            reader.bind_pv(
                FeedChannels::new(Arc::clone(&self.pv_input), read, refill),
                Arc::clone(&self.arena),
            );
        }
    }

    fn single_rank_shuffle(&mut self) -> ShuffleStats {
        let shuffled = shuffle::local_shuffle(&self.ctx.input, &mut self.ctx.rng);
        let mut records = Vec::new();
        self.ctx.input.read_all(&mut records);

        let targets = self.pairs.read_set(self.side).to_vec();
        targets.iter().for_each(|c| c.open());
        let sink = ShuffleSink::round_robin(targets);
        sink.write(records);
        sink.close();
        ShuffleStats {
            drained: shuffled,
            kept: shuffled,
            ..ShuffleStats::default()
        }
    }
}

impl DatasetBase for MultiSlotDataset {
    fn name(&self) -> &'static str {
        NAME
    }

    fn kind(&self) -> DatasetKind {
        DatasetKind::MultiSlot
    }

    fn phase(&self) -> PipelinePhase {
        self.ctx.phase()
    }

    fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    fn set_filelist(&mut self, files: Vec<PathBuf>) {
        self.ctx.set_filelist(files, false);
    }

    fn create_channel(&mut self) -> Result<()> {
        self.ctx.wait_release_done();
        if self.pairs.is_empty() {
            let channel_num = self.ctx.channel_num();
            self.pairs = ChannelPairs::new(channel_num);
            self.id_pairs = ChannelPairs::new(channel_num);
            self.pv_pairs = ChannelPairs::new(channel_num);
            tracing::debug!(dataset = NAME, channel_num, "channels created");
        }
        Ok(())
    }

    fn create_readers(&mut self) -> Result<()> {
        self.ctx.check_readers()?;
        if !self.ctx.readers.is_empty() {
            tracing::debug!(dataset = NAME, readers = self.ctx.readers.len(), "readers exist, not recreating");
            return Ok(());
        }
        if self.pairs.len() != self.ctx.channel_num() {
            return Err(PipelineError::dataset(
                NAME,
                format!(
                    "{} channel pairs do not match channel_num {}",
                    self.pairs.len(),
                    self.ctx.channel_num()
                ),
            ));
        }

        self.pairs.open_all();
        self.id_pairs.open_all();
        self.pv_pairs.open_all();

        let thread_num = self.ctx.thread_num();
        let batch_size = self.ctx.config.dataset.batch_size;
        self.ctx.readers = (0..thread_num)
            .map(|i| ThreadReader::new(i, thread_num, batch_size))
            .collect();
        self.bind_readers();
        self.ctx.enter(PipelinePhase::Sharded);
        tracing::debug!(dataset = NAME, thread_num, side = ?self.side, "readers created");
        Ok(())
    }

    fn destroy_readers(&mut self) {
        self.ctx.readers.clear();
        self.ctx.files.reset();
        self.side = self.side.flip();
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
            tracing::debug!(dataset = NAME, thread_num, "reader count unchanged");
            return Ok(());
        }
        self.ctx.check_reader_counts(thread_num, self.ctx.channel_num())?;
        tracing::info!(dataset = NAME, from = self.ctx.thread_num(), to = thread_num, "adjusting reader count");
        self.ctx.config.dataset.thread_num = thread_num;
        self.ctx.readers.clear();
        self.create_readers()
    }

    fn dynamic_adjust_channel_num(
        &mut self,
        channel_num: usize,
        discard_remainder: bool,
    ) -> Result<ReshardStats> {
        if channel_num == self.pairs.len() {
            tracing::debug!(dataset = NAME, channel_num, "channel count unchanged");
            return Ok(ReshardStats {
                total: self.pairs.total_size(),
                dropped: 0,
                data_side: self.pairs.data_side()?,
            });
        }

        let from = self.pairs.len();
        let stats = self.pairs.reshard(channel_num, discard_remainder)?;
        self.id_pairs.reshard(channel_num, discard_remainder)?;
        self.pv_pairs.reshard(channel_num, discard_remainder)?;
        self.ctx.config.dataset.channel_num = channel_num;

        let extra = usize::from(!discard_remainder);
        let input_size = self.ctx.input.size();
        if input_size >= channel_num {
            self.ctx.input.set_block_size(input_size / channel_num + extra);
        }
        let id_size = self.id_input.size();
        if id_size >= channel_num {
            self.id_input.set_block_size(id_size / channel_num + extra);
        }
        let pv_size = self.pv_input.size();
        if pv_size >= channel_num {
            self.pv_input.set_block_size(pv_size / channel_num + extra);
        }

        if channel_num > self.ctx.thread_num() {
            tracing::warn!(dataset = NAME, channel_num, thread_num = self.ctx.thread_num(), "more channels than reader threads");
        }
        self.bind_readers();
        tracing::info!(
            dataset = NAME,
            from,
            to = channel_num,
            total = stats.total,
            dropped = stats.dropped,
            "channels resharded"
        );
        Ok(stats)
    }

    fn memory_data_size(&self) -> usize {
        self.ctx.input.size()
    }

    fn shuffle_data_size(&self) -> usize {
        self.pairs.total_size()
    }

    fn pv_data_size(&self) -> usize {
        self.pv_input.size() + self.pv_pairs.total_size()
    }

    fn feature_count(&self) -> u64 {
        self.ctx.features.get()
    }

    fn release_memory(&mut self) {
        let payload = (
            std::mem::replace(&mut self.ctx.input, make_channel()),
            std::mem::replace(&mut self.pairs, ChannelPairs::new(0)),
            std::mem::replace(&mut self.id_input, make_channel()),
            std::mem::replace(&mut self.id_pairs, ChannelPairs::new(0)),
            std::mem::replace(&mut self.pv_input, make_channel()),
            std::mem::replace(&mut self.pv_pairs, ChannelPairs::new(0)),
            std::mem::take(&mut self.arena),
            std::mem::take(&mut self.ctx.readers),
        );
        self.ctx.release_in_background(Box::new(payload));
    }

    fn wait_release_done(&mut self) {
        self.ctx.wait_release_done();
    }
}

impl Load for MultiSlotDataset {
    fn load_into_memory(&mut self) -> Result<usize> {
        self.ctx.load()
    }

    fn preload_into_memory(&mut self) -> Result<()> {
        self.ctx.start_preload()
    }

    fn wait_preload_done(&mut self) -> Result<usize> {
        self.ctx.wait_preload()
    }
}

impl Shuffle for MultiSlotDataset {
    fn local_shuffle(&mut self) -> Result<usize> {
        let started = Instant::now();
        self.ctx.enter(PipelinePhase::LocalShuffle);
        let shuffled = shuffle::local_shuffle(&self.ctx.input, &mut self.ctx.rng);
        self.ctx
            .input
            .set_block_size(consumer_block_size(shuffled, self.ctx.thread_num()));
        tracing::info!(
            dataset = NAME,
            shuffled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "local shuffle finished"
        );
        Ok(shuffled)
    }

    /// Shuffles the input locally, then repartitions it across ranks into
    /// the producing output channels, filled round-robin.
    ///
    /// Every rank must call this together, even with an empty input.
    fn global_shuffle(&mut self) -> Result<ShuffleStats> {
        let started = Instant::now();
        self.ctx.enter(PipelinePhase::DistributedShuffle);

        let Some(messenger) = self.ctx.messenger.clone().filter(|m| m.rank_count() > 1) else {
            let stats = self.single_rank_shuffle();
            tracing::info!(dataset = NAME, records = stats.kept, "single-rank global shuffle finished");
            return Ok(stats);
        };

        shuffle::local_shuffle(&self.ctx.input, &mut self.ctx.rng);
        let options = ShuffleOptions::from_config(&self.ctx.config);
        let workers = self.ctx.config.shuffle.thread_num;
        let input = Arc::clone(&self.ctx.input);
        let targets = self.pairs.read_set(self.side).to_vec();
        targets.iter().for_each(|c| c.open());

        let pool = self.ctx.pools.shuffle(workers)?;
        let coordinator = Arc::new(DistributedShuffle::new(
            Arc::clone(&messenger),
            ShuffleSink::round_robin(targets),
            options,
        ));
        coordinator.register();
        let handles = coordinator.start(pool, input, workers);
        let joined = join_all(handles);
        coordinator.wait_closed();
        coordinator.unregister();
        messenger.barrier();
        joined?;

        self.ctx.input.clear();
        let stats = coordinator.stats();
        tracing::info!(
            dataset = NAME,
            rank = messenger.rank(),
            drained = stats.drained,
            kept = stats.kept,
            sent = stats.sent,
            received = stats.received,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "global shuffle finished"
        );
        Ok(stats)
    }
}

impl Merge for MultiSlotDataset {
    /// Drains the input and the channel half holding data, merges records
    /// by instance id, shuffles the result and splits it evenly over the
    /// producing channels.
    fn merge_by_ins_id(&mut self) -> Result<MergeStats> {
        let started = Instant::now();
        self.ctx.enter(PipelinePhase::Merging);

        let mut records = Vec::new();
        self.ctx.input.close();
        self.ctx.input.read_all(&mut records);
        if let Some(side) = self.pairs.data_side()? {
            records.extend(self.pairs.drain_side(side));
        }
        self.pairs.open_all();

        let (mut merged, stats) = merge_by_instance_id(
            records,
            &self.slots,
            self.ctx.config.merge.merge_size,
        );
        merged.shuffle(&mut self.ctx.rng);

        let features: usize = merged.iter().map(Record::feature_count).sum();
        self.ctx.features.reset();
        self.ctx.features.add(features as u64);

        let targets = self.pairs.read_set(self.side);
        let block = merged.len().div_ceil(targets.len().max(1)).max(1);
        let mut rest = merged;
        for channel in targets {
            let tail = rest.split_off(block.min(rest.len()));
            channel.write(std::mem::replace(&mut rest, tail));
        }

        tracing::info!(
            dataset = NAME,
            input = stats.input_records,
            merged = stats.merged_records,
            size_mismatch_groups = stats.size_mismatch_groups,
            conflict_groups = stats.conflict_groups,
            dropped_records = stats.dropped_records,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merge by instance id finished"
        );
        Ok(stats)
    }
}

impl Preprocess for MultiSlotDataset {
    /// Moves the input into the record arena and queues record ids, or PV
    /// sessions when PV merge is enabled, for the readers.
    fn preprocess_instance(&mut self) -> Result<()> {
        if self.ctx.input.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let pv_merge = self.ctx.config.merge.enable_pv_merge;
        let thread_num = self.ctx.thread_num();

        if !pv_merge {
            shuffle::local_shuffle(&self.ctx.input, &mut self.ctx.rng);
        }
        let mut records = Vec::new();
        self.ctx.input.close();
        self.ctx.input.read_all(&mut records);
        let mut arena = RecordArena::new(records);

        if pv_merge {
            arena.sort_by_search_id();
            let mut instances = build_pv_instances(&arena, self.ctx.config.merge.merge_by_sid);
            instances.shuffle(&mut self.ctx.rng);
            let sessions = instances.len();
            self.pv_input.open();
            self.pv_input.write(instances);
            self.pv_input.close();
            self.pv_input
                .set_block_size(consumer_block_size(sessions, thread_num));
            tracing::info!(dataset = NAME, records = arena.len(), sessions, "records grouped into sessions");
        } else {
            self.id_input.open();
            self.id_input.write(arena.ids().collect());
            self.id_input.close();
            self.id_input
                .set_block_size(consumer_block_size(arena.len(), thread_num));
        }

        self.arena = Arc::new(arena);
        self.bind_readers();
        tracing::info!(
            dataset = NAME,
            records = self.arena.len(),
            pv_merge,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "preprocess finished"
        );
        Ok(())
    }

    /// Returns every handed-out id to the id input for the next pass.
    fn postprocess_instance(&mut self) -> Result<()> {
        self.id_input.open();
        if self.ctx.config.merge.enable_pv_merge {
            for side in [ReadSide::Output, ReadSide::Consume] {
                self.pv_pairs.drain_side(side);
            }
            self.pv_pairs.open_all();
            self.pv_input.clear();

            let mut ids: Vec<RecordId> = self.arena.ids().collect();
            ids.shuffle(&mut self.ctx.rng);
            self.id_input.write(ids);
        } else {
            for side in [ReadSide::Output, ReadSide::Consume] {
                let ids = self.id_pairs.drain_side(side);
                self.id_input.write(ids);
            }
            self.id_pairs.open_all();
        }
        self.id_input.close();
        self.id_input
            .set_block_size(consumer_block_size(self.id_input.size(), self.ctx.thread_num()));
        tracing::debug!(dataset = NAME, ids = self.id_input.size(), "postprocess finished");
        Ok(())
    }
}

impl std::fmt::Debug for MultiSlotDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSlotDataset")
            .field("phase", &self.ctx.phase())
            .field("side", &self.side)
            .field("input", &self.ctx.input.size())
            .field("pairs", &self.pairs)
            .field("arena", &self.arena.len())
            .finish()
    }
}
