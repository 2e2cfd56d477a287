// rust/pipeline-core/src/feed.rs

//! Per-thread reader bindings handed to downstream consumers.
//!
//! A [`ThreadReader`] is what one training thread drains. In channel mode it
//! owns one output/consume pair: batches are taken from the output side and
//! everything handed out is written to the consume side, so the next pass can
//! read it back from there. In offset mode (slot datasets) it walks a list of
//! `(start, len)` ranges over a shared record arena instead.

use std::sync::Arc;

use crate::channel::Channel;
use crate::record::{PvInstance, Record, RecordArena, RecordId};

/// The input/output/consume triple one reader works on.
pub struct FeedChannels<T> {
    input: Arc<Channel<T>>,
    output: Arc<Channel<T>>,
    consume: Arc<Channel<T>>,
}

impl<T> FeedChannels<T> {
    pub fn new(input: Arc<Channel<T>>, output: Arc<Channel<T>>, consume: Arc<Channel<T>>) -> Self {
        Self {
            input,
            output,
            consume,
        }
    }

    pub fn input(&self) -> &Arc<Channel<T>> {
        &self.input
    }

    pub fn output(&self) -> &Arc<Channel<T>> {
        &self.output
    }

    pub fn consume(&self) -> &Arc<Channel<T>> {
        &self.consume
    }

    /// Moves one input block into the output channel if the output is empty.
    ///
    /// The input channel's block size is set to `total / readers + 1`, so
    /// every reader starting in turn takes roughly an equal share.
    pub fn start(&self) -> usize {
        if !self.output.is_empty() || self.input.is_empty() {
            return 0;
        }
        let mut block = Vec::new();
        self.input.read_once(&mut block, self.input.block_size());
        self.output.write(block)
    }

    /// Takes up to `batch_size` buffered items without blocking.
    pub fn take_batch(&self, batch_size: usize) -> Vec<T> {
        let mut batch = Vec::with_capacity(batch_size);
        self.output.try_read(&mut batch, batch_size);
        batch
    }

    /// Returns a handed-out batch to the consume side.
    pub fn finish_batch(&self, batch: Vec<T>) {
        self.consume.write(batch);
    }
}

impl<T> Clone for FeedChannels<T> {
    fn clone(&self) -> Self {
        Self {
            input: Arc::clone(&self.input),
            output: Arc::clone(&self.output),
            consume: Arc::clone(&self.consume),
        }
    }
}

/// The reader one training thread drains during a pass.
pub struct ThreadReader {
    thread_id: usize,
    thread_num: usize,
    batch_size: usize,
    records: Option<FeedChannels<Record>>,
    ids: Option<FeedChannels<RecordId>>,
    pv: Option<FeedChannels<PvInstance>>,
    arena: Option<Arc<RecordArena>>,
    pv_instances: Option<Arc<Vec<PvInstance>>>,
    batch_offsets: Vec<(usize, usize)>,
    cursor: usize,
}

impl ThreadReader {
    pub fn new(thread_id: usize, thread_num: usize, batch_size: usize) -> Self {
        Self {
            thread_id,
            thread_num,
            batch_size: batch_size.max(1),
            records: None,
            ids: None,
            pv: None,
            arena: None,
            pv_instances: None,
            batch_offsets: Vec::new(),
            cursor: 0,
        }
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn thread_num(&self) -> usize {
        self.thread_num
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn bind_records(&mut self, channels: FeedChannels<Record>) {
        self.records = Some(channels);
    }

    pub fn bind_ids(&mut self, channels: FeedChannels<RecordId>, arena: Arc<RecordArena>) {
        self.ids = Some(channels);
        self.arena = Some(arena);
    }

    pub fn bind_pv(&mut self, channels: FeedChannels<PvInstance>, arena: Arc<RecordArena>) {
        self.pv = Some(channels);
        self.arena = Some(arena);
    }

    /// Binds offset mode over `arena`, and over `pv_instances` when present.
    pub fn bind_arena(&mut self, arena: Arc<RecordArena>, pv_instances: Option<Arc<Vec<PvInstance>>>) {
        self.arena = Some(arena);
        self.pv_instances = pv_instances;
        self.cursor = 0;
    }

    pub fn record_channels(&self) -> Option<&FeedChannels<Record>> {
        self.records.as_ref()
    }

    pub fn id_channels(&self) -> Option<&FeedChannels<RecordId>> {
        self.ids.as_ref()
    }

    pub fn pv_channels(&self) -> Option<&FeedChannels<PvInstance>> {
        self.pv.as_ref()
    }

    /// Pulls this reader's first share of input into its output channels.
    pub fn start(&mut self) {
        let mut moved = 0;
        if let Some(c) = &self.records {
            moved += c.start();
        }
        if let Some(c) = &self.ids {
            moved += c.start();
        }
        if let Some(c) = &self.pv {
            moved += c.start();
        }
        self.cursor = 0;
        tracing::trace!(thread = self.thread_id, moved, "reader started");
    }

    /// Hands the next batch of records to `visit`, or returns `false` when drained.
    pub fn next_batch<F>(&mut self, visit: F) -> bool
    where
        F: FnOnce(&[Record]),
    {
        let Some(channels) = &self.records else {
            return false;
        };
        let batch = channels.take_batch(self.batch_size);
        if batch.is_empty() {
            return false;
        }
        visit(&batch);
        channels.finish_batch(batch);
        true
    }

    /// Like [`next_batch`](Self::next_batch), over record ids resolved through the arena.
    pub fn next_indexed_batch<F>(&mut self, visit: F) -> bool
    where
        F: FnOnce(&[&Record]),
    {
        let (Some(channels), Some(arena)) = (&self.ids, &self.arena) else {
            return false;
        };
        let batch = channels.take_batch(self.batch_size);
        if batch.is_empty() {
            return false;
        }
        let records: Vec<&Record> = batch.iter().filter_map(|id| arena.get(*id)).collect();
        visit(&records);
        channels.finish_batch(batch);
        true
    }

    /// Hands the next batch of PV instances to `visit`.
    pub fn next_pv_batch<F>(&mut self, visit: F) -> bool
    where
        F: FnOnce(&RecordArena, &[PvInstance]),
    {
        let (Some(channels), Some(arena)) = (&self.pv, &self.arena) else {
            return false;
        };
        let batch = channels.take_batch(self.batch_size);
        if batch.is_empty() {
            return false;
        }
        visit(arena, &batch);
        channels.finish_batch(batch);
        true
    }

    pub fn add_batch_offset(&mut self, start: usize, len: usize) {
        self.batch_offsets.push((start, len));
    }

    pub fn clear_batch_offsets(&mut self) {
        self.batch_offsets.clear();
        self.cursor = 0;
    }

    pub fn batch_offsets(&self) -> &[(usize, usize)] {
        &self.batch_offsets
    }

    /// The next offset batch over the bound arena.
    pub fn next_offset_batch(&mut self) -> Option<&[Record]> {
        let (start, len) = *self.batch_offsets.get(self.cursor)?;
        self.cursor += 1;
        let arena = self.arena.as_ref()?;
        Some(arena.slice(start, len))
    }

    /// The next offset batch over the bound PV instances.
    pub fn next_pv_offset_batch(&mut self) -> Option<(&RecordArena, &[PvInstance])> {
        let (start, len) = *self.batch_offsets.get(self.cursor)?;
        self.cursor += 1;
        let arena = self.arena.as_ref()?;
        let instances = self.pv_instances.as_ref()?;
        let end = start.saturating_add(len).min(instances.len());
        let start = start.min(end);
        Some((arena.as_ref(), &instances[start..end]))
    }
}

impl std::fmt::Debug for ThreadReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadReader")
            .field("thread_id", &self.thread_id)
            .field("thread_num", &self.thread_num)
            .field("batch_size", &self.batch_size)
            .field("batch_offsets", &self.batch_offsets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::make_channel;

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::with_instance_id(format!("ins-{i}"))).collect()
    }

    #[test]
    fn test_start_takes_one_input_block() {
        let input = make_channel();
        input.write(records(10));
        input.set_block_size(4);
        input.close();

        let channels = FeedChannels::new(Arc::clone(&input), make_channel(), make_channel());
        assert_eq!(channels.start(), 4);
        assert_eq!(input.size(), 6);

        // Output already holds data
        assert_eq!(channels.start(), 0);
    }

    #[test]
    fn test_next_batch_moves_to_consume() {
        let output = make_channel();
        let consume = make_channel();
        output.write(records(5));

        let mut reader = ThreadReader::new(0, 1, 2);
        reader.bind_records(FeedChannels::new(make_channel(), Arc::clone(&output), Arc::clone(&consume)));

        let mut sizes = Vec::new();
        while reader.next_batch(|batch| sizes.push(batch.len())) {}
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(output.size(), 0);
        assert_eq!(consume.size(), 5);
    }

    #[test]
    fn test_next_indexed_batch_resolves_ids() {
        let arena = Arc::new(RecordArena::new(records(3)));
        let output = make_channel();
        output.write(vec![RecordId(2), RecordId(0)]);

        let mut reader = ThreadReader::new(0, 1, 8);
        reader.bind_ids(FeedChannels::new(make_channel(), output, make_channel()), arena);

        let mut seen = Vec::new();
        assert!(reader.next_indexed_batch(|batch| {
            seen = batch.iter().map(|r| r.instance_id.clone()).collect();
        }));
        assert_eq!(seen, vec!["ins-2", "ins-0"]);
        assert!(!reader.next_indexed_batch(|_| {}));
    }

    #[test]
    fn test_offset_batches() {
        let arena = Arc::new(RecordArena::new(records(10)));
        let mut reader = ThreadReader::new(1, 2, 4);
        reader.bind_arena(arena, None);
        reader.add_batch_offset(0, 4);
        reader.add_batch_offset(8, 4);

        assert_eq!(reader.next_offset_batch().map(<[Record]>::len), Some(4));
        assert_eq!(reader.next_offset_batch().map(<[Record]>::len), Some(2));
        assert!(reader.next_offset_batch().is_none());

        reader.clear_batch_offsets();
        assert!(reader.next_offset_batch().is_none());
    }

    #[test]
    fn test_pv_offset_batches() {
        let arena = Arc::new(RecordArena::new(records(3)));
        let pv = Arc::new(vec![PvInstance::single(RecordId(0)), PvInstance::single(RecordId(1))]);
        let mut reader = ThreadReader::new(0, 1, 4);
        reader.bind_arena(arena, Some(pv));
        reader.add_batch_offset(1, 5);

        let (arena, batch) = reader.next_pv_offset_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].resolve(arena).next().unwrap().instance_id, "ins-1");
    }
}
