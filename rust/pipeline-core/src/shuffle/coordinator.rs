// rust/pipeline-core/src/shuffle/coordinator.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::partition::{create_partitioner, Partitioner};
use super::termination::{ShuffleSink, ShuffleTermination};
use crate::channel::{Channel, WaitGroup};
use crate::config::{PartitionStrategy, PipelineConfig};
use crate::error::Result;
use crate::messenger::{InterRankMessenger, MessageHandler};
use crate::pool::{TaskHandle, WorkerPool};
use crate::record::{decode_records, encode_record, Record};

/// Tunables for one distributed shuffle round.
#[derive(Debug, Clone)]
pub struct ShuffleOptions {
    pub strategy: PartitionStrategy,
    pub send_batch_size: usize,
    pub send_sleep: Duration,
    pub seed: Option<u64>,
}

impl ShuffleOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            strategy: config.partition_strategy(),
            send_batch_size: config.shuffle.send_batch_size.max(1),
            send_sleep: Duration::from_millis(config.shuffle.send_sleep_ms),
            seed: config.shuffle.seed,
        }
    }
}

impl Default for ShuffleOptions {
    fn default() -> Self {
        Self {
            strategy: PartitionStrategy::Random,
            send_batch_size: 1024,
            send_sleep: Duration::ZERO,
            seed: None,
        }
    }
}

/// Record counts for one shuffle round on one rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShuffleStats {
    /// Records drained from the local input.
    pub drained: usize,
    /// Drained records that stayed on this rank.
    pub kept: usize,
    /// Drained records sent to other ranks.
    pub sent: usize,
    /// Records received from other ranks.
    pub received: usize,
}

#[derive(Debug, Default)]
struct Counters {
    drained: AtomicUsize,
    kept: AtomicUsize,
    sent: AtomicUsize,
    received: AtomicUsize,
}

/// Repartitions records across ranks for one pass.
///
/// Shuffle workers drain the local input, keep records partitioned to this
/// rank and send the rest to their owners. Records arriving from peers go to
/// the same sink. The sink is closed by the [`ShuffleTermination`] tracker
/// once every rank has finished and nothing is left mid-decode.
///
/// A coordinator is single-use: build one per pass, [`register`] it before
/// starting workers, and [`unregister`] it after [`wait_closed`] returns.
///
/// [`register`]: Self::register
/// [`unregister`]: Self::unregister
/// [`wait_closed`]: Self::wait_closed
pub struct DistributedShuffle {
    messenger: Arc<dyn InterRankMessenger>,
    partitioner: Box<dyn Partitioner>,
    termination: ShuffleTermination,
    options: ShuffleOptions,
    active_workers: AtomicUsize,
    counters: Counters,
}

impl DistributedShuffle {
    pub fn new(messenger: Arc<dyn InterRankMessenger>, sink: ShuffleSink, options: ShuffleOptions) -> Self {
        let rank_count = messenger.rank_count();
        let seed = options
            .seed
            .map(|seed| seed.wrapping_add(messenger.rank() as u64));
        Self {
            partitioner: create_partitioner(options.strategy, rank_count, seed),
            termination: ShuffleTermination::new(rank_count, sink),
            messenger,
            options,
            active_workers: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn rank(&self) -> usize {
        self.messenger.rank()
    }

    /// Routes this rank's incoming payloads to the coordinator.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
        self.messenger.register_handler(handler);
    }

    pub fn unregister(&self) {
        self.messenger.unregister_handler();
    }

    /// Queues `workers` shuffle workers draining `input` on `pool`.
    ///
    /// Each handle yields the number of records that worker drained. The
    /// last worker to finish announces this rank's completion to its peers,
    /// even if another worker failed.
    pub fn start(
        self: &Arc<Self>,
        pool: &WorkerPool,
        input: Arc<Channel<Record>>,
        workers: usize,
    ) -> Vec<TaskHandle<Result<usize>>> {
        let workers = workers.max(1);
        self.active_workers.store(workers, Ordering::SeqCst);
        tracing::debug!(rank = self.rank(), workers, strategy = ?self.options.strategy, "starting shuffle workers");
        (0..workers)
            .map(|_| {
                let shuffle = Arc::clone(self);
                let input = Arc::clone(&input);
                pool.spawn(move || shuffle.run_worker(&input))
            })
            .collect()
    }

    /// Drains `input` until it is closed and empty, then retires this worker.
    pub fn run_worker(&self, input: &Channel<Record>) -> Result<usize> {
        let in_flight = Arc::new(WaitGroup::new());
        let result = self.drain(input, &in_flight);
        in_flight.wait();
        if self.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_local();
        }
        result
    }

    fn drain(&self, input: &Channel<Record>, in_flight: &Arc<WaitGroup>) -> Result<usize> {
        let rank = self.messenger.rank();
        let rank_count = self.messenger.rank_count();
        let mut outbound: Vec<Vec<u8>> = vec![Vec::new(); rank_count];
        let mut outbound_records = vec![0usize; rank_count];
        let mut batch = Vec::new();
        let mut drained = 0;

        while input.read_once(&mut batch, self.options.send_batch_size) {
            drained += batch.len();
            let mut local = Vec::new();
            for record in batch.drain(..) {
                let dest = self.partitioner.destination(&record);
                if dest == rank {
                    local.push(record);
                } else {
                    encode_record(&mut outbound[dest], &record)?;
                    outbound_records[dest] += 1;
                }
            }
            self.counters.kept.fetch_add(local.len(), Ordering::Relaxed);
            self.termination.sink().write(local);

            // Previous round's sends must be handled before issuing more.
            in_flight.wait();
            in_flight.add(rank_count as i64);
            for dest in 0..rank_count {
                if dest == rank || outbound[dest].is_empty() {
                    in_flight.done();
                    continue;
                }
                self.counters
                    .sent
                    .fetch_add(std::mem::take(&mut outbound_records[dest]), Ordering::Relaxed);
                let payload = std::mem::take(&mut outbound[dest]);
                self.messenger.send(dest, payload, in_flight.completion());
            }

            if !self.options.send_sleep.is_zero() {
                std::thread::sleep(self.options.send_sleep);
            }
        }

        self.counters.drained.fetch_add(drained, Ordering::Relaxed);
        Ok(drained)
    }

    fn finish_local(&self) {
        let rank = self.messenger.rank();
        let done = Arc::new(WaitGroup::new());
        self.messenger.broadcast_done(&done);
        done.wait();
        self.messenger.wait_message_done();
        tracing::info!(rank, "local shuffle input exhausted, peers notified");
        self.termination.peer_finished(rank);
    }

    /// Blocks until the sink has been closed on this rank.
    pub fn wait_closed(&self) {
        self.termination.wait_closed();
    }

    pub fn stats(&self) -> ShuffleStats {
        ShuffleStats {
            drained: self.counters.drained.load(Ordering::Relaxed),
            kept: self.counters.kept.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
        }
    }
}

impl MessageHandler for DistributedShuffle {
    fn on_receive(&self, from_rank: usize, payload: &[u8]) {
        if payload.is_empty() {
            self.termination.peer_finished(from_rank);
            return;
        }
        if !self.termination.begin_receive() {
            tracing::error!(from_rank, bytes = payload.len(), "payload arrived after shuffle sink closed, dropped");
            return;
        }
        match decode_records(payload) {
            Ok(records) => {
                self.counters.received.fetch_add(records.len(), Ordering::Relaxed);
                self.termination.sink().write(records);
            }
            Err(e) => tracing::error!(from_rank, error = %e, "failed to decode shuffle payload"),
        }
        self.termination.end_receive();
    }
}

impl std::fmt::Debug for DistributedShuffle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedShuffle")
            .field("rank", &self.messenger.rank())
            .field("rank_count", &self.messenger.rank_count())
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}
