// rust/pipeline-core/src/shuffle/termination.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::record::Record;

/// Where shuffled records land on the receiving rank.
#[derive(Debug)]
pub enum ShuffleSink {
    /// A single shuffle channel drained by merge workers.
    Channel(Arc<Channel<Record>>),
    /// Reader output channels, filled record by record in rotation.
    RoundRobin {
        channels: Vec<Arc<Channel<Record>>>,
        next: AtomicUsize,
    },
}

impl ShuffleSink {
    pub fn channel(channel: Arc<Channel<Record>>) -> Self {
        Self::Channel(channel)
    }

    pub fn round_robin(channels: Vec<Arc<Channel<Record>>>) -> Self {
        Self::RoundRobin {
            channels,
            next: AtomicUsize::new(0),
        }
    }

    pub fn write(&self, records: Vec<Record>) -> usize {
        match self {
            Self::Channel(channel) => channel.write(records),
            Self::RoundRobin { channels, next } => {
                if channels.is_empty() || records.is_empty() {
                    return 0;
                }
                let start = next.fetch_add(records.len(), Ordering::Relaxed);
                let mut shares: Vec<Vec<Record>> = (0..channels.len()).map(|_| Vec::new()).collect();
                for (i, record) in records.into_iter().enumerate() {
                    shares[(start + i) % channels.len()].push(record);
                }
                channels
                    .iter()
                    .zip(shares)
                    .map(|(channel, share)| channel.write(share))
                    .sum()
            }
        }
    }

    pub fn close(&self) {
        match self {
            Self::Channel(channel) => channel.close(),
            Self::RoundRobin { channels, .. } => channels.iter().for_each(|c| c.close()),
        }
    }
}

#[derive(Debug)]
struct TerminationState {
    finished_counter: usize,
    still_sending: Vec<bool>,
    receiving: usize,
    closed: bool,
}

/// Decides when no more shuffled records can arrive on this rank.
///
/// Every rank starts as still sending. A rank is finished once its "done"
/// message has been processed (or, for the local rank, once every local
/// worker has drained its input and flushed its sends). The sink is closed
/// when every rank is finished and no received payload is still being
/// decoded. Both counters live under one lock, and whichever update brings
/// them both to zero closes the sink.
#[derive(Debug)]
pub struct ShuffleTermination {
    state: Mutex<TerminationState>,
    closed: Condvar,
    sink: ShuffleSink,
}

impl ShuffleTermination {
    pub fn new(rank_count: usize, sink: ShuffleSink) -> Self {
        Self {
            state: Mutex::new(TerminationState {
                finished_counter: rank_count,
                still_sending: vec![true; rank_count],
                receiving: 0,
                closed: false,
            }),
            closed: Condvar::new(),
            sink,
        }
    }

    pub fn sink(&self) -> &ShuffleSink {
        &self.sink
    }

    /// Registers a payload about to be decoded. Returns `false` if the sink
    /// is already closed, in which case the payload must be dropped.
    pub fn begin_receive(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.receiving += 1;
        true
    }

    pub fn end_receive(&self) {
        let mut state = self.state.lock();
        state.receiving = state.receiving.saturating_sub(1);
        self.close_if_drained(&mut state);
    }

    /// Marks `rank` as done sending. Repeated calls for one rank are ignored.
    pub fn peer_finished(&self, rank: usize) {
        let mut state = self.state.lock();
        match state.still_sending.get_mut(rank) {
            Some(sending) if *sending => {
                *sending = false;
                state.finished_counter -= 1;
                tracing::debug!(
                    peer = rank,
                    remaining = state.finished_counter,
                    "shuffle peer finished"
                );
            }
            Some(_) => tracing::warn!(peer = rank, "duplicate shuffle done message ignored"),
            None => tracing::error!(peer = rank, "shuffle done message from unknown rank"),
        }
        self.close_if_drained(&mut state);
    }

    fn close_if_drained(&self, state: &mut TerminationState) {
        if state.closed || state.finished_counter > 0 || state.receiving > 0 {
            return;
        }
        state.closed = true;
        self.sink.close();
        self.closed.notify_all();
        tracing::debug!("shuffle sink closed");
    }

    /// Blocks until the sink has been closed.
    pub fn wait_closed(&self) {
        let mut state = self.state.lock();
        while !state.closed {
            self.closed.wait(&mut state);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Ranks still sending.
    pub fn finished_counter(&self) -> usize {
        self.state.lock().finished_counter
    }
}
