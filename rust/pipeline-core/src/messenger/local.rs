// rust/pipeline-core/src/messenger/local.rs

use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::{InterRankMessenger, MessageHandler, SendCompletion};
use crate::channel::WaitGroup;
use crate::error::{PipelineError, Result};

struct Envelope {
    from: usize,
    payload: Vec<u8>,
    on_complete: SendCompletion,
}

#[derive(Default)]
struct HandlerSlot {
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    registered: Condvar,
}

impl HandlerSlot {
    // Messages that arrive before a handler is registered wait for one.
    fn wait_handler(&self) -> Arc<dyn MessageHandler> {
        let mut handler = self.handler.lock();
        loop {
            if let Some(h) = handler.as_ref() {
                return Arc::clone(h);
            }
            self.registered.wait(&mut handler);
        }
    }
}

struct ReduceBoard {
    values: Mutex<Vec<u64>>,
    barrier: Barrier,
}

impl ReduceBoard {
    fn reduce(&self, rank: usize, value: u64, op: fn(u64, u64) -> u64) -> u64 {
        self.values.lock()[rank] = value;
        self.barrier.wait();
        let result = self.values.lock().iter().copied().reduce(op).unwrap_or(value);
        self.barrier.wait();
        result
    }
}

/// Builds a set of in-process ranks connected to each other.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates `rank_count` connected messengers, indexed by rank.
    ///
    /// Each rank gets one delivery thread that hands payloads to the rank's
    /// handler in arrival order, so order per sender/receiver pair is kept.
    /// Delivery threads exit once every messenger has been dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `rank_count` is zero or a thread cannot be spawned.
    pub fn new(rank_count: usize) -> Result<Vec<Arc<LocalMessenger>>> {
        if rank_count == 0 {
            return Err(PipelineError::config("a local cluster needs at least one rank"));
        }

        let board = Arc::new(ReduceBoard {
            values: Mutex::new(vec![0; rank_count]),
            barrier: Barrier::new(rank_count),
        });

        let mut inboxes: Vec<Sender<Envelope>> = Vec::with_capacity(rank_count);
        let mut slots = Vec::with_capacity(rank_count);
        for rank in 0..rank_count {
            let (sender, receiver) = unbounded();
            let slot = Arc::new(HandlerSlot::default());
            spawn_delivery(rank, receiver, Arc::clone(&slot))?;
            inboxes.push(sender);
            slots.push(slot);
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                Arc::new(LocalMessenger {
                    rank,
                    rank_count,
                    peers: inboxes.clone(),
                    slot,
                    outstanding: Arc::new(WaitGroup::new()),
                    board: Arc::clone(&board),
                })
            })
            .collect())
    }
}

fn spawn_delivery(rank: usize, inbox: Receiver<Envelope>, slot: Arc<HandlerSlot>) -> Result<()> {
    thread::Builder::new()
        .name(format!("rank-{rank}-inbox"))
        .spawn(move || {
            for envelope in inbox.iter() {
                let handler = slot.wait_handler();
                handler.on_receive(envelope.from, &envelope.payload);
                (envelope.on_complete)();
            }
        })
        .map_err(|e| PipelineError::worker("messenger", format!("failed to spawn delivery thread: {e}")))?;
    Ok(())
}

/// One rank of a [`LocalCluster`].
pub struct LocalMessenger {
    rank: usize,
    rank_count: usize,
    peers: Vec<Sender<Envelope>>,
    slot: Arc<HandlerSlot>,
    outstanding: Arc<WaitGroup>,
    board: Arc<ReduceBoard>,
}

impl InterRankMessenger for LocalMessenger {
    fn rank(&self) -> usize {
        self.rank
    }

    fn rank_count(&self) -> usize {
        self.rank_count
    }

    fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.slot.handler.lock() = Some(handler);
        self.slot.registered.notify_all();
    }

    fn unregister_handler(&self) {
        self.slot.handler.lock().take();
    }

    fn send(&self, dest_rank: usize, payload: Vec<u8>, on_complete: SendCompletion) {
        let Some(inbox) = self.peers.get(dest_rank) else {
            tracing::error!(rank = self.rank, dest_rank, "send to unknown rank dropped");
            on_complete();
            return;
        };

        self.outstanding.add(1);
        let outstanding = Arc::clone(&self.outstanding);
        let envelope = Envelope {
            from: self.rank,
            payload,
            on_complete: Box::new(move || {
                on_complete();
                outstanding.done();
            }),
        };
        if let Err(undelivered) = inbox.send(envelope) {
            tracing::error!(rank = self.rank, dest_rank, "destination inbox closed");
            (undelivered.into_inner().on_complete)();
        }
    }

    fn wait_message_done(&self) {
        self.outstanding.wait();
    }

    fn all_reduce_max(&self, value: u64) -> u64 {
        self.board.reduce(self.rank, value, u64::max)
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        self.board.reduce(self.rank, value, u64::saturating_add)
    }
}

impl std::fmt::Debug for LocalMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMessenger")
            .field("rank", &self.rank)
            .field("rank_count", &self.rank_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    impl MessageHandler for Recorder {
        fn on_receive(&self, from_rank: usize, payload: &[u8]) {
            self.seen.lock().push((from_rank, payload.to_vec()));
        }
    }

    #[test]
    fn test_zero_ranks_rejected() {
        assert!(LocalCluster::new(0).is_err());
    }

    #[test]
    fn test_send_preserves_order_per_pair() {
        let ranks = LocalCluster::new(2).unwrap();
        let recorder = Arc::new(Recorder::default());
        ranks[1].register_handler(recorder.clone());

        let group = Arc::new(WaitGroup::new());
        for i in 0..50u8 {
            group.add(1);
            ranks[0].send(1, vec![i], group.completion());
        }
        group.wait();
        ranks[0].wait_message_done();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 50);
        assert!(seen.iter().all(|(from, _)| *from == 0));
        let order: Vec<u8> = seen.iter().map(|(_, p)| p[0]).collect();
        assert_eq!(order, (0..50).collect::<Vec<u8>>());
    }

    #[test]
    fn test_delivery_waits_for_registration() {
        let ranks = LocalCluster::new(2).unwrap();
        let group = Arc::new(WaitGroup::new());
        group.add(1);
        ranks[1].send(0, vec![7], group.completion());

        let recorder = Arc::new(Recorder::default());
        ranks[0].register_handler(recorder.clone());
        group.wait();
        assert_eq!(recorder.seen.lock().as_slice(), &[(1, vec![7])]);
    }

    #[test]
    fn test_broadcast_done_reaches_every_peer() {
        let ranks = LocalCluster::new(3).unwrap();
        let recorders: Vec<_> = ranks
            .iter()
            .map(|r| {
                let recorder = Arc::new(Recorder::default());
                r.register_handler(recorder.clone());
                recorder
            })
            .collect();

        let group = Arc::new(WaitGroup::new());
        ranks[2].broadcast_done(&group);
        group.wait();

        assert_eq!(recorders[0].seen.lock().as_slice(), &[(2, Vec::new())]);
        assert_eq!(recorders[1].seen.lock().as_slice(), &[(2, Vec::new())]);
        assert!(recorders[2].seen.lock().is_empty());
    }

    #[test]
    fn test_all_reduce() {
        let ranks = LocalCluster::new(3).unwrap();
        let handles: Vec<_> = ranks
            .iter()
            .map(|r| {
                let r = Arc::clone(r);
                thread::spawn(move || {
                    let value = (r.rank() as u64 + 1) * 10;
                    (r.all_reduce_max(value), r.all_reduce_sum(value))
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), (30, 60));
        }
    }
}
