// rust/pipeline-core/src/messenger/mod.rs

//! Rank-to-rank message delivery.
//!
//! The shuffle coordinator talks to other ranks only through
//! [`InterRankMessenger`]: fire-and-forget sends with a completion callback,
//! plus a handler registered for incoming payloads. Implementations must
//! deliver every payload, keep order per sender/receiver pair, and fire each
//! completion exactly once. An empty payload is the "done" control message.
//!
//! [`LocalCluster`] provides an in-process implementation for running several
//! ranks inside one process.

mod local;

pub use local::{LocalCluster, LocalMessenger};

use std::sync::Arc;

use crate::channel::WaitGroup;

/// Callback fired once a send has been delivered and handled.
pub type SendCompletion = Box<dyn FnOnce() + Send + 'static>;

/// Receives payloads addressed to this rank.
pub trait MessageHandler: Send + Sync {
    fn on_receive(&self, from_rank: usize, payload: &[u8]);
}

pub trait InterRankMessenger: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of cooperating ranks.
    fn rank_count(&self) -> usize;

    /// Routes incoming payloads to `handler` until unregistered.
    fn register_handler(&self, handler: Arc<dyn MessageHandler>);

    fn unregister_handler(&self);

    /// Sends `payload` to `dest_rank`; `on_complete` fires once it has been handled.
    fn send(&self, dest_rank: usize, payload: Vec<u8>, on_complete: SendCompletion);

    /// Sends the empty "done" message to every other rank.
    ///
    /// Adds one to `wait_group` per rank and marks the local slot done
    /// immediately, so waiting on the group waits for every peer.
    fn broadcast_done(&self, wait_group: &Arc<WaitGroup>) {
        let rank = self.rank();
        let rank_count = self.rank_count();
        wait_group.add(rank_count as i64);
        for dest in 0..rank_count {
            if dest == rank {
                wait_group.done();
                continue;
            }
            self.send(dest, Vec::new(), wait_group.completion());
        }
    }

    /// Blocks until every send issued so far has completed.
    fn wait_message_done(&self) {}

    /// Maximum of `value` across ranks. Every rank must call it.
    fn all_reduce_max(&self, value: u64) -> u64 {
        value
    }

    /// Sum of `value` across ranks. Every rank must call it.
    fn all_reduce_sum(&self, value: u64) -> u64 {
        value
    }

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) {
        self.all_reduce_sum(0);
    }
}
