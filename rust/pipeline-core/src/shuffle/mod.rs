// rust/pipeline-core/src/shuffle/mod.rs

//! Local and distributed record shuffling.
//!
//! [`local_shuffle`] is the stop-the-world in-memory permutation of one
//! channel. [`DistributedShuffle`] repartitions records across ranks through
//! an [`InterRankMessenger`](crate::messenger::InterRankMessenger) and uses
//! [`ShuffleTermination`] to decide when the receiving sink can be closed.

mod coordinator;
mod partition;
mod termination;

pub use coordinator::{DistributedShuffle, ShuffleOptions, ShuffleStats};
pub use partition::{
    create_partitioner, InstanceIdPartitioner, Partitioner, RandomPartitioner, SearchIdPartitioner,
};
pub use termination::{ShuffleSink, ShuffleTermination};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::channel::Channel;

/// Drains `channel`, permutes its items uniformly and writes them back.
///
/// The channel must be closed; it is reopened for the rewrite and closed
/// again afterwards. Returns the number of items shuffled.
pub fn local_shuffle<T, R>(channel: &Channel<T>, rng: &mut R) -> usize
where
    R: Rng + ?Sized,
{
    let mut items = Vec::new();
    channel.close();
    channel.read_all(&mut items);
    if items.is_empty() {
        return 0;
    }
    items.shuffle(rng);
    let total = items.len();
    channel.open();
    channel.write(items);
    channel.close();
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::make_channel;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_local_shuffle_permutes() {
        let channel = make_channel();
        channel.write((0..100u32).collect());
        channel.close();

        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(local_shuffle(&channel, &mut rng), 100);
        assert!(channel.is_closed());

        let mut items = Vec::new();
        channel.read_all(&mut items);
        assert_ne!(items, (0..100).collect::<Vec<_>>());
        items.sort_unstable();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_local_shuffle_empty_is_noop() {
        let channel = make_channel::<u32>();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(local_shuffle(&channel, &mut rng), 0);
    }
}
