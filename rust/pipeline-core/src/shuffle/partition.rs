// rust/pipeline-core/src/shuffle/partition.rs

//! Destination-rank selection for the distributed shuffle.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PartitionStrategy;
use crate::record::Record;

/// Maps a record to the rank that should own it after the shuffle.
pub trait Partitioner: Send + Sync {
    /// Destination rank for `record`, always `< rank_count`.
    fn destination(&self, record: &Record) -> usize;

    /// The strategy this partitioner implements.
    fn strategy(&self) -> PartitionStrategy;
}

/// `search_id % rank_count`: a session stays on one rank.
#[derive(Debug)]
pub struct SearchIdPartitioner {
    rank_count: usize,
}

impl SearchIdPartitioner {
    pub fn new(rank_count: usize) -> Self {
        Self {
            rank_count: rank_count.max(1),
        }
    }
}

impl Partitioner for SearchIdPartitioner {
    fn destination(&self, record: &Record) -> usize {
        (record.search_id % self.rank_count as u64) as usize
    }

    fn strategy(&self) -> PartitionStrategy {
        PartitionStrategy::SearchId
    }
}

/// `hash(instance_id) % rank_count`: duplicates of an instance meet on one rank.
#[derive(Debug)]
pub struct InstanceIdPartitioner {
    rank_count: usize,
}

impl InstanceIdPartitioner {
    pub fn new(rank_count: usize) -> Self {
        Self {
            rank_count: rank_count.max(1),
        }
    }
}

impl Partitioner for InstanceIdPartitioner {
    fn destination(&self, record: &Record) -> usize {
        (record.instance_hash() % self.rank_count as u64) as usize
    }

    fn strategy(&self) -> PartitionStrategy {
        PartitionStrategy::InstanceId
    }
}

/// Uniformly random destination.
#[derive(Debug)]
pub struct RandomPartitioner {
    rank_count: usize,
    rng: Mutex<StdRng>,
}

impl RandomPartitioner {
    /// A partitioner seeded from `seed`, or from OS entropy when `None`.
    pub fn new(rank_count: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::random::<u64>()),
        };
        Self {
            rank_count: rank_count.max(1),
            rng: Mutex::new(rng),
        }
    }
}

impl Partitioner for RandomPartitioner {
    fn destination(&self, _record: &Record) -> usize {
        self.rng.lock().random_range(0..self.rank_count)
    }

    fn strategy(&self) -> PartitionStrategy {
        PartitionStrategy::Random
    }
}

/// Creates a partitioner for a resolved strategy.
///
/// `Auto` must be resolved by the caller (see
/// [`PipelineConfig::partition_strategy`](crate::config::PipelineConfig::partition_strategy));
/// if it reaches here it falls back to random.
pub fn create_partitioner(
    strategy: PartitionStrategy,
    rank_count: usize,
    seed: Option<u64>,
) -> Box<dyn Partitioner> {
    match strategy {
        PartitionStrategy::SearchId => Box::new(SearchIdPartitioner::new(rank_count)),
        PartitionStrategy::InstanceId => Box::new(InstanceIdPartitioner::new(rank_count)),
        PartitionStrategy::Random | PartitionStrategy::Auto => {
            Box::new(RandomPartitioner::new(rank_count, seed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ins: &str, search_id: u64) -> Record {
        Record {
            search_id,
            ..Record::with_instance_id(ins)
        }
    }

    #[test]
    fn test_search_id_partitioner() {
        let p = SearchIdPartitioner::new(4);
        assert_eq!(p.destination(&record("a", 9)), 1);
        assert_eq!(p.destination(&record("b", 12)), 0);
        assert_eq!(p.strategy(), PartitionStrategy::SearchId);
    }

    #[test]
    fn test_instance_id_partitioner_is_consistent() {
        let p = InstanceIdPartitioner::new(3);
        let first = p.destination(&record("user-17", 1));
        let second = p.destination(&record("user-17", 99));
        assert_eq!(first, second);
        assert!(first < 3);
    }

    #[test]
    fn test_random_partitioner_in_range_and_seeded() {
        let a = RandomPartitioner::new(5, Some(7));
        let b = RandomPartitioner::new(5, Some(7));
        let r = record("x", 0);
        let picks_a: Vec<_> = (0..100).map(|_| a.destination(&r)).collect();
        let picks_b: Vec<_> = (0..100).map(|_| b.destination(&r)).collect();
        assert_eq!(picks_a, picks_b);
        assert!(picks_a.iter().all(|d| *d < 5));
    }

    #[test]
    fn test_create_partitioner() {
        assert_eq!(
            create_partitioner(PartitionStrategy::InstanceId, 2, None).strategy(),
            PartitionStrategy::InstanceId
        );
        assert_eq!(
            create_partitioner(PartitionStrategy::Auto, 2, None).strategy(),
            PartitionStrategy::Random
        );
    }
}
