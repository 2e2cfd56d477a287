// rust/pipeline-core/src/channel/pairs.rs

//! Double-buffered output/consume channel sets.

use std::sync::Arc;

use super::{make_channel, Channel};
use crate::error::{PipelineError, Result};

/// Which half of a channel pair readers drain during the current pass.
///
/// Readers take items from the read side and hand consumed items to the
/// other side, so the next pass can start from the other half without
/// reallocating channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadSide {
    /// Readers drain `output` and refill `consume`.
    #[default]
    Output,
    /// Readers drain `consume` and refill `output`.
    Consume,
}

impl ReadSide {
    pub fn flip(self) -> Self {
        match self {
            Self::Output => Self::Consume,
            Self::Consume => Self::Output,
        }
    }
}

/// Outcome of a reshard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReshardStats {
    pub total: usize,
    pub dropped: usize,
    pub data_side: Option<ReadSide>,
}

/// N output channels paired with N consume channels.
pub struct ChannelPairs<T> {
    output: Vec<Arc<Channel<T>>>,
    consume: Vec<Arc<Channel<T>>>,
}

impl<T> ChannelPairs<T> {
    pub fn new(channel_num: usize) -> Self {
        Self {
            output: (0..channel_num).map(|_| make_channel()).collect(),
            consume: (0..channel_num).map(|_| make_channel()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    pub fn output(&self) -> &[Arc<Channel<T>>] {
        &self.output
    }

    pub fn consume(&self) -> &[Arc<Channel<T>>] {
        &self.consume
    }

    /// Channels readers drain when reading from `side`.
    pub fn read_set(&self, side: ReadSide) -> &[Arc<Channel<T>>] {
        match side {
            ReadSide::Output => &self.output,
            ReadSide::Consume => &self.consume,
        }
    }

    /// Channels readers refill when reading from `side`.
    pub fn refill_set(&self, side: ReadSide) -> &[Arc<Channel<T>>] {
        self.read_set(side.flip())
    }

    /// The (read, refill) channels for reader slot `index`.
    pub fn for_reader(&self, index: usize, side: ReadSide) -> (Arc<Channel<T>>, Arc<Channel<T>>) {
        let read = Arc::clone(&self.read_set(side)[index]);
        let refill = Arc::clone(&self.refill_set(side)[index]);
        (read, refill)
    }

    pub fn output_size(&self) -> usize {
        self.output.iter().map(|c| c.size()).sum()
    }

    pub fn consume_size(&self) -> usize {
        self.consume.iter().map(|c| c.size()).sum()
    }

    pub fn total_size(&self) -> usize {
        self.output_size() + self.consume_size()
    }

    /// The half that currently holds data, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if both halves hold data.
    pub fn data_side(&self) -> Result<Option<ReadSide>> {
        match (self.output_size(), self.consume_size()) {
            (0, 0) => Ok(None),
            (_, 0) => Ok(Some(ReadSide::Output)),
            (0, _) => Ok(Some(ReadSide::Consume)),
            (out, con) => Err(PipelineError::dataset(
                "channel_pairs",
                format!("both output ({out}) and consume ({con}) channels hold data"),
            )),
        }
    }

    /// Closes and drains every channel on `side` into one vector.
    pub fn drain_side(&self, side: ReadSide) -> Vec<T> {
        let mut all = Vec::new();
        let mut chunk = Vec::new();
        for channel in self.read_set(side) {
            channel.close();
            channel.read_all(&mut chunk);
            all.append(&mut chunk);
        }
        all
    }

    /// Reopens every channel on both halves.
    pub fn open_all(&self) {
        for channel in self.output.iter().chain(&self.consume) {
            channel.open();
        }
    }

    /// Closes every channel on both halves.
    pub fn close_all(&self) {
        for channel in self.output.iter().chain(&self.consume) {
            channel.close();
        }
    }

    pub fn clear(&self) {
        for channel in self.output.iter().chain(&self.consume) {
            channel.clear();
        }
    }

    /// Redistributes all buffered items into `channel_num` fresh pairs.
    ///
    /// Data stays on whichever half held it. Channel `i` receives
    /// `total / channel_num` items, plus one for the first
    /// `total % channel_num` channels unless `discard_remainder` is set, in
    /// which case those remainder items are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `channel_num` is zero or both halves hold data.
    pub fn reshard(&mut self, channel_num: usize, discard_remainder: bool) -> Result<ReshardStats> {
        if channel_num == 0 {
            return Err(PipelineError::dataset(
                "channel_pairs",
                "cannot reshard into zero channels",
            ));
        }
        let data_side = self.data_side()?;
        let origin = data_side.unwrap_or(ReadSide::Consume);

        let staging = make_channel();
        staging.write(self.drain_side(origin));
        staging.close();

        let total = staging.size();
        let base = total / channel_num;
        let remainder = total % channel_num;

        let mut refilled = Vec::with_capacity(channel_num);
        let mut chunk = Vec::new();
        for i in 0..channel_num {
            let share = if !discard_remainder && i < remainder {
                base + 1
            } else {
                base
            };
            let channel = make_channel();
            if share > 0 {
                staging.set_block_size(share);
                staging.read(&mut chunk);
                channel.write(std::mem::take(&mut chunk));
            }
            refilled.push(channel);
        }

        let dropped = staging.size();
        staging.clear();

        let empty = (0..channel_num).map(|_| make_channel()).collect();
        match origin {
            ReadSide::Output => {
                self.output = refilled;
                self.consume = empty;
            }
            ReadSide::Consume => {
                self.consume = refilled;
                self.output = empty;
            }
        }

        Ok(ReshardStats {
            total,
            dropped,
            data_side,
        })
    }
}

impl<T> std::fmt::Debug for ChannelPairs<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPairs")
            .field("channels", &self.len())
            .field("output_size", &self.output_size())
            .field("consume_size", &self.consume_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(channels: &[Arc<Channel<u32>>]) -> Vec<usize> {
        channels.iter().map(|c| c.size()).collect()
    }

    #[test]
    fn test_flip() {
        assert_eq!(ReadSide::Output.flip(), ReadSide::Consume);
        assert_eq!(ReadSide::Consume.flip(), ReadSide::Output);
    }

    #[test]
    fn test_reshard_ten_into_three() {
        let mut pairs = ChannelPairs::new(2);
        pairs.output()[0].write((0..6).collect());
        pairs.output()[1].write((6..10).collect());

        let stats = pairs.reshard(3, false).unwrap();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.dropped, 0);

        let mut got = sizes(pairs.output());
        got.sort_unstable();
        assert_eq!(got, vec![3, 3, 4]);
        assert_eq!(pairs.consume_size(), 0);
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn test_reshard_preserves_size_for_many_counts() {
        for total in [0usize, 1, 7, 64, 101] {
            for n in 1..=9 {
                let mut pairs = ChannelPairs::new(1);
                pairs.consume()[0].write((0..total as u32).collect());
                pairs.reshard(n, false).unwrap();
                assert_eq!(pairs.consume_size(), total);
                assert_eq!(pairs.output_size(), 0);
            }
        }
    }

    #[test]
    fn test_reshard_discard_drops_at_most_n_minus_one() {
        let mut pairs = ChannelPairs::new(1);
        pairs.output()[0].write((0..10).collect());

        let stats = pairs.reshard(4, true).unwrap();
        assert_eq!(stats.dropped, 2);
        assert_eq!(sizes(pairs.output()), vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_reshard_rejects_both_halves_holding_data() {
        let mut pairs = ChannelPairs::new(1);
        pairs.output()[0].write(vec![1]);
        pairs.consume()[0].write(vec![2]);
        assert!(pairs.reshard(2, false).is_err());
    }

    #[test]
    fn test_reshard_keeps_items() {
        let mut pairs = ChannelPairs::new(3);
        pairs.consume()[0].write(vec![5, 6]);
        pairs.consume()[2].write(vec![7]);
        pairs.reshard(2, false).unwrap();

        let mut items = pairs.drain_side(ReadSide::Consume);
        items.sort_unstable();
        assert_eq!(items, vec![5, 6, 7]);
    }

    #[test]
    fn test_for_reader_follows_side() {
        let pairs = ChannelPairs::<u32>::new(1);
        pairs.output()[0].write(vec![1]);

        let (read, refill) = pairs.for_reader(0, ReadSide::Output);
        assert_eq!(read.size(), 1);
        assert_eq!(refill.size(), 0);

        let (read, refill) = pairs.for_reader(0, ReadSide::Consume);
        assert_eq!(read.size(), 0);
        assert_eq!(refill.size(), 1);
    }
}
