// rust/pipeline-core/src/channel/mod.rs

//! Closable concurrent queues used between pipeline stages.
//!
//! A [`Channel`] buffers items between producers and consumers. Producers
//! `write` whole batches, consumers `read` up to the channel's block size at
//! a time, and `close` tells consumers that no more data is coming. Reads only
//! report exhaustion once the channel is closed *and* drained.
//!
//! # Example
//!
//! ```
//! use pipeline_core::channel::make_channel;
//!
//! let channel = make_channel::<u32>();
//! channel.set_block_size(2);
//! channel.write(vec![1, 2, 3]);
//! channel.close();
//!
//! let mut batch = Vec::new();
//! assert!(channel.read(&mut batch));
//! assert_eq!(batch, vec![1, 2]);
//! assert!(channel.read(&mut batch));
//! assert_eq!(batch, vec![3]);
//! assert!(!channel.read(&mut batch));
//! ```

mod pairs;
mod wait_group;

pub use pairs::{ChannelPairs, ReadSide, ReshardStats};
pub use wait_group::WaitGroup;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Block size a new channel hands out per `read`.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

struct ChannelState<T> {
    data: VecDeque<T>,
    closed: bool,
    block_size: usize,
    capacity: usize,
}

/// A closable FIFO queue shared between pipeline threads.
///
/// All mutation goes through the channel's own lock. Batches written by one
/// `write` call stay contiguous and in order.
pub struct Channel<T> {
    state: Mutex<ChannelState<T>>,
    readable: Condvar,
    writable: Condvar,
}

/// Creates an open, unbounded channel behind an `Arc`.
pub fn make_channel<T>() -> Arc<Channel<T>> {
    Arc::new(Channel::new())
}

impl<T> Channel<T> {
    /// Creates an open, unbounded channel.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Creates an open channel whose writers block while `capacity` items are buffered.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(capacity.max(1))
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                data: VecDeque::new(),
                closed: false,
                block_size: DEFAULT_BLOCK_SIZE,
                capacity,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Reopens the channel for writing.
    pub fn open(&self) {
        self.state.lock().closed = false;
    }

    /// Marks that no more producers will write. Buffered items stay readable.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of buffered items at the time of the call.
    pub fn size(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().block_size
    }

    /// Sets how many items a single `read` hands out. Zero is treated as one.
    pub fn set_block_size(&self, block_size: usize) {
        self.state.lock().block_size = block_size.max(1);
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Appends a batch and returns the number of items written.
    ///
    /// On a bounded channel this blocks until every item fits.
    ///
    /// # Panics
    ///
    /// Panics if the channel is closed. Writing after `close` is a pipeline bug.
    pub fn write(&self, items: Vec<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let total = items.len();
        let mut state = self.state.lock();
        assert!(!state.closed, "write on a closed channel");

        if total <= state.capacity.saturating_sub(state.data.len()) {
            state.data.extend(items);
            drop(state);
            self.readable.notify_all();
            return total;
        }

        let mut pending = items.into_iter();
        let mut written = 0;
        while written < total {
            while state.data.len() >= state.capacity {
                self.writable.wait(&mut state);
                assert!(!state.closed, "channel closed while a writer was blocked");
            }
            let room = state.capacity - state.data.len();
            let before = state.data.len();
            state.data.extend(pending.by_ref().take(room));
            written += state.data.len() - before;
            self.readable.notify_all();
        }
        total
    }

    /// Fills `out` with up to `block_size` items.
    ///
    /// Blocks until a full block is available or the channel is closed.
    /// Returns `false` only when the channel is closed and drained.
    pub fn read(&self, out: &mut Vec<T>) -> bool {
        out.clear();
        let mut state = self.state.lock();
        let want = state.block_size;
        loop {
            self.take_into(&mut state, out, want);
            if out.len() >= want || (state.closed && state.data.is_empty()) {
                break;
            }
            self.readable.wait(&mut state);
        }
        !out.is_empty()
    }

    /// Fills `out` with up to `max` items, returning as soon as any are available.
    ///
    /// Returns `false` only when the channel is closed and drained.
    pub fn read_once(&self, out: &mut Vec<T>, max: usize) -> bool {
        out.clear();
        let want = max.max(1);
        let mut state = self.state.lock();
        loop {
            self.take_into(&mut state, out, want);
            if !out.is_empty() || (state.closed && state.data.is_empty()) {
                break;
            }
            self.readable.wait(&mut state);
        }
        !out.is_empty()
    }

    /// Takes up to `max` buffered items without blocking.
    pub fn try_read(&self, out: &mut Vec<T>, max: usize) -> usize {
        out.clear();
        let mut state = self.state.lock();
        self.take_into(&mut state, out, max);
        out.len()
    }

    /// Drains every item until the channel is closed, returning the count.
    ///
    /// Blocks while the channel is open; callers close it first.
    pub fn read_all(&self, out: &mut Vec<T>) -> usize {
        out.clear();
        let mut state = self.state.lock();
        loop {
            if !state.data.is_empty() {
                out.extend(state.data.drain(..));
                self.writable.notify_all();
            }
            if state.closed {
                break;
            }
            self.readable.wait(&mut state);
        }
        out.len()
    }

    /// Discards buffered items and releases their storage.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.data.clear();
        state.data.shrink_to_fit();
        drop(state);
        self.writable.notify_all();
    }

    fn take_into(&self, state: &mut ChannelState<T>, out: &mut Vec<T>, want: usize) {
        let take = want.saturating_sub(out.len()).min(state.data.len());
        if take > 0 {
            out.extend(state.data.drain(..take));
            self.writable.notify_all();
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("size", &state.data.len())
            .field("closed", &state.closed)
            .field("block_size", &state.block_size)
            .finish()
    }
}

/// Block size that lets `consumers` reads drain `total` items:
/// `ceil(total / consumers)`, never below one.
pub fn consumer_block_size(total: usize, consumers: usize) -> usize {
    total.div_ceil(consumers.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_respects_block_size() {
        let channel = Channel::new();
        channel.set_block_size(3);
        channel.write((0..7).collect());
        channel.close();

        let mut out = Vec::new();
        let mut sizes = Vec::new();
        while channel.read(&mut out) {
            sizes.push(out.len());
        }
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_read_false_only_after_close_and_drain() {
        let channel = make_channel::<u32>();
        channel.set_block_size(10);

        let reader = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let mut out = Vec::new();
                let mut total = 0;
                while channel.read(&mut out) {
                    total += out.len();
                }
                total
            })
        };

        channel.write(vec![1, 2, 3]);
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        channel.write(vec![4, 5]);
        channel.close();
        assert_eq!(reader.join().unwrap(), 5);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let channel = make_channel::<usize>();
        channel.set_block_size(16);

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for chunk in 0..50 {
                        let base = p * 10_000 + chunk * 10;
                        channel.write((base..base + 10).collect());
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    let mut out = Vec::new();
                    let mut seen = Vec::new();
                    while channel.read(&mut out) {
                        seen.extend_from_slice(&out);
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        channel.close();

        let mut all: Vec<usize> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4 * 50 * 10);
    }

    #[test]
    fn test_read_all_drains_regardless_of_block_size() {
        let channel = Channel::new();
        channel.set_block_size(2);
        channel.write(vec!['a', 'b', 'c', 'd', 'e']);
        channel.close();

        let mut out = Vec::new();
        assert_eq!(channel.read_all(&mut out), 5);
        assert_eq!(out, vec!['a', 'b', 'c', 'd', 'e']);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_close_is_idempotent_and_keeps_data() {
        let channel = Channel::new();
        channel.write(vec![1, 2]);
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert_eq!(channel.size(), 2);

        channel.open();
        channel.write(vec![3]);
        assert_eq!(channel.size(), 3);
    }

    #[test]
    #[should_panic(expected = "write on a closed channel")]
    fn test_write_after_close_panics() {
        let channel = Channel::new();
        channel.close();
        channel.write(vec![1]);
    }

    #[test]
    fn test_read_once_returns_partial_block() {
        let channel = make_channel::<u8>();
        channel.write(vec![1, 2]);

        let mut out = Vec::new();
        assert!(channel.read_once(&mut out, 10));
        assert_eq!(out, vec![1, 2]);
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_try_read_does_not_block() {
        let channel = Channel::<u8>::new();
        let mut out = Vec::new();
        assert_eq!(channel.try_read(&mut out, 4), 0);

        channel.write(vec![9, 8, 7]);
        assert_eq!(channel.try_read(&mut out, 2), 2);
        assert_eq!(out, vec![9, 8]);
    }

    #[test]
    fn test_bounded_write_blocks_until_read() {
        let channel = Arc::new(Channel::bounded(2));
        let writer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.write(vec![1, 2, 3, 4, 5]))
        };

        let mut out = Vec::new();
        let mut seen = Vec::new();
        while seen.len() < 5 {
            if channel.read_once(&mut out, 2) {
                seen.extend_from_slice(&out);
            }
        }
        assert_eq!(writer.join().unwrap(), 5);
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_clear_discards_items() {
        let channel = Channel::new();
        channel.write(vec![1, 2, 3]);
        channel.clear();
        assert_eq!(channel.size(), 0);
    }

    #[test]
    fn test_consumer_block_size() {
        assert_eq!(consumer_block_size(10, 3), 4);
        assert_eq!(consumer_block_size(9, 3), 3);
        assert_eq!(consumer_block_size(0, 4), 1);
        assert_eq!(consumer_block_size(5, 0), 5);
    }

    #[test]
    fn test_consumer_block_size_even_shares() {
        let channel: Channel<u32> = Channel::new();
        channel.write((0..9).collect());
        channel.close();
        channel.set_block_size(consumer_block_size(9, 3));

        let shares: Vec<usize> = (0..3)
            .map(|_| {
                let mut out = Vec::new();
                channel.read(&mut out);
                out.len()
            })
            .collect();
        assert_eq!(shares, vec![3, 3, 3]);
        assert!(channel.is_empty());
    }
}
