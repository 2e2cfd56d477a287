// rust/pipeline-core/src/reader/mod.rs

//! Record loading.
//!
//! Load workers share a [`FileCursor`]: each worker repeatedly claims the
//! next unread file, so skewed file sizes balance out across threads instead
//! of following a static partition. A [`RecordReader`] turns each claimed
//! file into records and writes them into the shared input channel.

mod text;

pub use text::TextRecordReader;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Result;
use crate::record::Record;

/// Shared, work-stealing position in a file list.
#[derive(Debug, Default)]
pub struct FileCursor {
    files: Vec<PathBuf>,
    next: Mutex<usize>,
}

impl FileCursor {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            next: Mutex::new(0),
        }
    }

    /// Claims the next unread file.
    pub fn next_file(&self) -> Option<PathBuf> {
        let mut next = self.next.lock();
        let file = self.files.get(*next)?.clone();
        *next += 1;
        Some(file)
    }

    /// Rewinds to the first file.
    pub fn reset(&self) {
        *self.next.lock() = 0;
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn claimed(&self) -> usize {
        (*self.next.lock()).min(self.files.len())
    }
}

/// Files a rank keeps when a file list is polled across ranks: `rank`,
/// `rank + rank_count`, and so on.
pub fn files_for_rank(files: &[PathBuf], rank: usize, rank_count: usize) -> Vec<PathBuf> {
    if rank_count <= 1 {
        return files.to_vec();
    }
    files
        .iter()
        .skip(rank)
        .step_by(rank_count)
        .cloned()
        .collect()
}

/// Running total of parsed feature signatures.
#[derive(Debug, Default)]
pub struct FeatureCounter {
    total: Mutex<u64>,
}

impl FeatureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, count: u64) {
        *self.total.lock() += count;
    }

    pub fn get(&self) -> u64 {
        *self.total.lock()
    }

    pub fn reset(&self) {
        *self.total.lock() = 0;
    }
}

/// Everything one load worker needs for a pass.
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub thread_id: usize,
    pub thread_num: usize,
    pub files: Arc<FileCursor>,
    pub features: Arc<FeatureCounter>,
    pub output: Arc<Channel<Record>>,
}

/// Turns raw files into records.
///
/// Several workers call `load_into_memory` concurrently with the same
/// cursor; each call returns once the cursor is exhausted. Per-file I/O
/// problems are the reader's to handle.
pub trait RecordReader: Send + Sync {
    /// Name of this reader.
    fn name(&self) -> &'static str;

    /// Loads claimed files into `ctx.output`, returning the number of records written.
    fn load_into_memory(&self, ctx: &LoadContext) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("part-{i:03}"))).collect()
    }

    #[test]
    fn test_cursor_hands_out_each_file_once() {
        let cursor = Arc::new(FileCursor::new(paths(50)));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cursor = Arc::clone(&cursor);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(file) = cursor.next_file() {
                        mine.push(file);
                    }
                    mine
                })
            })
            .collect();

        let claimed: Vec<PathBuf> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        let unique: HashSet<_> = claimed.iter().collect();
        assert_eq!(claimed.len(), 50);
        assert_eq!(unique.len(), 50);
        assert_eq!(cursor.claimed(), 50);
    }

    #[test]
    fn test_cursor_reset() {
        let cursor = FileCursor::new(paths(2));
        assert!(cursor.next_file().is_some());
        assert!(cursor.next_file().is_some());
        assert!(cursor.next_file().is_none());
        cursor.reset();
        assert_eq!(cursor.next_file(), Some(PathBuf::from("part-000")));
    }

    #[test]
    fn test_files_for_rank() {
        let files = paths(7);
        assert_eq!(files_for_rank(&files, 0, 1).len(), 7);

        let rank1 = files_for_rank(&files, 1, 3);
        assert_eq!(rank1, vec![PathBuf::from("part-001"), PathBuf::from("part-004")]);

        let total: usize = (0..3).map(|r| files_for_rank(&files, r, 3).len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_feature_counter() {
        let counter = FeatureCounter::new();
        counter.add(10);
        counter.add(5);
        assert_eq!(counter.get(), 15);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }
}
