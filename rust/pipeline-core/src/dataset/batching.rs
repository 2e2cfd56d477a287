// rust/pipeline-core/src/dataset/batching.rs

//! Batch-offset planning for the slot datasets.
//!
//! The planner cuts `total` buffered items into `(start, len)` batches that
//! are handed round-robin to `thread_num` readers. Full rounds of
//! `batch_size × thread_num` come first, and the tail is spread over one or
//! two extra rounds. With several ranks every rank must run the same number
//! of steps per thread, so trailing rounds are re-split until this rank
//! matches the largest per-thread batch count.

use crate::error::{PipelineError, Result};
use crate::messenger::InterRankMessenger;

/// Offsets for one pass, plus the number of batches each thread will run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub offsets: Vec<(usize, usize)>,
    pub thread_batch_num: usize,
}

// `parts` consecutive batches over `ins_num` items starting at `start`;
// the first batch absorbs the remainder.
fn split_remaining(ins_num: usize, parts: usize, start: usize, offsets: &mut Vec<(usize, usize)>) {
    let base = ins_num / parts;
    let left = ins_num % parts;
    let mut pos = start;
    for i in 0..parts {
        let len = if i == 0 { base + left } else { base };
        offsets.push((pos, len));
        pos += len;
    }
}

fn split_rounds(ins_num: usize, batch_size: usize, thread_num: usize, offsets: &mut Vec<(usize, usize)>) {
    let thread_batch_num = batch_size * thread_num;
    if thread_batch_num > ins_num {
        split_remaining(ins_num, thread_num, 0, offsets);
        return;
    }

    let mut full_batches = (ins_num / thread_batch_num) * thread_num;
    let mut left = ins_num % thread_batch_num;
    let mut tail_parts = thread_num;
    // A tiny tail is merged with the last full round and spread over two rounds.
    if left > 0 && left < thread_num * 2 && full_batches > 1 {
        full_batches -= thread_num;
        left += thread_batch_num;
        tail_parts = thread_num * 2;
    }

    let mut pos = 0;
    for _ in 0..full_batches {
        offsets.push((pos, batch_size));
        pos += batch_size;
    }
    if left > 0 {
        split_remaining(left, tail_parts, pos, offsets);
    }
}

/// Plans batch offsets for `total` items over `thread_num` readers.
///
/// With a multi-rank `messenger`, every rank must call this together: it
/// all-reduces the per-thread batch count and re-splits trailing rounds so
/// all ranks end up with the same count.
///
/// # Errors
///
/// Returns [`PipelineError::Shuffle`] if this rank holds too few items to
/// fill the batch count other ranks need.
pub fn compute_thread_batches(
    thread_num: usize,
    total: usize,
    batch_size: usize,
    messenger: Option<&dyn InterRankMessenger>,
) -> Result<BatchPlan> {
    let thread_num = thread_num.max(1);
    let batch_size = batch_size.max(1);

    let mut offsets = Vec::new();
    if total < thread_num {
        tracing::warn!(total, thread_num, "fewer instances than threads, no batches planned");
    } else {
        split_rounds(total, batch_size, thread_num, &mut offsets);
    }
    let avg = offsets.len() / thread_num;

    let Some(messenger) = messenger.filter(|m| m.rank_count() > 1) else {
        tracing::info!(thread_num, total, batches = offsets.len(), thread_batch_num = avg, "batch offsets planned");
        return Ok(BatchPlan {
            offsets,
            thread_batch_num: avg,
        });
    };

    let max = messenger.all_reduce_max(avg as u64) as usize;
    let cluster_total = messenger.all_reduce_sum(total as u64);
    let diff = max.saturating_sub(avg);
    if diff == 0 {
        tracing::info!(cluster_total, thread_num, total, batches = offsets.len(), thread_batch_num = avg, "batch offsets planned");
        return Ok(BatchPlan {
            offsets,
            thread_batch_num: avg,
        });
    }

    let need_ins = max * thread_num;
    if need_ins > total {
        return Err(PipelineError::shuffle(format!(
            "rank {} holds {total} instances but {need_ins} are needed for {max} batches per thread",
            messenger.rank()
        )));
    }

    let exhausted = || {
        PipelineError::shuffle(format!(
            "cannot re-split {total} instances into {max} batches per thread"
        ))
    };
    let mut need_batch_num = (diff + 1) * thread_num;
    let mut split_index = offsets.len().checked_sub(thread_num).ok_or_else(&exhausted)?;
    let mut split_left = total - offsets[split_index].0;
    while split_left < need_batch_num {
        need_batch_num += thread_num;
        split_index = split_index.checked_sub(thread_num).ok_or_else(&exhausted)?;
        split_left = total - offsets[split_index].0;
    }

    let split_start = offsets[split_index].0;
    offsets.truncate(split_index);
    split_remaining(split_left, need_batch_num, split_start, &mut offsets);
    tracing::warn!(
        cluster_total,
        thread_num,
        total,
        batches = offsets.len(),
        thread_avg_batch_num = avg,
        thread_max_batch_num = max,
        split_start,
        split_left,
        "batch offsets re-split to match other ranks"
    );
    Ok(BatchPlan {
        offsets,
        thread_batch_num: max,
    })
}
