// rust/pipeline-core/src/merge/instance.rs

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::record::{FeatureItem, Record, SlotTable};

/// Counters reported by [`merge_by_instance_id`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub input_records: usize,
    pub merged_records: usize,
    /// Groups dropped because their size differed from `merge_size`.
    pub size_mismatch_groups: usize,
    /// Groups dropped because a sparse slot appeared in more than one record.
    pub conflict_groups: usize,
    /// Records belonging to dropped groups.
    pub dropped_records: usize,
}

impl MergeStats {
    pub fn dropped_groups(&self) -> usize {
        self.size_mismatch_groups + self.conflict_groups
    }

    pub fn absorb(&mut self, other: &MergeStats) {
        self.input_records += other.input_records;
        self.merged_records += other.merged_records;
        self.size_mismatch_groups += other.size_mismatch_groups;
        self.conflict_groups += other.conflict_groups;
        self.dropped_records += other.dropped_records;
    }
}

/// Folds records sharing an `instance_id` into one record each.
///
/// Records are sorted by instance id and handled one group at a time:
///
/// - with `merge_size > 0`, a group of any other size is dropped;
/// - a dense slot takes the values of the first record in which that slot
///   is non-empty, or the first record's values if it is empty everywhere;
/// - a sparse slot may come from one record of the group only; a second
///   record carrying it makes the whole group a conflict and it is dropped;
/// - the merged record keeps the first record's ids, content and log key.
///
/// Returned records are in instance-id order.
pub fn merge_by_instance_id(
    mut records: Vec<Record>,
    slots: &SlotTable,
    merge_size: usize,
) -> (Vec<Record>, MergeStats) {
    let mut stats = MergeStats {
        input_records: records.len(),
        ..MergeStats::default()
    };
    records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

    let mut merged = Vec::new();
    let mut group: Vec<Record> = Vec::new();
    for record in records {
        if group
            .first()
            .is_some_and(|first| first.instance_id != record.instance_id)
        {
            merge_group(std::mem::take(&mut group), slots, merge_size, &mut merged, &mut stats);
        }
        group.push(record);
    }
    if !group.is_empty() {
        merge_group(group, slots, merge_size, &mut merged, &mut stats);
    }

    stats.merged_records = merged.len();
    if stats.dropped_groups() > 0 {
        tracing::warn!(
            size_mismatch = stats.size_mismatch_groups,
            conflicts = stats.conflict_groups,
            dropped_records = stats.dropped_records,
            "merge by instance id dropped groups"
        );
    }
    (merged, stats)
}

fn merge_group(
    group: Vec<Record>,
    slots: &SlotTable,
    merge_size: usize,
    merged: &mut Vec<Record>,
    stats: &mut MergeStats,
) {
    if merge_size > 0 && group.len() != merge_size {
        tracing::warn!(
            instance_id = %group[0].instance_id,
            size = group.len(),
            expected = merge_size,
            "dropping instance group with unexpected size"
        );
        stats.size_mismatch_groups += 1;
        stats.dropped_records += group.len();
        return;
    }

    let dense_u64 = pick_dense(&group, slots, |r| &r.uint64_feasigns);
    let dense_f32 = pick_dense(&group, slots, |r| &r.float_feasigns);

    let sparse_u64 = match collect_sparse(&group, slots, |r| &r.uint64_feasigns) {
        Ok(features) => features,
        Err(slot) => return record_conflict(&group, slots, slot, stats),
    };
    let sparse_f32 = match collect_sparse(&group, slots, |r| &r.float_feasigns) {
        Ok(features) => features,
        Err(slot) => return record_conflict(&group, slots, slot, stats),
    };

    let Some(mut record) = group.into_iter().next() else {
        return;
    };
    record.uint64_feasigns = dense_u64.into_values().flatten().chain(sparse_u64).collect();
    record.float_feasigns = dense_f32.into_values().flatten().chain(sparse_f32).collect();
    merged.push(record);
}

fn record_conflict(group: &[Record], slots: &SlotTable, slot: u16, stats: &mut MergeStats) {
    tracing::warn!(
        instance_id = %group[0].instance_id,
        slot,
        slot_name = slots.name(slot).unwrap_or("<unknown>"),
        "dropping instance group with conflicting sparse slot"
    );
    stats.conflict_groups += 1;
    stats.dropped_records += group.len();
}

trait Emptiness {
    fn empty(&self) -> bool;
}

impl Emptiness for FeatureItem<u64> {
    fn empty(&self) -> bool {
        self.is_empty()
    }
}

impl Emptiness for FeatureItem<f32> {
    fn empty(&self) -> bool {
        self.is_empty()
    }
}

// Per dense slot: the first record's values in which any value is non-empty,
// falling back to the first record that carries the slot at all.
fn pick_dense<V, F>(group: &[Record], slots: &SlotTable, features: F) -> BTreeMap<u16, Vec<FeatureItem<V>>>
where
    V: Copy,
    FeatureItem<V>: Emptiness,
    F: Fn(&Record) -> &Vec<FeatureItem<V>>,
{
    let mut chosen: BTreeMap<u16, (Vec<FeatureItem<V>>, bool)> = BTreeMap::new();
    for record in group {
        let mut local: BTreeMap<u16, Vec<FeatureItem<V>>> = BTreeMap::new();
        for item in features(record).iter().filter(|f| slots.is_dense(f.slot)) {
            local.entry(item.slot).or_default().push(*item);
        }
        for (slot, values) in local {
            let non_empty = values.iter().any(|v| !v.empty());
            let replace = match chosen.get(&slot) {
                None => true,
                Some((_, settled)) => !settled && non_empty,
            };
            if replace {
                chosen.insert(slot, (values, non_empty));
            }
        }
    }
    chosen.into_iter().map(|(slot, (values, _))| (slot, values)).collect()
}

// Sparse features of the group in record order. Err carries the first slot
// found in a second record.
fn collect_sparse<V, F>(group: &[Record], slots: &SlotTable, features: F) -> Result<Vec<FeatureItem<V>>, u16>
where
    V: Copy,
    F: Fn(&Record) -> &Vec<FeatureItem<V>>,
{
    let mut owned: HashSet<u16> = HashSet::new();
    let mut out = Vec::new();
    for record in group {
        let local: HashSet<u16> = features(record)
            .iter()
            .filter(|f| !slots.is_dense(f.slot))
            .map(|f| f.slot)
            .collect();
        if let Some(slot) = local.iter().copied().filter(|s| owned.contains(s)).min() {
            return Err(slot);
        }
        out.extend(features(record).iter().filter(|f| !slots.is_dense(f.slot)).copied());
        owned.extend(local);
    }
    Ok(out)
}
