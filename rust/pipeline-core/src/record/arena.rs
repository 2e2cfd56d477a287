// rust/pipeline-core/src/record/arena.rs

use rand::seq::SliceRandom;
use rand::Rng;

use super::Record;

/// Index of a record inside a [`RecordArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub usize);

impl RecordId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Owning store of records, addressed by [`RecordId`].
///
/// Channels and sessions carry ids instead of references, so the arena can be
/// rebuilt or shuffled between passes without dangling anything.
#[derive(Debug, Clone, Default)]
pub struct RecordArena {
    records: Vec<Record>,
}

impl RecordArena {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        (0..self.records.len()).map(RecordId)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Records `start..start + len`, clamped to the arena.
    pub fn slice(&self, start: usize, len: usize) -> &[Record] {
        let start = start.min(self.records.len());
        let end = start.saturating_add(len).min(self.records.len());
        &self.records[start..end]
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.records.shuffle(rng);
    }

    /// Reorders records by `search_id`, keeping the relative order of equal ids.
    pub fn sort_by_search_id(&mut self) {
        self.records.sort_by_key(|r| r.search_id);
    }
}

/// A session: records sharing one `search_id`.
///
/// Holds ids only; the records stay in their arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvInstance {
    records: Vec<RecordId>,
}

impl PvInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(id: RecordId) -> Self {
        Self { records: vec![id] }
    }

    pub fn merge_instance(&mut self, id: RecordId) {
        self.records.push(id);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_ids(&self) -> &[RecordId] {
        &self.records
    }

    /// Resolves this session's records in `arena`, skipping stale ids.
    pub fn resolve<'a>(&'a self, arena: &'a RecordArena) -> impl Iterator<Item = &'a Record> + 'a {
        self.records.iter().filter_map(move |id| arena.get(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn arena_of(ids: &[&str]) -> RecordArena {
        RecordArena::new(ids.iter().map(|id| Record::with_instance_id(*id)).collect())
    }

    #[test]
    fn test_slice_clamps() {
        let arena = arena_of(&["a", "b", "c"]);
        assert_eq!(arena.slice(1, 5).len(), 2);
        assert!(arena.slice(9, 2).is_empty());
    }

    #[test]
    fn test_shuffle_keeps_records() {
        let mut arena = arena_of(&["a", "b", "c", "d", "e"]);
        arena.shuffle(&mut StdRng::seed_from_u64(3));
        let mut ids: Vec<_> = arena.records().iter().map(|r| r.instance_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_sort_by_search_id_is_stable() {
        let records = [("a", 3), ("b", 1), ("c", 3), ("d", 0)]
            .into_iter()
            .map(|(id, sid)| Record {
                search_id: sid,
                ..Record::with_instance_id(id)
            })
            .collect();
        let mut arena = RecordArena::new(records);
        arena.sort_by_search_id();
        let ids: Vec<_> = arena.records().iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b", "a", "c"]);
    }

    #[test]
    fn test_pv_instance_resolve() {
        let arena = arena_of(&["a", "b", "c"]);
        let mut pv = PvInstance::single(RecordId(2));
        pv.merge_instance(RecordId(0));
        pv.merge_instance(RecordId(42));

        let resolved: Vec<_> = pv.resolve(&arena).map(|r| r.instance_id.as_str()).collect();
        assert_eq!(resolved, vec!["c", "a"]);
        assert_eq!(pv.len(), 3);
    }
}
