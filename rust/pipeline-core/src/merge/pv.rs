// rust/pipeline-core/src/merge/pv.rs

use crate::record::{PvInstance, RecordArena, RecordId};

/// Groups arena records into sessions.
///
/// Ids are ordered by `search_id` (stable). With `merge_by_sid`, consecutive
/// records sharing a search id form one [`PvInstance`]; otherwise every
/// record becomes its own session. No record is dropped or repeated.
pub fn build_pv_instances(arena: &RecordArena, merge_by_sid: bool) -> Vec<PvInstance> {
    let mut ids: Vec<RecordId> = arena.ids().collect();
    ids.sort_by_key(|id| arena.get(*id).map_or(0, |r| r.search_id));

    if !merge_by_sid {
        return ids.into_iter().map(PvInstance::single).collect();
    }

    let mut instances: Vec<PvInstance> = Vec::new();
    let mut last_search_id = None;
    for id in ids {
        let search_id = arena.get(id).map(|r| r.search_id);
        match instances.last_mut() {
            Some(current) if search_id == last_search_id => current.merge_instance(id),
            _ => instances.push(PvInstance::single(id)),
        }
        last_search_id = search_id;
    }
    instances
}
