// rust/pipeline-core/src/merge/mod.rs

//! Record merging.
//!
//! Two independent folds run over buffered records:
//!
//! - [`merge_by_instance_id`] collapses horizontally split duplicates of one
//!   instance into a single record, dropping groups that look corrupt.
//! - [`build_pv_instances`] groups records into sessions by `search_id`.
//!   It only regroups and never drops.

mod instance;
mod pv;

pub use instance::{merge_by_instance_id, MergeStats};
pub use pv::build_pv_instances;
