//! Transaction Pool Module
//!
//! Prepares the pending pool transactions for selection:
//! - Atomic grouping: atomic bundles and independent per-sender bundles
//! - Atomic pre-filters: groups that failed earlier or can never be forged

mod atomic;
mod filter;

pub use atomic::{build_txs_map, relative_to_rq_offset, rq_offset_to_relative, AtomicGroups};
pub use filter::{
    filter_failed_atomic_groups, filter_invalid_atomic_groups, is_atomic_group_valid,
    FailedAtomicGroup,
};
