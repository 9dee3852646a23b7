//! Ranking Policies Module
//!
//! Fee rankings shared by the scheduler and the selection orchestrator.

use crate::types::{AtomicGroupId, PoolTransaction};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Average absolute fee of every atomic group present in `txs`
pub fn average_fee_by_group(txs: &[PoolTransaction]) -> HashMap<AtomicGroupId, f64> {
    let mut totals: HashMap<AtomicGroupId, (f64, usize)> = HashMap::new();
    for tx in txs {
        if let Some(id) = tx.atomic_group_id {
            let entry = totals.entry(id).or_insert((0.0, 0));
            entry.0 += tx.absolute_fee;
            entry.1 += 1;
        }
    }

    totals
        .into_iter()
        .map(|(id, (total, count))| (id, total / count as f64))
        .collect()
}

/// Highest fee first, then lowest sender index, then lowest nonce
pub fn compare_independent(a: &PoolTransaction, b: &PoolTransaction) -> Ordering {
    b.absolute_fee
        .total_cmp(&a.absolute_fee)
        .then_with(|| a.from_idx.cmp(&b.from_idx))
        .then_with(|| a.nonce.cmp(&b.nonce))
}
