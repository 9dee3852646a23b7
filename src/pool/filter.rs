//! Atomic-group pre-filters applied before a streaming selection pass

use crate::error::RejectReason;
use crate::pool::rq_offset_to_relative;
use crate::types::{AtomicGroupId, PoolTransaction, RejectedTx, TxId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// An atomic group that could not be admitted in an earlier pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAtomicGroup {
    pub id: AtomicGroupId,
    /// The member whose rejection failed the group
    pub failed_tx: TxId,
    pub reason: RejectReason,
}

/// Splits off the members of groups that already failed
///
/// The member that caused the failure keeps its own reason, the rest are tagged as
/// belonging to an unselectable group. Order of the remaining transactions is preserved.
pub fn filter_failed_atomic_groups(
    txs: Vec<PoolTransaction>,
    failed: &[FailedAtomicGroup],
) -> (Vec<PoolTransaction>, Vec<RejectedTx>) {
    let mut keep = Vec::with_capacity(txs.len());
    let mut filtered = Vec::new();

    for tx in txs {
        let group = tx
            .atomic_group_id
            .and_then(|id| failed.iter().find(|group| group.id == id));

        match group {
            None => keep.push(tx),
            Some(group) if group.failed_tx == tx.id => {
                filtered.push(RejectedTx::new(tx, group.reason.clone()));
            }
            Some(group) => {
                let reason = RejectReason::AtomicGroupUnselectable {
                    group: group.id,
                    failed_tx: group.failed_tx,
                    cause: group.reason.to_string(),
                };
                filtered.push(RejectedTx::new(tx, reason));
            }
        }
    }

    (keep, filtered)
}

/// Splits off atomic groups that can never be forged because of missing or misordered members
///
/// Non-atomic transactions keep their order and come first, followed by the valid groups in
/// the order they first appear.
pub fn filter_invalid_atomic_groups(
    txs: Vec<PoolTransaction>,
) -> (Vec<PoolTransaction>, Vec<RejectedTx>) {
    let mut keep = Vec::with_capacity(txs.len());
    let mut order: Vec<AtomicGroupId> = Vec::new();
    let mut groups: HashMap<AtomicGroupId, Vec<PoolTransaction>> = HashMap::new();

    for tx in txs {
        match tx.atomic_group_id {
            None => keep.push(tx),
            Some(id) => {
                if !groups.contains_key(&id) {
                    order.push(id);
                }
                groups.entry(id).or_default().push(tx);
            }
        }
    }

    let mut filtered = Vec::new();
    for id in order {
        let Some(members) = groups.remove(&id) else { continue };
        if is_atomic_group_valid(&members) {
            keep.extend(members);
        } else {
            debug!(group = ?id, txs = members.len(), "Filtering invalid atomic group");
            filtered.extend(
                members
                    .into_iter()
                    .map(|tx| RejectedTx::new(tx, RejectReason::InvalidAtomicGroup)),
            );
        }
    }

    (keep, filtered)
}

/// Every member must request another member through a decodable, in-range offset
pub fn is_atomic_group_valid(members: &[PoolTransaction]) -> bool {
    members.iter().enumerate().all(|(pos, tx)| {
        if tx.rq_offset == 0 {
            return false;
        }
        let Some(relative) = rq_offset_to_relative(tx.rq_offset) else {
            return false;
        };
        let target = pos as i64 + relative;
        if target < 0 || target >= members.len() as i64 {
            return false;
        }
        match tx.requested_tx_id {
            Some(rq) => members[target as usize].id == rq,
            None => true,
        }
    })
}
