//! Atomic Group Builder
//!
//! Partitions a flat list of pool transactions into atomic bundles, linked by their
//! requested-transaction reference, and independent per-sender bundles.
//!
//! Reference chains are expected to loop back on themselves, so clusters are built with a
//! disjoint-set over an identity index instead of by walking references.

use crate::error::{RejectReason, SelectionError};
use crate::types::{Idx, PoolTransaction, RejectedTx, TxId};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Output of [`build_txs_map`]
#[derive(Debug, Default)]
pub struct AtomicGroups {
    /// Atomic bundles keyed by the identity of their first member in input order
    pub atomic: BTreeMap<TxId, Vec<PoolTransaction>>,
    /// Non-atomic transactions keyed by sender index, in input order
    pub by_sender: BTreeMap<Idx, Vec<PoolTransaction>>,
    /// Transactions with a dangling or unsatisfiable reference
    pub discarded: Vec<RejectedTx>,
}

/// Disjoint-set forest with path compression and union by rank
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Builds the atomic and per-sender bundles of `txs`
///
/// No transaction appears in more than one output.
pub fn build_txs_map(txs: Vec<PoolTransaction>) -> AtomicGroups {
    let mut groups = AtomicGroups::default();
    if txs.is_empty() {
        return groups;
    }

    // Step 1: Index by identity, first occurrence wins
    let mut index: HashMap<TxId, usize> = HashMap::with_capacity(txs.len());
    for (pos, tx) in txs.iter().enumerate() {
        index.entry(tx.id).or_insert(pos);
    }

    // Step 2: Dangling references are discarded before any union
    let dangling: Vec<bool> = txs
        .iter()
        .map(|tx| matches!(tx.requested_tx_id, Some(rq) if !index.contains_key(&rq)))
        .collect();

    // Step 3: Union every transaction with the one it requests
    let mut set = DisjointSet::new(txs.len());
    for (pos, tx) in txs.iter().enumerate() {
        if dangling[pos] {
            continue;
        }
        if let Some(target) = tx.requested_tx_id.and_then(|rq| index.get(&rq).copied()) {
            if !dangling[target] {
                set.union(pos, target);
            }
        }
    }

    // Step 4: Collect clusters in input order
    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut first_of: HashMap<usize, usize> = HashMap::new();
    for pos in 0..txs.len() {
        if dangling[pos] {
            continue;
        }
        let root = set.find(pos);
        let first = *first_of.entry(root).or_insert(pos);
        clusters.entry(first).or_default().push(pos);
    }

    let mut slots: Vec<Option<PoolTransaction>> = txs.into_iter().map(Some).collect();
    for (pos, is_dangling) in dangling.iter().enumerate() {
        if *is_dangling {
            if let Some(tx) = slots[pos].take() {
                debug!(tx_id = ?tx.id, "Discarding transaction with dangling requested reference");
                groups
                    .discarded
                    .push(RejectedTx::new(tx, RejectReason::InvalidAtomicGroup));
            }
        }
    }

    // Step 5: Clusters of one are not atomic
    for (first, members) in clusters {
        let mut bundle: Vec<PoolTransaction> =
            members.iter().filter_map(|pos| slots[*pos].take()).collect();

        if bundle.len() > 1 {
            let root = bundle[0].id;
            debug!(root = ?root, txs = bundle.len(), "Atomic group built");
            groups.atomic.insert(root, bundle);
            continue;
        }

        let Some(tx) = bundle.pop() else { continue };
        if tx.requested_tx_id.is_some() {
            debug!(tx_id = ?tx.id, position = first, "Discarding lone transaction with requested reference");
            groups
                .discarded
                .push(RejectedTx::new(tx, RejectReason::InvalidAtomicGroup));
        } else {
            groups.by_sender.entry(tx.from_idx).or_default().push(tx);
        }
    }

    groups
}

/// Encodes the position of the requested transaction relative to the requester
///
/// Only the range `[-4, 3]` is representable.
pub fn relative_to_rq_offset(relative: i64) -> Result<u8, SelectionError> {
    match relative {
        -4 => Ok(4),
        -3 => Ok(5),
        -2 => Ok(6),
        -1 => Ok(7),
        0..=3 => Ok(relative as u8),
        _ => Err(SelectionError::InvalidRqOffset(relative)),
    }
}

/// Decodes an encoded reference offset back into a relative position
pub fn rq_offset_to_relative(rq_offset: u8) -> Option<i64> {
    match rq_offset {
        0..=3 => Some(rq_offset as i64),
        4 => Some(-4),
        5 => Some(-3),
        6 => Some(-2),
        7 => Some(-1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{tx_id, transfer};

    fn linked(n: u64, requests: Option<u64>) -> PoolTransaction {
        let mut tx = transfer(256 + n, 300, 0, 10, 1, 0);
        tx.id = tx_id(n);
        tx.requested_tx_id = requests.map(tx_id);
        tx
    }

    #[test]
    fn test_no_references_lands_everything_per_sender() {
        let txs = vec![
            transfer(256, 300, 0, 10, 1, 0),
            transfer(256, 300, 0, 10, 1, 1),
            transfer(257, 300, 0, 10, 1, 0),
        ];

        let groups = build_txs_map(txs);
        assert!(groups.atomic.is_empty());
        assert!(groups.discarded.is_empty());
        assert_eq!(groups.by_sender[&256].len(), 2);
        assert_eq!(groups.by_sender[&257].len(), 1);
    }

    #[test]
    fn test_closed_chain_of_seven_is_one_group() {
        let txs: Vec<_> = (1..=7).map(|n| linked(n, Some(if n == 7 { 1 } else { n + 1 }))).collect();

        let groups = build_txs_map(txs);
        assert_eq!(groups.atomic.len(), 1);
        assert_eq!(groups.atomic[&tx_id(1)].len(), 7);
        assert!(groups.by_sender.is_empty());
        assert!(groups.discarded.is_empty());
    }

    #[test]
    fn test_dangling_reference_is_discarded() {
        let txs = vec![linked(1, Some(99)), linked(2, Some(3)), linked(3, Some(2)), linked(4, None)];

        let groups = build_txs_map(txs);
        assert_eq!(groups.discarded.len(), 1);
        assert_eq!(groups.discarded[0].tx.id, tx_id(1));
        assert_eq!(groups.discarded[0].reason, RejectReason::InvalidAtomicGroup);
        assert_eq!(groups.atomic[&tx_id(2)].len(), 2);
        assert_eq!(groups.by_sender.len(), 1);
    }

    #[test]
    fn test_reference_to_discarded_leaves_lone_requester_discarded() {
        // 2 requests 1, which is dangling
        let txs = vec![linked(1, Some(99)), linked(2, Some(1))];

        let groups = build_txs_map(txs);
        assert!(groups.atomic.is_empty());
        assert!(groups.by_sender.is_empty());
        assert_eq!(groups.discarded.len(), 2);
    }

    #[test]
    fn test_rq_offset_mapping() {
        for relative in -4..=3 {
            let encoded = relative_to_rq_offset(relative).unwrap();
            assert_eq!(rq_offset_to_relative(encoded), Some(relative));
        }
        assert_eq!(relative_to_rq_offset(-1), Ok(7));
        assert_eq!(relative_to_rq_offset(4), Err(SelectionError::InvalidRqOffset(4)));
        assert_eq!(relative_to_rq_offset(-5), Err(SelectionError::InvalidRqOffset(-5)));
        assert_eq!(rq_offset_to_relative(8), None);
    }
}
