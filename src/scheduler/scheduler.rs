//! Transaction Scheduler Module
//!
//! Determines the order in which a streaming pass verifies pool transactions.
//!
//! # Ordering Rules
//! 1. Atomic groups are ranked by descending average fee and never split
//! 2. Independent transactions are ranked by [`compare_independent`]
//! 3. The merge takes the next independent transaction only when its fee strictly beats
//!    the next group's average; otherwise the whole group goes first

use crate::scheduler::policies::{average_fee_by_group, compare_independent};
use crate::types::{AtomicGroupId, PoolTransaction};
use std::collections::HashMap;
use tracing::debug;

/// Fee-priority scheduler for streaming selection
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Schedule transactions for a streaming pass
    ///
    /// # Arguments
    /// * `txs` - Pool transactions; members of one atomic group keep their relative order
    ///
    /// # Returns
    /// The same transactions, ordered for verification
    pub fn schedule(&self, txs: Vec<PoolTransaction>) -> Vec<PoolTransaction> {
        let averages = average_fee_by_group(&txs);

        // Step 1: Split atomic groups from independent transactions
        let mut order: Vec<AtomicGroupId> = Vec::new();
        let mut groups: HashMap<AtomicGroupId, Vec<PoolTransaction>> = HashMap::new();
        let mut independent = Vec::new();
        for tx in txs {
            match tx.atomic_group_id {
                Some(id) => {
                    if !groups.contains_key(&id) {
                        order.push(id);
                    }
                    groups.entry(id).or_default().push(tx);
                }
                None => independent.push(tx),
            }
        }

        // Step 2: Rank both sides; the sorts are stable so ties keep arrival order
        let average = |id: &AtomicGroupId| averages.get(id).copied().unwrap_or_default();
        order.sort_by(|a, b| average(b).total_cmp(&average(a)));
        independent.sort_by(compare_independent);

        debug!(
            groups = order.len(),
            independent = independent.len(),
            "Scheduling pool transactions"
        );

        // Step 3: Merge
        let mut result = Vec::with_capacity(independent.len() + groups.values().map(Vec::len).sum::<usize>());
        let mut independent = independent.into_iter().peekable();
        for id in order {
            let group_average = average(&id);
            while let Some(tx) = independent.next_if(|tx| tx.absolute_fee > group_average) {
                result.push(tx);
            }
            if let Some(members) = groups.remove(&id) {
                result.extend(members);
            }
        }
        result.extend(independent);

        result
    }
}
