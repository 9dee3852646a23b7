//! Batch Engine Module
//!
//! Builds one batch out of transaction groups: groups are created from the pending pool,
//! ranked, pruned down to the capacity limits and finally flattened into a [`Selection`].

use crate::batch::group::{GroupContext, TransactionGroup};
use crate::config::SelectionConfig;
use crate::error::SelectionError;
use crate::pool::{build_txs_map, AtomicGroups, FailedAtomicGroup};
use crate::state::{AuthorizationSource, StateProcessor};
use crate::types::{CoordinatorAccount, Idx, OnChainTransaction, PoolTransaction, RejectedTx, Selection};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Batch under construction
///
/// Holds the speculative processor for the whole build: every group validates against the
/// ledger left by the groups created before it.
pub struct Batch<'a, P: StateProcessor, A: AuthorizationSource + ?Sized> {
    processor: &'a mut P,
    auths: &'a A,
    config: SelectionConfig,
    coordinator: CoordinatorAccount,
    groups: Vec<TransactionGroup>,
    fixed: Vec<OnChainTransaction>,
    future: Vec<OnChainTransaction>,
    /// Malformed atomic references and members of evicted groups
    discarded: Vec<RejectedTx>,
}

impl<'a, P: StateProcessor, A: AuthorizationSource + ?Sized> Batch<'a, P, A> {
    /// Creates an empty batch
    ///
    /// # Arguments
    /// * `processor` - Processor owning the speculative ledger, already reverted
    /// * `auths` - Source of account-creation authorizations
    /// * `config` - Capacity limits
    /// * `coordinator` - Identity fees are collected with
    pub fn new(
        processor: &'a mut P,
        auths: &'a A,
        config: SelectionConfig,
        coordinator: CoordinatorAccount,
    ) -> Self {
        Self {
            processor,
            auths,
            config,
            coordinator,
            groups: Vec::new(),
            fixed: Vec::new(),
            future: Vec::new(),
            discarded: Vec::new(),
        }
    }

    /// Applies the fixed on-chain transactions and builds one group per atomic bundle and per
    /// sender
    ///
    /// Atomic groups are built first, then sender groups in ascending sender order. Each
    /// group's synthesized transactions take the positions following the previous group's.
    ///
    /// # Arguments
    /// * `pending` - Pending pool transactions
    /// * `fixed` - On-chain transactions fixed for this batch
    /// * `future` - On-chain transactions fixed for a later batch
    pub fn create_groups(
        &mut self,
        pending: Vec<PoolTransaction>,
        fixed: Vec<OnChainTransaction>,
        future: Vec<OnChainTransaction>,
    ) -> Result<(), SelectionError> {
        // Step 1: Fixed on-chain transactions come first in the batch
        for tx in &fixed {
            self.processor.apply_on_chain(tx)?;
        }
        self.fixed = fixed;
        self.future = future;
        self.groups.clear();

        // Step 2: Split the pool into bundles
        let AtomicGroups {
            atomic,
            by_sender,
            discarded,
        } = build_txs_map(pending);
        self.discarded.extend(discarded);

        let bundles = atomic
            .into_values()
            .map(|members| (true, members))
            .chain(by_sender.into_values().map(|members| (false, members)));

        // Step 3: Validate each bundle against the ledger left by the previous ones
        let ctx = GroupContext {
            auths: self.auths,
            coordinator: &self.coordinator,
            fixed: &self.fixed,
            future: &self.future,
        };
        let mut position = self.fixed.len();
        for (atomic, members) in bundles {
            let group = TransactionGroup::new(atomic, members, &mut *self.processor, &ctx, position)?;
            position += group.l1_len();
            debug!(
                atomic,
                txs = group.l2_len(),
                l1_txs = group.l1_len(),
                fee_average = group.fee_average(),
                "Transaction group created"
            );
            self.groups.push(group);
        }

        Ok(())
    }

    /// Ranks the groups: atomic first, then by descending fee average
    ///
    /// The sort is stable, groups with equal rank keep their creation order.
    pub fn sort(&mut self) {
        self.groups.sort_by(|a, b| {
            b.is_atomic()
                .cmp(&a.is_atomic())
                .then_with(|| b.fee_average().total_cmp(&a.fee_average()))
        });
    }

    /// Shrinks the batch until it fits the capacity limits
    ///
    /// 1. Lowest-ranked groups first, each non-atomic group is truncated to its most
    ///    profitable prefix.
    /// 2. While still too long, the excess is popped from the last group; a group that cannot
    ///    shed the excess partially is evicted.
    /// 3. While the on-chain part exceeds its own limit, the last group with synthesized
    ///    transactions is evicted.
    pub fn prune(&mut self) -> Result<(), SelectionError> {
        self.sort();

        let ctx = GroupContext {
            auths: self.auths,
            coordinator: &self.coordinator,
            fixed: &self.fixed,
            future: &self.future,
        };
        let max_tx = self.config.max_tx;

        // Step 1: Profitable prefixes
        let mut next = self.groups.len();
        while length(&self.fixed, &self.groups) > max_tx && next > 0 {
            next -= 1;
            if self.groups[next].prune() {
                self.groups[next].create_l1_txs(&mut *self.processor, &ctx)?;
            }
        }

        // Step 2: Pop from the tail
        while length(&self.fixed, &self.groups) > max_tx {
            let excess = length(&self.fixed, &self.groups) - max_tx;
            let Some(last) = self.groups.last_mut() else {
                warn!(fixed = self.fixed.len(), max_tx, "Fixed on-chain txs exceed the batch");
                return Err(SelectionError::InvalidGroup);
            };

            if last.pop_tx(excess) {
                if let Some(evicted) = self.groups.pop() {
                    debug!(txs = evicted.discarded().len(), "Evicted transaction group");
                    self.discarded.extend(evicted.into_discarded());
                }
            } else {
                last.create_l1_txs(&mut *self.processor, &ctx)?;
            }
        }

        // Step 3: On-chain limit
        while l1_length(&self.fixed, &self.groups) > self.config.max_l1_tx {
            let Some(pos) = self.groups.iter().rposition(|group| group.l1_len() > 0) else {
                break;
            };
            let mut evicted = self.groups.remove(pos);
            evicted.pop_all_txs();
            debug!(txs = evicted.discarded().len(), "Evicted group over the on-chain limit");
            self.discarded.extend(evicted.into_discarded());
        }

        Ok(())
    }

    /// Flattens the batch into its selection
    ///
    /// Synthesized on-chain transactions are renumbered to follow the fixed ones densely. At
    /// most `max_fee_tx` fee-collecting accounts are reported, ascending.
    pub fn get_selection(&self) -> Selection {
        let mut fee_accounts: BTreeSet<Idx> = BTreeSet::new();
        let mut auths = Vec::new();
        let mut synthesized_on_chain = Vec::new();
        let mut selected = Vec::new();
        let mut discarded = self.discarded.clone();

        for group in &self.groups {
            for idx in group.fee_accounts().values() {
                if fee_accounts.len() >= self.config.max_fee_tx {
                    break;
                }
                fee_accounts.insert(*idx);
            }

            for (tx, auth) in group.on_chain_txs().zip(group.auths()) {
                let mut tx = tx.clone();
                tx.position = self.fixed.len() + synthesized_on_chain.len();
                synthesized_on_chain.push(tx);
                auths.push(auth.clone());
            }

            selected.extend(group.members().iter().cloned());
            discarded.extend(group.discarded().iter().cloned());
        }

        info!(
            selected = selected.len(),
            fixed = self.fixed.len(),
            synthesized = synthesized_on_chain.len(),
            discarded = discarded.len(),
            "Batch selection ready"
        );

        Selection {
            fee_accounts: fee_accounts.into_iter().collect(),
            auths,
            fixed_on_chain: self.fixed.clone(),
            synthesized_on_chain,
            selected,
            discarded,
        }
    }

    /// First atomic group that failed validation, with every member it discarded
    pub fn failed_atomic_group(&self) -> Option<(FailedAtomicGroup, Vec<RejectedTx>)> {
        self.groups.iter().find_map(|group| {
            group
                .failure()
                .map(|failure| (failure.clone(), group.discarded().to_vec()))
        })
    }

    /// Transactions in the batch: fixed on-chain plus every group's
    pub fn len(&self) -> usize {
        length(&self.fixed, &self.groups)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn l1_len(&self) -> usize {
        l1_length(&self.fixed, &self.groups)
    }

    /// Lowest-ranked group
    pub fn last(&self) -> Option<&TransactionGroup> {
        self.groups.last()
    }

    /// Groups in their current order
    pub fn groups(&self) -> &[TransactionGroup] {
        &self.groups
    }
}

fn length(fixed: &[OnChainTransaction], groups: &[TransactionGroup]) -> usize {
    fixed.len() + groups.iter().map(TransactionGroup::len).sum::<usize>()
}

fn l1_length(fixed: &[OnChainTransaction], groups: &[TransactionGroup]) -> usize {
    fixed.len() + groups.iter().map(TransactionGroup::l1_len).sum::<usize>()
}
