//! Transaction Group Module
//!
//! A [`TransactionGroup`] is the unit of selection: either one atomic bundle or the pending
//! transactions of one sender. The group ranks its members by fee, validates them against
//! the speculative ledger, synthesizes the account creations they need and shrinks itself
//! when the batch runs out of room.
//!
//! # Eviction
//! - Non-atomic groups can be truncated: the tail (highest nonces) is dropped.
//! - Atomic groups are all-or-nothing: any rejection or eviction clears the whole group.

use crate::error::{CheckError, RejectReason, SelectionError};
use crate::pool::{relative_to_rq_offset, FailedAtomicGroup};
use crate::state::{credit_accumulated_fees, AuthorizationSource, Ledger, StateProcessor};
use crate::types::{
    account_hash, CoordinatorAccount, Idx, OnChainKind, OnChainTransaction, PoolTransaction,
    RejectedTx, TokenId, TxId,
};
use crate::validation::{Destination, Validator};
use ethers::types::{Bytes, H256};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Collaborators and on-chain context shared by every group of a batch
pub struct GroupContext<'a, A: AuthorizationSource + ?Sized> {
    pub auths: &'a A,
    pub coordinator: &'a CoordinatorAccount,
    /// On-chain transactions fixed for this batch
    pub fixed: &'a [OnChainTransaction],
    /// On-chain transactions fixed for a later batch
    pub future: &'a [OnChainTransaction],
}

impl<A: AuthorizationSource + ?Sized> Clone for GroupContext<'_, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: AuthorizationSource + ?Sized> Copy for GroupContext<'_, A> {}

/// A synthesized account creation and the authorization that backs it
#[derive(Debug, Clone, PartialEq)]
struct Creation {
    tx: OnChainTransaction,
    auth: Bytes,
}

/// One atomic bundle or one sender's bundle
#[derive(Debug, Clone)]
pub struct TransactionGroup {
    /// Coordinator-originated creations of fee-collecting accounts
    fee_account_creations: Vec<Creation>,
    /// Pool-authorized creations of destination accounts
    destination_creations: Vec<Creation>,
    members: Vec<PoolTransaction>,
    discarded: Vec<RejectedTx>,
    fee_accounts: BTreeMap<TokenId, Idx>,
    fee_average: f64,
    atomic: bool,
    first_position: usize,
    /// Identity of the first member, names the group when members carry no group id
    root: TxId,
    failure: Option<FailedAtomicGroup>,
}

impl TransactionGroup {
    /// Builds, ranks and validates a group
    ///
    /// # Arguments
    /// * `atomic` - Whether the members must be admitted all together
    /// * `members` - The pool transactions of the group
    /// * `processor` - State-transition processor owning the speculative ledger
    /// * `ctx` - Authorization source, coordinator identity and fixed on-chain transactions
    /// * `first_position` - Batch position of the group's first synthesized transaction
    ///
    /// # Returns
    /// * `Err(SelectionError::EmptyGroup)` if `members` is empty
    /// * `Err` on any pass-fatal collaborator failure
    pub fn new<P, A>(
        atomic: bool,
        members: Vec<PoolTransaction>,
        processor: &mut P,
        ctx: &GroupContext<'_, A>,
        first_position: usize,
    ) -> Result<Self, SelectionError>
    where
        P: StateProcessor,
        A: AuthorizationSource + ?Sized,
    {
        let Some(first) = members.first() else {
            return Err(SelectionError::EmptyGroup);
        };

        let mut group = Self {
            fee_account_creations: Vec::new(),
            destination_creations: Vec::new(),
            root: first.id,
            members,
            discarded: Vec::new(),
            fee_accounts: BTreeMap::new(),
            fee_average: 0.0,
            atomic,
            first_position,
            failure: None,
        };

        group.calc_fee_average();
        group.sort();
        group.validate(processor, ctx)?;
        Ok(group)
    }

    /// Recomputes the average absolute fee of the admitted members
    fn calc_fee_average(&mut self) {
        self.fee_average = average_fee(&self.members);
    }

    /// Orders the members for application
    ///
    /// Stable by descending fee; non-atomic groups then by ascending nonce. Atomic groups keep
    /// fee order and get each member's reference offset, failing the group when a reference
    /// cannot be expressed.
    pub fn sort(&mut self) {
        self.members
            .sort_by(|a, b| b.absolute_fee.total_cmp(&a.absolute_fee));

        if !self.atomic {
            self.members.sort_by_key(|tx| tx.nonce);
            return;
        }

        if let Err((failed_tx, reason)) = self.assign_rq_offsets() {
            self.fail(failed_tx, reason);
        }
    }

    fn assign_rq_offsets(&mut self) -> Result<(), (TxId, RejectReason)> {
        let positions: HashMap<TxId, usize> = self
            .members
            .iter()
            .enumerate()
            .map(|(pos, tx)| (tx.id, pos))
            .collect();

        for pos in 0..self.members.len() {
            let tx = &self.members[pos];
            let target = tx
                .requested_tx_id
                .and_then(|rq| positions.get(&rq).copied())
                .filter(|target| *target != pos);

            let Some(target) = target else {
                return Err((tx.id, RejectReason::UnresolvedRqOffset));
            };

            let relative = target as i64 - pos as i64;
            match relative_to_rq_offset(relative) {
                Ok(rq_offset) => self.members[pos].rq_offset = rq_offset,
                Err(err) => {
                    debug!(tx_id = ?tx.id, relative, error = %err, "Reference offset out of range");
                    return Err((tx.id, RejectReason::UnresolvedRqOffset));
                }
            }
        }
        Ok(())
    }

    /// Synthesizes the account creations the members need and applies the new ones
    ///
    /// Coordinator fee accounts come first, then destination accounts. A hash already
    /// created by a fixed on-chain transaction, or by an earlier run of this method, is never
    /// synthesized twice; creations kept from an earlier run are not applied again.
    pub fn create_l1_txs<P, A>(
        &mut self,
        processor: &mut P,
        ctx: &GroupContext<'_, A>,
    ) -> Result<(), SelectionError>
    where
        P: StateProcessor,
        A: AuthorizationSource + ?Sized,
    {
        // Step 1: Reset, remembering what this group already applied
        let mut previous: HashMap<H256, Creation> = self
            .fee_account_creations
            .drain(..)
            .chain(self.destination_creations.drain(..))
            .map(|creation| (creation.tx.account_hash(), creation))
            .collect();

        let mut covered: HashSet<H256> = ctx
            .fixed
            .iter()
            .chain(ctx.future.iter())
            .filter(|tx| tx.kind == OnChainKind::CreateAccountDeposit)
            .map(|tx| tx.account_hash())
            .collect();

        let mut fee_creations: Vec<(Creation, bool)> = Vec::new();
        let mut destination_creations: Vec<(Creation, bool)> = Vec::new();

        // Step 2: Derive the creations from the current members
        {
            let ledger = processor.ledger();
            let validator = Validator::new(ledger);

            for tx in &self.members {
                let coordinator_hash = account_hash(
                    ctx.coordinator.address,
                    ctx.coordinator.public_key,
                    tx.token_id,
                );
                if covered.insert(coordinator_hash) {
                    if let Some(kept) = previous.remove(&coordinator_hash) {
                        fee_creations.push((kept, false));
                    } else if validator.fee_account(ctx.coordinator, tx.token_id)?.is_none() {
                        let creation = Creation {
                            tx: OnChainTransaction::create_account(
                                ctx.coordinator.address,
                                ctx.coordinator.public_key,
                                tx.token_id,
                            ),
                            auth: ctx.coordinator.creation_auth.clone(),
                        };
                        fee_creations.push((creation, true));
                    }
                }

                match validator.resolve_destination(tx, ctx.auths, ctx.future) {
                    Ok(Destination::Create { tx: creation, auth }) => {
                        if covered.insert(creation.account_hash()) {
                            destination_creations.push((Creation { tx: creation, auth }, true));
                        }
                    }
                    Ok(Destination::Existing(idx)) => {
                        let account = ledger.get_account(idx)?;
                        let hash = account_hash(account.address, account.public_key, account.token_id);
                        if covered.insert(hash) {
                            if let Some(kept) = previous.remove(&hash) {
                                destination_creations.push((kept, false));
                            }
                        }
                    }
                    Ok(Destination::Exit) => {}
                    // Rejected members are handled by `validate`
                    Err(CheckError::Reject(_)) => {}
                    Err(CheckError::Fatal(err)) => return Err(err),
                }
            }
        }

        // Step 3: Positions, coordinator-originated first
        let mut position = self.first_position;
        for (creation, _) in fee_creations.iter_mut().chain(destination_creations.iter_mut()) {
            creation.tx.position = position;
            position += 1;
        }

        // Step 4: Make the new accounts visible to the following checks
        for (creation, fresh) in fee_creations.iter().chain(destination_creations.iter()) {
            if !*fresh {
                continue;
            }
            let applied = processor.apply_on_chain(&creation.tx)?;
            debug!(
                address = ?creation.tx.from_address,
                token_id = creation.tx.token_id,
                position = creation.tx.position,
                idx = applied.idx,
                "New on-chain account creation"
            );
        }

        self.fee_account_creations = fee_creations.into_iter().map(|(c, _)| c).collect();
        self.destination_creations = destination_creations.into_iter().map(|(c, _)| c).collect();
        Ok(())
    }

    /// Validates and applies every member against the speculative ledger
    ///
    /// Atomic members short of funds are parked and retried until the parked count stops
    /// changing, since a later member may have funded them. Any rejection inside an atomic
    /// group fails the whole group.
    ///
    /// # Returns
    /// The token to fee-collecting account map of the admitted members
    pub fn validate<P, A>(
        &mut self,
        processor: &mut P,
        ctx: &GroupContext<'_, A>,
    ) -> Result<BTreeMap<TokenId, Idx>, SelectionError>
    where
        P: StateProcessor,
        A: AuthorizationSource + ?Sized,
    {
        self.create_l1_txs(processor, ctx)?;
        self.fee_accounts.clear();

        let mut pending = std::mem::take(&mut self.members);
        let mut admitted = Vec::with_capacity(pending.len());
        let mut rejected: Vec<RejectedTx> = Vec::new();
        let mut parked_len = 0;

        let parked = loop {
            let mut parked: Vec<RejectedTx> = Vec::new();
            for tx in pending.drain(..) {
                match self.admit(&tx, processor, ctx) {
                    Ok(()) => admitted.push(tx),
                    Err(CheckError::Reject(reason @ RejectReason::InsufficientFunds { .. })) => {
                        parked.push(RejectedTx::new(tx, reason));
                    }
                    Err(CheckError::Reject(reason)) => {
                        debug!(tx_id = ?tx.id, reason = %reason, "Transaction not selected");
                        rejected.push(RejectedTx::new(tx, reason));
                    }
                    Err(CheckError::Fatal(err)) => return Err(err),
                }
            }

            if self.atomic && !parked.is_empty() && parked.len() != parked_len {
                parked_len = parked.len();
                debug!(parked = parked_len, "Retrying atomic members short of funds");
                pending = parked.into_iter().map(|rejected| rejected.tx).collect();
                continue;
            }
            break parked;
        };
        rejected.extend(parked);

        self.members = admitted;
        self.discarded.extend(rejected);

        if self.atomic && self.failure.is_none() {
            let origin = self
                .discarded
                .iter()
                .find(|rejected| rejected.reason != RejectReason::AtomicGroupFailed)
                .map(|rejected| (rejected.tx.id, rejected.reason.clone()));
            if let Some((failed_tx, reason)) = origin {
                self.fail(failed_tx, reason);
            } else if let Err((failed_tx, reason)) = self.assign_rq_offsets() {
                // Retried members move behind the ones that funded them
                self.fail(failed_tx, reason);
            }
        }

        // Drop the creations only rejected members needed
        self.create_l1_txs(processor, ctx)?;
        self.calc_fee_average();
        Ok(self.fee_accounts.clone())
    }

    fn admit<P, A>(
        &mut self,
        tx: &PoolTransaction,
        processor: &mut P,
        ctx: &GroupContext<'_, A>,
    ) -> Result<(), CheckError>
    where
        P: StateProcessor,
        A: AuthorizationSource + ?Sized,
    {
        let fee_idx = {
            let validator = Validator::new(processor.ledger());
            validator.check_structure(tx, ctx.auths, ctx.future)?;
            validator.check_balance_and_nonce(tx)?;
            validator
                .fee_account(ctx.coordinator, tx.token_id)?
                .ok_or(RejectReason::FeeAccountUnavailable { token_id: tx.token_id })?
        };

        let fee_map = BTreeMap::from([(tx.token_id, fee_idx)]);
        processor.apply_pool(&fee_map, tx)?;

        self.fee_accounts.insert(tx.token_id, fee_idx);
        Ok(())
    }

    /// Fails an atomic group: the origin keeps its reason, every other member is discarded
    /// as part of a failed group
    fn fail(&mut self, failed_tx: TxId, reason: RejectReason) {
        let id = self
            .members
            .iter()
            .chain(self.discarded.iter().map(|rejected| &rejected.tx))
            .find_map(|tx| tx.atomic_group_id)
            .unwrap_or(self.root);

        for tx in self.members.drain(..) {
            let member_reason = if tx.id == failed_tx {
                reason.clone()
            } else {
                RejectReason::AtomicGroupFailed
            };
            self.discarded.push(RejectedTx::new(tx, member_reason));
        }

        debug!(group = ?id, failed_tx = ?failed_tx, reason = %reason, "Atomic group failed");
        self.fee_accounts.clear();
        self.fee_average = 0.0;
        self.failure = Some(FailedAtomicGroup {
            id,
            failed_tx,
            reason,
        });
    }

    /// Truncates a non-atomic group to its most profitable prefix
    ///
    /// Scans prefix lengths from `len - 1` down to 1 and keeps the first one whose fee average
    /// beats the best seen so far, starting from the current average.
    ///
    /// # Returns
    /// `true` if any member was dropped
    pub fn prune(&mut self) -> bool {
        if self.atomic || self.members.is_empty() {
            return false;
        }

        let mut best_len = self.members.len();
        let mut best_average = self.fee_average;
        for len in (1..self.members.len()).rev() {
            let average = average_fee(&self.members[..len]);
            if average > best_average {
                best_len = len;
                best_average = average;
            }
        }

        if best_len == self.members.len() {
            return false;
        }
        debug!(txs = self.members.len(), kept = best_len, "Group pruned to its best prefix");
        self.truncate(best_len);
        true
    }

    /// Drops `n` members from the tail, or the whole group if atomic or `n` covers it
    ///
    /// # Returns
    /// `true` if the whole group was evicted
    pub fn pop_tx(&mut self, n: usize) -> bool {
        if self.atomic || n >= self.members.len() {
            self.pop_all_txs();
            return true;
        }
        self.truncate(self.members.len() - n);
        false
    }

    /// Evicts every member and resets the group
    pub fn pop_all_txs(&mut self) {
        for tx in self.members.drain(..) {
            self.discarded
                .push(RejectedTx::new(tx, RejectReason::CapacityExceeded));
        }
        self.fee_account_creations.clear();
        self.destination_creations.clear();
        self.fee_accounts.clear();
        self.fee_average = 0.0;
        self.first_position = 0;
    }

    fn truncate(&mut self, len: usize) {
        if len >= self.members.len() {
            return;
        }
        for tx in self.members.drain(len..) {
            self.discarded
                .push(RejectedTx::new(tx, RejectReason::CapacityExceeded));
        }
        self.calc_fee_average();
    }

    /// Credits every fee-collecting account with what the processor accumulated for it
    pub fn distribute_fee<P: StateProcessor>(&self, processor: &mut P) -> Result<(), SelectionError> {
        let credited = credit_accumulated_fees(processor)?;
        debug!(accounts = credited.len(), "Distributed accumulated fees");
        Ok(())
    }

    pub fn members(&self) -> &[PoolTransaction] {
        &self.members
    }

    pub fn discarded(&self) -> &[RejectedTx] {
        &self.discarded
    }

    pub fn into_discarded(self) -> Vec<RejectedTx> {
        self.discarded
    }

    pub fn fee_accounts(&self) -> &BTreeMap<TokenId, Idx> {
        &self.fee_accounts
    }

    pub fn fee_average(&self) -> f64 {
        self.fee_average
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn failure(&self) -> Option<&FailedAtomicGroup> {
        self.failure.as_ref()
    }

    /// Synthesized on-chain transactions, coordinator-originated first
    pub fn on_chain_txs(&self) -> impl Iterator<Item = &OnChainTransaction> {
        self.fee_account_creations
            .iter()
            .chain(self.destination_creations.iter())
            .map(|creation| &creation.tx)
    }

    /// Authorizations of [`Self::on_chain_txs`], in the same order
    pub fn auths(&self) -> impl Iterator<Item = &Bytes> {
        self.fee_account_creations
            .iter()
            .chain(self.destination_creations.iter())
            .map(|creation| &creation.auth)
    }

    pub fn l1_len(&self) -> usize {
        self.fee_account_creations.len() + self.destination_creations.len()
    }

    pub fn l2_len(&self) -> usize {
        self.members.len()
    }

    /// All transactions of the group, synthesized and pool
    pub fn len(&self) -> usize {
        self.l1_len() + self.l2_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn average_fee(txs: &[PoolTransaction]) -> f64 {
    if txs.is_empty() {
        return 0.0;
    }
    txs.iter().map(|tx| tx.absolute_fee).sum::<f64>() / txs.len() as f64
}
