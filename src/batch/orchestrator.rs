//! Batch Orchestrator Module
//!
//! Entry point of a selection. Two flows build the same [`Selection`]:
//!
//! # Grouped flow
//! 1. Revert the speculative ledger
//! 2. Build one [`Batch`]: groups are created, ranked and pruned to the limits
//! 3. While the batch dropped anything, rebuild it from the kept transactions only
//! 4. Credit the accumulated fees
//!
//! # Streaming flow
//! 1. Revert the speculative ledger and apply the fixed on-chain transactions
//! 2. Drop atomic groups that failed before or can never be forged, then schedule
//! 3. Run [`VerificationPipeline`] passes over the non-selected transactions until a pass
//!    selects nothing
//! 4. Credit the accumulated fees
//!
//! In both flows a failed atomic group restarts the selection without that group.

use crate::batch::Batch;
use crate::config::{Config, PipelineConfig, SelectionConfig};
use crate::error::SelectionError;
use crate::pipeline::{CapacityContext, VerificationPipeline};
use crate::pool::{filter_failed_atomic_groups, filter_invalid_atomic_groups, FailedAtomicGroup};
use crate::scheduler::Scheduler;
use crate::state::{credit_accumulated_fees, AuthorizationSource, StateProcessor};
use crate::types::{
    BatchNum, CoordinatorAccount, Idx, OnChainTransaction, PoolTransaction, RejectedTx, Selection,
    TxId,
};
use crate::validation::Validator;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Selection orchestrator
///
/// Owns the shared processor; a selection holds it for its whole duration.
pub struct BatchOrchestrator<P, A: ?Sized> {
    processor: Arc<Mutex<P>>,
    auths: Arc<A>,
    scheduler: Scheduler,
    config: SelectionConfig,
    pipeline: PipelineConfig,
    coordinator: CoordinatorAccount,
}

impl<P, A> BatchOrchestrator<P, A>
where
    P: StateProcessor + Send + 'static,
    A: AuthorizationSource + Send + Sync + ?Sized + 'static,
{
    /// Creates a new orchestrator
    ///
    /// # Arguments
    /// * `processor` - Processor owning the speculative ledger; `revert` must restore the
    ///   state the batch starts from
    /// * `auths` - Source of account-creation authorizations
    /// * `config` - Loaded configuration
    pub fn new(processor: Arc<Mutex<P>>, auths: Arc<A>, config: &Config) -> Self {
        Self {
            processor,
            auths,
            scheduler: Scheduler::new(),
            config: config.selection,
            pipeline: config.pipeline.clone(),
            coordinator: config.coordinator.account(),
        }
    }

    pub fn processor(&self) -> Arc<Mutex<P>> {
        self.processor.clone()
    }

    /// Selects the next batch by building and pruning transaction groups
    ///
    /// # Arguments
    /// * `pending` - Pending pool transactions
    /// * `fixed` - On-chain transactions fixed for this batch
    /// * `future` - On-chain transactions fixed for a later batch
    /// * `batch_num` - Number of the batch being built
    pub async fn select_grouped(
        &self,
        pending: Vec<PoolTransaction>,
        fixed: Vec<OnChainTransaction>,
        future: Vec<OnChainTransaction>,
        batch_num: BatchNum,
    ) -> Result<Selection, SelectionError> {
        let mut processor = self.processor.lock().await;
        let mut excluded: Vec<RejectedTx> = Vec::new();
        let mut excluded_ids: HashSet<TxId> = HashSet::new();
        let mut candidates = pending.clone();
        let mut dropped: Vec<RejectedTx> = Vec::new();

        loop {
            // Step 1: Start from the state the batch builds on
            processor.revert()?;
            debug!("Building batch {} from {} pool transactions", batch_num, candidates.len());

            // Step 2: Build, rank and prune
            let mut selection = {
                let mut batch = Batch::new(
                    &mut *processor,
                    self.auths.as_ref(),
                    self.config,
                    self.coordinator.clone(),
                );
                batch.create_groups(candidates.clone(), fixed.clone(), future.clone())?;

                if let Some((failure, members)) = batch.failed_atomic_group() {
                    warn!(
                        "Atomic group {:?} failed on tx {:?} ({}), restarting without it",
                        failure.id, failure.failed_tx, failure.reason
                    );
                    excluded_ids.extend(members.iter().map(|rejected| rejected.tx.id));
                    excluded.extend(members);
                    candidates = pending
                        .iter()
                        .filter(|tx| !excluded_ids.contains(&tx.id))
                        .cloned()
                        .collect();
                    dropped.clear();
                    continue;
                }

                batch.prune()?;
                batch.get_selection()
            };

            // Step 3: Rebuild from the kept transactions until a build drops nothing. A kept
            // group may rely on a creation made by a group that was just dropped
            if selection.selected.len() < candidates.len() {
                debug!(
                    "Batch {} kept {} of {} pool transactions, rebuilding",
                    batch_num,
                    selection.selected.len(),
                    candidates.len()
                );
                dropped.extend(selection.discarded);
                candidates = selection.selected;
                continue;
            }

            // Step 4: Fees
            credit_accumulated_fees(&mut *processor)?;
            dropped.append(&mut selection.discarded);
            dropped.extend(excluded);
            selection.discarded = dropped;

            let metadata = selection.metadata(batch_num);
            info!(
                "Batch {} selected: {} pool txs, {} on-chain txs, {} discarded, {} fee accounts",
                metadata.batch_num,
                metadata.selected_count,
                metadata.on_chain_count,
                metadata.discarded_count,
                metadata.fee_account_count
            );
            return Ok(selection);
        }
    }

    /// Selects the next batch with repeated streaming verification passes
    ///
    /// # Arguments
    /// * `pending` - Pending pool transactions
    /// * `fixed` - On-chain transactions fixed for this batch
    /// * `future` - On-chain transactions fixed for a later batch
    /// * `next_batch` - Number of the batch being built
    pub async fn select_streaming(
        &self,
        pending: Vec<PoolTransaction>,
        fixed: Vec<OnChainTransaction>,
        future: Vec<OnChainTransaction>,
        next_batch: BatchNum,
    ) -> Result<Selection, SelectionError> {
        let pipeline = VerificationPipeline::new(
            self.processor.clone(),
            self.auths.clone(),
            self.config,
            self.coordinator.clone(),
            &self.pipeline,
        )
        .with_future(future);
        let mut failed: Vec<FailedAtomicGroup> = Vec::new();

        'selection: loop {
            // Step 1: Fresh ledger with the fixed on-chain transactions applied
            {
                let mut processor = self.processor.lock().await;
                processor.revert()?;
                for tx in &fixed {
                    processor.apply_on_chain(tx)?;
                }
            }

            // Step 2: Pre-filters and ordering
            let (candidates, mut discarded) = filter_failed_atomic_groups(pending.clone(), &failed);
            let (candidates, invalid) = filter_invalid_atomic_groups(candidates);
            discarded.extend(invalid);
            let mut queue = self.scheduler.schedule(candidates);

            // Step 3: Passes until one makes no progress
            let mut context = CapacityContext::new(fixed.len(), 0, fixed.len());
            let mut selected = Vec::new();
            let mut synthesized = Vec::new();
            let mut auths = Vec::new();
            while !queue.is_empty() {
                let pass = pipeline.run(queue, next_batch, context).await?;
                if let Some(group) = pass.failed_group {
                    warn!(
                        "Atomic group {:?} failed on tx {:?} ({}), restarting selection",
                        group.id, group.failed_tx, group.reason
                    );
                    failed.push(group);
                    continue 'selection;
                }

                context = pass.context;
                synthesized.extend(pass.on_chain);
                auths.extend(pass.auths);
                discarded.extend(pass.unforgeable);

                if pass.selected.is_empty() {
                    discarded.extend(pass.non_selected);
                    break;
                }
                selected.extend(pass.selected);
                queue = pass.non_selected.into_iter().map(|rejected| rejected.tx).collect();
            }

            // Step 4: Fee-collecting accounts of what was selected
            let mut processor = self.processor.lock().await;
            let fee_accounts = fee_accounts_of(&*processor, &self.coordinator, &selected)?;
            credit_accumulated_fees(&mut *processor)?;

            let selection = Selection {
                fee_accounts: fee_accounts.into_iter().collect(),
                auths,
                fixed_on_chain: fixed,
                synthesized_on_chain: synthesized,
                selected,
                discarded,
            };

            let metadata = selection.metadata(next_batch);
            info!(
                "Batch {} selected: {} pool txs, {} on-chain txs, {} discarded, {} fee accounts",
                metadata.batch_num,
                metadata.selected_count,
                metadata.on_chain_count,
                metadata.discarded_count,
                metadata.fee_account_count
            );
            return Ok(selection);
        }
    }
}

fn fee_accounts_of<P: StateProcessor>(
    processor: &P,
    coordinator: &CoordinatorAccount,
    selected: &[PoolTransaction],
) -> Result<BTreeSet<Idx>, SelectionError> {
    let validator = Validator::new(processor.ledger());
    let mut idxs = BTreeSet::new();
    for tx in selected {
        let idx = validator
            .fee_account(coordinator, tx.token_id)?
            .ok_or(SelectionError::UnknownFeeAccount(tx.token_id))?;
        idxs.insert(idx);
    }
    Ok(idxs)
}
