//! Verification Pipeline Module
//!
//! One streaming selection pass over an ordered list of pool transactions. The checks run as
//! concurrent stages connected by bounded queues:
//!
//! 1. Feed
//! 2. Validity window against the batch being built
//! 3. Zero-amount exits
//! 4. Capacity, balance, nonce and destination checks, synthesizing account creations
//! 5. Application through the state processor
//!
//! Creations are applied by a dedicated task; the verify stage waits for each one before it
//! forwards the transaction that needed it. It also waits for the pool applier before
//! checking a sender with a transaction still in flight, and before any atomic member.
//! The first atomic failure aborts the pass.

mod context;
mod stages;

#[cfg(test)]
mod tests;

pub use context::CapacityContext;
pub use stages::RejectionClass;

use crate::config::{PipelineConfig, SelectionConfig};
use crate::error::SelectionError;
use crate::pool::FailedAtomicGroup;
use crate::state::{AuthorizationSource, StateProcessor};
use crate::types::{BatchNum, CoordinatorAccount, OnChainTransaction, PoolTransaction, RejectedTx};
use ethers::types::Bytes;
use stages::{Outcome, VerifyStage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Result of one pass
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    /// Applied transactions, in application order
    pub selected: Vec<PoolTransaction>,
    /// Rejected for now, may succeed in a later pass
    pub non_selected: Vec<RejectedTx>,
    /// Can never be forged
    pub unforgeable: Vec<RejectedTx>,
    /// Creations synthesized during the pass, in position order
    pub on_chain: Vec<OnChainTransaction>,
    /// Authorizations of `on_chain`, in the same order
    pub auths: Vec<Bytes>,
    /// Set when an atomic member was rejected; the rest of the pass is then void
    pub failed_group: Option<FailedAtomicGroup>,
    /// Counters after the pass
    pub context: CapacityContext,
}

/// Streaming verifier sharing one processor between its stages
pub struct VerificationPipeline<P, A: ?Sized> {
    processor: Arc<Mutex<P>>,
    auths: Arc<A>,
    config: SelectionConfig,
    coordinator: CoordinatorAccount,
    future: Arc<[OnChainTransaction]>,
    channel_capacity: usize,
}

impl<P, A> VerificationPipeline<P, A>
where
    P: StateProcessor + Send + 'static,
    A: AuthorizationSource + Send + Sync + ?Sized + 'static,
{
    pub fn new(
        processor: Arc<Mutex<P>>,
        auths: Arc<A>,
        config: SelectionConfig,
        coordinator: CoordinatorAccount,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            processor,
            auths,
            config,
            coordinator,
            future: Arc::from(Vec::new()),
            channel_capacity: pipeline.channel_capacity.max(1),
        }
    }

    /// On-chain transactions fixed for a later batch, consulted before creating accounts
    pub fn with_future(mut self, future: Vec<OnChainTransaction>) -> Self {
        self.future = Arc::from(future);
        self
    }

    /// Verifies and applies `txs` in order
    ///
    /// # Arguments
    /// * `txs` - Scheduled pool transactions
    /// * `next_batch` - Number of the batch being built
    /// * `context` - Counters left by the fixed on-chain transactions and earlier passes
    ///
    /// # Returns
    /// * `Ok(PassOutcome)` once every transaction is resolved, or early with `failed_group`
    ///   set when an atomic member is rejected
    /// * `Err` on a collaborator failure or if a stage dies
    pub async fn run(
        &self,
        txs: Vec<PoolTransaction>,
        next_batch: BatchNum,
        context: CapacityContext,
    ) -> Result<PassOutcome, SelectionError> {
        let total = txs.len();
        let capacity = self.channel_capacity;
        debug!(txs = total, next_batch, ?context, "Starting verification pass");

        // Step 1: Wire the stages
        let (feed_tx, feed_rx) = mpsc::channel(capacity);
        let (window_tx, window_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = mpsc::channel(capacity);
        let (verified_tx, verified_rx) = mpsc::channel(capacity);
        let (creation_tx, creation_rx) = mpsc::channel(capacity);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = oneshot::channel();

        let verify = VerifyStage {
            processor: self.processor.clone(),
            auths: self.auths.clone(),
            config: self.config,
            coordinator: self.coordinator.clone(),
            future: self.future.clone(),
            context,
            applier: creation_tx,
            in_flight: Vec::new(),
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(stages::feed(txs, feed_tx));
        tasks.spawn(stages::check_max_batch(
            next_batch,
            feed_rx,
            window_tx,
            outcome_tx.clone(),
        ));
        tasks.spawn(stages::check_zero_exit(window_rx, exit_tx, outcome_tx.clone()));
        tasks.spawn(verify.run(exit_rx, verified_tx, outcome_tx.clone(), done_tx));
        tasks.spawn(stages::apply_on_chain(self.processor.clone(), creation_rx));
        tasks.spawn(stages::apply_pool(
            self.processor.clone(),
            self.coordinator.clone(),
            verified_rx,
            outcome_tx,
        ));

        // Step 2: Collect until every transaction is resolved
        let mut pass = PassOutcome {
            context,
            ..PassOutcome::default()
        };
        let mut resolved = 0;
        while resolved < total {
            let Some(outcome) = outcome_rx.recv().await else {
                tasks.shutdown().await;
                return Err(SelectionError::PipelineClosed);
            };

            match outcome {
                Outcome::Selected(tx) => {
                    resolved += 1;
                    pass.selected.push(tx);
                }
                Outcome::Rejected { rejected, class } => {
                    resolved += 1;
                    match class {
                        RejectionClass::NonSelected => pass.non_selected.push(rejected),
                        RejectionClass::Unforgeable => pass.unforgeable.push(rejected),
                    }
                }
                Outcome::Synthesized { tx, auth } => {
                    pass.on_chain.push(tx);
                    pass.auths.push(auth);
                }
                Outcome::FailedGroup(group) => {
                    warn!(group = ?group.id, failed_tx = ?group.failed_tx, reason = %group.reason, "Aborting pass on failed atomic group");
                    tasks.shutdown().await;
                    pass.failed_group = Some(group);
                    return Ok(pass);
                }
                Outcome::Fatal(err) => {
                    error!(error = %err, "Aborting pass");
                    tasks.shutdown().await;
                    return Err(err);
                }
            }
        }

        // Step 3: Let the stages drain and hand back the counters
        pass.context = done_rx.await.map_err(|_| SelectionError::PipelineClosed)?;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Pipeline stage died");
                return Err(SelectionError::PipelineClosed);
            }
        }

        debug!(
            selected = pass.selected.len(),
            non_selected = pass.non_selected.len(),
            unforgeable = pass.unforgeable.len(),
            synthesized = pass.on_chain.len(),
            "Verification pass finished"
        );
        Ok(pass)
    }
}
