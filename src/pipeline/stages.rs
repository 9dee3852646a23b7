//! Pipeline stages
//!
//! Every stage is a task reading from a bounded queue and writing to the next one. Results
//! flow back to the caller through a shared outcome queue. A stage stops on its own when its
//! input closes, when the outcome queue is gone, or after reporting a failed atomic group.

use crate::config::SelectionConfig;
use crate::error::{CheckError, RejectReason, SelectionError};
use crate::pipeline::CapacityContext;
use crate::pool::FailedAtomicGroup;
use crate::state::{AuthorizationSource, StateProcessor};
use crate::types::{
    BatchNum, CoordinatorAccount, Idx, OnChainTransaction, PoolTransaction, RejectedTx, TxKind,
};
use crate::validation::{Destination, Validator};
use ethers::types::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

/// Where a rejected transaction ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionClass {
    /// May be selected in a later pass or batch
    NonSelected,
    /// Can never be forged
    Unforgeable,
}

impl RejectionClass {
    pub fn of(reason: &RejectReason) -> Self {
        match reason {
            RejectReason::UnsupportedMaxBatch { .. }
            | RejectReason::ExitZeroAmount
            | RejectReason::InvalidExitTarget { .. }
            | RejectReason::InvalidToIdx { .. }
            | RejectReason::InvalidToAddress
            | RejectReason::InvalidToKey
            | RejectReason::AccountNotCreatable { .. }
            | RejectReason::AuthorizationKeyMismatch { .. }
            | RejectReason::PendingFutureCreation => RejectionClass::Unforgeable,
            _ => RejectionClass::NonSelected,
        }
    }
}

/// What a stage reports back to the caller
#[derive(Debug)]
pub enum Outcome {
    Selected(PoolTransaction),
    Rejected {
        rejected: RejectedTx,
        class: RejectionClass,
    },
    /// An account creation was synthesized and applied
    Synthesized {
        tx: OnChainTransaction,
        auth: Bytes,
    },
    FailedGroup(FailedAtomicGroup),
    Fatal(SelectionError),
}

/// Creation waiting to be applied, with the channel its result is acknowledged on
pub type CreationRequest = (OnChainTransaction, oneshot::Sender<Result<(), SelectionError>>);

/// Verified pool transaction, with the channel signalled once the applier is done with it
pub type ApplyRequest = (PoolTransaction, oneshot::Sender<()>);

/// Reports a rejection
///
/// # Returns
/// `false` when the stage must stop: the rejection failed an atomic group, or nobody is
/// listening anymore
async fn reject(outcomes: &mpsc::Sender<Outcome>, tx: PoolTransaction, reason: RejectReason) -> bool {
    if let Some(id) = tx.atomic_group_id {
        debug!(group = ?id, tx_id = ?tx.id, reason = %reason, "Atomic group failed");
        let failed = FailedAtomicGroup {
            id,
            failed_tx: tx.id,
            reason,
        };
        let _ = outcomes.send(Outcome::FailedGroup(failed)).await;
        return false;
    }

    let class = RejectionClass::of(&reason);
    debug!(tx_id = ?tx.id, reason = %reason, ?class, "Transaction rejected");
    outcomes
        .send(Outcome::Rejected {
            rejected: RejectedTx::new(tx, reason),
            class,
        })
        .await
        .is_ok()
}

pub async fn feed(txs: Vec<PoolTransaction>, out: mpsc::Sender<PoolTransaction>) {
    for tx in txs {
        if out.send(tx).await.is_err() {
            return;
        }
    }
}

/// Rejects transactions whose validity window ends before `next_batch`
pub async fn check_max_batch(
    next_batch: BatchNum,
    mut input: mpsc::Receiver<PoolTransaction>,
    out: mpsc::Sender<PoolTransaction>,
    outcomes: mpsc::Sender<Outcome>,
) {
    while let Some(tx) = input.recv().await {
        if let Some(max_valid_batch) = tx.max_valid_batch.filter(|max| *max < next_batch) {
            let reason = RejectReason::UnsupportedMaxBatch {
                max_valid_batch,
                next_batch,
            };
            if !reject(&outcomes, tx, reason).await {
                return;
            }
            continue;
        }
        if out.send(tx).await.is_err() {
            return;
        }
    }
}

/// Rejects exits that move nothing
pub async fn check_zero_exit(
    mut input: mpsc::Receiver<PoolTransaction>,
    out: mpsc::Sender<PoolTransaction>,
    outcomes: mpsc::Sender<Outcome>,
) {
    while let Some(tx) = input.recv().await {
        if tx.kind == TxKind::Exit && tx.amount.is_zero() {
            if !reject(&outcomes, tx, RejectReason::ExitZeroAmount).await {
                return;
            }
            continue;
        }
        if out.send(tx).await.is_err() {
            return;
        }
    }
}

/// Capacity, balance, nonce and destination checks
///
/// The only stage that touches the capacity counters, so the transactions it forwards are
/// counted in verification order. Before checking a sender that still has a forwarded
/// transaction in flight, or any atomic member, it waits for the pool applier to catch up.
pub struct VerifyStage<P, A: ?Sized> {
    pub processor: Arc<Mutex<P>>,
    pub auths: Arc<A>,
    pub config: SelectionConfig,
    pub coordinator: CoordinatorAccount,
    pub future: Arc<[OnChainTransaction]>,
    pub context: CapacityContext,
    pub applier: mpsc::Sender<CreationRequest>,
    /// Forwarded transactions not yet acknowledged by the pool applier, by sender
    pub in_flight: Vec<(Idx, oneshot::Receiver<()>)>,
}

impl<P, A> VerifyStage<P, A>
where
    P: StateProcessor + Send,
    A: AuthorizationSource + Send + Sync + ?Sized,
{
    /// Runs until the input closes, then hands the final counters to `done`
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<PoolTransaction>,
        out: mpsc::Sender<ApplyRequest>,
        outcomes: mpsc::Sender<Outcome>,
        done: oneshot::Sender<CapacityContext>,
    ) {
        while let Some(tx) = input.recv().await {
            match self.verify(&tx, &outcomes).await {
                Ok(()) => {
                    self.context.l2 += 1;
                    let from = tx.from_idx;
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if out.send((tx, ack_tx)).await.is_err() {
                        return;
                    }
                    self.in_flight.push((from, ack_rx));
                }
                Err(CheckError::Reject(reason)) => {
                    if !reject(&outcomes, tx, reason).await {
                        return;
                    }
                }
                Err(CheckError::Fatal(err)) => {
                    let _ = outcomes.send(Outcome::Fatal(err)).await;
                    return;
                }
            }
        }
        let _ = done.send(self.context);
    }

    async fn verify(
        &mut self,
        tx: &PoolTransaction,
        outcomes: &mpsc::Sender<Outcome>,
    ) -> Result<(), CheckError> {
        // Step 1: Room for one more pool transaction
        if !self.context.can_add_pool_tx(&self.config) {
            return Err(RejectReason::CapacityExceeded.into());
        }

        // Balance and nonce must reflect what was already forwarded
        if tx.is_atomic() || self.in_flight.iter().any(|(from, _)| *from == tx.from_idx) {
            self.settle().await?;
        }

        // Step 2: Sender balance and nonce, fee account lookup
        let fee_idx = {
            let processor = self.processor.lock().await;
            let validator = Validator::new(processor.ledger());
            validator.check_balance_and_nonce(tx)?;
            validator.fee_account(&self.coordinator, tx.token_id)?
        };

        // Step 3: Fee-collecting account, created on first use
        if fee_idx.is_none() {
            if !self.context.can_add_creation(&self.config) {
                return Err(RejectReason::NoRoomForCreation.into());
            }
            let mut creation = OnChainTransaction::create_account(
                self.coordinator.address,
                self.coordinator.public_key,
                tx.token_id,
            );
            creation.position = self.context.reserve_l1();
            let auth = self.coordinator.creation_auth.clone();
            self.synthesize(creation, auth, outcomes).await?;
        }

        // Step 4: Destination, possibly creating it
        let destination = {
            let processor = self.processor.lock().await;
            Validator::new(processor.ledger()).resolve_destination(
                tx,
                self.auths.as_ref(),
                &self.future,
            )?
        };
        if let Destination::Create { tx: mut creation, auth } = destination {
            if !self.context.can_add_creation(&self.config) {
                return Err(RejectReason::NoRoomForCreation.into());
            }
            creation.position = self.context.reserve_l1();
            self.synthesize(creation, auth, outcomes).await?;
        }

        Ok(())
    }

    /// Waits until the pool applier has handled every forwarded transaction
    async fn settle(&mut self) -> Result<(), SelectionError> {
        for (_, ack) in self.in_flight.drain(..) {
            ack.await.map_err(|_| SelectionError::PipelineClosed)?;
        }
        Ok(())
    }

    /// Hands a creation to the on-chain applier and waits until it is applied
    async fn synthesize(
        &self,
        tx: OnChainTransaction,
        auth: Bytes,
        outcomes: &mpsc::Sender<Outcome>,
    ) -> Result<(), CheckError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.applier
            .send((tx.clone(), ack_tx))
            .await
            .map_err(|_| SelectionError::PipelineClosed)?;
        ack_rx.await.map_err(|_| SelectionError::PipelineClosed)??;

        debug!(
            address = ?tx.from_address,
            token_id = tx.token_id,
            position = tx.position,
            "New on-chain account creation"
        );
        outcomes
            .send(Outcome::Synthesized { tx, auth })
            .await
            .map_err(|_| SelectionError::PipelineClosed)?;
        Ok(())
    }
}

/// Applies synthesized creations in arrival order and acknowledges each
pub async fn apply_on_chain<P: StateProcessor + Send>(
    processor: Arc<Mutex<P>>,
    mut input: mpsc::Receiver<CreationRequest>,
) {
    while let Some((tx, ack)) = input.recv().await {
        let result = processor
            .lock()
            .await
            .apply_on_chain(&tx)
            .map(|_| ())
            .map_err(SelectionError::from);
        let _ = ack.send(result);
    }
}

/// Applies verified pool transactions through the processor
pub async fn apply_pool<P: StateProcessor + Send>(
    processor: Arc<Mutex<P>>,
    coordinator: CoordinatorAccount,
    mut input: mpsc::Receiver<ApplyRequest>,
    outcomes: mpsc::Sender<Outcome>,
) {
    while let Some((tx, ack)) = input.recv().await {
        let result = {
            let mut processor = processor.lock().await;
            apply_one(&mut *processor, &coordinator, &tx)
        };
        let _ = ack.send(());

        match result {
            Ok(()) => {
                if outcomes.send(Outcome::Selected(tx)).await.is_err() {
                    return;
                }
            }
            Err(CheckError::Reject(reason)) => {
                if !reject(&outcomes, tx, reason).await {
                    return;
                }
            }
            Err(CheckError::Fatal(err)) => {
                let _ = outcomes.send(Outcome::Fatal(err)).await;
                return;
            }
        }
    }
}

fn apply_one<P: StateProcessor>(
    processor: &mut P,
    coordinator: &CoordinatorAccount,
    tx: &PoolTransaction,
) -> Result<(), CheckError> {
    let fee_idx = Validator::new(processor.ledger())
        .fee_account(coordinator, tx.token_id)?
        .ok_or(SelectionError::UnknownFeeAccount(tx.token_id))?;

    processor.apply_pool(&BTreeMap::from([(tx.token_id, fee_idx)]), tx)?;
    Ok(())
}
