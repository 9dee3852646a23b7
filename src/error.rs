//! Error Types Module
//!
//! Two families of errors live here:
//! - [`RejectReason`]: transaction-scoped outcomes. A rejected transaction is routed to a
//!   discarded/non-selected/unforgeable list and the selection carries on.
//! - [`SelectionError`]: pass-fatal failures. They abort the whole selection pass and are
//!   surfaced to the caller, who decides whether to retry.
//!
//! The collaborator errors ([`LedgerError`], [`AuthError`], [`ProcessorError`]) always keep
//! "not found" apart from genuine storage failures.

use crate::types::{AtomicGroupId, BatchNum, Idx, TokenId, TxId};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a pool transaction was left out of the batch
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("Exit must target index 1, got {to_idx}")]
    InvalidExitTarget { to_idx: Idx },

    #[error("Exits with amount 0 make no sense, not accepting to prevent unintended transactions")]
    ExitZeroAmount,

    #[error("Tx not selected due to tx.ToIdx not found in the ledger. ToIdx: {to_idx}")]
    RecipientNotFound { to_idx: Idx },

    #[error("Sender account {from_idx} not found")]
    SenderNotFound { from_idx: Idx },

    #[error("Invalid ToIdx {to_idx}: transfers resolved by address or key must use index 0")]
    InvalidToIdx { to_idx: Idx },

    #[error("Invalid destination address")]
    InvalidToAddress,

    #[error("Invalid destination public key")]
    InvalidToKey,

    #[error("Recipient account not found and no creation authorization stored for {address:?}")]
    AccountNotCreatable { address: Address },

    #[error("Creation authorization for {address:?} was signed for a different public key")]
    AuthorizationKeyMismatch { address: Address },

    #[error("Tx not selected due to not enough balance at the sender. Balance: {balance}, Amount+Fee: {required}")]
    InsufficientFunds { balance: U256, required: U256 },

    #[error("Tx not selected due to not current nonce. Tx.Nonce: {got}, Account.Nonce: {expected}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("No fee account for token {token_id} yet, wait next batch")]
    FeeAccountUnavailable { token_id: TokenId },

    #[error("Tx not selected because the batch capacity was exceeded")]
    CapacityExceeded,

    #[error("Tx not selected because it needs an account creation and there is no room for it")]
    NoRoomForCreation,

    #[error("Tx not selected because it belongs to an atomic group with missing transactions or bad requested transaction")]
    InvalidAtomicGroup,

    #[error("Requested transaction could not be located inside the atomic group")]
    UnresolvedRqOffset,

    #[error("MaxValidBatch {max_valid_batch} exceeded by batch {next_batch}")]
    UnsupportedMaxBatch { max_valid_batch: BatchNum, next_batch: BatchNum },

    #[error("Recipient account does not exist yet and a pending on-chain transaction will create it in a future batch")]
    PendingFutureCreation,

    #[error("Tx not selected (in state transition) due to {0}")]
    ProcessorRejected(String),

    #[error("Atomic group failed")]
    AtomicGroupFailed,

    #[error("Unselectable atomic group {group:?}, tx {failed_tx:?} failed due to: {cause}")]
    AtomicGroupUnselectable { group: AtomicGroupId, failed_tx: TxId, cause: String },
}

impl RejectReason {
    /// Stable numeric code persisted next to the rejected transaction
    pub fn code(&self) -> u16 {
        match self {
            RejectReason::ExitZeroAmount => 1,
            RejectReason::UnsupportedMaxBatch { .. } => 2,
            RejectReason::InsufficientFunds { .. } => 11,
            RejectReason::InvalidNonce { .. } => 12,
            RejectReason::NoRoomForCreation => 13,
            RejectReason::InvalidToIdx { .. }
            | RejectReason::InvalidToAddress
            | RejectReason::InvalidToKey
            | RejectReason::AccountNotCreatable { .. }
            | RejectReason::AuthorizationKeyMismatch { .. }
            | RejectReason::PendingFutureCreation => 14,
            RejectReason::RecipientNotFound { .. } => 15,
            RejectReason::ProcessorRejected(_) => 16,
            RejectReason::CapacityExceeded => 17,
            RejectReason::InvalidAtomicGroup
            | RejectReason::UnresolvedRqOffset
            | RejectReason::AtomicGroupFailed
            | RejectReason::AtomicGroupUnselectable { .. } => 18,
            RejectReason::InvalidExitTarget { .. } => 19,
            RejectReason::SenderNotFound { .. } => 20,
            RejectReason::FeeAccountUnavailable { .. } => 21,
        }
    }

    /// Short machine-readable name of the reason
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::InvalidExitTarget { .. } => "ErrInvalidExitTarget",
            RejectReason::ExitZeroAmount => "ErrExit0Amount",
            RejectReason::RecipientNotFound { .. } => "ErrToIdxNotFound",
            RejectReason::SenderNotFound { .. } => "ErrSenderNotFound",
            RejectReason::InvalidToIdx { .. } => "ErrInvalidToIdx",
            RejectReason::InvalidToAddress => "ErrInvalidToAddress",
            RejectReason::InvalidToKey => "ErrInvalidToKey",
            RejectReason::AccountNotCreatable { .. } => "ErrAccountNotCreatable",
            RejectReason::AuthorizationKeyMismatch { .. } => "ErrAuthorizationKeyMismatch",
            RejectReason::InsufficientFunds { .. } => "ErrSenderNotEnoughBalance",
            RejectReason::InvalidNonce { .. } => "ErrNoCurrentNonce",
            RejectReason::FeeAccountUnavailable { .. } => "ErrFeeAccountUnavailable",
            RejectReason::CapacityExceeded => "ErrNoAvailableSlots",
            RejectReason::NoRoomForCreation => "ErrNotEnoughSpaceForCreation",
            RejectReason::InvalidAtomicGroup => "ErrInvalidAtomicGroup",
            RejectReason::UnresolvedRqOffset => "ErrUnresolvedRqOffset",
            RejectReason::UnsupportedMaxBatch { .. } => "ErrUnsupportedMaxNumBatch",
            RejectReason::PendingFutureCreation => "ErrPendingFutureCreation",
            RejectReason::ProcessorRejected(_) => "ErrTxDiscardedInProcessor",
            RejectReason::AtomicGroupFailed => "ErrAtomicGroupFailed",
            RejectReason::AtomicGroupUnselectable { .. } => "ErrAtomicGroupUnselectable",
        }
    }
}

/// Failure of a ledger lookup or write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Account not found")]
    NotFound,

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Failure of an account-creation authorization lookup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Account creation authorization not found")]
    NotFound,

    #[error("Authorization storage error: {0}")]
    Storage(String),
}

/// Failure reported by the state-transition processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// The transition function refused the transaction
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Errors that abort the whole selection pass
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectionError {
    #[error("Empty txs")]
    EmptyGroup,

    #[error("Invalid TxGroup")]
    InvalidGroup,

    #[error("Invalid RqOffset for relative position {0}")]
    InvalidRqOffset(i64),

    #[error("Could not get the fee account for TokenID={0}")]
    UnknownFeeAccount(TokenId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("State processor error: {0}")]
    Processor(String),

    #[error("Authorization source error: {0}")]
    Authorization(String),

    #[error("Verification pipeline closed before all transactions were resolved")]
    PipelineClosed,
}

impl From<ProcessorError> for SelectionError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::Ledger(err) => SelectionError::Ledger(err),
            ProcessorError::Rejected(msg) => SelectionError::Processor(msg),
        }
    }
}

impl From<AuthError> for SelectionError {
    fn from(err: AuthError) -> Self {
        SelectionError::Authorization(err.to_string())
    }
}

/// Outcome of a single validation check
///
/// `Reject` is recorded against the transaction, `Fatal` aborts the pass.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckError {
    Reject(RejectReason),
    Fatal(SelectionError),
}

impl From<RejectReason> for CheckError {
    fn from(reason: RejectReason) -> Self {
        CheckError::Reject(reason)
    }
}

impl From<SelectionError> for CheckError {
    fn from(err: SelectionError) -> Self {
        CheckError::Fatal(err)
    }
}

impl From<LedgerError> for CheckError {
    fn from(err: LedgerError) -> Self {
        CheckError::Fatal(SelectionError::Ledger(err))
    }
}

impl From<ProcessorError> for CheckError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::Rejected(msg) => CheckError::Reject(RejectReason::ProcessorRejected(msg)),
            ProcessorError::Ledger(LedgerError::NotFound) => CheckError::Reject(
                RejectReason::ProcessorRejected(LedgerError::NotFound.to_string()),
            ),
            ProcessorError::Ledger(err) => CheckError::Fatal(SelectionError::Ledger(err)),
        }
    }
}

impl From<AuthError> for CheckError {
    fn from(err: AuthError) -> Self {
        CheckError::Fatal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_rejection_becomes_fatal_message() {
        let err: SelectionError = ProcessorError::Rejected("boom".into()).into();
        assert_eq!(err, SelectionError::Processor("boom".into()));

        let err: SelectionError = ProcessorError::Ledger(LedgerError::NotFound).into();
        assert_eq!(err, SelectionError::Ledger(LedgerError::NotFound));
    }

    #[test]
    fn test_reject_codes_are_stable() {
        assert_eq!(RejectReason::ExitZeroAmount.code(), 1);
        assert_eq!(RejectReason::CapacityExceeded.code(), 17);
        assert_eq!(RejectReason::InvalidAtomicGroup.kind(), "ErrInvalidAtomicGroup");
    }

    #[test]
    fn test_processor_errors_split_into_reject_and_fatal() {
        let check: CheckError = ProcessorError::Rejected("nonce".into()).into();
        assert_eq!(check, CheckError::Reject(RejectReason::ProcessorRejected("nonce".into())));

        let check: CheckError = ProcessorError::Ledger(LedgerError::Storage("disk".into())).into();
        assert!(matches!(check, CheckError::Fatal(SelectionError::Ledger(_))));
    }
}
