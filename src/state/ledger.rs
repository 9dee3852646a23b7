//! Collaborator contracts
//!
//! The selector never owns the authenticated account tree. It reads and writes it through
//! [`Ledger`], looks up creation permissions through [`AuthorizationSource`], and applies
//! transactions through a [`StateProcessor`] that owns the speculative ledger.

use crate::error::{AuthError, LedgerError, ProcessorError};
use crate::types::{
    Account, CreationAuthorization, Idx, OnChainTransaction, PoolTransaction, PublicKey, TokenId,
};
use ethers::types::{Address, H256, U256};
use std::collections::BTreeMap;
use tracing::debug;

/// Account storage the selector validates against
pub trait Ledger {
    fn get_account(&self, idx: Idx) -> Result<Account, LedgerError>;

    /// Writes `account` at `idx` and returns the new leaf hash
    fn update_account(&mut self, idx: Idx, account: Account) -> Result<H256, LedgerError>;

    fn find_idx_by_address_and_key(
        &self,
        address: Address,
        key: PublicKey,
        token_id: TokenId,
    ) -> Result<Idx, LedgerError>;

    fn find_idx_by_address(&self, address: Address, token_id: TokenId) -> Result<Idx, LedgerError>;
}

/// Store of signed account-creation permissions
pub trait AuthorizationSource {
    fn get_creation_authorization(
        &self,
        address: Address,
    ) -> Result<CreationAuthorization, AuthError>;
}

/// Effect of applying one transaction through the [`StateProcessor`]
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTx {
    /// Index of the origin account (the created account for creations)
    pub idx: Idx,
    pub account: Account,
    /// Whether the origin account was created by this transaction
    pub created: bool,
    /// Destination account after the transaction, when it has one
    pub receiver: Option<(Idx, Account)>,
}

/// Authenticated state-transition function over the speculative ledger
pub trait StateProcessor {
    type Ledger: Ledger;

    fn ledger(&self) -> &Self::Ledger;

    fn ledger_mut(&mut self) -> &mut Self::Ledger;

    /// Fees accumulated per fee-collecting account since the last take
    fn accumulated_fees(&self) -> &BTreeMap<Idx, U256>;

    /// Returns the fee accumulator and resets it
    fn take_accumulated_fees(&mut self) -> BTreeMap<Idx, U256>;

    fn apply_on_chain(&mut self, tx: &OnChainTransaction) -> Result<AppliedTx, ProcessorError>;

    /// Applies a pool transaction, accumulating its fee for the account `fee_accounts`
    /// maps its token to
    fn apply_pool(
        &mut self,
        fee_accounts: &BTreeMap<TokenId, Idx>,
        tx: &PoolTransaction,
    ) -> Result<AppliedTx, ProcessorError>;

    /// Rolls the speculative ledger back to the start of the selection
    fn revert(&mut self) -> Result<(), ProcessorError>;
}

/// Turns a "not found" into `None` and keeps genuine failures as errors
pub trait OptionalExt<T, E> {
    fn optional(self) -> Result<Option<T>, E>;
}

impl<T> OptionalExt<T, LedgerError> for Result<T, LedgerError> {
    fn optional(self) -> Result<Option<T>, LedgerError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(LedgerError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl<T> OptionalExt<T, AuthError> for Result<T, AuthError> {
    fn optional(self) -> Result<Option<T>, AuthError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(AuthError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Credits every fee-collecting account with what the processor accumulated for it
///
/// # Returns
/// The accumulated amounts that were credited, keyed by account index
pub fn credit_accumulated_fees<P: StateProcessor>(
    processor: &mut P,
) -> Result<BTreeMap<Idx, U256>, LedgerError> {
    let fees = processor.take_accumulated_fees();
    let ledger = processor.ledger_mut();

    for (idx, amount) in &fees {
        let mut account = ledger.get_account(*idx)?;
        account.balance = account.balance.saturating_add(*amount);
        ledger.update_account(*idx, account)?;
        debug!(idx = *idx, amount = %amount, "Credited accumulated fee");
    }

    Ok(fees)
}
