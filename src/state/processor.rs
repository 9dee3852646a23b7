use crate::error::{LedgerError, ProcessorError};
use crate::state::{AppliedTx, Ledger, OptionalExt, StateCache, StateProcessor};
use crate::types::{
    Account, Idx, OnChainKind, OnChainTransaction, PoolTransaction, TokenId, TxKind, IDX_EXIT,
    IDX_USER_THRESHOLD, KEY_ONLY_ADDRESS,
};
use ethers::types::U256;
use std::collections::BTreeMap;
use tracing::debug;

/// Balance/nonce transition function over an in-memory [`StateCache`]
///
/// Keeps a checkpoint of the cache taken at construction (or at the last
/// [`LocalProcessor::checkpoint`]) that [`StateProcessor::revert`] restores.
#[derive(Debug, Clone)]
pub struct LocalProcessor {
    cache: StateCache,
    checkpoint: StateCache,
    fees: BTreeMap<Idx, U256>,
}

impl LocalProcessor {
    pub fn new(cache: StateCache) -> Self {
        Self {
            checkpoint: cache.clone(),
            cache,
            fees: BTreeMap::new(),
        }
    }

    /// Makes the current ledger the state `revert` goes back to
    pub fn checkpoint(&mut self) {
        self.checkpoint = self.cache.clone();
    }

    fn receiver_idx(&self, tx: &PoolTransaction) -> Result<Option<Idx>, ProcessorError> {
        let idx = match tx.kind {
            TxKind::Exit => return Ok(None),
            TxKind::Transfer => tx.to_idx,
            TxKind::TransferToAddress => {
                let address = tx.destination_address();
                let found = match tx.to_key {
                    Some(key) => self.cache.find_idx_by_address_and_key(address, key, tx.token_id),
                    None => self.cache.find_idx_by_address(address, tx.token_id),
                };
                found.optional()?.ok_or_else(|| {
                    ProcessorError::Rejected("destination account not found".into())
                })?
            }
            TxKind::TransferToKey => self
                .cache
                .find_idx_by_address_and_key(KEY_ONLY_ADDRESS, tx.destination_key(), tx.token_id)
                .optional()?
                .ok_or_else(|| ProcessorError::Rejected("destination account not found".into()))?,
        };
        Ok(Some(idx))
    }

    fn credit(&mut self, idx: Idx, amount: U256) -> Result<Account, ProcessorError> {
        let mut account = self.cache.get_account(idx)?;
        account.balance = account.balance.saturating_add(amount);
        self.cache.update_account(idx, account.clone())?;
        Ok(account)
    }
}

impl StateProcessor for LocalProcessor {
    type Ledger = StateCache;

    fn ledger(&self) -> &StateCache {
        &self.cache
    }

    fn ledger_mut(&mut self) -> &mut StateCache {
        &mut self.cache
    }

    fn accumulated_fees(&self) -> &BTreeMap<Idx, U256> {
        &self.fees
    }

    fn take_accumulated_fees(&mut self) -> BTreeMap<Idx, U256> {
        std::mem::take(&mut self.fees)
    }

    fn apply_on_chain(&mut self, tx: &OnChainTransaction) -> Result<AppliedTx, ProcessorError> {
        // Step 1: Resolve (or create) the origin account and apply the deposit
        let (idx, created) = match tx.kind {
            OnChainKind::CreateAccountDeposit => {
                let idx = self.cache.create_account(Account {
                    token_id: tx.token_id,
                    address: tx.from_address,
                    public_key: tx.from_key,
                    balance: tx.deposit_amount,
                    nonce: 0,
                });
                (idx, true)
            }
            _ => {
                if !tx.deposit_amount.is_zero() {
                    self.credit(tx.from_idx, tx.deposit_amount)?;
                }
                (tx.from_idx, false)
            }
        };

        let mut account = self.cache.get_account(idx)?;
        if account.token_id != tx.token_id {
            return Err(ProcessorError::Rejected(format!(
                "on-chain tx token {} does not match account token {}",
                tx.token_id, account.token_id
            )));
        }

        // Step 2: Move the amount. Forced transfers without funds are nullified, not rejected
        let mut receiver = None;
        if !tx.amount.is_zero() && account.balance >= tx.amount {
            let to_exit = tx.kind == OnChainKind::ForceExit || tx.to_idx == IDX_EXIT;
            if to_exit || tx.to_idx >= IDX_USER_THRESHOLD {
                account.balance -= tx.amount;
                self.cache.update_account(idx, account.clone())?;
                if !to_exit {
                    receiver = Some((tx.to_idx, self.credit(tx.to_idx, tx.amount)?));
                }
            }
        } else if !tx.amount.is_zero() {
            debug!(idx, amount = %tx.amount, "Nullified on-chain amount, not enough balance");
        }

        Ok(AppliedTx {
            idx,
            account: self.cache.get_account(idx)?,
            created,
            receiver,
        })
    }

    fn apply_pool(
        &mut self,
        fee_accounts: &BTreeMap<TokenId, Idx>,
        tx: &PoolTransaction,
    ) -> Result<AppliedTx, ProcessorError> {
        let mut sender = match self.cache.get_account(tx.from_idx) {
            Ok(account) => account,
            Err(LedgerError::NotFound) => {
                return Err(ProcessorError::Rejected(format!(
                    "sender account {} not found",
                    tx.from_idx
                )));
            }
            Err(err) => return Err(err.into()),
        };

        if sender.token_id != tx.token_id {
            return Err(ProcessorError::Rejected(format!(
                "tx token {} does not match sender token {}",
                tx.token_id, sender.token_id
            )));
        }
        if sender.nonce != tx.nonce {
            return Err(ProcessorError::Rejected(format!(
                "invalid nonce, account nonce {} tx nonce {}",
                sender.nonce, tx.nonce
            )));
        }
        let required = tx.amount_and_fee();
        if sender.balance < required {
            return Err(ProcessorError::Rejected(format!(
                "insufficient balance {} for amount+fee {}",
                sender.balance, required
            )));
        }
        let fee_idx = *fee_accounts.get(&tx.token_id).ok_or_else(|| {
            ProcessorError::Rejected(format!("no fee account for token {}", tx.token_id))
        })?;
        if self.cache.get_account(fee_idx).optional()?.is_none() {
            return Err(ProcessorError::Rejected(format!(
                "fee account {} not found",
                fee_idx
            )));
        }
        let receiver_idx = self.receiver_idx(tx)?;

        sender.balance -= required;
        sender.nonce += 1;
        self.cache.update_account(tx.from_idx, sender)?;

        let receiver = match receiver_idx {
            Some(to_idx) => Some((to_idx, self.credit(to_idx, tx.amount)?)),
            None => None,
        };

        let accumulated = self.fees.entry(fee_idx).or_insert_with(U256::zero);
        *accumulated = accumulated.saturating_add(tx.fee);

        Ok(AppliedTx {
            idx: tx.from_idx,
            account: self.cache.get_account(tx.from_idx)?,
            created: false,
            receiver,
        })
    }

    fn revert(&mut self) -> Result<(), ProcessorError> {
        self.cache = self.checkpoint.clone();
        self.fees.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seeded_cache, transfer};
    use ethers::types::Address;

    #[test]
    fn test_apply_pool_moves_funds_and_accumulates_fee() {
        let mut processor = LocalProcessor::new(seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]));
        let fee_accounts = BTreeMap::from([(0, 257)]);

        let tx = transfer(256, 257, 0, 100, 10, 0);
        let applied = processor.apply_pool(&fee_accounts, &tx).unwrap();

        assert_eq!(applied.account.balance, U256::from(890));
        assert_eq!(applied.account.nonce, 1);
        assert_eq!(applied.receiver.unwrap().1.balance, U256::from(100));
        assert_eq!(processor.accumulated_fees().get(&257), Some(&U256::from(10)));
    }

    #[test]
    fn test_apply_pool_rejects_without_fee_account() {
        let mut processor = LocalProcessor::new(seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]));
        let tx = transfer(256, 257, 0, 100, 10, 0);

        let err = processor.apply_pool(&BTreeMap::new(), &tx).unwrap_err();
        assert!(matches!(err, ProcessorError::Rejected(_)));
    }

    #[test]
    fn test_apply_pool_rejects_missing_fee_account() {
        let mut processor = LocalProcessor::new(seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]));
        let tx = transfer(256, 257, 0, 100, 10, 0);

        let err = processor.apply_pool(&BTreeMap::from([(0, 258)]), &tx).unwrap_err();
        assert!(matches!(err, ProcessorError::Rejected(_)));
        assert_eq!(processor.ledger().get_account(256).unwrap().nonce, 0);
        assert!(processor.accumulated_fees().is_empty());
    }

    #[test]
    fn test_revert_restores_checkpoint() {
        let mut processor = LocalProcessor::new(seeded_cache(&[(256, 0, 1_000, 0)]));
        processor
            .apply_on_chain(&OnChainTransaction::create_account(Address::repeat_byte(7), Default::default(), 0))
            .unwrap();
        assert_eq!(processor.ledger().len(), 2);

        processor.revert().unwrap();
        assert_eq!(processor.ledger().len(), 1);
        assert!(processor.accumulated_fees().is_empty());
    }
}
