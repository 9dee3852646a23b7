use crate::error::{CheckError, LedgerError, RejectReason};
use crate::state::{AuthorizationSource, Ledger, OptionalExt};
use crate::types::{
    Account, CoordinatorAccount, Idx, OnChainKind, OnChainTransaction, PoolTransaction, PublicKey,
    TokenId, TxKind, IDX_EXIT, IDX_RESOLVE, IDX_USER_THRESHOLD, KEY_ONLY_ADDRESS,
};
use ethers::types::{Address, Bytes};
use tracing::debug;

/// Where the value of a pool transaction ends up
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Exit,
    /// The destination account already exists at this index
    Existing(Idx),
    /// The destination account must be created first by `tx`, carrying `auth`
    Create { tx: OnChainTransaction, auth: Bytes },
}

/// Read-only checks of pool transactions against a ledger snapshot
pub struct Validator<'a, L: Ledger> {
    ledger: &'a L,
}

impl<'a, L: Ledger> Validator<'a, L> {
    pub fn new(ledger: &'a L) -> Self {
        Self { ledger }
    }

    /// Structural checks of the destination
    ///
    /// Passes when the destination exists or can be created by a synthesized on-chain
    /// transaction in this batch.
    pub fn check_structure<A: AuthorizationSource + ?Sized>(
        &self,
        tx: &PoolTransaction,
        auths: &A,
        future: &[OnChainTransaction],
    ) -> Result<(), CheckError> {
        self.resolve_destination(tx, auths, future).map(|_| ())
    }

    /// Resolves the destination of `tx`
    ///
    /// # Arguments
    /// * `tx` - The pool transaction
    /// * `auths` - Store of creation authorizations for address destinations
    /// * `future` - On-chain transactions fixed for a later batch
    ///
    /// # Returns
    /// * `Ok(Destination)` when the transaction can be applied once the destination exists
    /// * `Err(CheckError::Reject)` with the reason it cannot
    /// * `Err(CheckError::Fatal)` on a storage failure
    pub fn resolve_destination<A: AuthorizationSource + ?Sized>(
        &self,
        tx: &PoolTransaction,
        auths: &A,
        future: &[OnChainTransaction],
    ) -> Result<Destination, CheckError> {
        match tx.kind {
            TxKind::Exit => {
                if tx.to_idx != IDX_EXIT {
                    return Err(RejectReason::InvalidExitTarget { to_idx: tx.to_idx }.into());
                }
                if tx.amount.is_zero() {
                    return Err(RejectReason::ExitZeroAmount.into());
                }
                Ok(Destination::Exit)
            }
            TxKind::Transfer => {
                if tx.to_idx < IDX_USER_THRESHOLD {
                    return Err(RejectReason::InvalidToIdx { to_idx: tx.to_idx }.into());
                }
                match self.ledger.get_account(tx.to_idx).optional()? {
                    Some(_) => Ok(Destination::Existing(tx.to_idx)),
                    None => Err(RejectReason::RecipientNotFound { to_idx: tx.to_idx }.into()),
                }
            }
            TxKind::TransferToAddress => self.resolve_address(tx, auths, future),
            TxKind::TransferToKey => self.resolve_key(tx, future),
        }
    }

    fn resolve_address<A: AuthorizationSource + ?Sized>(
        &self,
        tx: &PoolTransaction,
        auths: &A,
        future: &[OnChainTransaction],
    ) -> Result<Destination, CheckError> {
        if tx.to_idx != IDX_RESOLVE {
            return Err(RejectReason::InvalidToIdx { to_idx: tx.to_idx }.into());
        }
        let address = match tx.to_address {
            Some(address) if !address.is_zero() && address != KEY_ONLY_ADDRESS => address,
            _ => return Err(RejectReason::InvalidToAddress.into()),
        };
        let key = tx.to_key.filter(|key| !key.is_zero());

        let found = match key {
            Some(key) => self.ledger.find_idx_by_address_and_key(address, key, tx.token_id),
            None => self.ledger.find_idx_by_address(address, tx.token_id),
        };
        if let Some(idx) = found.optional()? {
            return Ok(Destination::Existing(idx));
        }

        if pending_future_creation(future, tx.token_id, address, key.unwrap_or_default()) {
            return Err(RejectReason::PendingFutureCreation.into());
        }

        let auth = auths
            .get_creation_authorization(address)
            .optional()?
            .ok_or(RejectReason::AccountNotCreatable { address })?;
        if let Some(key) = key {
            if auth.public_key != key {
                return Err(RejectReason::AuthorizationKeyMismatch { address }.into());
            }
        }

        debug!(tx_id = ?tx.id, address = ?auth.address, token_id = tx.token_id, "Destination needs account creation");
        Ok(Destination::Create {
            tx: OnChainTransaction::create_account(auth.address, auth.public_key, tx.token_id),
            auth: auth.signature,
        })
    }

    fn resolve_key(
        &self,
        tx: &PoolTransaction,
        future: &[OnChainTransaction],
    ) -> Result<Destination, CheckError> {
        if tx.to_idx != IDX_RESOLVE {
            return Err(RejectReason::InvalidToIdx { to_idx: tx.to_idx }.into());
        }
        let key = match tx.to_key {
            Some(key) if !key.is_zero() => key,
            _ => return Err(RejectReason::InvalidToKey.into()),
        };
        if let Some(address) = tx.to_address {
            if address != KEY_ONLY_ADDRESS && !address.is_zero() {
                return Err(RejectReason::InvalidToAddress.into());
            }
        }

        let found = self
            .ledger
            .find_idx_by_address_and_key(KEY_ONLY_ADDRESS, key, tx.token_id)
            .optional()?;
        if let Some(idx) = found {
            return Ok(Destination::Existing(idx));
        }
        if pending_future_creation(future, tx.token_id, KEY_ONLY_ADDRESS, key) {
            return Err(RejectReason::PendingFutureCreation.into());
        }

        // Key-only accounts need no authorization
        Ok(Destination::Create {
            tx: OnChainTransaction::create_account(KEY_ONLY_ADDRESS, key, tx.token_id),
            auth: Bytes::default(),
        })
    }

    /// Checks that the sender can pay amount plus fee and that the nonce is the current one
    pub fn check_balance_and_nonce(&self, tx: &PoolTransaction) -> Result<Account, CheckError> {
        let account = self
            .ledger
            .get_account(tx.from_idx)
            .optional()?
            .ok_or(RejectReason::SenderNotFound { from_idx: tx.from_idx })?;

        let required = tx.amount_and_fee();
        if account.balance < required {
            debug!(
                tx_id = ?tx.id,
                balance = %account.balance,
                required = %required,
                "Insufficient balance"
            );
            return Err(RejectReason::InsufficientFunds {
                balance: account.balance,
                required,
            }
            .into());
        }

        if tx.nonce != account.nonce {
            debug!(tx_id = ?tx.id, expected = account.nonce, got = tx.nonce, "Nonce check failed");
            return Err(RejectReason::InvalidNonce {
                expected: account.nonce,
                got: tx.nonce,
            }
            .into());
        }

        Ok(account)
    }

    /// Index of the coordinator's fee-collecting account for `token_id`, if it exists
    pub fn fee_account(
        &self,
        coordinator: &CoordinatorAccount,
        token_id: TokenId,
    ) -> Result<Option<Idx>, LedgerError> {
        self.ledger
            .find_idx_by_address_and_key(coordinator.address, coordinator.public_key, token_id)
            .optional()
    }
}

/// Whether an on-chain transaction fixed for a later batch will create the account
///
/// A zero `key` matches any key registered under `address`.
pub fn pending_future_creation(
    future: &[OnChainTransaction],
    token_id: TokenId,
    address: Address,
    key: PublicKey,
) -> bool {
    future.iter().any(|tx| {
        tx.kind == OnChainKind::CreateAccountDeposit
            && tx.from_address == address
            && tx.token_id == token_id
            && (tx.from_key == key || key.is_zero())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateCache;
    use crate::test_utils::{
        authorization, exit, seeded_cache, transfer, transfer_to_address, transfer_to_key,
    };
    use crate::types::CreationAuthorization;
    use ethers::types::U256;

    #[test]
    fn test_exit_must_target_exit_index_with_amount() {
        let cache = seeded_cache(&[(256, 0, 1_000, 0)]);
        let validator = Validator::new(&cache);

        let mut tx = exit(256, 0, 0, 1, 0);
        assert_eq!(
            validator.check_structure(&tx, &cache, &[]),
            Err(CheckError::Reject(RejectReason::ExitZeroAmount))
        );

        tx.amount = U256::from(10u64);
        tx.to_idx = 300;
        assert_eq!(
            validator.check_structure(&tx, &cache, &[]),
            Err(CheckError::Reject(RejectReason::InvalidExitTarget { to_idx: 300 }))
        );
    }

    #[test]
    fn test_transfer_requires_existing_recipient() {
        let cache = seeded_cache(&[(256, 0, 1_000, 0)]);
        let validator = Validator::new(&cache);

        assert_eq!(
            validator.check_structure(&transfer(256, 999, 0, 10, 1, 0), &cache, &[]),
            Err(CheckError::Reject(RejectReason::RecipientNotFound { to_idx: 999 }))
        );
    }

    #[test]
    fn test_address_destination_uses_stored_authorization() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0)]);
        let to = Address::repeat_byte(0x42);
        let validator_cache = cache.clone();
        let validator = Validator::new(&validator_cache);
        let tx = transfer_to_address(256, to, 0, 10, 1, 0);

        assert_eq!(
            validator.resolve_destination(&tx, &cache, &[]),
            Err(CheckError::Reject(RejectReason::AccountNotCreatable { address: to }))
        );

        cache.insert_authorization(authorization(to, PublicKey::repeat_byte(5)));
        match validator.resolve_destination(&tx, &cache, &[]) {
            Ok(Destination::Create { tx, auth }) => {
                assert_eq!(tx.from_address, to);
                assert_eq!(tx.from_key, PublicKey::repeat_byte(5));
                assert!(!auth.is_empty());
            }
            other => panic!("unexpected destination {other:?}"),
        }
    }

    #[test]
    fn test_authorization_key_mismatch_is_rejected() {
        let mut cache = StateCache::new();
        let to = Address::repeat_byte(0x42);
        cache.insert_authorization(CreationAuthorization {
            address: to,
            public_key: PublicKey::repeat_byte(1),
            signature: Bytes::from(vec![1, 2, 3]),
        });
        let validator = Validator::new(&cache);

        let mut tx = transfer_to_address(256, to, 0, 10, 1, 0);
        tx.to_key = Some(PublicKey::repeat_byte(2));
        assert_eq!(
            validator.resolve_destination(&tx, &cache, &[]),
            Err(CheckError::Reject(RejectReason::AuthorizationKeyMismatch { address: to }))
        );
    }

    #[test]
    fn test_future_creation_blocks_synthesis() {
        let cache = StateCache::new();
        let validator = Validator::new(&cache);
        let key = PublicKey::repeat_byte(9);
        let mut future = OnChainTransaction::create_account(KEY_ONLY_ADDRESS, key, 0);
        future.user_origin = true;

        assert_eq!(
            validator.resolve_destination(&transfer_to_key(256, key, 0, 10, 1, 0), &cache, &[future]),
            Err(CheckError::Reject(RejectReason::PendingFutureCreation))
        );
    }

    #[test]
    fn test_pending_future_creation_matches_empty_key() {
        let addr = Address::repeat_byte(3);
        let future = vec![OnChainTransaction::create_account(addr, PublicKey::repeat_byte(1), 5)];

        assert!(pending_future_creation(&future, 5, addr, PublicKey::repeat_byte(1)));
        assert!(pending_future_creation(&future, 5, addr, PublicKey::zero()));
        assert!(!pending_future_creation(&future, 5, addr, PublicKey::repeat_byte(2)));
        assert!(!pending_future_creation(&future, 6, addr, PublicKey::zero()));
    }

    #[test]
    fn test_balance_is_checked_before_nonce() {
        let cache = seeded_cache(&[(256, 0, 10, 3)]);
        let validator = Validator::new(&cache);

        assert!(matches!(
            validator.check_balance_and_nonce(&transfer(256, 257, 0, 10, 1, 0)),
            Err(CheckError::Reject(RejectReason::InsufficientFunds { .. }))
        ));
        assert_eq!(
            validator.check_balance_and_nonce(&transfer(256, 257, 0, 5, 1, 0)),
            Err(CheckError::Reject(RejectReason::InvalidNonce { expected: 3, got: 0 }))
        );
        assert!(validator.check_balance_and_nonce(&transfer(256, 257, 0, 5, 1, 3)).is_ok());
    }
}
