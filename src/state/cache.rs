use crate::error::{AuthError, LedgerError};
use crate::state::{AuthorizationSource, Ledger};
use crate::types::{Account, CreationAuthorization, Idx, PublicKey, TokenId, IDX_USER_THRESHOLD};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// In-memory account ledger and authorization store
///
/// Backs the local processor, the binary and the tests. Accounts are kept ordered by index
/// so lookups by address resolve to the lowest matching index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateCache {
    #[serde(default)]
    accounts: BTreeMap<Idx, Account>,
    #[serde(default)]
    authorizations: HashMap<Address, CreationAuthorization>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&mut self, idx: Idx, account: Account) {
        self.accounts.insert(idx, account);
    }

    /// Stores `account` at the next free user index
    pub fn create_account(&mut self, account: Account) -> Idx {
        let idx = self
            .accounts
            .keys()
            .next_back()
            .map(|last| (*last + 1).max(IDX_USER_THRESHOLD))
            .unwrap_or(IDX_USER_THRESHOLD);
        self.accounts.insert(idx, account);
        idx
    }

    pub fn insert_authorization(&mut self, auth: CreationAuthorization) {
        self.authorizations.insert(auth.address, auth);
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Idx, &Account)> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Ledger for StateCache {
    fn get_account(&self, idx: Idx) -> Result<Account, LedgerError> {
        self.accounts.get(&idx).cloned().ok_or(LedgerError::NotFound)
    }

    fn update_account(&mut self, idx: Idx, account: Account) -> Result<H256, LedgerError> {
        let entry = self.accounts.get_mut(&idx).ok_or(LedgerError::NotFound)?;
        *entry = account;
        Ok(entry.leaf_hash(idx))
    }

    fn find_idx_by_address_and_key(
        &self,
        address: Address,
        key: PublicKey,
        token_id: TokenId,
    ) -> Result<Idx, LedgerError> {
        self.accounts
            .iter()
            .find(|(_, acc)| {
                acc.address == address && acc.public_key == key && acc.token_id == token_id
            })
            .map(|(idx, _)| *idx)
            .ok_or(LedgerError::NotFound)
    }

    fn find_idx_by_address(&self, address: Address, token_id: TokenId) -> Result<Idx, LedgerError> {
        self.accounts
            .iter()
            .find(|(_, acc)| acc.address == address && acc.token_id == token_id)
            .map(|(idx, _)| *idx)
            .ok_or(LedgerError::NotFound)
    }
}

impl AuthorizationSource for StateCache {
    fn get_creation_authorization(
        &self,
        address: Address,
    ) -> Result<CreationAuthorization, AuthError> {
        self.authorizations.get(&address).cloned().ok_or(AuthError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn account(address: Address, token_id: TokenId) -> Account {
        Account {
            token_id,
            address,
            public_key: PublicKey::zero(),
            balance: U256::from(100),
            nonce: 0,
        }
    }

    #[test]
    fn test_create_account_starts_at_user_threshold() {
        let mut cache = StateCache::new();
        let addr = Address::repeat_byte(1);

        assert_eq!(cache.create_account(account(addr, 0)), IDX_USER_THRESHOLD);
        assert_eq!(cache.create_account(account(addr, 1)), IDX_USER_THRESHOLD + 1);
        assert_eq!(cache.find_idx_by_address(addr, 1), Ok(IDX_USER_THRESHOLD + 1));
    }

    #[test]
    fn test_lookups_distinguish_not_found() {
        let mut cache = StateCache::new();
        assert_eq!(cache.get_account(300), Err(LedgerError::NotFound));
        assert_eq!(
            cache.update_account(300, account(Address::zero(), 0)),
            Err(LedgerError::NotFound)
        );
        assert_eq!(
            cache.get_creation_authorization(Address::zero()),
            Err(AuthError::NotFound)
        );
    }
}
