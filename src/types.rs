use crate::error::RejectReason;
use ethers::types::{Address, Bytes, H160, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Account index inside the ledger
pub type Idx = u64;
/// Token identifier
pub type TokenId = u32;
/// Batch number
pub type BatchNum = u32;
/// Transaction identifier
pub type TxId = H256;
/// Identifier shared by the members of an atomic group
pub type AtomicGroupId = H256;
/// Compressed public key of an account
pub type PublicKey = H256;

/// `ToIdx` of a transfer whose destination is resolved by address and/or key
pub const IDX_RESOLVE: Idx = 0;
/// `ToIdx` of an exit
pub const IDX_EXIT: Idx = 1;
/// First index assigned to user accounts
pub const IDX_USER_THRESHOLD: Idx = 256;
/// Address under which key-only accounts are registered
pub const KEY_ONLY_ADDRESS: Address = H160([0xff; 20]);

/// Kind of a pool transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Exit,
    Transfer,
    TransferToAddress,
    TransferToKey,
}

/// User-signed transaction waiting in the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolTransaction {
    pub id: TxId,
    pub kind: TxKind,
    pub from_idx: Idx,
    pub to_idx: Idx,
    #[serde(default)]
    pub to_address: Option<Address>,
    #[serde(default)]
    pub to_key: Option<PublicKey>,
    pub token_id: TokenId,
    pub amount: U256,
    /// Fee in token units, debited from the sender
    pub fee: U256,
    /// Fee valued in a common unit, used to rank transactions and groups
    #[serde(default)]
    pub absolute_fee: f64,
    pub nonce: u64,
    #[serde(default)]
    pub atomic_group_id: Option<AtomicGroupId>,
    #[serde(default)]
    pub requested_tx_id: Option<TxId>,
    /// Encoded position of the requested transaction relative to this one
    #[serde(default)]
    pub rq_offset: u8,
    #[serde(default)]
    pub max_valid_batch: Option<BatchNum>,
}

impl PoolTransaction {
    pub fn is_atomic(&self) -> bool {
        self.atomic_group_id.is_some()
    }

    /// Amount plus fee, the total debited from the sender
    pub fn amount_and_fee(&self) -> U256 {
        self.amount.saturating_add(self.fee)
    }

    /// Address the destination account is registered under
    pub fn destination_address(&self) -> Address {
        match self.kind {
            TxKind::TransferToKey => KEY_ONLY_ADDRESS,
            _ => self.to_address.unwrap_or_default(),
        }
    }

    /// Public key of the destination, zero when unknown
    pub fn destination_key(&self) -> PublicKey {
        self.to_key.unwrap_or_default()
    }

    /// Content hash of the destination account
    pub fn destination_hash(&self) -> H256 {
        account_hash(self.destination_address(), self.destination_key(), self.token_id)
    }
}

/// Kind of an on-chain transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnChainKind {
    CreateAccountDeposit,
    Deposit,
    ForceTransfer,
    ForceExit,
}

/// Transaction fixed by the chain, or synthesized here to create a missing account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnChainTransaction {
    pub id: TxId,
    pub kind: OnChainKind,
    /// Slot inside the batch being built
    #[serde(default)]
    pub position: usize,
    /// `false` when the coordinator synthesized the transaction
    pub user_origin: bool,
    #[serde(default)]
    pub from_idx: Idx,
    pub from_address: Address,
    #[serde(default)]
    pub from_key: PublicKey,
    #[serde(default)]
    pub to_idx: Idx,
    pub token_id: TokenId,
    #[serde(default)]
    pub amount: U256,
    #[serde(default)]
    pub deposit_amount: U256,
}

impl OnChainTransaction {
    /// Zero-value account creation synthesized by the coordinator
    pub fn create_account(address: Address, key: PublicKey, token_id: TokenId) -> Self {
        Self {
            id: account_hash(address, key, token_id),
            kind: OnChainKind::CreateAccountDeposit,
            position: 0,
            user_origin: false,
            from_idx: 0,
            from_address: address,
            from_key: key,
            to_idx: 0,
            token_id,
            amount: U256::zero(),
            deposit_amount: U256::zero(),
        }
    }

    /// Content hash of the account this transaction originates from
    pub fn account_hash(&self) -> H256 {
        account_hash(self.from_address, self.from_key, self.token_id)
    }
}

/// Content hash identifying an account by (address, key, token)
pub fn account_hash(address: Address, key: PublicKey, token_id: TokenId) -> H256 {
    let mut data = Vec::with_capacity(32 + 20 + 4);
    data.extend_from_slice(key.as_bytes());
    data.extend_from_slice(address.as_bytes());
    data.extend_from_slice(&token_id.to_be_bytes());
    H256::from_slice(&keccak256(data))
}

/// Account state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub token_id: TokenId,
    pub address: Address,
    #[serde(default)]
    pub public_key: PublicKey,
    pub balance: U256,
    pub nonce: u64,
}

impl Account {
    /// Hash of the account leaf
    pub fn leaf_hash(&self, idx: Idx) -> H256 {
        let mut data = Vec::new();
        data.extend_from_slice(&idx.to_be_bytes());
        data.extend_from_slice(&self.token_id.to_be_bytes());
        data.extend_from_slice(self.address.as_bytes());
        data.extend_from_slice(self.public_key.as_bytes());

        let mut balance_bytes = [0u8; 32];
        self.balance.to_big_endian(&mut balance_bytes);
        data.extend_from_slice(&balance_bytes);

        data.extend_from_slice(&self.nonce.to_be_bytes());
        H256::from_slice(&keccak256(data))
    }
}

/// Identity the coordinator collects fees with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorAccount {
    pub address: Address,
    pub public_key: PublicKey,
    /// Pre-obtained authorization to create the coordinator's accounts
    pub creation_auth: Bytes,
}

/// Signed permission to create an account on behalf of `address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationAuthorization {
    pub address: Address,
    pub public_key: PublicKey,
    pub signature: Bytes,
}

/// Pool transaction left out of the batch, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTx {
    pub tx: PoolTransaction,
    pub reason: RejectReason,
}

impl RejectedTx {
    pub fn new(tx: PoolTransaction, reason: RejectReason) -> Self {
        Self { tx, reason }
    }
}

/// Membership and application order of the next batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Fee-collecting account indices, deduplicated and ascending
    pub fee_accounts: Vec<Idx>,
    /// Creation authorizations of the synthesized on-chain transactions
    pub auths: Vec<Bytes>,
    /// On-chain transactions fixed by the chain
    pub fixed_on_chain: Vec<OnChainTransaction>,
    /// Account creations synthesized for this batch
    pub synthesized_on_chain: Vec<OnChainTransaction>,
    /// Admitted pool transactions in application order
    pub selected: Vec<PoolTransaction>,
    pub discarded: Vec<RejectedTx>,
}

impl Selection {
    /// Total transactions taking a slot in the batch
    pub fn len(&self) -> usize {
        self.fixed_on_chain.len() + self.synthesized_on_chain.len() + self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summary used for logging
    pub fn metadata(&self, batch_num: BatchNum) -> SelectionMetadata {
        SelectionMetadata {
            batch_num,
            selected_count: self.selected.len(),
            discarded_count: self.discarded.len(),
            on_chain_count: self.fixed_on_chain.len() + self.synthesized_on_chain.len(),
            fee_account_count: self.fee_accounts.len(),
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }
}

/// Selection summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionMetadata {
    pub batch_num: BatchNum,
    pub selected_count: usize,
    pub discarded_count: usize,
    pub on_chain_count: usize,
    pub fee_account_count: usize,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_hash_distinguishes_tokens() {
        let addr = Address::repeat_byte(0x11);
        let key = PublicKey::repeat_byte(0x22);
        assert_ne!(account_hash(addr, key, 0), account_hash(addr, key, 1));
        assert_eq!(account_hash(addr, key, 7), account_hash(addr, key, 7));
    }

    #[test]
    fn test_create_account_is_zero_valued() {
        let tx = OnChainTransaction::create_account(Address::repeat_byte(1), PublicKey::zero(), 33);
        assert_eq!(tx.kind, OnChainKind::CreateAccountDeposit);
        assert!(!tx.user_origin);
        assert!(tx.amount.is_zero());
        assert!(tx.deposit_amount.is_zero());
        assert_eq!(tx.account_hash(), account_hash(Address::repeat_byte(1), PublicKey::zero(), 33));
    }

    #[test]
    fn test_key_only_destination_uses_reserved_address() {
        let tx = PoolTransaction {
            id: TxId::repeat_byte(1),
            kind: TxKind::TransferToKey,
            from_idx: 256,
            to_idx: IDX_RESOLVE,
            to_address: None,
            to_key: Some(PublicKey::repeat_byte(9)),
            token_id: 0,
            amount: U256::from(10),
            fee: U256::from(1),
            absolute_fee: 0.0,
            nonce: 0,
            atomic_group_id: None,
            requested_tx_id: None,
            rq_offset: 0,
            max_valid_batch: None,
        };
        assert_eq!(tx.destination_address(), KEY_ONLY_ADDRESS);
        assert_eq!(tx.amount_and_fee(), U256::from(11));
    }
}
