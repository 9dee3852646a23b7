//! Shared test fixtures

use crate::config::{Config, CoordinatorConfig, PipelineConfig, SelectionConfig};
use crate::state::{Ledger, StateCache};
use crate::types::{
    Account, CoordinatorAccount, CreationAuthorization, Idx, PoolTransaction, PublicKey, TokenId,
    TxId, TxKind, IDX_EXIT, IDX_RESOLVE,
};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1_000_000);

pub fn tx_id(n: u64) -> TxId {
    H256::from_low_u64_be(n)
}

/// Address the seeded account at `idx` is registered under
pub fn address_of(idx: Idx) -> Address {
    Address::from_low_u64_be(idx)
}

/// Cache seeded with `(idx, token, balance, nonce)` accounts
pub fn seeded_cache(accounts: &[(Idx, TokenId, u64, u64)]) -> StateCache {
    let mut cache = StateCache::new();
    for (idx, token_id, balance, nonce) in accounts {
        cache.insert_account(
            *idx,
            Account {
                token_id: *token_id,
                address: address_of(*idx),
                public_key: PublicKey::zero(),
                balance: U256::from(*balance),
                nonce: *nonce,
            },
        );
    }
    cache
}

pub fn coordinator() -> CoordinatorAccount {
    CoordinatorAccount {
        address: Address::repeat_byte(0xc0),
        public_key: PublicKey::repeat_byte(0xc1),
        creation_auth: Bytes::from(vec![0xcc; 65]),
    }
}

/// Creates the coordinator's fee account for `token_id` and returns its index
pub fn add_fee_account(cache: &mut StateCache, token_id: TokenId) -> Idx {
    let coordinator = coordinator();
    cache.create_account(Account {
        token_id,
        address: coordinator.address,
        public_key: coordinator.public_key,
        balance: U256::zero(),
        nonce: 0,
    })
}

pub fn authorization(address: Address, public_key: PublicKey) -> CreationAuthorization {
    CreationAuthorization {
        address,
        public_key,
        signature: Bytes::from(vec![0xaa; 65]),
    }
}

pub fn selection_config(max_tx: usize, max_l1_tx: usize, max_fee_tx: usize) -> SelectionConfig {
    SelectionConfig {
        max_tx,
        max_l1_tx,
        max_fee_tx,
        tree_depth: 32,
        chain_id: 0,
    }
}

/// Full configuration around [`selection_config`] and [`coordinator`]
pub fn config(max_tx: usize, max_l1_tx: usize, max_fee_tx: usize) -> Config {
    let coordinator = coordinator();
    Config {
        selection: selection_config(max_tx, max_l1_tx, max_fee_tx),
        coordinator: CoordinatorConfig {
            address: coordinator.address,
            public_key: coordinator.public_key,
            creation_auth: coordinator.creation_auth,
        },
        pipeline: PipelineConfig::default(),
    }
}

fn pool_tx(kind: TxKind, from: Idx, to: Idx, token_id: TokenId, amount: u64, fee: u64, nonce: u64) -> PoolTransaction {
    PoolTransaction {
        id: tx_id(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        kind,
        from_idx: from,
        to_idx: to,
        to_address: None,
        to_key: None,
        token_id,
        amount: U256::from(amount),
        fee: U256::from(fee),
        absolute_fee: fee as f64,
        nonce,
        atomic_group_id: None,
        requested_tx_id: None,
        rq_offset: 0,
        max_valid_batch: None,
    }
}

pub fn transfer(from: Idx, to: Idx, token_id: TokenId, amount: u64, fee: u64, nonce: u64) -> PoolTransaction {
    pool_tx(TxKind::Transfer, from, to, token_id, amount, fee, nonce)
}

pub fn exit(from: Idx, token_id: TokenId, amount: u64, fee: u64, nonce: u64) -> PoolTransaction {
    pool_tx(TxKind::Exit, from, IDX_EXIT, token_id, amount, fee, nonce)
}

pub fn transfer_to_address(
    from: Idx,
    to: Address,
    token_id: TokenId,
    amount: u64,
    fee: u64,
    nonce: u64,
) -> PoolTransaction {
    let mut tx = pool_tx(TxKind::TransferToAddress, from, IDX_RESOLVE, token_id, amount, fee, nonce);
    tx.to_address = Some(to);
    tx
}

pub fn transfer_to_key(
    from: Idx,
    key: PublicKey,
    token_id: TokenId,
    amount: u64,
    fee: u64,
    nonce: u64,
) -> PoolTransaction {
    let mut tx = pool_tx(TxKind::TransferToKey, from, IDX_RESOLVE, token_id, amount, fee, nonce);
    tx.to_key = Some(key);
    tx
}

/// Two transfers between 256 and 257 requesting each other, consecutive and pre-encoded
pub fn atomic_pair(seed: u64) -> (PoolTransaction, PoolTransaction) {
    let group = H256::from_low_u64_be(0xa70_0000 + seed);
    let mut a = transfer(256, 257, 0, 10, 1, 0);
    let mut b = transfer(257, 256, 0, 10, 1, 0);
    a.id = tx_id(seed * 10 + 1);
    b.id = tx_id(seed * 10 + 2);
    a.atomic_group_id = Some(group);
    b.atomic_group_id = Some(group);
    a.requested_tx_id = Some(b.id);
    b.requested_tx_id = Some(a.id);
    a.rq_offset = 1;
    b.rq_offset = 7;
    (a, b)
}

pub fn balance_of<L: Ledger>(ledger: &L, idx: Idx) -> U256 {
    ledger
        .get_account(idx)
        .map(|account| account.balance)
        .unwrap_or_default()
}
