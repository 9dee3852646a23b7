//! Tests for the streaming verification pipeline

#[cfg(test)]
mod tests {
    use crate::config::{PipelineConfig, SelectionConfig};
    use crate::error::RejectReason;
    use crate::pipeline::{CapacityContext, VerificationPipeline};
    use crate::state::{LocalProcessor, StateCache, StateProcessor};
    use crate::test_utils::{
        add_fee_account, atomic_pair, authorization, balance_of, coordinator, exit, seeded_cache,
        selection_config, transfer, transfer_to_address,
    };
    use crate::types::{OnChainKind, PublicKey};
    use ethers::types::{Address, U256};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Processor = Arc<Mutex<LocalProcessor>>;

    fn build(cache: StateCache, config: SelectionConfig) -> (Processor, VerificationPipeline<LocalProcessor, StateCache>) {
        let auths = Arc::new(cache.clone());
        let processor = Arc::new(Mutex::new(LocalProcessor::new(cache)));
        let pipeline = VerificationPipeline::new(
            processor.clone(),
            auths,
            config,
            coordinator(),
            &PipelineConfig { channel_capacity: 2 },
        );
        (processor, pipeline)
    }

    #[tokio::test]
    async fn test_selects_valid_transfer() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]);
        let fee_idx = add_fee_account(&mut cache, 0);
        let (processor, pipeline) = build(cache, selection_config(10, 5, 5));

        let tx = transfer(256, 257, 0, 100, 5, 0);
        let pass = pipeline
            .run(vec![tx.clone()], 1, CapacityContext::default())
            .await
            .unwrap();

        assert_eq!(pass.selected, vec![tx]);
        assert!(pass.non_selected.is_empty());
        assert!(pass.on_chain.is_empty());
        assert_eq!(pass.context, CapacityContext::new(0, 1, 0));

        let processor = processor.lock().await;
        assert_eq!(balance_of(processor.ledger(), 256), U256::from(895u64));
        assert_eq!(balance_of(processor.ledger(), 257), U256::from(100u64));
        assert_eq!(processor.accumulated_fees()[&fee_idx], U256::from(5u64));
    }

    #[tokio::test]
    async fn test_expired_and_zero_exits_are_unforgeable() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0), (300, 0, 1_000, 0)]);
        add_fee_account(&mut cache, 0);
        let (_, pipeline) = build(cache, selection_config(10, 5, 5));

        let mut expired = transfer(256, 300, 0, 1, 1, 0);
        expired.max_valid_batch = Some(3);
        let empty_exit = exit(300, 0, 0, 1, 0);

        let pass = pipeline
            .run(vec![expired, empty_exit], 5, CapacityContext::default())
            .await
            .unwrap();

        assert!(pass.selected.is_empty());
        let mut reasons: Vec<RejectReason> =
            pass.unforgeable.iter().map(|r| r.reason.clone()).collect();
        reasons.sort_by_key(|reason| reason.code());
        assert_eq!(
            reasons,
            vec![
                RejectReason::ExitZeroAmount,
                RejectReason::UnsupportedMaxBatch {
                    max_valid_batch: 3,
                    next_batch: 5
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_nonce_gap_is_non_selected() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]);
        add_fee_account(&mut cache, 0);
        let (_, pipeline) = build(cache, selection_config(10, 5, 5));

        let pass = pipeline
            .run(vec![transfer(256, 257, 0, 1, 1, 3)], 1, CapacityContext::default())
            .await
            .unwrap();

        assert_eq!(pass.non_selected.len(), 1);
        assert_eq!(
            pass.non_selected[0].reason,
            RejectReason::InvalidNonce { expected: 0, got: 3 }
        );
        assert_eq!(pass.context.l2, 0);
    }

    #[tokio::test]
    async fn test_capacity_limits_pool_transactions() {
        let mut cache = seeded_cache(&[
            (256, 0, 1_000, 0),
            (257, 0, 1_000, 0),
            (258, 0, 1_000, 0),
            (300, 0, 0, 0),
        ]);
        add_fee_account(&mut cache, 0);
        let (_, pipeline) = build(cache, selection_config(3, 1, 5));

        let txs = vec![
            transfer(256, 300, 0, 1, 9, 0),
            transfer(257, 300, 0, 1, 8, 0),
            transfer(258, 300, 0, 1, 7, 0),
        ];
        let pass = pipeline
            .run(txs.clone(), 1, CapacityContext::new(1, 0, 1))
            .await
            .unwrap();

        assert_eq!(pass.selected.len(), 2);
        assert_eq!(pass.non_selected.len(), 1);
        assert_eq!(pass.non_selected[0].tx.id, txs[2].id);
        assert_eq!(pass.non_selected[0].reason, RejectReason::CapacityExceeded);
    }

    #[tokio::test]
    async fn test_synthesizes_fee_account_before_destination() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0)]);
        let recipient = Address::repeat_byte(0x42);
        let key = PublicKey::repeat_byte(0x43);
        cache.insert_authorization(authorization(recipient, key));
        let (processor, pipeline) = build(cache, selection_config(10, 5, 5));

        let tx = transfer_to_address(256, recipient, 0, 50, 2, 0);
        let pass = pipeline
            .run(vec![tx.clone()], 1, CapacityContext::new(1, 0, 1))
            .await
            .unwrap();

        assert_eq!(pass.selected, vec![tx]);
        assert_eq!(pass.on_chain.len(), 2);
        assert_eq!(pass.on_chain[0].from_address, coordinator().address);
        assert_eq!(pass.on_chain[0].position, 1);
        assert_eq!(pass.on_chain[1].from_address, recipient);
        assert_eq!(pass.on_chain[1].position, 2);
        assert!(pass.on_chain.iter().all(|tx| tx.kind == OnChainKind::CreateAccountDeposit));
        assert_eq!(pass.auths[0], coordinator().creation_auth);
        assert_eq!(pass.auths[1].to_vec(), vec![0xaa; 65]);
        assert_eq!(pass.context, CapacityContext::new(3, 1, 3));

        let processor = processor.lock().await;
        let created = processor
            .ledger()
            .accounts()
            .find(|(_, account)| account.address == recipient)
            .map(|(_, account)| account.balance);
        assert_eq!(created, Some(U256::from(50u64)));
    }

    #[tokio::test]
    async fn test_no_room_for_creation() {
        let cache = seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]);
        let (_, pipeline) = build(cache, selection_config(10, 0, 5));

        let pass = pipeline
            .run(vec![transfer(256, 257, 0, 1, 1, 0)], 1, CapacityContext::default())
            .await
            .unwrap();

        assert_eq!(pass.non_selected[0].reason, RejectReason::NoRoomForCreation);
        assert!(pass.on_chain.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_rejection_aborts_pass() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]);
        add_fee_account(&mut cache, 0);
        let (_, pipeline) = build(cache, selection_config(10, 5, 5));

        let (a, b) = atomic_pair(1);
        let pass = pipeline
            .run(vec![a.clone(), b.clone()], 1, CapacityContext::default())
            .await
            .unwrap();

        let failed = pass.failed_group.expect("group should fail");
        assert_eq!(failed.id, a.atomic_group_id.unwrap());
        assert_eq!(failed.failed_tx, b.id);
        assert!(matches!(failed.reason, RejectReason::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn test_same_sender_sees_earlier_forwarded_tx() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]);
        let fee_idx = add_fee_account(&mut cache, 0);
        let (processor, pipeline) = build(cache, selection_config(10, 5, 5));

        let txs: Vec<_> = (0..4).map(|nonce| transfer(256, 257, 0, 100, 2, nonce)).collect();
        let pass = pipeline
            .run(txs.clone(), 1, CapacityContext::default())
            .await
            .unwrap();

        assert_eq!(pass.selected, txs);
        assert!(pass.non_selected.is_empty());

        let processor = processor.lock().await;
        assert_eq!(balance_of(processor.ledger(), 256), U256::from(592u64));
        assert_eq!(processor.accumulated_fees()[&fee_idx], U256::from(8u64));
    }

    #[tokio::test]
    async fn test_atomic_member_funded_by_earlier_member() {
        let mut cache = seeded_cache(&[(256, 0, 1_000, 0), (257, 0, 0, 0)]);
        add_fee_account(&mut cache, 0);
        let (processor, pipeline) = build(cache, selection_config(10, 5, 5));

        // 257 can only pay once 256's transfer is applied
        let (mut a, mut b) = atomic_pair(2);
        a.amount = U256::from(100u64);
        b.amount = U256::from(50u64);
        let pass = pipeline
            .run(vec![a.clone(), b.clone()], 1, CapacityContext::default())
            .await
            .unwrap();

        assert!(pass.failed_group.is_none());
        assert_eq!(pass.selected, vec![a, b]);

        let processor = processor.lock().await;
        assert_eq!(balance_of(processor.ledger(), 256), U256::from(949u64));
        assert_eq!(balance_of(processor.ledger(), 257), U256::from(49u64));
    }

    #[tokio::test]
    async fn test_empty_pass_keeps_context() {
        let cache = seeded_cache(&[(256, 0, 1_000, 0)]);
        let (_, pipeline) = build(cache, selection_config(10, 5, 5));

        let context = CapacityContext::new(2, 1, 2);
        let pass = pipeline.run(Vec::new(), 1, context).await.unwrap();
        assert!(pass.selected.is_empty());
        assert_eq!(pass.context, context);
    }
}
