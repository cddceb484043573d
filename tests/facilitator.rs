mod common;

use common::{requirement, ASSET, PAY_TO};
use ethers::{
    core::rand::thread_rng,
    signers::{LocalWallet, Signer},
    types::U256,
};
use futures::future::join_all;
use paygate::{
    models::{PaymentProof, ResourceInfo, SettleFailure, VerifyResult},
    services::{
        clock::ManualClock, ledger::format_hash, Facilitator, InMemoryLedger, MemoryReplayStore,
        ReplayGuard,
    },
};
use std::sync::Arc;
use std::time::Duration;

async fn paid_proof(ledger: &InMemoryLedger) -> PaymentProof {
    let wallet = LocalWallet::new(&mut thread_rng());
    ledger.mint(ASSET, wallet.address(), U256::from(1_000u64));
    let hash = ledger
        .submit_transfer(&wallet, ASSET, PAY_TO, U256::from(100u64))
        .await
        .unwrap();
    PaymentProof::new(
        ResourceInfo {
            url: "/api/echo".to_string(),
            description: "echo".to_string(),
            mime_type: "application/json".to_string(),
        },
        requirement(),
        format_hash(&hash),
    )
}

fn facilitator(ledger: Arc<InMemoryLedger>, clock: Arc<ManualClock>) -> Facilitator {
    let replay = ReplayGuard::new(
        Arc::new(MemoryReplayStore::new()),
        clock,
        Duration::from_secs(60),
    );
    Facilitator::new(ledger, replay, "testnet")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settlement_has_one_winner() {
    let ledger = Arc::new(InMemoryLedger::new());
    let facilitator = facilitator(ledger.clone(), Arc::new(ManualClock::new(1_000)));
    let proof = paid_proof(&ledger).await;
    let requirement = requirement();

    assert!(facilitator.verify(&proof, &requirement).await.is_valid());

    let attempts = (0..32).map(|_| {
        let facilitator = facilitator.clone();
        let proof = proof.clone();
        let requirement = requirement.clone();
        tokio::spawn(async move { facilitator.settle(&proof, &requirement).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.success).count(), 1);
    assert!(results
        .iter()
        .filter(|r| !r.success)
        .all(|r| r.error == Some(SettleFailure::AlreadyUsed)));
    assert!(!facilitator.verify(&proof, &requirement).await.is_valid());
}

#[tokio::test]
async fn test_proof_is_accepted_again_after_ttl() {
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let facilitator = facilitator(ledger.clone(), clock.clone());
    let proof = paid_proof(&ledger).await;
    let requirement = requirement();

    assert!(facilitator.settle(&proof, &requirement).await.success);
    clock.advance(Duration::from_secs(30));
    assert_eq!(
        facilitator.verify(&proof, &requirement).await,
        VerifyResult::invalid(paygate::models::InvalidReason::AlreadyUsed)
    );

    clock.advance(Duration::from_secs(31));
    assert!(facilitator.verify(&proof, &requirement).await.is_valid());
}
