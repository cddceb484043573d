use ethers::types::U256;
use std::sync::Arc;

use crate::models::{
    normalize_tx_hash, InvalidReason, PaymentProof, PaymentRequirement, SettleFailure,
    SettleResult, SupportedKind, SupportedResponse, VerifyResult, PROTOCOL_VERSION, SCHEME_EXACT,
};
use crate::services::ledger::{parse_hash, LedgerClient, Receipt};
use crate::services::replay::ReplayGuard;

/// Verifies payment proofs against the ledger and settles them.
///
/// Nothing here returns an error: every failure is folded into a typed
/// `VerifyResult` or `SettleResult` so the HTTP layer can always answer.
#[derive(Clone)]
pub struct Facilitator {
    ledger: Arc<dyn LedgerClient>,
    replay: ReplayGuard,
    network: String,
}

impl Facilitator {
    pub fn new(ledger: Arc<dyn LedgerClient>, replay: ReplayGuard, network: impl Into<String>) -> Self {
        Self {
            ledger,
            replay,
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn replay(&self) -> &ReplayGuard {
        &self.replay
    }

    /// Read-only with respect to the replay set: a valid proof is not consumed here.
    pub async fn verify(&self, proof: &PaymentProof, requirement: &PaymentRequirement) -> VerifyResult {
        if let Err(e) = self.replay.evict_expired().await {
            tracing::warn!(error = %e, "Replay eviction failed");
        }

        let Some(raw_hash) = proof.tx_hash() else {
            return VerifyResult::invalid(InvalidReason::MissingHash);
        };

        match self.replay.contains(raw_hash).await {
            Ok(true) => return VerifyResult::invalid(InvalidReason::AlreadyUsed),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(tx_hash = raw_hash, error = %e, "Replay lookup failed");
                return VerifyResult::invalid(InvalidReason::VerificationError);
            }
        }

        let Some(tx_hash) = parse_hash(raw_hash) else {
            return VerifyResult::invalid(InvalidReason::VerificationError);
        };

        let receipt = match self.ledger.get_receipt(tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return VerifyResult::invalid(InvalidReason::NotFound),
            Err(e) => {
                tracing::warn!(tx_hash = raw_hash, error = %e, "Receipt lookup failed");
                return VerifyResult::invalid(InvalidReason::VerificationError);
            }
        };

        if !receipt.success {
            return VerifyResult::invalid(InvalidReason::Failed);
        }

        let Some(required) = requirement.amount_units() else {
            tracing::error!(amount = %requirement.amount, "Requirement amount is not an integer");
            return VerifyResult::invalid(InvalidReason::VerificationError);
        };
        let paid = credited_amount(&receipt, requirement);
        if paid < required {
            tracing::debug!(tx_hash = raw_hash, %paid, %required, "Payment below requirement");
            return VerifyResult::invalid(InvalidReason::AmountInsufficient);
        }

        let payer = receipt.transfer.as_ref().map(|t| t.from).unwrap_or(receipt.from);
        tracing::info!(tx_hash = raw_hash, payer = ?payer, amount = %paid, "Payment verified");
        VerifyResult::Valid { payer }
    }

    /// Consumes the proof. Call only once the paid resource has been produced.
    /// The replay insert is the serialization point: of two concurrent settles
    /// for one hash, exactly one succeeds.
    pub async fn settle(&self, proof: &PaymentProof, _requirement: &PaymentRequirement) -> SettleResult {
        let Some(raw_hash) = proof.tx_hash() else {
            return SettleResult::failed(String::new(), self.network.clone(), SettleFailure::MissingHash);
        };
        let transaction_ref = normalize_tx_hash(raw_hash);
        let fail = |reason| SettleResult::failed(transaction_ref.clone(), self.network.clone(), reason);

        let Some(tx_hash) = parse_hash(raw_hash) else {
            return fail(SettleFailure::ReceiptMissing);
        };
        let payer = match self.ledger.get_receipt(tx_hash).await {
            Ok(Some(receipt)) => receipt.transfer.map(|t| t.from).unwrap_or(receipt.from),
            Ok(None) => return fail(SettleFailure::ReceiptMissing),
            Err(e) => {
                tracing::error!(tx_hash = %transaction_ref, error = %e, "Ledger unavailable during settle");
                return fail(SettleFailure::LedgerUnavailable);
            }
        };

        match self.replay.mark_used(raw_hash).await {
            Ok(true) => {
                tracing::info!(tx_hash = %transaction_ref, payer = ?payer, "Payment settled");
                SettleResult::settled(transaction_ref.clone(), self.network.clone(), payer)
            }
            Ok(false) => {
                tracing::warn!(tx_hash = %transaction_ref, "Settle lost race for already used proof");
                fail(SettleFailure::AlreadyUsed)
            }
            Err(e) => {
                tracing::error!(tx_hash = %transaction_ref, error = %e, "Replay store unavailable during settle");
                fail(SettleFailure::StoreUnavailable)
            }
        }
    }

    pub fn supported(&self) -> SupportedResponse {
        SupportedResponse {
            kinds: vec![SupportedKind {
                protocol_version: PROTOCOL_VERSION,
                scheme: SCHEME_EXACT.to_string(),
                network: self.network.clone(),
            }],
        }
    }
}

/// Amount of the required asset the receipt moved to the required recipient.
/// Anything else (another token, another payee, no transfer log) credits nothing.
fn credited_amount(receipt: &Receipt, requirement: &PaymentRequirement) -> U256 {
    match &receipt.transfer {
        Some(transfer)
            if transfer.to == requirement.pay_to && receipt.to == Some(requirement.asset) =>
        {
            transfer.amount
        }
        _ => U256::zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceInfo;
    use crate::services::clock::ManualClock;
    use crate::services::ledger::{format_hash, InMemoryLedger, TransferLog};
    use crate::services::store::MemoryReplayStore;
    use ethers::types::{Address, H256};
    use std::time::Duration;

    fn requirement(amount: &str) -> PaymentRequirement {
        PaymentRequirement {
            scheme: SCHEME_EXACT.to_string(),
            network: "testnet".to_string(),
            asset: Address::repeat_byte(0xaa),
            amount: amount.to_string(),
            pay_to: Address::repeat_byte(0xbb),
            max_timeout_seconds: 60,
            extra: None,
        }
    }

    fn proof(hash: H256, requirement: &PaymentRequirement) -> PaymentProof {
        PaymentProof::new(
            ResourceInfo {
                url: "/api/echo".to_string(),
                description: "echo".to_string(),
                mime_type: "application/json".to_string(),
            },
            requirement.clone(),
            format_hash(&hash),
        )
    }

    fn receipt(hash: H256, amount: u64, success: bool) -> Receipt {
        Receipt {
            tx_hash: hash,
            success,
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0xaa)),
            transfer: Some(TransferLog {
                from: Address::repeat_byte(0x11),
                to: Address::repeat_byte(0xbb),
                amount: U256::from(amount),
            }),
        }
    }

    fn facilitator() -> (Facilitator, Arc<InMemoryLedger>, Arc<ManualClock>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let replay = ReplayGuard::new(
            Arc::new(MemoryReplayStore::new()),
            clock.clone(),
            Duration::from_secs(3600),
        );
        (Facilitator::new(ledger.clone(), replay, "testnet"), ledger, clock)
    }

    #[tokio::test]
    async fn test_verify_reasons() {
        let (facilitator, ledger, _) = facilitator();
        let req = requirement("100");

        let mut missing = proof(H256::zero(), &req);
        missing.payload.tx_hash = Some("  ".to_string());
        assert_eq!(
            facilitator.verify(&missing, &req).await,
            VerifyResult::invalid(InvalidReason::MissingHash)
        );

        let unknown = H256::repeat_byte(1);
        assert_eq!(
            facilitator.verify(&proof(unknown, &req), &req).await,
            VerifyResult::invalid(InvalidReason::NotFound)
        );

        let reverted = H256::repeat_byte(2);
        ledger.insert_receipt(receipt(reverted, 100, false));
        assert_eq!(
            facilitator.verify(&proof(reverted, &req), &req).await,
            VerifyResult::invalid(InvalidReason::Failed)
        );

        let ok = H256::repeat_byte(3);
        ledger.insert_receipt(receipt(ok, 100, true));
        assert_eq!(
            facilitator.verify(&proof(ok, &req), &req).await,
            VerifyResult::Valid {
                payer: Address::repeat_byte(0x11)
            }
        );
    }

    #[tokio::test]
    async fn test_ledger_outage_is_a_verification_error() {
        let (facilitator, ledger, _) = facilitator();
        let req = requirement("100");
        ledger.set_unavailable(true);

        assert_eq!(
            facilitator.verify(&proof(H256::repeat_byte(4), &req), &req).await,
            VerifyResult::invalid(InvalidReason::VerificationError)
        );
    }

    #[tokio::test]
    async fn test_underpayment_does_not_consume_hash() {
        let (facilitator, ledger, _) = facilitator();
        let hash = H256::repeat_byte(5);
        ledger.insert_receipt(receipt(hash, 100, true));

        let req = requirement("200");
        assert_eq!(
            facilitator.verify(&proof(hash, &req), &req).await,
            VerifyResult::invalid(InvalidReason::AmountInsufficient)
        );
        assert!(!facilitator.replay().contains(&format_hash(&hash)).await.unwrap());

        // Re-verifying an unconsumed hash against a lower price is allowed.
        let lower = requirement("100");
        assert!(facilitator.verify(&proof(hash, &lower), &lower).await.is_valid());
    }

    #[tokio::test]
    async fn test_wrong_recipient_credits_nothing() {
        let (facilitator, ledger, _) = facilitator();
        let hash = H256::repeat_byte(6);
        let mut misdirected = receipt(hash, 1_000, true);
        if let Some(transfer) = misdirected.transfer.as_mut() {
            transfer.to = Address::repeat_byte(0xcc);
        }
        ledger.insert_receipt(misdirected);

        let req = requirement("100");
        assert_eq!(
            facilitator.verify(&proof(hash, &req), &req).await,
            VerifyResult::invalid(InvalidReason::AmountInsufficient)
        );
    }

    #[tokio::test]
    async fn test_settle_once_then_already_used() {
        let (facilitator, ledger, clock) = facilitator();
        let hash = H256::repeat_byte(7);
        ledger.insert_receipt(receipt(hash, 100, true));
        let req = requirement("100");
        let p = proof(hash, &req);

        assert!(facilitator.verify(&p, &req).await.is_valid());
        let first = facilitator.settle(&p, &req).await;
        assert!(first.success);
        assert_eq!(first.payer, Some(Address::repeat_byte(0x11)));

        let second = facilitator.settle(&p, &req).await;
        assert!(!second.success);
        assert_eq!(second.error, Some(SettleFailure::AlreadyUsed));
        assert_eq!(
            facilitator.verify(&p, &req).await,
            VerifyResult::invalid(InvalidReason::AlreadyUsed)
        );

        clock.advance(Duration::from_secs(3600) - Duration::from_millis(1));
        assert_eq!(
            facilitator.verify(&p, &req).await,
            VerifyResult::invalid(InvalidReason::AlreadyUsed)
        );
        clock.advance(Duration::from_millis(2));
        assert!(facilitator.verify(&p, &req).await.is_valid());
    }

    #[tokio::test]
    async fn test_settle_reports_ledger_outage() {
        let (facilitator, ledger, _) = facilitator();
        let hash = H256::repeat_byte(8);
        ledger.insert_receipt(receipt(hash, 100, true));
        ledger.set_unavailable(true);
        let req = requirement("100");

        let result = facilitator.settle(&proof(hash, &req), &req).await;
        assert_eq!(result.error, Some(SettleFailure::LedgerUnavailable));
        assert!(!facilitator.replay().contains(&format_hash(&hash)).await.unwrap());
    }

    #[test]
    fn test_supported_lists_exact_scheme() {
        let (facilitator, _, _) = facilitator();
        let supported = facilitator.supported();
        assert_eq!(supported.kinds.len(), 1);
        assert_eq!(supported.kinds[0].scheme, "exact");
        assert_eq!(supported.kinds[0].network, "testnet");
    }
}
