use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, H256, U256},
};
use std::sync::Arc;
use std::time::Duration;

use crate::client::sequence::SequenceCounter;
use crate::error::AgentError;
use crate::services::ledger::{
    format_hash, LedgerClient, RejectReason, SubmitOutcome, TransferRequest,
};

/// Counter corrections per `submit` call before a nonce disagreement is reported.
const MAX_SUBMIT_RESYNCS: usize = 4;
const NONCE_GAP_WAIT: Duration = Duration::from_millis(100);

/// Pays token transfers from one wallet, owning that wallet's nonce sequence.
pub struct PaymentClient {
    wallet: LocalWallet,
    ledger: Arc<dyn LedgerClient>,
    sequence: SequenceCounter,
    receipt_timeout: Duration,
}

impl PaymentClient {
    pub fn new(wallet: LocalWallet, ledger: Arc<dyn LedgerClient>, receipt_timeout: Duration) -> Self {
        Self {
            wallet,
            ledger,
            sequence: SequenceCounter::new(),
            receipt_timeout,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    /// Broadcasts a token transfer without waiting for it to be mined.
    pub async fn submit(&self, asset: Address, to: Address, amount: U256) -> Result<H256, AgentError> {
        self.send(Some(asset), to, amount).await
    }

    /// Broadcasts a native-coin transfer, e.g. gas money for another wallet.
    pub async fn submit_native(&self, to: Address, amount: U256) -> Result<H256, AgentError> {
        self.send(None, to, amount).await
    }

    /// A duplicate submission resolves to the hash already in flight. A nonce
    /// above the ledger's count while a sibling still holds a lower one is
    /// retried after a short wait; once nothing below it is outstanding the
    /// counter is resynced. A nonce below it only moves the counter forward.
    /// Any other refusal hands the claimed nonce back.
    async fn send(&self, asset: Option<Address>, to: Address, amount: U256) -> Result<H256, AgentError> {
        let account = self.address();
        let mut nonce = self.sequence.claim_or_init(self.ledger.as_ref(), account).await?;
        let mut resyncs = 0;
        let mut gap_waited = Duration::ZERO;

        loop {
            let request = TransferRequest {
                signer: self.wallet.clone(),
                asset,
                to,
                amount,
                nonce,
            };

            let outcome = match self.ledger.send_transaction(&request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.sequence.rollback(nonce);
                    return Err(e.into());
                }
            };

            let reason = match outcome {
                SubmitOutcome::Accepted { hash } => {
                    self.sequence.complete(nonce);
                    tracing::debug!(from = ?account, nonce, tx_hash = %format_hash(&hash), "Transfer submitted");
                    return Ok(hash);
                }
                SubmitOutcome::AlreadyPending { hash } => {
                    self.sequence.complete(nonce);
                    tracing::debug!(from = ?account, nonce, tx_hash = %format_hash(&hash), "Transfer already pending; reusing hash");
                    return Ok(hash);
                }
                SubmitOutcome::Rejected(reason) => reason,
            };

            match reason {
                RejectReason::NonceTooHigh
                    if gap_waited < self.receipt_timeout
                        && (gap_waited.is_zero() || self.sequence.has_in_flight_below(nonce)) =>
                {
                    tokio::time::sleep(NONCE_GAP_WAIT).await;
                    gap_waited += NONCE_GAP_WAIT;
                    continue;
                }
                RejectReason::NonceTooHigh if resyncs >= MAX_SUBMIT_RESYNCS => {
                    self.sequence.rollback(nonce);
                    return Err(out_of_sync());
                }
                RejectReason::NonceTooLow if resyncs >= MAX_SUBMIT_RESYNCS => {
                    self.sequence.forget(nonce);
                    return Err(out_of_sync());
                }
                RejectReason::NonceTooHigh => {
                    self.sequence.forget(nonce);
                    let pending = self.ledger.get_nonce(account).await?;
                    tracing::debug!(from = ?account, nonce, pending, "Nonce ahead of ledger; resynchronizing");
                    self.sequence.resync(pending);
                }
                RejectReason::NonceTooLow => {
                    self.sequence.forget(nonce);
                    let pending = self.ledger.get_nonce(account).await?;
                    tracing::debug!(from = ?account, nonce, pending, "Nonce already used; advancing");
                    self.sequence.advance_to(pending);
                }
                other => {
                    self.sequence.rollback(nonce);
                    return Err(AgentError::Rejected(other.to_string()));
                }
            }

            resyncs += 1;
            gap_waited = Duration::ZERO;
            nonce = self.sequence.claim_or_init(self.ledger.as_ref(), account).await?;
        }
    }

    /// Submits and waits for the receipt. A timeout is reported as a failure
    /// even though the transfer may still land later.
    pub async fn pay(&self, asset: Address, to: Address, amount: U256) -> Result<H256, AgentError> {
        let hash = self.submit(asset, to, amount).await?;
        let receipt = self.ledger.wait_for_receipt(hash, self.receipt_timeout).await?;
        if !receipt.success {
            return Err(AgentError::Reverted(format_hash(&hash)));
        }
        Ok(hash)
    }

    pub async fn balance(&self, asset: Address) -> Result<U256, AgentError> {
        Ok(self.ledger.get_balance(self.address(), asset).await?)
    }
}

fn out_of_sync() -> AgentError {
    AgentError::Rejected(format!(
        "nonce still out of sync after {} resyncs",
        MAX_SUBMIT_RESYNCS
    ))
}
