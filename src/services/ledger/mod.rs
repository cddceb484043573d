//! Capability interface to the ledger that carries payments.
//!
//! The protocol engine only needs five things from a chain: look up a
//! receipt, broadcast a transfer (token or native coin), wait for it to land,
//! read an account's pending transaction count and read a token balance. Everything else about
//! the chain is out of scope.

pub mod ethereum;
pub mod memory;

pub use ethereum::EthersLedger;
pub use memory::InMemoryLedger;

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::{Address, H256, U256};
use std::str::FromStr;
use std::time::Duration;

use crate::error::LedgerError;

pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Token movement decoded from a receipt's `Transfer` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub success: bool,
    pub from: Address,
    pub to: Option<Address>,
    pub transfer: Option<TransferLog>,
}

/// A transfer ready to be signed. The caller owns nonce allocation.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub signer: LocalWallet,
    /// Token contract to call, or `None` to move the chain's native coin.
    pub asset: Option<Address>,
    pub to: Address,
    pub amount: U256,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NonceTooLow,
    NonceTooHigh,
    InsufficientFunds,
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonceTooLow => f.write_str("nonce too low"),
            Self::NonceTooHigh => f.write_str("nonce too high"),
            Self::InsufficientFunds => f.write_str("insufficient funds"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

/// What happened to a broadcast. A node that already holds the exact same
/// signed transaction reports `AlreadyPending`, which is as good as `Accepted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { hash: H256 },
    AlreadyPending { hash: H256 },
    Rejected(RejectReason),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, LedgerError>;

    async fn send_transaction(&self, request: &TransferRequest)
        -> Result<SubmitOutcome, LedgerError>;

    /// Pending transaction count, i.e. the next usable nonce for `account`.
    async fn get_nonce(&self, account: Address) -> Result<u64, LedgerError>;

    async fn get_balance(&self, account: Address, asset: Address) -> Result<U256, LedgerError>;

    /// Polls until the receipt shows up. On timeout the transaction may still
    /// land later; callers treat it as failed and move on.
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError> {
        let poll = async {
            loop {
                if let Some(receipt) = self.get_receipt(tx_hash).await? {
                    return Ok::<_, LedgerError>(receipt);
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| LedgerError::Timeout(timeout, format_hash(&tx_hash)))?
    }
}

pub fn format_hash(hash: &H256) -> String {
    format!("{:?}", hash)
}

pub fn parse_hash(raw: &str) -> Option<H256> {
    let trimmed = raw.trim().trim_start_matches("0x");
    if trimmed.len() != 64 {
        return None;
    }
    H256::from_str(trimmed).ok()
}
