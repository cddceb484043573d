use async_trait::async_trait;
use ethers::{
    prelude::*,
    providers::{Http, Provider, RpcError},
    types::{transaction::eip2718::TypedTransaction, BlockNumber, TransactionReceipt},
    utils::keccak256,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::{LedgerClient, Receipt, RejectReason, SubmitOutcome, TransferLog, TransferRequest};
use crate::contracts::{transfer_calldata, transfer_topic, IERC20};
use crate::error::LedgerError;

const TRANSFER_GAS_LIMIT: u64 = 100_000;
const NATIVE_TRANSFER_GAS_LIMIT: u64 = 21_000;

/// JSON-RPC ledger adapter.
///
/// Transactions are signed locally so the hash is known before broadcast;
/// that is what lets a "duplicate submission" error be turned back into a
/// usable hash instead of a failure.
pub struct EthersLedger {
    provider: Arc<Provider<Http>>,
    chain_id: u64,
    receipts: Cache<H256, Receipt>,
}

impl EthersLedger {
    pub fn new(rpc_url: &str, chain_id: u64) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| LedgerError::Rpc(format!("invalid RPC url {}: {}", rpc_url, e)))?;

        // Mined receipts never change, so only the capacity bound matters here.
        let receipts = Cache::builder()
            .max_capacity(50_000)
            .time_to_live(Duration::from_secs(60 * 60))
            .build();

        Ok(Self {
            provider: Arc::new(provider),
            chain_id,
            receipts,
        })
    }

    pub async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    fn to_receipt(receipt: &TransactionReceipt) -> Receipt {
        Receipt {
            tx_hash: receipt.transaction_hash,
            success: receipt.status == Some(1.into()),
            from: receipt.from,
            to: receipt.to,
            transfer: Self::parse_transfer(receipt),
        }
    }

    /// First well-formed `Transfer` log emitted by the contract the transaction
    /// called. Logs from other contracts, or whose data is not a single word,
    /// are skipped.
    fn parse_transfer(receipt: &TransactionReceipt) -> Option<TransferLog> {
        let topic = transfer_topic();
        let token = receipt.to?;
        receipt
            .logs
            .iter()
            .filter(|log| log.address == token)
            .filter(|log| log.topics.len() >= 3 && log.topics[0] == topic)
            .find(|log| log.data.len() == 32)
            .map(|log| TransferLog {
                from: Address::from(log.topics[1]),
                to: Address::from(log.topics[2]),
                amount: U256::from_big_endian(&log.data),
            })
    }
}

#[async_trait]
impl LedgerClient for EthersLedger {
    async fn get_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, LedgerError> {
        if let Some(cached) = self.receipts.get(&tx_hash).await {
            return Ok(Some(cached));
        }

        let Some(raw) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        let receipt = Self::to_receipt(&raw);
        self.receipts.insert(tx_hash, receipt.clone()).await;
        Ok(Some(receipt))
    }

    async fn send_transaction(
        &self,
        request: &TransferRequest,
    ) -> Result<SubmitOutcome, LedgerError> {
        let gas_price = self.provider.get_gas_price().await?;

        let base = TransactionRequest::new()
            .from(request.signer.address())
            .nonce(request.nonce)
            .gas_price(gas_price)
            .chain_id(self.chain_id);
        let tx: TypedTransaction = match request.asset {
            Some(token) => base
                .to(token)
                .data(transfer_calldata(request.to, request.amount))
                .gas(TRANSFER_GAS_LIMIT),
            None => base
                .to(request.to)
                .value(request.amount)
                .gas(NATIVE_TRANSFER_GAS_LIMIT),
        }
        .into();

        let signature = request
            .signer
            .sign_transaction_sync(&tx)
            .map_err(|e| LedgerError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));

        match self.provider.send_raw_transaction(raw).await {
            Ok(pending) => Ok(SubmitOutcome::Accepted {
                hash: pending.tx_hash(),
            }),
            // The node answered with a JSON-RPC error: the tx was judged and refused.
            Err(e) => match RpcError::as_error_response(&e) {
                Some(rpc) => {
                    let outcome = classify_rejection(hash, &rpc.message);
                    tracing::debug!(
                        tx_hash = ?hash,
                        nonce = request.nonce,
                        code = rpc.code,
                        message = %rpc.message,
                        ?outcome,
                        "Node refused transaction"
                    );
                    Ok(outcome)
                }
                None => Err(e.into()),
            },
        }
    }

    async fn get_nonce(&self, account: Address) -> Result<u64, LedgerError> {
        let count = self
            .provider
            .get_transaction_count(account, Some(BlockNumber::Pending.into()))
            .await?;
        Ok(count.as_u64())
    }

    async fn get_balance(&self, account: Address, asset: Address) -> Result<U256, LedgerError> {
        IERC20::new(asset, self.provider.clone())
            .balance_of(account)
            .call()
            .await
            .map_err(|e| LedgerError::Contract(e.to_string()))
    }
}

/// Maps a node's refusal message onto a structured outcome. Node software only
/// reports these conditions as text, so this is the one place that reads it.
pub fn classify_rejection(hash: H256, message: &str) -> SubmitOutcome {
    let msg = message.to_lowercase();
    if msg.contains("already known")
        || msg.contains("known transaction")
        || msg.contains("already imported")
    {
        SubmitOutcome::AlreadyPending { hash }
    } else if msg.contains("nonce too low") {
        SubmitOutcome::Rejected(RejectReason::NonceTooLow)
    } else if msg.contains("nonce too high") {
        SubmitOutcome::Rejected(RejectReason::NonceTooHigh)
    } else if msg.contains("insufficient funds") {
        SubmitOutcome::Rejected(RejectReason::InsufficientFunds)
    } else {
        SubmitOutcome::Rejected(RejectReason::Other(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_submission_keeps_local_hash() {
        let hash = H256::repeat_byte(7);
        assert_eq!(
            classify_rejection(hash, "already known"),
            SubmitOutcome::AlreadyPending { hash }
        );
        assert_eq!(
            classify_rejection(hash, "Known transaction: 0x1234"),
            SubmitOutcome::AlreadyPending { hash }
        );
    }

    #[test]
    fn test_sequence_errors_are_structured() {
        let hash = H256::zero();
        assert_eq!(
            classify_rejection(hash, "nonce too high"),
            SubmitOutcome::Rejected(RejectReason::NonceTooHigh)
        );
        assert_eq!(
            classify_rejection(hash, "Nonce too low: next nonce 4, tx nonce 2"),
            SubmitOutcome::Rejected(RejectReason::NonceTooLow)
        );
        assert_eq!(
            classify_rejection(hash, "insufficient funds for gas * price + value"),
            SubmitOutcome::Rejected(RejectReason::InsufficientFunds)
        );
        assert_eq!(
            classify_rejection(hash, "execution reverted"),
            SubmitOutcome::Rejected(RejectReason::Other("execution reverted".into()))
        );
    }

    fn transfer_log(token: Address, from: Address, to: Address, data: Vec<u8>) -> Log {
        Log {
            address: token,
            topics: vec![transfer_topic(), H256::from(from), H256::from(to)],
            data: Bytes::from(data),
            ..Default::default()
        }
    }

    fn receipt_with(token: Address, logs: Vec<Log>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::repeat_byte(9),
            status: Some(1.into()),
            from: Address::repeat_byte(1),
            to: Some(token),
            logs,
            ..Default::default()
        }
    }

    fn word(amount: u64) -> Vec<u8> {
        let mut data = [0u8; 32];
        U256::from(amount).to_big_endian(&mut data);
        data.to_vec()
    }

    #[test]
    fn test_receipt_decodes_transfer_log() {
        let token = Address::repeat_byte(0xaa);
        let from = Address::repeat_byte(1);
        let to = Address::repeat_byte(2);
        let raw = receipt_with(token, vec![transfer_log(token, from, to, word(250))]);

        let receipt = EthersLedger::to_receipt(&raw);
        assert!(receipt.success);
        assert_eq!(
            receipt.transfer,
            Some(TransferLog {
                from,
                to,
                amount: U256::from(250u64)
            })
        );
    }

    #[test]
    fn test_oversized_log_data_is_skipped() {
        let token = Address::repeat_byte(0xaa);
        let from = Address::repeat_byte(1);
        let to = Address::repeat_byte(2);
        let raw = receipt_with(token, vec![transfer_log(token, from, to, vec![0xff; 64])]);

        assert_eq!(EthersLedger::to_receipt(&raw).transfer, None);
    }

    #[test]
    fn test_transfer_from_another_contract_is_ignored() {
        let token = Address::repeat_byte(0xaa);
        let other = Address::repeat_byte(0xcc);
        let from = Address::repeat_byte(1);
        let to = Address::repeat_byte(2);
        let raw = receipt_with(
            token,
            vec![
                transfer_log(other, from, to, word(1_000)),
                transfer_log(token, from, to, word(5)),
            ],
        );

        let transfer = EthersLedger::to_receipt(&raw).transfer.unwrap();
        assert_eq!(transfer.amount, U256::from(5u64));
    }
}
