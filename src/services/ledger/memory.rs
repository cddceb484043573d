use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{Address, H256, U256},
    utils::keccak256,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{LedgerClient, Receipt, RejectReason, SubmitOutcome, TransferLog, TransferRequest};
use crate::error::LedgerError;

/// A transfer the in-memory ledger has mined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub hash: H256,
    pub from: Address,
    pub to: Address,
    /// `None` for a native-coin transfer.
    pub asset: Option<Address>,
    pub amount: U256,
    pub nonce: u64,
    pub success: bool,
}

#[derive(Default)]
struct LedgerState {
    assets: HashSet<Address>,
    balances: HashMap<(Address, Address), U256>,
    native: HashMap<Address, U256>,
    gas_fee: U256,
    nonces: HashMap<Address, u64>,
    by_sender_nonce: HashMap<(Address, u64), H256>,
    receipts: HashMap<H256, Receipt>,
    transfers: Vec<TransferRecord>,
    injected: VecDeque<RejectReason>,
    unavailable: bool,
}

/// Deterministic single-process ledger: every accepted transaction is mined
/// immediately, nonces must arrive in order, and token balances are tracked
/// per asset. Transfers against an unregistered asset are mined as reverted.
///
/// Gas is free unless `set_gas_fee` is called; with a fee every transaction
/// needs that much native coin on the sender or it is refused at admission.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_asset(&self, asset: Address) {
        self.lock().assets.insert(asset);
    }

    pub fn mint(&self, asset: Address, account: Address, amount: U256) {
        let mut state = self.lock();
        state.assets.insert(asset);
        let balance = state.balances.entry((asset, account)).or_default();
        *balance += amount;
    }

    pub fn balance(&self, asset: Address, account: Address) -> U256 {
        self.lock()
            .balances
            .get(&(asset, account))
            .copied()
            .unwrap_or_default()
    }

    pub fn fund_native(&self, account: Address, amount: U256) {
        *self.lock().native.entry(account).or_default() += amount;
    }

    pub fn native_balance(&self, account: Address) -> U256 {
        self.lock().native.get(&account).copied().unwrap_or_default()
    }

    /// Native coin charged to the sender of every transaction from now on.
    pub fn set_gas_fee(&self, fee: U256) {
        self.lock().gas_fee = fee;
    }

    pub fn nonce_of(&self, account: Address) -> u64 {
        self.lock().nonces.get(&account).copied().unwrap_or(0)
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.lock().transfers.clone()
    }

    /// The next `send_transaction` is refused with `reason`, without consuming a nonce.
    pub fn inject_rejection(&self, reason: RejectReason) {
        self.lock().injected.push_back(reason);
    }

    /// While unavailable every call fails as if the node were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Stores an arbitrary receipt, e.g. one for a transaction that reverted.
    pub fn insert_receipt(&self, receipt: Receipt) {
        self.lock().receipts.insert(receipt.tx_hash, receipt);
    }

    /// Submits a transfer at the signer's current nonce and returns its hash.
    pub async fn submit_transfer(
        &self,
        signer: &LocalWallet,
        asset: Address,
        to: Address,
        amount: U256,
    ) -> Result<H256, LedgerError> {
        let request = TransferRequest {
            signer: signer.clone(),
            asset: Some(asset),
            to,
            amount,
            nonce: self.nonce_of(signer.address()),
        };
        match self.send_transaction(&request).await? {
            SubmitOutcome::Accepted { hash } | SubmitOutcome::AlreadyPending { hash } => Ok(hash),
            SubmitOutcome::Rejected(reason) => Err(LedgerError::Rpc(reason.to_string())),
        }
    }

    fn apply_token_transfer(
        state: &mut LedgerState,
        hash: H256,
        from: Address,
        asset: Address,
        request: &TransferRequest,
    ) -> Receipt {
        let known_asset = state.assets.contains(&asset);
        let sender_balance = state.balances.get(&(asset, from)).copied().unwrap_or_default();
        let success = known_asset && sender_balance >= request.amount;

        if success {
            state.balances.insert((asset, from), sender_balance - request.amount);
            *state.balances.entry((asset, request.to)).or_default() += request.amount;
        }

        Receipt {
            tx_hash: hash,
            success,
            from,
            to: Some(asset),
            transfer: success.then(|| TransferLog {
                from,
                to: request.to,
                amount: request.amount,
            }),
        }
    }

    fn ensure_available(state: &LedgerState) -> Result<(), LedgerError> {
        if state.unavailable {
            return Err(LedgerError::Rpc("connection refused".to_string()));
        }
        Ok(())
    }

    fn tx_hash(from: Address, request: &TransferRequest) -> H256 {
        let mut amount = [0u8; 32];
        request.amount.to_big_endian(&mut amount);

        let mut preimage = Vec::with_capacity(20 * 3 + 8 + 32);
        preimage.extend_from_slice(from.as_bytes());
        preimage.extend_from_slice(&request.nonce.to_be_bytes());
        preimage.extend_from_slice(request.asset.unwrap_or_default().as_bytes());
        preimage.extend_from_slice(request.to.as_bytes());
        preimage.extend_from_slice(&amount);
        H256::from(keccak256(preimage))
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, LedgerError> {
        let state = self.lock();
        Self::ensure_available(&state)?;
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn send_transaction(
        &self,
        request: &TransferRequest,
    ) -> Result<SubmitOutcome, LedgerError> {
        let from = request.signer.address();
        let mut state = self.lock();
        Self::ensure_available(&state)?;

        if let Some(reason) = state.injected.pop_front() {
            return Ok(SubmitOutcome::Rejected(reason));
        }

        let expected = state.nonces.get(&from).copied().unwrap_or(0);
        if request.nonce < expected {
            return Ok(match state.by_sender_nonce.get(&(from, request.nonce)) {
                Some(hash) if *hash == Self::tx_hash(from, request) => {
                    SubmitOutcome::AlreadyPending { hash: *hash }
                }
                _ => SubmitOutcome::Rejected(RejectReason::NonceTooLow),
            });
        }
        if request.nonce > expected {
            return Ok(SubmitOutcome::Rejected(RejectReason::NonceTooHigh));
        }

        let native_balance = state.native.get(&from).copied().unwrap_or_default();
        let value = if request.asset.is_none() { request.amount } else { U256::zero() };
        let Some(remaining) = native_balance.checked_sub(state.gas_fee.saturating_add(value)) else {
            return Ok(SubmitOutcome::Rejected(RejectReason::InsufficientFunds));
        };
        state.native.insert(from, remaining);

        let hash = Self::tx_hash(from, request);
        state.nonces.insert(from, expected + 1);
        state.by_sender_nonce.insert((from, request.nonce), hash);

        let receipt = match request.asset {
            Some(asset) => Self::apply_token_transfer(&mut state, hash, from, asset, request),
            None => {
                *state.native.entry(request.to).or_default() += request.amount;
                Receipt {
                    tx_hash: hash,
                    success: true,
                    from,
                    to: Some(request.to),
                    transfer: None,
                }
            }
        };

        state.transfers.push(TransferRecord {
            hash,
            from,
            to: request.to,
            asset: request.asset,
            amount: request.amount,
            nonce: request.nonce,
            success: receipt.success,
        });
        state.receipts.insert(hash, receipt);

        Ok(SubmitOutcome::Accepted { hash })
    }

    async fn get_nonce(&self, account: Address) -> Result<u64, LedgerError> {
        let state = self.lock();
        Self::ensure_available(&state)?;
        Ok(state.nonces.get(&account).copied().unwrap_or(0))
    }

    async fn get_balance(&self, account: Address, asset: Address) -> Result<U256, LedgerError> {
        let state = self.lock();
        Self::ensure_available(&state)?;
        Ok(state
            .balances
            .get(&(asset, account))
            .copied()
            .unwrap_or_default())
    }
}
