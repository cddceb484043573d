use base64::{engine::general_purpose::STANDARD, Engine as _};
use ethers::types::{Address, U256};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 2;
pub const SCHEME_EXACT: &str = "exact";

/// Server → client, carried on a 402.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
/// Client → server, carries the [`PaymentProof`].
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
/// Server → client, carries the [`SettleResult`] of a served request.
pub const PAYMENT_RESPONSE_HEADER: &str = "payment-response";
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// What a protected route charges. Built once per route, cloned per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: String,
    pub asset: Address,
    /// Integer amount in the asset's base units, kept as a string so no precision is lost.
    pub amount: String,
    pub pay_to: Address,
    pub max_timeout_seconds: u64,
    /// Scheme-specific data this crate never inspects; echoed back verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Box<RawValue>>,
}

impl PaymentRequirement {
    pub fn amount_units(&self) -> Option<U256> {
        U256::from_dec_str(self.amount.trim()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub url: String,
    pub description: String,
    pub mime_type: String,
}

/// Body of the `PAYMENT-REQUIRED` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    #[serde(rename = "x402Version")]
    pub protocol_version: u32,
    pub resource: ResourceInfo,
    pub accepts: Vec<PaymentRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentRequired {
    pub fn new(resource: ResourceInfo, requirement: PaymentRequirement) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            resource,
            accepts: vec![requirement],
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

/// Body of the `PAYMENT-SIGNATURE` header. The transaction hash is the only
/// thing tying a client payment to server-side verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    #[serde(rename = "x402Version")]
    pub protocol_version: u32,
    pub resource: ResourceInfo,
    pub accepted: PaymentRequirement,
    #[serde(default)]
    pub payload: ProofPayload,
}

impl PaymentProof {
    pub fn new(resource: ResourceInfo, accepted: PaymentRequirement, tx_hash: String) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            resource,
            accepted,
            payload: ProofPayload {
                tx_hash: Some(tx_hash),
            },
        }
    }

    pub fn tx_hash(&self) -> Option<&str> {
        self.payload
            .tx_hash
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    MissingHash,
    AlreadyUsed,
    NotFound,
    Failed,
    AmountInsufficient,
    VerificationError,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingHash => "missing_hash",
            Self::AlreadyUsed => "already_used",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
            Self::AmountInsufficient => "amount_insufficient",
            Self::VerificationError => "verification_error",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyResult {
    Valid { payer: Address },
    Invalid { reason: InvalidReason },
}

impl VerifyResult {
    pub fn invalid(reason: InvalidReason) -> Self {
        Self::Invalid { reason }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleFailure {
    MissingHash,
    AlreadyUsed,
    ReceiptMissing,
    LedgerUnavailable,
    StoreUnavailable,
}

impl SettleFailure {
    /// Infrastructure failures are the server's problem, not the payer's.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::LedgerUnavailable | Self::StoreUnavailable)
    }
}

impl fmt::Display for SettleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingHash => "missing_hash",
            Self::AlreadyUsed => "already_used",
            Self::ReceiptMissing => "receipt_missing",
            Self::LedgerUnavailable => "ledger_unavailable",
            Self::StoreUnavailable => "store_unavailable",
        };
        f.write_str(s)
    }
}

/// Body of the `PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResult {
    pub success: bool,
    #[serde(rename = "transaction")]
    pub transaction_ref: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SettleFailure>,
}

impl SettleResult {
    pub fn settled(transaction_ref: String, network: String, payer: Address) -> Self {
        Self {
            success: true,
            transaction_ref,
            network,
            payer: Some(payer),
            error: None,
        }
    }

    pub fn failed(transaction_ref: String, network: String, error: SettleFailure) -> Self {
        Self {
            success: false,
            transaction_ref,
            network,
            payer: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    #[serde(rename = "x402Version")]
    pub protocol_version: u32,
    pub scheme: String,
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedResponse {
    pub kinds: Vec<SupportedKind>,
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// base64(JSON) encoding shared by all three payment headers.
pub fn encode_header<T: Serialize>(value: &T) -> Result<String, HeaderError> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_header<T: DeserializeOwned>(raw: &str) -> Result<T, HeaderError> {
    let bytes = STANDARD.decode(raw.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Canonical string form of a transaction hash, used as the replay key.
pub fn normalize_tx_hash(hash: &str) -> String {
    let trimmed = hash.trim().trim_start_matches("0x").trim_start_matches("0X");
    format!("0x{}", trimmed.to_ascii_lowercase())
}
