use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    encode_header, HeaderError, InvalidReason, PaymentRequired, SettleResult,
    PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER,
};

/// Errors that cross the HTTP boundary of the payment gate.
#[derive(Error, Debug)]
pub enum PayGateError {
    #[error("Payment required")]
    PaymentRequired(Box<PaymentRequired>),

    #[error("Payment rejected: {reason}")]
    PaymentRejected {
        challenge: Box<PaymentRequired>,
        reason: InvalidReason,
    },

    #[error("Settlement failed: {}", .settlement.error.map(|e| e.to_string()).unwrap_or_default())]
    SettlementFailed {
        challenge: Box<PaymentRequired>,
        settlement: Box<SettleResult>,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<PaymentRequired>,
}

impl PayGateError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            PayGateError::PaymentRequired(_) => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_REQUIRED"),
            PayGateError::PaymentRejected { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "PAYMENT_VERIFICATION_FAILED")
            }
            PayGateError::SettlementFailed { settlement, .. } => {
                if settlement.error.is_some_and(|e| e.is_unavailable()) {
                    (StatusCode::SERVICE_UNAVAILABLE, "SETTLEMENT_UNAVAILABLE")
                } else {
                    (StatusCode::PAYMENT_REQUIRED, "SETTLEMENT_FAILED")
                }
            }
            PayGateError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        }
    }
}

impl IntoResponse for PayGateError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status, error_code) = self.status_and_code();

        let (challenge, reason, settlement) = match &self {
            PayGateError::PaymentRequired(challenge) => (Some(challenge.as_ref()), None, None),
            PayGateError::PaymentRejected { challenge, reason } => {
                (Some(challenge.as_ref()), Some(reason.to_string()), None)
            }
            PayGateError::SettlementFailed {
                challenge,
                settlement,
            } => (
                Some(challenge.as_ref()),
                settlement.error.map(|e| e.to_string()),
                Some(settlement.as_ref()),
            ),
            _ => (None, None, None),
        };

        if status == StatusCode::PAYMENT_REQUIRED && reason.is_none() {
            tracing::debug!(error_code, "Payment challenge issued");
        } else {
            tracing::warn!(error = %self, error_code, reason = ?reason, "Request failed");
        }

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: error_code.to_string(),
            timestamp: Utc::now(),
            request_id,
            reason,
            payment_required: challenge.cloned(),
        };

        let mut response = (status, Json(body)).into_response();
        // A 503 means "try again", so only a 402 re-issues the challenge.
        if status == StatusCode::PAYMENT_REQUIRED {
            if let Some(challenge) = challenge {
                attach_header(&mut response, PAYMENT_REQUIRED_HEADER, challenge);
            }
        }
        if let Some(settlement) = settlement {
            attach_header(&mut response, PAYMENT_RESPONSE_HEADER, settlement);
        }
        response
    }
}

/// Encodes `value` as base64(JSON) into `name`. Encoding can only fail on a
/// serializer bug, in which case the header is left off and the failure logged.
pub fn attach_header<T: Serialize>(response: &mut Response, name: &'static str, value: &T) {
    let encoded = match encode_header(value) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::error!(header = name, error = %e, "Failed to encode payment header");
            return;
        }
    };
    match HeaderValue::from_str(&encoded) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Err(e) => tracing::error!(header = name, error = %e, "Payment header is not a valid header value"),
    }
}

/// Failures talking to the ledger. Never crosses the facilitator boundary:
/// it is folded into a typed verify/settle result there.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timed out after {0:?} waiting for receipt of {1}")]
    Timeout(Duration, String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Contract error: {0}")]
    Contract(String),
}

impl From<ethers::providers::ProviderError> for LedgerError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        LedgerError::Rpc(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Replay store backend error: {0}")]
    Backend(String),

    #[error("Corrupt replay entry for {key}: {value}")]
    Corrupt { key: String, value: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} required")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Client-side failures of a single simulated request. The agent loop folds
/// these into a failed `RequestResult`; they never stop the loop.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("402 response carried no usable payment requirement")]
    MissingRequirement,

    #[error("Malformed payment header: {0}")]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Payment transaction {0} reverted")]
    Reverted(String),

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No payment asset accepted a trial transfer (tried {tried})")]
    AssetDiscovery { tried: usize },

    #[error("Funding failed: {0}")]
    Funding(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Pool has not been initialized")]
    NotInitialized,
}
