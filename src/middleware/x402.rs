use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{attach_header, PayGateError};
use crate::middleware::agent_id::AgentId;
use crate::models::{
    decode_header, InvalidReason, LifecycleEvent, PaymentProof, PaymentRequired,
    PaymentRequirement, ResourceInfo, VerifyResult, PAYMENT_RESPONSE_HEADER,
    PAYMENT_SIGNATURE_HEADER,
};
use crate::services::{EventBus, Facilitator};

/// What one protected path charges and how it describes itself in a challenge.
#[derive(Debug, Clone)]
pub struct PricedRoute {
    pub resource: ResourceInfo,
    pub requirement: PaymentRequirement,
}

/// Server side of the 402 exchange for a set of priced paths.
///
/// Per request: no proof gets a challenge; an invalid proof gets the challenge
/// again with a reason; a valid proof runs the handler and is settled only if
/// the handler succeeded. A failed handler leaves the proof unconsumed.
pub struct PaymentGate {
    facilitator: Facilitator,
    events: Arc<EventBus>,
    routes: HashMap<String, PricedRoute>,
}

impl PaymentGate {
    pub fn new(facilitator: Facilitator, events: Arc<EventBus>) -> Self {
        Self {
            facilitator,
            events,
            routes: HashMap::new(),
        }
    }

    pub fn protect(
        mut self,
        path: &str,
        description: &str,
        requirement: PaymentRequirement,
    ) -> Self {
        let resource = ResourceInfo {
            url: path.to_string(),
            description: description.to_string(),
            mime_type: "application/json".to_string(),
        };
        self.routes.insert(
            path.to_string(),
            PricedRoute {
                resource,
                requirement,
            },
        );
        self
    }

    pub fn route(&self, path: &str) -> Option<&PricedRoute> {
        self.routes.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn facilitator(&self) -> &Facilitator {
        &self.facilitator
    }

    fn challenge(route: &PricedRoute) -> PaymentRequired {
        PaymentRequired::new(route.resource.clone(), route.requirement.clone())
    }

    fn now_ms(&self) -> u64 {
        self.facilitator.replay().now_ms()
    }

    fn reject(
        &self,
        route: &PricedRoute,
        agent_id: &str,
        tx_hash: Option<&str>,
        reason: InvalidReason,
        started: Instant,
    ) -> PayGateError {
        self.events.publish(LifecycleEvent::PaymentFailed {
            timestamp: self.now_ms(),
            agent_id: agent_id.to_string(),
            tx_hash: tx_hash.map(str::to_string),
            endpoint: route.resource.url.clone(),
            error: reason.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        });
        PayGateError::PaymentRejected {
            challenge: Box::new(Self::challenge(route).with_error(reason.to_string())),
            reason,
        }
    }

    pub async fn handle(&self, request: Request, next: Next) -> Result<Response, PayGateError> {
        let Some(route) = self.route(request.uri().path()) else {
            return Ok(next.run(request).await);
        };
        let started = Instant::now();
        let agent_id = AgentId::of(&request);

        let Some(header) = request
            .headers()
            .get(PAYMENT_SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
        else {
            return Err(PayGateError::PaymentRequired(Box::new(Self::challenge(route))));
        };

        let proof: PaymentProof = match decode_header(header) {
            Ok(proof) => proof,
            Err(e) => {
                tracing::debug!(agent_id = %agent_id, error = %e, "Unreadable payment signature");
                return Err(self.reject(route, &agent_id, None, InvalidReason::VerificationError, started));
            }
        };
        let tx_hash = proof.tx_hash().map(str::to_string);

        let payer = match self.facilitator.verify(&proof, &route.requirement).await {
            VerifyResult::Valid { payer } => payer,
            VerifyResult::Invalid { reason } => {
                return Err(self.reject(route, &agent_id, tx_hash.as_deref(), reason, started));
            }
        };
        let tx_hash = tx_hash.unwrap_or_default();

        self.events.publish(LifecycleEvent::PaymentSubmitted {
            timestamp: self.now_ms(),
            agent_id: agent_id.clone(),
            tx_hash: tx_hash.clone(),
            amount: route.requirement.amount.clone(),
            endpoint: route.resource.url.clone(),
            from: Some(format!("{:?}", payer)),
            to: Some(format!("{:?}", route.requirement.pay_to)),
        });

        let mut response = next.run(request).await;

        if !response.status().is_success() {
            tracing::warn!(
                agent_id = %agent_id,
                tx_hash = %tx_hash,
                status = %response.status(),
                "Handler failed; payment left unconsumed"
            );
            self.events.publish(LifecycleEvent::Error {
                timestamp: self.now_ms(),
                agent_id,
                error: format!("handler returned {}", response.status()),
                endpoint: Some(route.resource.url.clone()),
            });
            return Ok(response);
        }

        let settlement = self.facilitator.settle(&proof, &route.requirement).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !settlement.success {
            self.events.publish(LifecycleEvent::PaymentFailed {
                timestamp: self.now_ms(),
                agent_id,
                tx_hash: Some(tx_hash),
                endpoint: route.resource.url.clone(),
                error: settlement.error.map(|e| e.to_string()).unwrap_or_default(),
                latency_ms,
            });
            return Err(PayGateError::SettlementFailed {
                challenge: Box::new(Self::challenge(route)),
                settlement: Box::new(settlement),
            });
        }

        let now = self.now_ms();
        self.events.publish(LifecycleEvent::PaymentConfirmed {
            timestamp: now,
            agent_id: agent_id.clone(),
            tx_hash: settlement.transaction_ref.clone(),
            amount: route.requirement.amount.clone(),
            endpoint: route.resource.url.clone(),
        });
        self.events.publish(LifecycleEvent::RequestServed {
            timestamp: now,
            agent_id,
            endpoint: route.resource.url.clone(),
            latency_ms,
            tx_hash: Some(settlement.transaction_ref.clone()),
        });

        attach_header(&mut response, PAYMENT_RESPONSE_HEADER, &settlement);
        Ok(response)
    }
}

/// `axum::middleware::from_fn_with_state` entry point.
pub async fn payment_middleware(
    State(gate): State<Arc<PaymentGate>>,
    request: Request,
    next: Next,
) -> Result<Response, PayGateError> {
    gate.handle(request, next).await
}
