use ethers::types::Address;
use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::endpoint::{select_endpoint, Endpoint};
use crate::client::payment::PaymentClient;
use crate::error::AgentError;
use crate::models::{
    decode_header, encode_header, PaymentProof, PaymentRequired, RequestResult, AGENT_ID_HEADER,
    PAYMENT_REQUIRED_HEADER, PAYMENT_SIGNATURE_HEADER,
};
use crate::services::clock::now_ms;
use crate::services::ledger::format_hash;
use crate::services::MetricsCollector;

/// Largest random addition to a worker's pause, as a fraction of the interval.
const MAX_JITTER: f64 = 0.2;

/// A simulated paying client.
///
/// Runs `workers` independent request loops so one slow payment does not
/// stall the agent. All loops share the agent's wallet and nonce sequence.
pub struct Agent {
    id: String,
    server_url: String,
    http: Client,
    payments: PaymentClient,
    endpoints: Arc<[Endpoint]>,
    requests_per_second: f64,
    workers: usize,
    metrics: MetricsCollector,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        server_url: &str,
        http: Client,
        payments: PaymentClient,
        endpoints: Arc<[Endpoint]>,
        requests_per_second: f64,
        workers: usize,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            id,
            server_url: server_url.trim_end_matches('/').to_string(),
            http,
            payments,
            endpoints,
            requests_per_second,
            workers: workers.max(1),
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> Address {
        self.payments.address()
    }

    pub fn payments(&self) -> &PaymentClient {
        &self.payments
    }

    /// Pause between iterations of one worker, so that all workers together
    /// approach the agent's target rate.
    pub fn interval(&self) -> Duration {
        let rps = self.requests_per_second.max(f64::MIN_POSITIVE);
        Duration::from_secs_f64((self.workers as f64 / rps).min(3600.0))
    }

    fn next_pause(&self) -> Duration {
        let interval = self.interval();
        let jitter = rand::thread_rng().gen_range(0.0..=MAX_JITTER);
        interval.mul_f64(1.0 + jitter)
    }

    fn pick(&self) -> Option<(Endpoint, Value)> {
        let mut rng = rand::thread_rng();
        let endpoint = select_endpoint(&self.endpoints, &mut rng)?.clone();
        let body = (endpoint.payload)(&mut rng);
        Some((endpoint, body))
    }

    /// One full request, folded into a result. Never fails.
    pub async fn run_once(&self) -> RequestResult {
        let started = Instant::now();
        let Some((endpoint, body)) = self.pick() else {
            return self.result("", started, Err(AgentError::MissingRequirement));
        };
        let outcome = self.request(&endpoint, &body).await;
        self.result(&endpoint.path, started, outcome)
    }

    fn result(
        &self,
        endpoint: &str,
        started: Instant,
        outcome: Result<Option<String>, AgentError>,
    ) -> RequestResult {
        let latency_ms = started.elapsed().as_millis() as u64;
        let (success, error, tx_hash) = match outcome {
            Ok(tx_hash) => (true, None, tx_hash),
            Err(e) => {
                tracing::debug!(agent_id = %self.id, endpoint, error = %e, "Request failed");
                (false, Some(e.to_string()), None)
            }
        };
        RequestResult {
            success,
            agent_id: self.id.clone(),
            endpoint: endpoint.to_string(),
            latency_ms,
            timestamp: now_ms(),
            error,
            tx_hash,
        }
    }

    async fn send(&self, endpoint: &Endpoint, body: &Value, proof: Option<&str>) -> Result<Response, AgentError> {
        let mut request = self
            .http
            .request(endpoint.method.clone(), format!("{}{}", self.server_url, endpoint.path))
            .header(AGENT_ID_HEADER, &self.id)
            .json(body);
        if let Some(proof) = proof {
            request = request.header(PAYMENT_SIGNATURE_HEADER, proof);
        }
        Ok(request.send().await?)
    }

    async fn unexpected(response: Response) -> AgentError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        AgentError::UnexpectedStatus { status, body }
    }

    /// Client half of the 402 exchange. Returns the payment hash if the
    /// endpoint charged for the call.
    pub async fn request(&self, endpoint: &Endpoint, body: &Value) -> Result<Option<String>, AgentError> {
        let first = self.send(endpoint, body, None).await?;
        if first.status() != StatusCode::PAYMENT_REQUIRED {
            if first.status().is_success() {
                return Ok(None);
            }
            return Err(Self::unexpected(first).await);
        }

        let header = first
            .headers()
            .get(PAYMENT_REQUIRED_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or(AgentError::MissingRequirement)?;
        let challenge: PaymentRequired = decode_header(header)?;
        let resource = challenge.resource;
        let requirement = challenge
            .accepts
            .into_iter()
            .next()
            .ok_or(AgentError::MissingRequirement)?;
        let amount = requirement
            .amount_units()
            .ok_or(AgentError::MissingRequirement)?;

        let tx_hash = self
            .payments
            .pay(requirement.asset, requirement.pay_to, amount)
            .await?;
        let tx_hash = format_hash(&tx_hash);

        let proof = encode_header(&PaymentProof::new(resource, requirement, tx_hash.clone()))?;
        let paid = self.send(endpoint, body, Some(&proof)).await?;
        if !paid.status().is_success() {
            return Err(Self::unexpected(paid).await);
        }
        Ok(Some(tx_hash))
    }

    /// Starts the worker loops. Each waits `start_delay` plus its own offset
    /// within one interval, then loops until `shutdown` flips to true.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
        start_delay: Duration,
    ) -> Vec<JoinHandle<()>> {
        let interval = self.interval();
        (0..self.workers)
            .map(|worker| {
                let agent = self.clone();
                let offset = start_delay + interval.mul_f64(worker as f64 / agent.workers as f64);
                tokio::spawn(agent.worker_loop(worker, shutdown.clone(), offset))
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>, offset: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(offset) => {}
            _ = shutdown.changed() => return,
        }
        tracing::debug!(agent_id = %self.id, worker, "Worker started");

        while !*shutdown.borrow() {
            let result = self.run_once().await;
            self.metrics.record_result(result);

            let pause = self.next_pause();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(agent_id = %self.id, worker, "Worker stopped");
    }
}
