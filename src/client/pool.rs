use ethers::{
    core::rand::thread_rng,
    signers::LocalWallet,
    types::{Address, H256, U256},
};
use futures::future::join_all;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::agent::Agent;
use crate::client::endpoint::{default_endpoints, Endpoint};
use crate::client::payment::PaymentClient;
use crate::error::PoolError;
use crate::models::{LifecycleEvent, PoolMetrics};
use crate::services::clock::now_ms;
use crate::services::ledger::{format_hash, LedgerClient};
use crate::services::MetricsCollector;

pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// USDC deployments tried, in order, when no payment asset is configured.
pub const WELL_KNOWN_ASSETS: [&str; 3] = [
    "0x036CbD53842c5426634e7929541eC2318f3dCF7e", // Base Sepolia
    "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238", // Ethereum Sepolia
    "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", // Base
];

pub fn well_known_assets() -> Vec<Address> {
    WELL_KNOWN_ASSETS
        .iter()
        .filter_map(|a| Address::from_str(a).ok())
        .collect()
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub agents: usize,
    /// Aggregate target across every agent.
    pub requests_per_second: f64,
    pub workers_per_agent: usize,
    pub funding_amount: U256,
    /// Native coin sent to each agent for gas. Zero skips the gas transfers.
    pub gas_funding: U256,
    pub server_url: String,
    /// Tried in order; empty means `WELL_KNOWN_ASSETS`.
    pub asset_candidates: Vec<Address>,
    pub payment_timeout: Duration,
}

pub type SnapshotObserver = Arc<dyn Fn(&PoolMetrics) + Send + Sync>;

/// Owns the agents: funds them from a faucet wallet, staggers their start,
/// and stops them by letting in-flight requests finish.
pub struct AgentPool {
    config: PoolConfig,
    ledger: Arc<dyn LedgerClient>,
    faucet: PaymentClient,
    metrics: MetricsCollector,
    endpoints: Arc<[Endpoint]>,
    http: reqwest::Client,
    agents: Vec<Arc<Agent>>,
    asset: Option<Address>,
    observer: Option<SnapshotObserver>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentPool {
    pub fn new(
        config: PoolConfig,
        ledger: Arc<dyn LedgerClient>,
        faucet: LocalWallet,
        metrics: MetricsCollector,
    ) -> Self {
        let faucet = PaymentClient::new(faucet, ledger.clone(), config.payment_timeout);
        Self {
            config,
            ledger,
            faucet,
            metrics,
            endpoints: default_endpoints().into(),
            http: reqwest::Client::new(),
            agents: Vec::new(),
            asset: None,
            observer: None,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints.into();
        self
    }

    /// Called with a metrics snapshot every `SNAPSHOT_INTERVAL` while running.
    pub fn on_snapshot(&mut self, observer: SnapshotObserver) {
        self.observer = Some(observer);
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    pub fn asset(&self) -> Option<Address> {
        self.asset
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    fn build_agents(&self) -> Vec<Arc<Agent>> {
        let count = self.config.agents.max(1);
        let per_agent_rps = self.config.requests_per_second / count as f64;
        let mut rng = thread_rng();

        (0..count)
            .map(|i| {
                let payments = PaymentClient::new(
                    LocalWallet::new(&mut rng),
                    self.ledger.clone(),
                    self.config.payment_timeout,
                );
                Arc::new(Agent::new(
                    format!("agent-{}", i + 1),
                    &self.config.server_url,
                    self.http.clone(),
                    payments,
                    self.endpoints.clone(),
                    per_agent_rps,
                    self.config.workers_per_agent,
                    self.metrics.clone(),
                ))
            })
            .collect()
    }

    /// Funds the first agent with a trial transfer per candidate asset until
    /// one goes through, then broadcasts the remaining token fundings and the
    /// gas fundings back to back and waits only for the last receipt: the
    /// faucet's transfers land in nonce order, so the last one landing means
    /// all of them did.
    pub async fn initialize(&mut self) -> Result<(), PoolError> {
        let agents = self.build_agents();
        let amount = self.config.funding_amount;
        let candidates = if self.config.asset_candidates.is_empty() {
            well_known_assets()
        } else {
            self.config.asset_candidates.clone()
        };

        let first = agents[0].address();
        let mut asset = None;
        for candidate in &candidates {
            match self.faucet.pay(*candidate, first, amount).await {
                Ok(hash) => {
                    tracing::info!(asset = ?candidate, tx_hash = %format_hash(&hash), "Payment asset discovered");
                    asset = Some(*candidate);
                    break;
                }
                Err(e) => tracing::debug!(asset = ?candidate, error = %e, "Trial transfer failed"),
            }
        }
        let asset = asset.ok_or(PoolError::AssetDiscovery {
            tried: candidates.len(),
        })?;

        let mut last: Option<H256> = None;
        for agent in &agents[1..] {
            let hash = self
                .faucet
                .submit(asset, agent.address(), amount)
                .await
                .map_err(|e| PoolError::Funding(format!("{}: {}", agent.id(), e)))?;
            last = Some(hash);
        }
        let gas = self.config.gas_funding;
        if !gas.is_zero() {
            for agent in &agents {
                let hash = self
                    .faucet
                    .submit_native(agent.address(), gas)
                    .await
                    .map_err(|e| PoolError::Funding(format!("{} gas: {}", agent.id(), e)))?;
                last = Some(hash);
            }
        }
        if let Some(last) = last {
            let receipt = self
                .ledger
                .wait_for_receipt(last, self.config.payment_timeout)
                .await?;
            if !receipt.success {
                return Err(PoolError::Funding(format!(
                    "final funding transfer {} reverted",
                    format_hash(&last)
                )));
            }
        }

        for agent in &agents {
            self.metrics
                .register_agent(agent.id(), Some(format!("{:?}", agent.address())))
                .await;
        }

        tracing::info!(agents = agents.len(), asset = ?asset, amount = %amount, gas = %gas, "Agent pool funded");
        self.asset = Some(asset);
        self.agents = agents;
        Ok(())
    }

    /// Starts every agent, spreading the starts evenly over one fair-share
    /// window (`1s / total rps`) so the aggregate rate ramps instead of bursting.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.agents.is_empty() {
            return Err(PoolError::NotInitialized);
        }
        if self.is_running() {
            return Ok(());
        }

        let window = Duration::from_secs_f64(1.0 / self.config.requests_per_second.max(1e-3));
        let count = self.agents.len();
        let (shutdown, receiver) = watch::channel(false);

        for (i, agent) in self.agents.iter().enumerate() {
            let delay = window.mul_f64(i as f64 / count as f64);
            self.metrics.record_event(LifecycleEvent::AgentConnected {
                timestamp: now_ms(),
                agent_id: agent.id().to_string(),
                address: Some(format!("{:?}", agent.address())),
            });
            self.tasks.extend(agent.spawn_workers(receiver.clone(), delay));
        }

        if let Some(observer) = self.observer.clone() {
            self.tasks.push(spawn_observer(self.metrics.clone(), observer, receiver));
        }

        tracing::info!(
            agents = count,
            target_rps = self.config.requests_per_second,
            "Agent pool started"
        );
        self.shutdown = Some(shutdown);
        Ok(())
    }

    /// Stops new iterations and waits for in-flight ones, including their
    /// receipt waits, to finish.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(true);

        for result in join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Agent task panicked");
            }
        }

        for agent in &self.agents {
            self.metrics.record_event(LifecycleEvent::AgentDisconnected {
                timestamp: now_ms(),
                agent_id: agent.id().to_string(),
            });
        }
        self.metrics.flush().await;
        tracing::info!("Agent pool stopped");
    }

    pub async fn snapshot(&self) -> PoolMetrics {
        self.metrics.snapshot().await
    }
}

fn spawn_observer(
    metrics: MetricsCollector,
    observer: SnapshotObserver,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => observer(&metrics.snapshot().await),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
