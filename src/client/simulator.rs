use anyhow::{Context, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use paygate::{
    client::{AgentPool, PoolConfig},
    config::SimulatorConfig,
    error::ConfigError,
    models::PoolMetrics,
    services::{metrics::DEFAULT_LATENCY_WINDOW, EthersLedger, LedgerClient, MetricsCollector},
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("paygate=info,paygate_sim=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = SimulatorConfig::parse();

    if let Err(e) = config.validate() {
        eprintln!("[ERROR] Invalid simulator options:");
        match e {
            ConfigError::Validation(problems) => {
                for problem in problems {
                    eprintln!("  - {}", problem);
                }
            }
            other => eprintln!("  - {}", other),
        }
        std::process::exit(2);
    }

    println!("paygate agent simulator");
    println!("=======================");
    println!("Server:  {}", config.server_url);
    println!("Ledger:  {}", config.ledger_url);
    println!("Agents:  {} x {} workers", config.agents, config.workers);
    println!("Target:  {} req/s", config.rps);
    println!("Gas:     {} per agent", config.gas_funding);
    println!();

    let ledger: Arc<dyn LedgerClient> = Arc::new(
        EthersLedger::new(&config.ledger_url, config.chain_id)
            .context("Failed to create ledger client")?,
    );

    let funding_key = config.funding_key.as_deref().unwrap_or_default();
    let faucet = LocalWallet::from_str(funding_key)
        .context("Failed to parse funding key")?
        .with_chain_id(config.chain_id);
    tracing::info!(faucet = ?faucet.address(), "Funding account loaded");

    let (metrics, _collector) = MetricsCollector::spawn(DEFAULT_LATENCY_WINDOW);
    let pool_config = PoolConfig {
        agents: config.agents,
        requests_per_second: f64::from(config.rps),
        workers_per_agent: config.workers,
        funding_amount: config.funding_amount_units(),
        gas_funding: config.gas_funding_wei(),
        server_url: config.server_url.clone(),
        asset_candidates: config.asset_candidates(),
        payment_timeout: config.payment_timeout(),
    };

    let mut pool = AgentPool::new(pool_config, ledger, faucet, metrics);
    pool.on_snapshot(Arc::new(log_snapshot));

    pool.initialize().await.context("Failed to fund agents")?;
    pool.start()?;

    match config.duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    println!();
    println!("Stopping agents, waiting for in-flight requests...");
    pool.stop().await;

    let summary = pool.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn log_snapshot(metrics: &PoolMetrics) {
    tracing::info!(
        requests = metrics.total_requests,
        success_rate = %format!("{:.1}%", metrics.success_rate),
        tps = metrics.current_tps,
        p50_ms = metrics.latency.p50_ms,
        p95_ms = metrics.latency.p95_ms,
        mempool_conflicts = metrics.mempool_conflicts,
        "Pool progress"
    );
}
