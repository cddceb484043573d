use anyhow::{Context, Result};
use paygate::{
    app::{build_router, AppState},
    config::Config,
    services::{
        metrics::DEFAULT_LATENCY_WINDOW, EthersLedger, Facilitator, LedgerClient,
        MemoryReplayStore, RedisReplayStore, ReplayGuard, ReplayStore, SystemClock,
    },
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("paygate=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Starting paygate v{}", env!("CARGO_PKG_VERSION"));

    let ledger: Arc<dyn LedgerClient> = Arc::new(
        EthersLedger::new(&config.ledger_rpc_url, config.chain_id)
            .context("Failed to create ledger client")?,
    );

    let store: Arc<dyn ReplayStore> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisReplayStore::connect(url)
                .await
                .context("Failed to connect replay store")?,
        ),
        None => Arc::new(MemoryReplayStore::new()),
    };
    let replay = ReplayGuard::new(store, Arc::new(SystemClock), config.replay_ttl);
    let facilitator = Facilitator::new(ledger.clone(), replay, config.network.clone());

    let state = AppState::new(ledger, facilitator, config.requirement(), DEFAULT_LATENCY_WINDOW);
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Event stream: ws://{}/ws/events", addr);
    tracing::info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down gracefully...");
}
