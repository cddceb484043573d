#![allow(dead_code)]

use ethers::{
    core::rand::thread_rng,
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use paygate::{
    app::{build_router, AppState},
    models::{PaymentRequirement, SCHEME_EXACT},
    services::{Facilitator, InMemoryLedger, MemoryReplayStore, ReplayGuard, SystemClock},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub const ASSET: Address = Address::repeat_byte(0xaa);
pub const PAY_TO: Address = Address::repeat_byte(0xbb);
pub const PRICE: &str = "100";

pub fn requirement() -> PaymentRequirement {
    PaymentRequirement {
        scheme: SCHEME_EXACT.to_string(),
        network: "testnet".to_string(),
        asset: ASSET,
        amount: PRICE.to_string(),
        pay_to: PAY_TO,
        max_timeout_seconds: 60,
        extra: None,
    }
}

pub struct TestServer {
    pub ledger: Arc<InMemoryLedger>,
    pub state: AppState,
}

impl TestServer {
    pub fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.register_asset(ASSET);
        let replay = ReplayGuard::new(
            Arc::new(MemoryReplayStore::new()),
            Arc::new(SystemClock),
            Duration::from_secs(3600),
        );
        let facilitator = Facilitator::new(ledger.clone(), replay, "testnet");
        let state = AppState::new(ledger.clone(), facilitator, requirement(), 100);
        Self { ledger, state }
    }

    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    pub fn funded_wallet(&self, amount: u64) -> LocalWallet {
        let wallet = LocalWallet::new(&mut thread_rng());
        self.ledger.mint(ASSET, wallet.address(), U256::from(amount));
        wallet
    }

    /// Serves the router on an ephemeral port until the sender is dropped or fired.
    pub async fn serve(&self) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });
        (addr, shutdown_tx)
    }
}
