use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use ethers::types::Address;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::{
    handlers::{self, Transform},
    middleware::{extract_agent_id, payment_middleware, PaymentGate},
    models::PaymentRequirement,
    services::{EventBus, Facilitator, LedgerClient, MetricsCollector},
};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<PaymentGate>,
    pub events: Arc<EventBus>,
    pub metrics: MetricsCollector,
    pub ledger: Arc<dyn LedgerClient>,
    /// Account whose nonce the health check reads to probe the ledger.
    pub probe_account: Address,
    pub started_at: Instant,
}

impl AppState {
    /// Prices every transform route at `requirement` and starts feeding the
    /// event bus into a metrics collector. Needs a Tokio runtime.
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        facilitator: Facilitator,
        requirement: PaymentRequirement,
        latency_window: usize,
    ) -> Self {
        let events = Arc::new(EventBus::default());
        let probe_account = requirement.pay_to;

        let gate = Transform::ALL.iter().fold(
            PaymentGate::new(facilitator, events.clone()),
            |gate, transform| {
                gate.protect(
                    &transform.path(),
                    &format!("{} transform", transform.name()),
                    requirement.clone(),
                )
            },
        );

        let (metrics, _collector) = MetricsCollector::spawn(latency_window);
        metrics.follow(&events);

        Self {
            gate: Arc::new(gate),
            events,
            metrics,
            ledger,
            probe_account,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let paid = Router::new()
        .route("/api/echo", post(handlers::echo))
        .route("/api/reverse", post(handlers::reverse))
        .route("/api/uppercase", post(handlers::uppercase))
        .route("/api/hash", post(handlers::hash))
        .route_layer(from_fn_with_state(state.gate.clone(), payment_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::get_stats))
        .route("/events", get(handlers::get_events))
        .route("/ws/events", get(handlers::websocket_handler))
        .route("/facilitator/supported", get(handlers::get_supported))
        .merge(paid)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::default().include_headers(true)),
                )
                .layer(CorsLayer::permissive())
                .layer(from_fn(extract_agent_id)),
        )
        .with_state(state)
}
