use axum::{extract::State, Json};
use chrono::Utc;

use crate::{app::AppState, models::HealthStatus};

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    let ledger_ok = state.ledger.get_nonce(state.probe_account).await.is_ok();

    let status = if ledger_ok { "healthy" } else { "degraded" };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger_rpc: ledger_ok,
        replay_store: state.gate.facilitator().replay().store_kind().to_string(),
        events_buffered: state.events.len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}
